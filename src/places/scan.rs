//! Scan Pipeline
//!
//! Scatter-gather nearby search: one provider call per unique place-type,
//! partial failures dropped, results merged, filtered and attributed to
//! themes.

use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{ActivitySource, BusinessStatus, LatLng, OutdoorActivity, Place, PlaceSearch, PlaceSearchRequest};
use crate::error::{FunnelError, FunnelResult};
use crate::themes::{self, ThemeConfig};

/// Below this many activities the scan is flagged as a shortage.
pub const SHORTAGE_THRESHOLD: usize = 5;
/// A dichotomy pool needs at least this many candidates.
pub const MIN_DICHOTOMY_CANDIDATES: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScanFilters {
    pub require_open_now: bool,
    pub min_rating: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutcome {
    pub activities: Vec<OutdoorActivity>,
    pub shortage: bool,
    pub failed_types: Vec<String>,
}

impl ScanOutcome {
    pub fn count(&self) -> usize {
        self.activities.len()
    }

    pub fn can_build_dichotomy(&self) -> bool {
        self.activities.len() >= MIN_DICHOTOMY_CANDIDATES
    }
}

pub struct ScanPipeline {
    provider: Arc<dyn PlaceSearch>,
}

/// Unique place-types across `themes`, each with the themes that list it,
/// in first-seen order.
fn group_place_types<'a>(themes: &[&'a ThemeConfig]) -> Vec<(&'static str, Vec<&'a ThemeConfig>)> {
    let mut groups: Vec<(&'static str, Vec<&'a ThemeConfig>)> = Vec::new();
    let mut index: HashMap<&'static str, usize> = HashMap::new();

    for &theme in themes {
        for &place_type in theme.place_types {
            match index.get(place_type) {
                Some(&i) => groups[i].1.push(theme),
                None => {
                    index.insert(place_type, groups.len());
                    groups.push((place_type, vec![theme]));
                }
            }
        }
    }
    groups
}

/// Missing open-now or rating data never excludes a place.
fn keep_place(place: &Place, filters: &ScanFilters) -> bool {
    if matches!(
        place.business_status,
        Some(BusinessStatus::ClosedPermanently) | Some(BusinessStatus::ClosedTemporarily)
    ) {
        return false;
    }
    if filters.require_open_now && place.open_now == Some(false) {
        return false;
    }
    if let (Some(min), Some(rating)) = (filters.min_rating, place.rating) {
        if rating < min {
            return false;
        }
    }
    true
}

fn catalog_position(theme: &ThemeConfig) -> usize {
    themes::catalog()
        .iter()
        .position(|t| t.slug == theme.slug)
        .unwrap_or(usize::MAX)
}

fn to_activity(place: Place, theme: &ThemeConfig) -> OutdoorActivity {
    OutdoorActivity {
        id: place.id,
        source: ActivitySource::GooglePlaces,
        name: place.name,
        theme_slug: theme.slug.to_string(),
        theme_emoji: theme.emoji.to_string(),
        rating: place.rating,
        user_rating_count: place.user_rating_count,
        address: place.address,
        coordinates: place.location,
        place_types: place.types,
        price_level: place.price_level,
        open_now: place.open_now,
    }
}

impl ScanPipeline {
    pub fn new(provider: Arc<dyn PlaceSearch>) -> Self {
        Self { provider }
    }

    pub async fn scan(
        &self,
        location: LatLng,
        radius_meters: u32,
        themes: &[&ThemeConfig],
        filters: ScanFilters,
        language: &str,
    ) -> FunnelResult<ScanOutcome> {
        let mut ordered: Vec<&ThemeConfig> = themes.to_vec();
        ordered.sort_by_key(|t| catalog_position(t));

        let groups = group_place_types(&ordered);
        if groups.is_empty() {
            return Ok(ScanOutcome { activities: Vec::new(), shortage: true, failed_types: Vec::new() });
        }

        let searches = groups.iter().map(|(place_type, _)| {
            let request = PlaceSearchRequest {
                location,
                radius_meters,
                types: vec![place_type.to_string()],
                language: language.to_string(),
            };
            let provider = self.provider.clone();
            async move { provider.search(&request).await }
        });
        let results = join_all(searches).await;

        let mut failed_types = Vec::new();
        let mut succeeded = 0usize;
        let mut seen = HashSet::new();
        let mut merged: Vec<(Place, &ThemeConfig)> = Vec::new();

        for ((place_type, owners), result) in groups.iter().zip(results) {
            match result {
                Ok(places) => {
                    succeeded += 1;
                    debug!("type {} returned {} places", place_type, places.len());
                    for place in places {
                        if seen.insert(place.id.clone()) {
                            merged.push((place, owners[0]));
                        }
                    }
                }
                Err(e) => {
                    warn!("Place search for type {} failed: {}", place_type, e);
                    failed_types.push(place_type.to_string());
                }
            }
        }

        if succeeded == 0 {
            return Err(FunnelError::ScanFailed);
        }

        let activities: Vec<OutdoorActivity> = merged
            .into_iter()
            .filter(|(place, _)| keep_place(place, &filters))
            .map(|(place, origin)| {
                let theme = ordered
                    .iter()
                    .copied()
                    .find(|t| t.matches_place_types(&place.types))
                    .unwrap_or(origin);
                to_activity(place, theme)
            })
            .collect();

        let shortage = activities.len() < SHORTAGE_THRESHOLD;
        info!(
            "Scan found {} activities across {} types ({} failed, shortage={})",
            activities.len(),
            groups.len(),
            failed_types.len(),
            shortage
        );

        Ok(ScanOutcome { activities, shortage, failed_types })
    }
}
