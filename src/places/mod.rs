//! Places Module
//!
//! Nearby-place search and the scan pipeline that turns raw provider
//! results into outdoor activity candidates.

mod google;
mod scan;

pub use google::{GooglePlacesClient, MAX_RADIUS_METERS};
pub use scan::{ScanFilters, ScanOutcome, ScanPipeline, MIN_DICHOTOMY_CANDIDATES, SHORTAGE_THRESHOLD};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusinessStatus {
    Operational,
    ClosedTemporarily,
    ClosedPermanently,
}

/// A place as returned by the search provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub id: String,
    pub name: String,
    pub types: Vec<String>,
    pub location: LatLng,
    pub address: Option<String>,
    pub rating: Option<f32>,
    pub user_rating_count: Option<u32>,
    pub price_level: Option<u8>,
    pub business_status: Option<BusinessStatus>,
    pub open_now: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceSearchRequest {
    pub location: LatLng,
    pub radius_meters: u32,
    pub types: Vec<String>,
    pub language: String,
}

#[async_trait]
pub trait PlaceSearch: Send + Sync {
    async fn search(&self, request: &PlaceSearchRequest) -> Result<Vec<Place>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySource {
    GooglePlaces,
}

/// A nearby place attributed to a theme. Built once per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutdoorActivity {
    pub id: String,
    pub source: ActivitySource,
    pub name: String,
    pub theme_slug: String,
    pub theme_emoji: String,
    pub rating: Option<f32>,
    pub user_rating_count: Option<u32>,
    pub address: Option<String>,
    pub coordinates: LatLng,
    pub place_types: Vec<String>,
    pub price_level: Option<u8>,
    pub open_now: Option<bool>,
}

impl OutdoorActivity {
    /// Search query that opens the place in a maps app.
    pub fn maps_query(&self) -> String {
        match &self.address {
            Some(address) => format!("{}, {}", self.name, address),
            None => self.name.clone(),
        }
    }

    pub fn maps_url(&self) -> String {
        format!(
            "https://www.google.com/maps/search/?api=1&query={}&query_place_id={}",
            urlencoding::encode(&self.maps_query()),
            urlencoding::encode(&self.id)
        )
    }
}
