//! Google Places (New) nearby search.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{BusinessStatus, LatLng, Place, PlaceSearch, PlaceSearchRequest};

const SEARCH_NEARBY_URL: &str = "https://places.googleapis.com/v1/places:searchNearby";
const FIELD_MASK: &str = "places.id,places.displayName,places.types,places.location,\
places.formattedAddress,places.rating,places.userRatingCount,places.priceLevel,\
places.businessStatus,places.currentOpeningHours.openNow";
const MAX_RESULTS: u32 = 20;
/// Provider-side ceiling for `locationRestriction.circle.radius`.
pub const MAX_RADIUS_METERS: u32 = 50_000;

pub struct GooglePlacesClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GooglePlacesClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .user_agent(concat!("mogogo/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            base_url: SEARCH_NEARBY_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct NearbyResponse {
    #[serde(default)]
    places: Vec<RawPlace>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPlace {
    id: String,
    display_name: Option<LocalizedText>,
    #[serde(default)]
    types: Vec<String>,
    location: Option<LatLng>,
    formatted_address: Option<String>,
    rating: Option<f32>,
    user_rating_count: Option<u32>,
    price_level: Option<String>,
    business_status: Option<String>,
    current_opening_hours: Option<OpeningHours>,
}

#[derive(Debug, Deserialize)]
struct LocalizedText {
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpeningHours {
    open_now: Option<bool>,
}

fn price_level(raw: &str) -> Option<u8> {
    match raw {
        "PRICE_LEVEL_FREE" => Some(0),
        "PRICE_LEVEL_INEXPENSIVE" => Some(1),
        "PRICE_LEVEL_MODERATE" => Some(2),
        "PRICE_LEVEL_EXPENSIVE" => Some(3),
        "PRICE_LEVEL_VERY_EXPENSIVE" => Some(4),
        _ => None,
    }
}

fn business_status(raw: &str) -> Option<BusinessStatus> {
    match raw {
        "OPERATIONAL" => Some(BusinessStatus::Operational),
        "CLOSED_TEMPORARILY" => Some(BusinessStatus::ClosedTemporarily),
        "CLOSED_PERMANENTLY" => Some(BusinessStatus::ClosedPermanently),
        _ => None,
    }
}

fn parse_places(body: &str) -> Result<Vec<Place>> {
    let response: NearbyResponse =
        serde_json::from_str(body).context("Failed to parse searchNearby response")?;

    Ok(response
        .places
        .into_iter()
        .filter_map(|raw| {
            // places without coordinates cannot be shown on a map
            let location = raw.location?;
            Some(Place {
                name: raw.display_name.map(|d| d.text).unwrap_or_else(|| raw.id.clone()),
                id: raw.id,
                types: raw.types,
                location,
                address: raw.formatted_address,
                rating: raw.rating,
                user_rating_count: raw.user_rating_count,
                price_level: raw.price_level.as_deref().and_then(price_level),
                business_status: raw.business_status.as_deref().and_then(business_status),
                open_now: raw.current_opening_hours.and_then(|h| h.open_now),
            })
        })
        .collect())
}

#[async_trait]
impl PlaceSearch for GooglePlacesClient {
    async fn search(&self, request: &PlaceSearchRequest) -> Result<Vec<Place>> {
        let body = json!({
            "includedTypes": request.types,
            "maxResultCount": MAX_RESULTS,
            "languageCode": request.language,
            "locationRestriction": {
                "circle": {
                    "center": {
                        "latitude": request.location.latitude,
                        "longitude": request.location.longitude,
                    },
                    "radius": request.radius_meters.min(MAX_RADIUS_METERS) as f64,
                }
            }
        });

        debug!("searchNearby types={:?} radius={}m", request.types, request.radius_meters);

        let response = self
            .client
            .post(&self.base_url)
            .header("X-Goog-Api-Key", &self.api_key)
            .header("X-Goog-FieldMask", FIELD_MASK)
            .json(&body)
            .send()
            .await
            .context("Failed to send searchNearby request")?
            .error_for_status()
            .context("searchNearby returned an error status")?;

        let text = response.text().await.context("Failed to read searchNearby response")?;
        parse_places(&text)
    }
}
