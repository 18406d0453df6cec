use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FunnelError, FunnelResult};
use crate::places::LatLng;
use crate::themes::Environment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocialGroup {
    Solo,
    Couple,
    Friends,
    Family,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Budget {
    Free,
    Budget,
    Standard,
    Luxury,
}

/// Who is asking, and under which constraints. Fixed for the whole session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub social: SocialGroup,
    /// 1 (exhausted) to 5 (full of energy).
    pub energy: u8,
    pub budget: Budget,
    pub environment: Environment,
    #[serde(default)]
    pub location: Option<LatLng>,
    #[serde(default)]
    pub radius_meters: Option<u32>,
    #[serde(default)]
    pub hint: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn default_language() -> String {
    "fr".to_string()
}

impl UserContext {
    pub fn new(social: SocialGroup, energy: u8, budget: Budget, environment: Environment) -> Self {
        Self {
            social,
            energy,
            budget,
            environment,
            location: None,
            radius_meters: None,
            hint: None,
            language: default_language(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_location(mut self, location: LatLng, radius_meters: Option<u32>) -> Self {
        self.location = Some(location);
        self.radius_meters = radius_meters;
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn validate(&self) -> FunnelResult<()> {
        if !(1..=5).contains(&self.energy) {
            return Err(FunnelError::InvalidTransition(format!(
                "energy must be between 1 and 5, got {}",
                self.energy
            )));
        }
        if self.radius_meters == Some(0) {
            return Err(FunnelError::InvalidTransition("radius must be positive".to_string()));
        }
        Ok(())
    }

    /// One line per constraint, fed to the oracle as the opening user turn.
    pub fn describe(&self) -> String {
        let mut lines = vec![
            format!("social: {:?}", self.social).to_lowercase(),
            format!("energy: {}/5", self.energy),
            format!("budget: {:?}", self.budget).to_lowercase(),
            format!("environment: {}", self.environment),
            format!("language: {}", self.language),
            format!("local time: {}", self.timestamp.format("%A %H:%M")),
        ];
        if let Some(hint) = self.hint.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
            lines.push(format!("hint: {}", hint));
        }
        lines.join("\n")
    }
}
