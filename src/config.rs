use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

use crate::places::ScanFilters;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OracleSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub retry_delay_ms: u64,
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            api_key: None,
            model: "llama3.2".to_string(),
            temperature: 0.7,
            max_tokens: 800,
            timeout_secs: 30,
            retry_delay_ms: 1500,
            cache_capacity: 256,
            cache_ttl_secs: 600,
        }
    }
}

impl OracleSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FunnelSettings {
    /// Depth from which the oracle may finalize.
    pub min_depth: u32,
    /// Depth at which the oracle must finalize.
    pub max_depth: u32,
    pub initial_radius_meters: u32,
    pub require_open_now: bool,
    pub min_rating: Option<f32>,
}

impl Default for FunnelSettings {
    fn default() -> Self {
        Self {
            min_depth: 3,
            max_depth: 8,
            initial_radius_meters: 5_000,
            require_open_now: false,
            min_rating: None,
        }
    }
}

impl FunnelSettings {
    pub fn scan_filters(&self) -> ScanFilters {
        ScanFilters { require_open_now: self.require_open_now, min_rating: self.min_rating }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QuotaSettings {
    pub enabled: bool,
    pub burst: u32,
    pub refill_secs: u64,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self { enabled: true, burst: 30, refill_secs: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MogogoConfig {
    pub oracle: OracleSettings,
    pub funnel: FunnelSettings,
    pub quota: QuotaSettings,
    pub places_api_key: Option<String>,
    pub database_path: PathBuf,
    pub bind_address: String,
    pub session_file: PathBuf,
}

impl Default for MogogoConfig {
    fn default() -> Self {
        Self {
            oracle: OracleSettings::default(),
            funnel: FunnelSettings::default(),
            quota: QuotaSettings::default(),
            places_api_key: None,
            database_path: PathBuf::from("mogogo.db"),
            bind_address: "127.0.0.1:3000".to_string(),
            session_file: PathBuf::from("mogogo_sessions.json"),
        }
    }
}

impl MogogoConfig {
    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("ORACLE_BASE_URL") {
            self.oracle.base_url = v;
        }
        if let Some(v) = get("ORACLE_API_KEY") {
            self.oracle.api_key = Some(v);
        }
        if let Some(v) = get("ORACLE_MODEL") {
            self.oracle.model = v;
        }
        if let Some(v) = get("PLACES_API_KEY") {
            self.places_api_key = Some(v);
        }
        if let Some(v) = get("MOGOGO_DB") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = get("MOGOGO_BIND") {
            self.bind_address = v;
        }
        if let Some(v) = get("MOGOGO_SESSION_FILE") {
            self.session_file = PathBuf::from(v);
        }
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }
}

pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the file, writing defaults first when it does not exist.
    pub async fn load(&self) -> Result<MogogoConfig> {
        if !self.path.exists() {
            let default = MogogoConfig::default();
            self.save(&default).await?;
            return Ok(default);
        }
        let content = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read config {}", self.path.display()))?;
        let config = serde_json::from_str(&content).context("Failed to parse config")?;
        Ok(config)
    }

    pub async fn save(&self, config: &MogogoConfig) -> Result<()> {
        let content = serde_json::to_string_pretty(config)?;
        fs::write(&self.path, content).await?;
        Ok(())
    }
}
