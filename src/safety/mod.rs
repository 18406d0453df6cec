//! Safety Module
//!
//! Guardrails on oracle usage.

mod rate_limiter;

pub use rate_limiter::RateLimiter;

use std::time::Duration;
use tracing::warn;

use crate::error::{FunnelError, FunnelResult};

/// Per-device oracle call quota.
pub struct OracleQuota {
    limiter: Option<RateLimiter>,
}

impl OracleQuota {
    pub fn new(burst: u32, refill_every: Duration) -> Self {
        Self { limiter: Some(RateLimiter::new(burst, refill_every)) }
    }

    pub fn unlimited() -> Self {
        Self { limiter: None }
    }

    pub async fn check(&self, device_id: &str) -> FunnelResult<()> {
        match &self.limiter {
            Some(limiter) if !limiter.check(device_id).await => {
                warn!("Oracle quota exceeded for device {}", device_id);
                Err(FunnelError::QuotaExceeded(device_id.to_string()))
            }
            _ => Ok(()),
        }
    }
}

impl Default for OracleQuota {
    fn default() -> Self {
        Self { limiter: Some(RateLimiter::default()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_quota_maps_to_error_code() {
        let quota = OracleQuota::new(1, Duration::from_secs(60));
        assert!(quota.check("d").await.is_ok());
        let err = quota.check("d").await.unwrap_err();
        assert_eq!(err.code(), "quota_exceeded");
        assert_eq!(err.status(), 429);
    }

    #[tokio::test]
    async fn test_unlimited() {
        let quota = OracleQuota::unlimited();
        for _ in 0..100 {
            assert!(quota.check("d").await.is_ok());
        }
    }
}
