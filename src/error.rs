//! Funnel Errors
//!
//! Domain error taxonomy shared by the orchestrator and the HTTP surface.
//! Each variant carries a stable wire code and an HTTP status.

use thiserror::Error;

use crate::oracle::{OracleError, ValidationError};

#[derive(Debug, Error)]
pub enum FunnelError {
    /// Billing gate tripped: the turn would finalize and the balance cannot cover it.
    #[error("not enough plumes (balance {balance}, cost {cost})")]
    NoPlumes { balance: i64, cost: i64 },

    #[error("reroll already used in this session")]
    RerollLimit,

    #[error("refine already used in this session")]
    RefineLimit,

    #[error("oracle quota exceeded for device {0}")]
    QuotaExceeded(String),

    #[error("invalid oracle output: {0}")]
    InvalidOracleOutput(#[from] ValidationError),

    #[error("oracle unavailable: {0}")]
    OracleUnavailable(#[source] OracleError),

    #[error("no place search could be completed")]
    ScanFailed,

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("nothing to retry")]
    NothingToRetry,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl FunnelError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoPlumes { .. } => "no_plumes",
            Self::RerollLimit => "reroll_limit",
            Self::RefineLimit => "refine_limit",
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::InvalidOracleOutput(_) => "invalid_oracle_output",
            Self::OracleUnavailable(_) | Self::ScanFailed => "oracle_unavailable",
            Self::SessionNotFound(_) => "session_not_found",
            Self::InvalidTransition(_) | Self::NothingToRetry => "invalid_transition",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::NoPlumes { .. } => 402,
            Self::RerollLimit | Self::RefineLimit | Self::QuotaExceeded(_) => 429,
            Self::InvalidOracleOutput(_) => 502,
            Self::OracleUnavailable(_) | Self::ScanFailed => 503,
            Self::SessionNotFound(_) => 404,
            Self::InvalidTransition(_) | Self::NothingToRetry => 409,
            Self::Internal(_) => 500,
        }
    }

    /// Whether a `retry()` of the pending action can help.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::OracleUnavailable(_) | Self::ScanFailed => true,
            Self::InvalidOracleOutput(_) => true,
            _ => false,
        }
    }
}

impl From<OracleError> for FunnelError {
    fn from(err: OracleError) -> Self {
        Self::OracleUnavailable(err)
    }
}

pub type FunnelResult<T> = std::result::Result<T, FunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_codes() {
        let err = FunnelError::NoPlumes { balance: 5, cost: 10 };
        assert_eq!(err.code(), "no_plumes");
        assert_eq!(err.status(), 402);
        assert!(!err.is_retryable());

        assert_eq!(FunnelError::RerollLimit.status(), 429);
        assert_eq!(FunnelError::RefineLimit.code(), "refine_limit");
        assert_eq!(FunnelError::QuotaExceeded("d".into()).code(), "quota_exceeded");
    }

    #[test]
    fn test_oracle_errors_are_retryable() {
        let err: FunnelError = OracleError::Timeout.into();
        assert_eq!(err.status(), 503);
        assert!(err.is_retryable());

        let err: FunnelError = ValidationError::MissingRecommendation.into();
        assert_eq!(err.code(), "invalid_oracle_output");
        assert_eq!(err.status(), 502);
    }
}
