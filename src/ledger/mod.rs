//! Plumes Ledger
//!
//! Per-device virtual-currency accounts. Every operation is atomic at the
//! storage layer; callers never read a balance and write it back.

mod billing;
mod sqlite;

pub use billing::{post_finalize_consume, pre_check_gate, GateDecision};
pub use sqlite::SqlitePlumesLedger;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_BALANCE: i64 = 30;
pub const SESSION_COST: i64 = 10;
pub const AD_REWARD: i64 = 30;
pub const DAILY_REWARD: i64 = 10;
pub const SMALL_PACK: i64 = 100;
pub const LARGE_PACK: i64 = 300;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlumesAccount {
    pub device_id: String,
    pub balance: i64,
    pub is_premium: bool,
    pub last_daily_reward_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConsumeOutcome {
    Consumed { balance: i64 },
    /// Premium account: nothing was debited.
    Unlimited,
    Insufficient { balance: i64 },
}

impl ConsumeOutcome {
    pub fn succeeded(&self) -> bool {
        !matches!(self, ConsumeOutcome::Insufficient { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DailyClaim {
    Claimed { balance: i64 },
    TooEarly { next_claim_at: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PromoRedemption {
    Credited { bonus: i64, balance: i64 },
    PremiumGranted,
}

#[derive(Debug, Error)]
pub enum PromoError {
    #[error("invalid promo code")]
    Invalid,
    #[error("promo code already redeemed on this device")]
    AlreadyRedeemed,
    #[error("ledger storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl PromoError {
    pub fn code(&self) -> &'static str {
        match self {
            PromoError::Invalid => "invalid",
            PromoError::AlreadyRedeemed => "already_redeemed",
            PromoError::Storage(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for PromoError {
    fn from(err: rusqlite::Error) -> Self {
        PromoError::Storage(err.into())
    }
}

/// In-app purchase packs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pack {
    Small,
    Large,
}

impl Pack {
    pub fn amount(&self) -> i64 {
        match self {
            Pack::Small => SMALL_PACK,
            Pack::Large => LARGE_PACK,
        }
    }
}

/// Storage interface for plumes accounts. Accounts are created lazily with
/// [`DEFAULT_BALANCE`] on first touch.
#[async_trait]
pub trait PlumesLedger: Send + Sync {
    async fn get_account(&self, device_id: &str) -> Result<PlumesAccount>;

    /// Debit `amount` iff the balance covers it. Premium accounts are never debited.
    async fn consume(&self, device_id: &str, amount: i64) -> Result<ConsumeOutcome>;

    /// Returns the new balance.
    async fn credit(&self, device_id: &str, amount: i64) -> Result<i64>;

    /// Credit [`DAILY_REWARD`] iff at least 24h elapsed since the last claim.
    async fn claim_daily(&self, device_id: &str, now: DateTime<Utc>) -> Result<DailyClaim>;

    async fn set_premium(&self, device_id: &str, premium: bool) -> Result<()>;

    async fn register_promo(&self, code: &str, bonus: i64, grants_premium: bool) -> Result<()>;

    async fn redeem_promo(&self, device_id: &str, code: &str) -> Result<PromoRedemption, PromoError>;

    async fn reward_ad(&self, device_id: &str) -> Result<i64> {
        self.credit(device_id, AD_REWARD).await
    }

    async fn credit_pack(&self, device_id: &str, pack: Pack) -> Result<i64> {
        self.credit(device_id, pack.amount()).await
    }
}

/// Promo codes are matched case-insensitively.
pub(crate) fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}
