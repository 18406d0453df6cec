//! Billing gate around finalized recommendations.
//!
//! The gate runs before the oracle call it protects; the debit runs after a
//! finalized result and is keyed off session history so retries and
//! rerolls never bill twice.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ConsumeOutcome, PlumesLedger, SESSION_COST};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GateDecision {
    Ok,
    Blocked { balance: i64 },
}

/// Blocked iff the turn will finalize, nobody grants premium, and the
/// balance cannot cover [`SESSION_COST`].
pub async fn pre_check_gate(
    ledger: &dyn PlumesLedger,
    device_id: &str,
    will_finalize: bool,
    external_premium: bool,
) -> Result<GateDecision> {
    if !will_finalize || external_premium {
        return Ok(GateDecision::Ok);
    }
    let account = ledger.get_account(device_id).await?;
    if account.is_premium || account.balance >= SESSION_COST {
        return Ok(GateDecision::Ok);
    }
    info!("Gate blocked {}: balance {} < {}", device_id, account.balance, SESSION_COST);
    Ok(GateDecision::Blocked { balance: account.balance })
}

/// Debit the session cost at the first finalized result only.
///
/// Returns `None` when nothing had to be consumed.
pub async fn post_finalize_consume(
    ledger: &dyn PlumesLedger,
    device_id: &str,
    status_is_final: bool,
    had_refine_or_reroll: bool,
) -> Result<Option<ConsumeOutcome>> {
    if !status_is_final || had_refine_or_reroll {
        return Ok(None);
    }
    let outcome = ledger.consume(device_id, SESSION_COST).await?;
    if let ConsumeOutcome::Insufficient { balance } = outcome {
        warn!("Finalized session for {} could not be billed (balance {})", device_id, balance);
    }
    Ok(Some(outcome))
}
