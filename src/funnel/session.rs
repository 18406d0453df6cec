use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::UserContext;
use super::drill_down::{DrillDownNode, ScarcityFlags};
use super::navigator::{get_pair, DichotomyState, PoolPair};
use super::prompt::Exchange;
use crate::oracle::{OracleRequest, OracleResponse, Recommendation};
use crate::places::OutdoorActivity;

/// Labels the oracle offered, with where the user is in them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub pool: Vec<String>,
    pub emojis: Vec<Option<String>>,
    pub pool_index: usize,
    pub response: OracleResponse,
}

impl PoolSnapshot {
    pub fn from_response(response: OracleResponse) -> Self {
        let (emojis, pool) = response.pool().iter().map(|label| split_emoji(label)).unzip();
        Self { pool, emojis, pool_index: 0, response }
    }

    pub fn pair(&self) -> PoolPair<'_> {
        get_pair(&self.pool, self.pool_index)
    }

    pub fn question(&self) -> &str {
        match &self.response.turn {
            crate::oracle::OracleTurn::Question { question, .. } => question,
            _ => &self.response.message,
        }
    }
}

/// "🎲 Jeux de société" -> (Some("🎲"), "Jeux de société").
fn split_emoji(label: &str) -> (Option<String>, String) {
    let trimmed = label.trim();
    match trimmed.split_once(' ') {
        Some((head, rest)) if !rest.trim().is_empty() && head.chars().all(|c| !c.is_alphanumeric()) => {
            (Some(head.to_string()), rest.trim().to_string())
        }
        _ => (None, trimmed.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeDuelSnapshot {
    pub remaining: Vec<String>,
    pub current: (String, String),
}

/// One variant per phase, each holding only what that phase needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum FunnelPhase {
    ThemeDuel {
        eligible: Vec<String>,
        remaining: Vec<String>,
        current: (String, String),
        history: Vec<ThemeDuelSnapshot>,
    },
    DrillDown {
        theme: String,
        is_home: bool,
        scarcity: Option<ScarcityFlags>,
        current: PoolSnapshot,
        snapshots: Vec<PoolSnapshot>,
        history: Vec<DrillDownNode>,
        exchanges: Vec<Exchange>,
    },
    PlacesScan {
        theme: String,
        radius_meters: u32,
        activities: Vec<OutdoorActivity>,
    },
    OutdoorDrill {
        theme: String,
        activities: Vec<OutdoorActivity>,
        dichotomy: DichotomyState,
    },
    Result {
        theme: String,
        recommendation: Recommendation,
        message: String,
        /// Conversation so far when the result came from the oracle.
        exchanges: Vec<Exchange>,
        /// Scanned place behind the result, best first, then alternatives.
        activities: Vec<OutdoorActivity>,
    },
}

impl FunnelPhase {
    pub fn name(&self) -> &'static str {
        match self {
            FunnelPhase::ThemeDuel { .. } => "theme_duel",
            FunnelPhase::DrillDown { .. } => "drill_down",
            FunnelPhase::PlacesScan { .. } => "places_scan",
            FunnelPhase::OutdoorDrill { .. } => "outdoor_drill",
            FunnelPhase::Result { .. } => "result",
        }
    }

    pub fn theme(&self) -> Option<&str> {
        match self {
            FunnelPhase::ThemeDuel { .. } => None,
            FunnelPhase::DrillDown { theme, .. }
            | FunnelPhase::PlacesScan { theme, .. }
            | FunnelPhase::OutdoorDrill { theme, .. }
            | FunnelPhase::Result { theme, .. } => Some(theme),
        }
    }
}

/// What an oracle call is for, so its reply is applied the right way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallPurpose {
    /// Next drill-down turn. `node` is the answer that triggered it.
    DrillDown {
        theme: String,
        is_home: bool,
        scarcity: Option<ScarcityFlags>,
        node: Option<DrillDownNode>,
        forced: bool,
    },
    Reroll,
    Refine,
    Dichotomy { theme: String },
}

/// The effect a turn still has to perform. Kept on the session until it
/// succeeds so `retry` can replay it exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PendingAction {
    Oracle {
        purpose: CallPurpose,
        request: OracleRequest,
        directive: String,
        will_finalize: bool,
        billable: bool,
    },
    Scan {
        theme: String,
        radius_meters: u32,
    },
    /// Local result once dichotomy narrowing converged.
    FinalizeOutdoor {
        billable: bool,
    },
    /// Debit for a finalized session, kept until the ledger accepted it.
    Bill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Choice,
    Back,
    Reroll,
    Refine,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAction {
    pub kind: ActionKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelSession {
    pub id: String,
    pub device_id: String,
    pub context: UserContext,
    pub created_at: DateTime<Utc>,
    pub phase: FunnelPhase,
    /// Phases left behind, most recent last. `back` pops from here.
    pub previous: Vec<FunnelPhase>,
    pub actions: Vec<SessionAction>,
    pub pending: Option<PendingAction>,
    /// Set while `pending` is being executed; nothing else may be issued meanwhile.
    /// Not persisted, a restored session has nothing running.
    #[serde(skip)]
    pub in_flight: bool,
    /// Bumped by `back`; replies issued under an older generation are dropped.
    pub generation: u64,
    pub billed: bool,
}

impl FunnelSession {
    pub fn new(device_id: impl Into<String>, context: UserContext, phase: FunnelPhase) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            context,
            created_at: Utc::now(),
            phase,
            previous: Vec::new(),
            actions: Vec::new(),
            pending: None,
            in_flight: false,
            generation: 0,
            billed: false,
        }
    }

    pub fn log(&mut self, kind: ActionKind) {
        self.actions.push(SessionAction { kind, at: Utc::now() });
    }

    pub fn has_used(&self, kind: ActionKind) -> bool {
        self.actions.iter().any(|a| a.kind == kind)
    }

    /// Billing is skipped once a reroll or refine happened, or once billed.
    pub fn is_billable(&self) -> bool {
        !self.billed && !self.has_used(ActionKind::Reroll) && !self.has_used(ActionKind::Refine)
    }

    /// Record `action` as issued and running. Returns what `drive` needs.
    pub fn dispatch(&mut self, action: PendingAction) -> (PendingAction, u64) {
        self.pending = Some(action.clone());
        self.in_flight = true;
        (action, self.generation)
    }

    /// Move to `next`, remembering the current phase for `back`.
    pub fn enter(&mut self, next: FunnelPhase) {
        let left = std::mem::replace(&mut self.phase, next);
        self.previous.push(left);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::context::{Budget, SocialGroup};
    use crate::oracle::parse_oracle_output;
    use crate::themes::Environment;

    #[test]
    fn test_split_emoji() {
        assert_eq!(split_emoji("🎲 Jeux de société"), (Some("🎲".into()), "Jeux de société".into()));
        assert_eq!(split_emoji("Jeux vidéo"), (None, "Jeux vidéo".into()));
        assert_eq!(split_emoji("🎲"), (None, "🎲".into()));
    }

    #[test]
    fn test_pool_snapshot_from_response() {
        let response = parse_oracle_output(
            r#"{"statut": "en_cours", "question": "Lequel ?", "subcategories": ["🎲 Société", "🎮 Vidéo", "Quiz"]}"#,
        )
        .unwrap();
        let snapshot = PoolSnapshot::from_response(response);
        assert_eq!(snapshot.pool, vec!["Société", "Vidéo", "Quiz"]);
        assert_eq!(snapshot.emojis[0].as_deref(), Some("🎲"));
        assert_eq!(snapshot.pair(), PoolPair::Duel("Société", "Vidéo"));
        assert_eq!(snapshot.question(), "Lequel ?");
    }

    #[test]
    fn test_billable_until_reroll_or_billed() {
        let ctx = UserContext::new(SocialGroup::Solo, 3, Budget::Free, Environment::Home);
        let phase = FunnelPhase::ThemeDuel {
            eligible: vec![],
            remaining: vec![],
            current: ("a".into(), "b".into()),
            history: vec![],
        };
        let mut session = FunnelSession::new("device", ctx, phase);
        assert!(session.is_billable());
        session.log(ActionKind::Choice);
        assert!(session.is_billable());
        session.log(ActionKind::Reroll);
        assert!(!session.is_billable());
    }
}
