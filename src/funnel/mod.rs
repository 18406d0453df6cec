//! Funnel Module
//!
//! Narrowing a user's wish down to one activity: theme duel, oracle-backed
//! drill-down, and for location-based sessions a place scan followed by
//! local dichotomy duels.

mod context;
mod drill_down;
mod navigator;
mod orchestrator;
mod prompt;
mod session;
mod store;

pub use context::{Budget, SocialGroup, UserContext};
pub use drill_down::{
    build, Choice, DrillDownInput, DrillDownNode, DrillDownState, Instruction, ScarcityFlags, NEITHER_STREAK,
};
pub use navigator::{
    advance, apply_choice, get_pair, is_converged, next_duel_index, rewind, DichotomyNode, DichotomyPool,
    DichotomySnapshot, DichotomyState, PoolPair, CONVERGED_AT,
};
pub use orchestrator::{ErrorInfo, FunnelOrchestrator, FunnelView, SessionView, ThemeCard};
pub use prompt::Exchange;
pub use session::{
    ActionKind, CallPurpose, FunnelPhase, FunnelSession, PendingAction, PoolSnapshot, SessionAction,
    ThemeDuelSnapshot,
};
pub use store::SessionStore;
