//! Funnel Orchestrator
//!
//! Top-level state machine. Each user action mutates the session under the
//! store lock and may yield one [`PendingAction`]; the action runs with the
//! lock released, then its outcome is applied if the session generation did
//! not move in the meantime. Applying can chain a further action (scan ->
//! dichotomy call, exhausted reply -> forced finalize, finalize -> debit).
//! Nothing new is issued while an action is in flight.

use anyhow::anyhow;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::context::UserContext;
use super::drill_down::{build, Choice, DrillDownInput, DrillDownNode, Instruction, ScarcityFlags};
use super::navigator::{advance, rewind, DichotomyState, PoolPair};
use super::prompt::{self, Exchange};
use super::session::{
    ActionKind, CallPurpose, FunnelPhase, FunnelSession, PendingAction, PoolSnapshot, ThemeDuelSnapshot,
};
use super::store::SessionStore;
use crate::config::{FunnelSettings, OracleSettings};
use crate::error::{FunnelError, FunnelResult};
use crate::ledger::{post_finalize_consume, pre_check_gate, ConsumeOutcome, GateDecision, PlumesLedger, SESSION_COST};
use crate::oracle::{
    parse_dichotomy_pool, parse_oracle_output, Action, ChatMessage, Oracle, OracleRequest, Recommendation,
    Statut, ValidationError,
};
use crate::places::{OutdoorActivity, ScanOutcome, ScanPipeline, MAX_RADIUS_METERS, MIN_DICHOTOMY_CANDIDATES};
use crate::safety::OracleQuota;
use crate::themes::{self, Environment, ThemeConfig};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThemeCard {
    pub slug: String,
    pub name: String,
    pub emoji: String,
}

impl From<&ThemeConfig> for ThemeCard {
    fn from(theme: &ThemeConfig) -> Self {
        Self { slug: theme.slug.to_string(), name: theme.name.to_string(), emoji: theme.emoji.to_string() }
    }
}

/// What a client needs to render the current step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum FunnelView {
    ThemeDuel {
        a: ThemeCard,
        b: ThemeCard,
    },
    DrillDown {
        message: String,
        question: String,
        option_a: String,
        option_b: Option<String>,
        emoji_a: Option<String>,
        emoji_b: Option<String>,
        depth: u32,
        branch_path: Vec<String>,
    },
    PlacesScan {
        theme: String,
        radius_meters: u32,
    },
    OutdoorDrill {
        message: String,
        question: Option<String>,
        option_a: Option<String>,
        option_b: Option<String>,
        candidates: usize,
    },
    Result {
        theme: String,
        message: String,
        recommendation: Recommendation,
        place: Option<OutdoorActivity>,
        maps_url: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub code: &'static str,
    pub message: String,
}

impl From<&FunnelError> for ErrorInfo {
    fn from(err: &FunnelError) -> Self {
        Self { code: err.code(), message: err.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub session_id: String,
    pub generation: u64,
    pub can_retry: bool,
    pub can_reroll: bool,
    pub can_refine: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(flatten)]
    pub view: FunnelView,
}

/// Result of running a [`PendingAction`].
enum Outcome {
    Reply(String),
    Scanned(ScanOutcome),
    Ready,
    Billed(Option<ConsumeOutcome>),
}

/// What to do after an outcome was applied.
enum Next {
    Nothing,
    Effect(PendingAction),
    Bill,
}

/// Everything a drill-down oracle turn is derived from.
struct DrillTurn<'a> {
    context: &'a UserContext,
    theme: &'a str,
    is_home: bool,
    scarcity: Option<ScarcityFlags>,
    /// Answered nodes, the triggering one included.
    history: &'a [DrillDownNode],
    exchanges: &'a [Exchange],
    node: Option<DrillDownNode>,
    force: bool,
    billable: bool,
}

pub struct FunnelOrchestrator {
    oracle: Arc<dyn Oracle>,
    ledger: Arc<dyn PlumesLedger>,
    scanner: Option<ScanPipeline>,
    store: SessionStore,
    quota: OracleQuota,
    oracle_settings: OracleSettings,
    settings: FunnelSettings,
}

impl FunnelOrchestrator {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        ledger: Arc<dyn PlumesLedger>,
        oracle_settings: OracleSettings,
        settings: FunnelSettings,
    ) -> Self {
        Self {
            oracle,
            ledger,
            scanner: None,
            store: SessionStore::new(),
            quota: OracleQuota::unlimited(),
            oracle_settings,
            settings,
        }
    }

    pub fn with_scanner(mut self, scanner: ScanPipeline) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn with_quota(mut self, quota: OracleQuota) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.store = store;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<dyn PlumesLedger> {
        &self.ledger
    }

    /// Open a session. A hint naming an eligible theme skips the theme duel.
    ///
    /// Failures of the first oracle call or scan do not fail the start: the
    /// session is returned with the error attached and a retry available.
    pub async fn start(&self, device_id: &str, context: UserContext) -> FunnelResult<SessionView> {
        context.validate()?;
        let environment = context.environment;
        let eligible = themes::eligible_themes(environment);
        let (a, b) = themes::pick_duel(&eligible, &mut rand::thread_rng()).map_err(|e| anyhow!(e))?;

        let phase = FunnelPhase::ThemeDuel {
            eligible: eligible.iter().map(|t| t.slug.to_string()).collect(),
            remaining: eligible.iter().map(|t| t.slug.to_string()).collect(),
            current: (a.slug.to_string(), b.slug.to_string()),
            history: Vec::new(),
        };
        let hinted = context
            .hint
            .as_deref()
            .and_then(themes::match_hint)
            .filter(|t| t.is_eligible(environment));

        let mut session = FunnelSession::new(device_id, context, phase);
        let id = session.id.clone();
        info!("Session {} started for device {} ({})", id, device_id, environment);

        let first = match hinted {
            Some(theme) => {
                info!("Hint matched theme {}, skipping the theme duel", theme.slug);
                let action = self.enter_theme(&mut session, theme.slug)?;
                let (action, _) = session.dispatch(action);
                Some(action)
            }
            None => None,
        };
        let generation = session.generation;
        self.store.insert(session).await;

        match first {
            Some(action) => match self.drive(&id, generation, action).await {
                Ok(view) => Ok(view),
                Err(err) => {
                    warn!("First step of session {} failed: {}", id, err);
                    let mut view = self.view(&id).await?;
                    view.error = Some(ErrorInfo::from(&err));
                    Ok(view)
                }
            },
            None => self.view(&id).await,
        }
    }

    pub async fn choose(&self, session_id: &str, choice: Choice) -> FunnelResult<SessionView> {
        let issued = self
            .store
            .update(session_id, |s| {
                ensure_idle(s)?;
                let action = match s.phase {
                    FunnelPhase::ThemeDuel { .. } => self.choose_theme(s, choice)?,
                    FunnelPhase::DrillDown { .. } => self.choose_in_drill(s, choice)?,
                    FunnelPhase::OutdoorDrill { .. } => choose_outdoor(s, choice)?,
                    FunnelPhase::PlacesScan { .. } => {
                        return Err(FunnelError::InvalidTransition("place scan still running".into()))
                    }
                    FunnelPhase::Result { .. } => {
                        return Err(FunnelError::InvalidTransition("session already has a result".into()))
                    }
                };
                s.log(ActionKind::Choice);
                match action {
                    Some(action) => Ok(Some(s.dispatch(action))),
                    None => {
                        s.pending = None;
                        Ok(None)
                    }
                }
            })
            .await?;

        match issued {
            Some((action, generation)) => self.drive(session_id, generation, action).await,
            None => self.view(session_id).await,
        }
    }

    /// Step back: previous pair, pool or duel first, then the previous phase.
    pub async fn back(&self, session_id: &str) -> FunnelResult<SessionView> {
        self.store
            .update(session_id, |s| {
                if matches!(s.pending, Some(PendingAction::Bill)) {
                    return Err(FunnelError::InvalidTransition("session debit must be retried first".into()));
                }
                let moved = match &mut s.phase {
                    FunnelPhase::ThemeDuel { remaining, current, history, .. } => match history.pop() {
                        Some(snapshot) => {
                            *remaining = snapshot.remaining;
                            *current = snapshot.current;
                            true
                        }
                        None => false,
                    },
                    FunnelPhase::DrillDown { current, snapshots, history, exchanges, .. } => {
                        if current.pool_index > 0 {
                            current.pool_index = rewind(current.pool_index);
                            true
                        } else if let Some(previous) = snapshots.pop() {
                            *current = previous;
                            history.pop();
                            exchanges.pop();
                            true
                        } else {
                            false
                        }
                    }
                    FunnelPhase::OutdoorDrill { dichotomy, .. } => dichotomy.back(),
                    FunnelPhase::PlacesScan { .. } | FunnelPhase::Result { .. } => false,
                };

                if !moved {
                    pop_phase(s)?;
                }
                s.generation += 1;
                s.pending = None;
                s.in_flight = false;
                s.log(ActionKind::Back);
                debug!("Session {} back to {} (generation {})", s.id, s.phase.name(), s.generation);
                Ok(())
            })
            .await?;
        self.view(session_id).await
    }

    /// Replay the action that failed last.
    pub async fn retry(&self, session_id: &str) -> FunnelResult<SessionView> {
        let (action, generation) = self
            .store
            .update(session_id, |s| {
                if s.in_flight {
                    return Err(FunnelError::InvalidTransition("previous step still running".into()));
                }
                let action = s.pending.clone().ok_or(FunnelError::NothingToRetry)?;
                Ok(s.dispatch(action))
            })
            .await?;
        info!("Retrying pending action for session {}", session_id);
        self.drive(session_id, generation, action).await
    }

    /// Another recommendation on the same branch. Once per session.
    pub async fn reroll(&self, session_id: &str) -> FunnelResult<SessionView> {
        let issued = self
            .store
            .update(session_id, |s| {
                ensure_idle(s)?;
                if !matches!(s.phase, FunnelPhase::Result { .. }) {
                    return Err(FunnelError::InvalidTransition("reroll needs a result".into()));
                }
                if s.has_used(ActionKind::Reroll) {
                    return Err(FunnelError::RerollLimit);
                }
                s.log(ActionKind::Reroll);
                let billable = s.is_billable();

                let FunnelPhase::Result { theme, recommendation, message, exchanges, activities } = &mut s.phase else {
                    return Err(FunnelError::InvalidTransition("reroll needs a result".into()));
                };

                // scanned results reroll locally to the next best place
                if activities.len() > 1 {
                    activities.rotate_left(1);
                    if let Some(theme_config) = themes::by_slug(theme) {
                        *recommendation = recommend_place(theme_config, &activities[0]);
                    }
                    *message = format!("Et pourquoi pas {} ?", activities[0].name);
                    return Ok(None);
                }

                let theme_config = lookup_theme(theme)?;
                let directive = prompt::reroll_directive(recommendation);
                let request = self.request(prompt::build_messages(theme_config, &s.context, exchanges, &directive));
                let action = PendingAction::Oracle {
                    purpose: CallPurpose::Reroll,
                    request,
                    directive,
                    will_finalize: true,
                    billable,
                };
                Ok(Some(s.dispatch(action)))
            })
            .await?;

        match issued {
            Some((action, generation)) => self.drive(session_id, generation, action).await,
            None => self.view(session_id).await,
        }
    }

    /// Narrow the current result further. Once per session.
    pub async fn refine(&self, session_id: &str) -> FunnelResult<SessionView> {
        let (action, generation) = self
            .store
            .update(session_id, |s| {
                ensure_idle(s)?;
                let FunnelPhase::Result { theme, recommendation, exchanges, .. } = &s.phase else {
                    return Err(FunnelError::InvalidTransition("refine needs a result".into()));
                };
                if s.has_used(ActionKind::Refine) {
                    return Err(FunnelError::RefineLimit);
                }
                let theme_config = lookup_theme(theme)?;
                let directive = prompt::refine_directive(recommendation);
                let request = self.request(prompt::build_messages(theme_config, &s.context, exchanges, &directive));

                s.log(ActionKind::Refine);
                let action = PendingAction::Oracle {
                    purpose: CallPurpose::Refine,
                    request,
                    directive,
                    will_finalize: false,
                    billable: s.is_billable(),
                };
                Ok(s.dispatch(action))
            })
            .await?;
        self.drive(session_id, generation, action).await
    }

    pub async fn view(&self, session_id: &str) -> FunnelResult<SessionView> {
        let session = self.store.get(session_id).await?;
        Ok(self.render(&session))
    }

    fn render(&self, s: &FunnelSession) -> SessionView {
        let in_result = matches!(s.phase, FunnelPhase::Result { .. });
        let view = match &s.phase {
            FunnelPhase::ThemeDuel { current, .. } => {
                let card = |slug: &str| {
                    themes::by_slug(slug).map(ThemeCard::from).unwrap_or_else(|| ThemeCard {
                        slug: slug.to_string(),
                        name: slug.to_string(),
                        emoji: String::new(),
                    })
                };
                FunnelView::ThemeDuel { a: card(&current.0), b: card(&current.1) }
            }
            FunnelPhase::DrillDown { theme, is_home, current, history, .. } => {
                let state = build(&DrillDownInput {
                    theme_slug: theme,
                    is_home: *is_home,
                    history,
                    choice: history.last().map(|n| n.choice),
                    min_depth: self.settings.min_depth,
                    max_depth: self.settings.max_depth,
                    consecutive_neithers: None,
                    scarcity: None,
                    force_finalize: false,
                });
                let (option_a, option_b) = match current.pair() {
                    PoolPair::Duel(a, b) => (a.to_string(), Some(b.to_string())),
                    PoolPair::Solo(a) => (a.to_string(), None),
                    PoolPair::Exhausted => (String::new(), None),
                };
                let emoji = |i: usize| current.emojis.get(i).cloned().flatten();
                FunnelView::DrillDown {
                    message: current.response.message.clone(),
                    question: current.question().to_string(),
                    option_a,
                    emoji_a: emoji(current.pool_index),
                    emoji_b: option_b.as_ref().and_then(|_| emoji(current.pool_index + 1)),
                    option_b,
                    depth: state.depth,
                    branch_path: state.branch_path,
                }
            }
            FunnelPhase::PlacesScan { theme, radius_meters, .. } => {
                FunnelView::PlacesScan { theme: theme.clone(), radius_meters: *radius_meters }
            }
            FunnelPhase::OutdoorDrill { dichotomy, .. } => {
                let duel = dichotomy.current_duel();
                FunnelView::OutdoorDrill {
                    message: dichotomy.pool.message.clone(),
                    question: duel.map(|d| d.question.clone()),
                    option_a: duel.map(|d| d.label_a.clone()),
                    option_b: duel.map(|d| d.label_b.clone()),
                    candidates: dichotomy.candidates.len(),
                }
            }
            FunnelPhase::Result { theme, recommendation, message, activities, .. } => FunnelView::Result {
                theme: theme.clone(),
                message: message.clone(),
                recommendation: recommendation.clone(),
                place: activities.first().cloned(),
                maps_url: activities.first().map(OutdoorActivity::maps_url),
            },
        };

        SessionView {
            session_id: s.id.clone(),
            generation: s.generation,
            can_retry: s.pending.is_some() && !s.in_flight,
            can_reroll: in_result && !s.has_used(ActionKind::Reroll),
            can_refine: in_result && !s.has_used(ActionKind::Refine),
            error: None,
            view,
        }
    }

    fn request(&self, messages: Vec<ChatMessage>) -> OracleRequest {
        OracleRequest {
            model: self.oracle_settings.model.clone(),
            messages,
            temperature: self.oracle_settings.temperature,
            max_tokens: self.oracle_settings.max_tokens,
        }
    }

    fn choose_theme(&self, s: &mut FunnelSession, choice: Choice) -> FunnelResult<Option<PendingAction>> {
        let FunnelPhase::ThemeDuel { eligible, remaining, current, history } = &mut s.phase else {
            return Err(FunnelError::InvalidTransition("not in a theme duel".into()));
        };
        let picked = match choice {
            Choice::A => current.0.clone(),
            Choice::B => current.1.clone(),
            Choice::Neither => {
                history.push(ThemeDuelSnapshot { remaining: remaining.clone(), current: current.clone() });
                let rejected = current.clone();
                remaining.retain(|t| *t != rejected.0 && *t != rejected.1);
                if remaining.len() < 2 {
                    *remaining = eligible
                        .iter()
                        .filter(|t| **t != rejected.0 && **t != rejected.1)
                        .cloned()
                        .collect();
                }
                let pool: Vec<&ThemeConfig> = remaining.iter().filter_map(|slug| themes::by_slug(slug)).collect();
                let (a, b) = themes::pick_duel(&pool, &mut rand::thread_rng()).map_err(|e| anyhow!(e))?;
                *current = (a.slug.to_string(), b.slug.to_string());
                return Ok(None);
            }
        };
        info!("Session {} picked theme {}", s.id, picked);
        self.enter_theme(s, &picked).map(Some)
    }

    /// First step inside a theme: a place scan when the session is
    /// location-based and a scanner is configured, else the first oracle turn.
    fn enter_theme(&self, s: &mut FunnelSession, theme: &str) -> FunnelResult<PendingAction> {
        let context = &s.context;
        let location_based = context.environment.is_location_based();

        if location_based && context.location.is_some() && self.scanner.is_some() {
            let radius_meters = context
                .radius_meters
                .unwrap_or(self.settings.initial_radius_meters)
                .min(MAX_RADIUS_METERS);
            s.enter(FunnelPhase::PlacesScan { theme: theme.to_string(), radius_meters, activities: Vec::new() });
            return Ok(PendingAction::Scan { theme: theme.to_string(), radius_meters });
        }

        self.drill_call(DrillTurn {
            context,
            theme,
            is_home: context.environment == Environment::Home,
            scarcity: None,
            history: &[],
            exchanges: &[],
            node: None,
            force: false,
            billable: s.is_billable(),
        })
    }

    fn choose_in_drill(&self, s: &mut FunnelSession, choice: Choice) -> FunnelResult<Option<PendingAction>> {
        let billable = s.is_billable();
        let context = s.context.clone();
        let FunnelPhase::DrillDown { theme, is_home, scarcity, current, history, exchanges, .. } = &mut s.phase
        else {
            return Err(FunnelError::InvalidTransition("not in a drill-down".into()));
        };

        let (option_a, option_b) = match current.pair() {
            PoolPair::Duel(a, b) => (a.to_string(), Some(b.to_string())),
            PoolPair::Solo(a) => (a.to_string(), None),
            PoolPair::Exhausted => return Err(FunnelError::InvalidTransition("pool exhausted".into())),
        };
        if choice == Choice::B && option_b.is_none() {
            return Err(FunnelError::InvalidTransition("only one option left".into()));
        }

        if choice == Choice::Neither {
            let next = advance(current.pool_index);
            if next < current.pool.len() {
                current.pool_index = next;
                return Ok(None);
            }
        }

        // reaching here on "neither" means every pair of the pool was turned down
        let rejected = if choice == Choice::Neither { current.pool.clone() } else { Vec::new() };
        let node = DrillDownNode {
            question: current.question().to_string(),
            option_a,
            option_b: option_b.unwrap_or_default(),
            choice,
            rejected,
        };
        let mut path = history.clone();
        path.push(node.clone());

        self.drill_call(DrillTurn {
            context: &context,
            theme,
            is_home: *is_home,
            scarcity: *scarcity,
            history: &path,
            exchanges,
            node: Some(node),
            force: false,
            billable,
        })
        .map(Some)
    }

    fn drill_call(&self, turn: DrillTurn<'_>) -> FunnelResult<PendingAction> {
        let theme = lookup_theme(turn.theme)?;
        let input = DrillDownInput {
            theme_slug: turn.theme,
            is_home: turn.is_home,
            history: turn.history,
            choice: turn.node.as_ref().map(|n| n.choice),
            min_depth: self.settings.min_depth,
            max_depth: self.settings.max_depth,
            consecutive_neithers: None,
            scarcity: turn.scarcity,
            force_finalize: turn.force,
        };
        let mut state = build(&input);

        // nothing nearby and at-home ideas exhausted: best-effort guess
        if state.is_impasse && state.fallback_level == Some(3) && !turn.force {
            state = build(&DrillDownInput { force_finalize: true, ..input });
        }
        let forced = state.instruction == Instruction::Finalize;

        let directive = prompt::directive(&state);
        let request = self.request(prompt::build_messages(theme, turn.context, turn.exchanges, &directive));
        debug!("Drill-down depth {} instruction {:?}", state.depth, state.instruction);

        Ok(PendingAction::Oracle {
            purpose: CallPurpose::DrillDown {
                theme: turn.theme.to_string(),
                is_home: turn.is_home,
                scarcity: turn.scarcity,
                node: turn.node,
                forced,
            },
            request,
            directive,
            will_finalize: state.instruction.allows_finalize(),
            billable: turn.billable,
        })
    }

    /// Run `action` and apply its outcome, following chained actions.
    ///
    /// An outcome is applied only while the session still waits on that very
    /// action at the generation it was issued for.
    async fn drive(&self, session_id: &str, generation: u64, mut action: PendingAction) -> FunnelResult<SessionView> {
        loop {
            let snapshot = self.store.get(session_id).await?;
            let outcome = match self.execute(&snapshot, &action).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.store
                        .update(session_id, |s| {
                            if s.generation == generation {
                                s.in_flight = false;
                                // quota refusals are not worth a retry
                                if matches!(err, FunnelError::QuotaExceeded(_)) {
                                    s.pending = None;
                                }
                            }
                            Ok(())
                        })
                        .await?;
                    return Err(err);
                }
            };

            let next = self
                .store
                .update(session_id, |s| {
                    if s.generation != generation || s.pending.as_ref() != Some(&action) {
                        debug!(
                            "Dropping stale outcome for session {} (generation {} != {})",
                            s.id, generation, s.generation
                        );
                        return Ok(Next::Nothing);
                    }
                    s.pending = None;
                    s.in_flight = false;
                    match self.apply(s, &action, &outcome) {
                        Ok(Next::Effect(next)) => Ok(Next::Effect(s.dispatch(next).0)),
                        Ok(Next::Bill) => {
                            s.billed = true;
                            Ok(Next::Effect(s.dispatch(PendingAction::Bill).0))
                        }
                        Ok(Next::Nothing) => Ok(Next::Nothing),
                        Err(err) => {
                            s.pending = Some(with_correction(&action, &outcome, &err));
                            Err(err)
                        }
                    }
                })
                .await?;

            match next {
                Next::Effect(chained) => action = chained,
                _ => break,
            }
        }
        self.view(session_id).await
    }

    async fn execute(&self, session: &FunnelSession, action: &PendingAction) -> FunnelResult<Outcome> {
        match action {
            PendingAction::Oracle { request, will_finalize, billable, .. } => {
                if *will_finalize && *billable {
                    self.gate(&session.device_id).await?;
                }
                self.quota.check(&session.device_id).await?;
                let reply = self.oracle.call(request.clone()).await?;
                if let Some(usage) = reply.usage {
                    debug!("Oracle usage: {} prompt / {} completion tokens", usage.prompt_tokens, usage.completion_tokens);
                }
                Ok(Outcome::Reply(reply.content))
            }
            PendingAction::Scan { theme, radius_meters } => {
                let scanner = self
                    .scanner
                    .as_ref()
                    .ok_or_else(|| FunnelError::InvalidTransition("no place search configured".into()))?;
                let location = session
                    .context
                    .location
                    .ok_or_else(|| FunnelError::InvalidTransition("session has no location".into()))?;
                let theme = lookup_theme(theme)?;
                let outcome = scanner
                    .scan(location, *radius_meters, &[theme], self.settings.scan_filters(), &session.context.language)
                    .await?;
                Ok(Outcome::Scanned(outcome))
            }
            PendingAction::FinalizeOutdoor { billable } => {
                if *billable {
                    self.gate(&session.device_id).await?;
                }
                Ok(Outcome::Ready)
            }
            PendingAction::Bill => {
                let had_refine_or_reroll = session.has_used(ActionKind::Reroll) || session.has_used(ActionKind::Refine);
                let outcome =
                    post_finalize_consume(self.ledger.as_ref(), &session.device_id, true, had_refine_or_reroll).await?;
                Ok(Outcome::Billed(outcome))
            }
        }
    }

    async fn gate(&self, device_id: &str) -> FunnelResult<()> {
        match pre_check_gate(self.ledger.as_ref(), device_id, true, false).await? {
            GateDecision::Ok => Ok(()),
            GateDecision::Blocked { balance } => Err(FunnelError::NoPlumes { balance, cost: SESSION_COST }),
        }
    }

    fn apply(&self, s: &mut FunnelSession, action: &PendingAction, outcome: &Outcome) -> FunnelResult<Next> {
        match (action, outcome) {
            (PendingAction::Oracle { purpose, directive, billable, .. }, Outcome::Reply(text)) => match purpose {
                CallPurpose::DrillDown { theme, is_home, scarcity, node, forced } => {
                    self.apply_drill_reply(s, text, directive, theme, *is_home, *scarcity, node.as_ref(), *forced, *billable)
                }
                CallPurpose::Reroll | CallPurpose::Refine => self.apply_result_reply(s, text, directive, *billable),
                CallPurpose::Dichotomy { theme } => apply_dichotomy_reply(s, text, theme),
            },
            (PendingAction::Scan { theme, radius_meters }, Outcome::Scanned(scan)) => {
                self.apply_scan(s, theme, *radius_meters, scan)
            }
            (PendingAction::FinalizeOutdoor { billable }, Outcome::Ready) => {
                finalize_outdoor(s)?;
                Ok(if *billable { Next::Bill } else { Next::Nothing })
            }
            (PendingAction::Bill, Outcome::Billed(outcome)) => {
                info!("Session {} billed: {:?}", s.id, outcome);
                if outcome.as_ref().is_some_and(|o| !o.succeeded()) {
                    s.billed = false;
                }
                Ok(Next::Nothing)
            }
            _ => Err(FunnelError::Internal(anyhow!("outcome does not match its action"))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_drill_reply(
        &self,
        s: &mut FunnelSession,
        text: &str,
        directive: &str,
        theme: &str,
        is_home: bool,
        scarcity: Option<ScarcityFlags>,
        node: Option<&DrillDownNode>,
        forced: bool,
        billable: bool,
    ) -> FunnelResult<Next> {
        let response = parse_oracle_output(text)?;
        let exchange = Exchange { directive: directive.to_string(), reply: response.to_json() };

        match response.statut() {
            Statut::EnCours => {
                let message = response.message.clone();
                let snapshot = PoolSnapshot::from_response(response);
                let same_drill = matches!(&s.phase, FunnelPhase::DrillDown { theme: t, .. } if t == theme);

                match (&mut s.phase, node) {
                    (FunnelPhase::DrillDown { current, snapshots, history, exchanges, .. }, Some(node)) if same_drill => {
                        snapshots.push(std::mem::replace(current, snapshot));
                        history.push(node.clone());
                        exchanges.push(exchange);
                    }
                    _ => {
                        // later turns of an at-home fallback are past level 2
                        let carried = scarcity.map(|f| ScarcityFlags {
                            home_mode_tried: f.home_mode_tried || f.fallback_level() >= 2,
                            ..f
                        });
                        let history = node.into_iter().cloned().collect();
                        s.enter(FunnelPhase::DrillDown {
                            theme: theme.to_string(),
                            is_home,
                            scarcity: carried,
                            current: snapshot,
                            snapshots: Vec::new(),
                            history,
                            exchanges: vec![exchange],
                        });
                    }
                }
                debug!("Session {} got a new pool: {}", s.id, message);
                Ok(Next::Nothing)
            }
            Statut::Finalise => {
                let recommendation = response
                    .recommendation()
                    .cloned()
                    .ok_or(ValidationError::MissingRecommendation)?;
                let mut transcript = match &s.phase {
                    FunnelPhase::DrillDown { exchanges, .. } => exchanges.clone(),
                    _ => Vec::new(),
                };
                transcript.push(exchange);
                info!("Session {} finalized: {}", s.id, recommendation.titre);
                s.enter(FunnelPhase::Result {
                    theme: theme.to_string(),
                    recommendation,
                    message: response.message,
                    exchanges: transcript,
                    activities: Vec::new(),
                });
                Ok(if billable { Next::Bill } else { Next::Nothing })
            }
            Statut::Epuise => {
                if forced {
                    return Err(ValidationError::MissingRecommendation.into());
                }
                warn!("Oracle exhausted for session {}, forcing a final answer", s.id);
                let (mut path, exchanges) = match &s.phase {
                    FunnelPhase::DrillDown { history, exchanges, .. } => (history.clone(), exchanges.clone()),
                    _ => (Vec::new(), Vec::new()),
                };
                path.extend(node.cloned());
                let next = self.drill_call(DrillTurn {
                    context: &s.context,
                    theme,
                    is_home,
                    scarcity,
                    history: &path,
                    exchanges: &exchanges,
                    node: node.cloned(),
                    force: true,
                    billable,
                })?;
                Ok(Next::Effect(next))
            }
        }
    }

    fn apply_result_reply(
        &self,
        s: &mut FunnelSession,
        text: &str,
        directive: &str,
        billable: bool,
    ) -> FunnelResult<Next> {
        let response = parse_oracle_output(text)?;
        let exchange = Exchange { directive: directive.to_string(), reply: response.to_json() };
        let is_home = s.context.environment == Environment::Home;

        let FunnelPhase::Result { theme, recommendation, message, exchanges, activities } = &mut s.phase else {
            return Err(FunnelError::InvalidTransition("result no longer current".into()));
        };

        match response.statut() {
            Statut::Finalise => {
                if let Some(next) = response.recommendation() {
                    *recommendation = next.clone();
                }
                *message = response.message;
                exchanges.push(exchange);
                activities.clear();
                Ok(if billable { Next::Bill } else { Next::Nothing })
            }
            Statut::EnCours => {
                let mut transcript = exchanges.clone();
                transcript.push(exchange);
                let theme = theme.clone();
                s.enter(FunnelPhase::DrillDown {
                    theme,
                    is_home,
                    scarcity: None,
                    current: PoolSnapshot::from_response(response),
                    snapshots: Vec::new(),
                    history: Vec::new(),
                    exchanges: transcript,
                });
                Ok(Next::Nothing)
            }
            Statut::Epuise => Err(ValidationError::MissingRecommendation.into()),
        }
    }

    /// Fallback ladder: widen the radius, then drill down without places.
    fn apply_scan(&self, s: &mut FunnelSession, theme: &str, radius_meters: u32, scan: &ScanOutcome) -> FunnelResult<Next> {
        let count = scan.count();
        info!(
            "Scan for {} at {}m: {} activities (shortage: {}, failed types: {})",
            theme,
            radius_meters,
            count,
            scan.shortage,
            scan.failed_types.len()
        );

        if count < MIN_DICHOTOMY_CANDIDATES {
            if radius_meters < MAX_RADIUS_METERS {
                let widened = radius_meters.saturating_mul(2).min(MAX_RADIUS_METERS);
                if let FunnelPhase::PlacesScan { radius_meters, .. } = &mut s.phase {
                    *radius_meters = widened;
                }
                return Ok(Next::Effect(PendingAction::Scan { theme: theme.to_string(), radius_meters: widened }));
            }

            let scarcity = ScarcityFlags { availability_count: count, radius_maxed: true, home_mode_tried: false };
            info!("Nothing usable within {}m, falling back to drill-down (level {})", MAX_RADIUS_METERS, scarcity.fallback_level());
            let next = self.drill_call(DrillTurn {
                context: &s.context,
                theme,
                is_home: count == 0,
                scarcity: Some(scarcity),
                history: &[],
                exchanges: &[],
                node: None,
                force: false,
                billable: s.is_billable(),
            })?;
            return Ok(Next::Effect(next));
        }

        let theme_config = lookup_theme(theme)?;
        let messages = prompt::dichotomy_messages(theme_config, &s.context, &scan.activities);
        if let FunnelPhase::PlacesScan { activities, .. } = &mut s.phase {
            *activities = scan.activities.clone();
        }
        Ok(Next::Effect(PendingAction::Oracle {
            purpose: CallPurpose::Dichotomy { theme: theme.to_string() },
            request: self.request(messages),
            directive: String::new(),
            will_finalize: false,
            billable: s.is_billable(),
        }))
    }
}

fn lookup_theme(slug: &str) -> FunnelResult<&'static ThemeConfig> {
    themes::by_slug(slug).ok_or_else(|| FunnelError::InvalidTransition(format!("unknown theme {}", slug)))
}

/// Refuse a new step while a call is running or a debit is still owed.
fn ensure_idle(s: &FunnelSession) -> FunnelResult<()> {
    if s.in_flight {
        return Err(FunnelError::InvalidTransition("previous step still running".into()));
    }
    if matches!(s.pending, Some(PendingAction::Bill)) {
        return Err(FunnelError::InvalidTransition("session debit must be retried first".into()));
    }
    Ok(())
}

/// Leave the current phase for the previous one, skipping transient scans.
fn pop_phase(s: &mut FunnelSession) -> FunnelResult<()> {
    while let Some(previous) = s.previous.pop() {
        if matches!(previous, FunnelPhase::PlacesScan { .. }) {
            continue;
        }
        s.phase = previous;
        return Ok(());
    }
    Err(FunnelError::InvalidTransition("nothing to go back to".into()))
}

fn choose_outdoor(s: &mut FunnelSession, choice: Choice) -> FunnelResult<Option<PendingAction>> {
    let billable = s.is_billable();
    let FunnelPhase::OutdoorDrill { dichotomy, .. } = &mut s.phase else {
        return Err(FunnelError::InvalidTransition("not in an outdoor drill".into()));
    };
    if dichotomy.current_duel().is_some() {
        dichotomy.choose(choice);
    }
    if dichotomy.is_converged() {
        return Ok(Some(PendingAction::FinalizeOutdoor { billable }));
    }
    Ok(None)
}

fn apply_dichotomy_reply(s: &mut FunnelSession, text: &str, theme: &str) -> FunnelResult<Next> {
    let FunnelPhase::PlacesScan { activities, .. } = &s.phase else {
        return Err(FunnelError::InvalidTransition("dichotomy reply outside a place scan".into()));
    };
    let ids: Vec<String> = activities.iter().map(|a| a.id.clone()).collect();
    let known: HashSet<String> = ids.iter().cloned().collect();
    let pool = parse_dichotomy_pool(text, &known)?;
    let activities = activities.clone();

    let dichotomy = DichotomyState::new(pool, ids);
    let converged = dichotomy.is_converged();
    debug!("Dichotomy pool with {} duels over {} places", dichotomy.pool.duels.len(), activities.len());
    s.enter(FunnelPhase::OutdoorDrill { theme: theme.to_string(), activities, dichotomy });

    if converged {
        return Ok(Next::Effect(PendingAction::FinalizeOutdoor { billable: s.is_billable() }));
    }
    Ok(Next::Nothing)
}

/// Rank the remaining candidates and move to the result.
fn finalize_outdoor(s: &mut FunnelSession) -> FunnelResult<()> {
    let FunnelPhase::OutdoorDrill { theme, activities, dichotomy } = &s.phase else {
        return Err(FunnelError::InvalidTransition("not in an outdoor drill".into()));
    };
    let theme_config = lookup_theme(theme)?;

    let mut ranked: Vec<OutdoorActivity> = activities
        .iter()
        .filter(|a| dichotomy.candidates.contains(&a.id))
        .cloned()
        .collect();
    ranked.sort_by(|a, b| {
        let score = |x: &OutdoorActivity| (x.rating.unwrap_or(0.0), x.user_rating_count.unwrap_or(0));
        let (ra, ca) = score(a);
        let (rb, cb) = score(b);
        rb.total_cmp(&ra).then(cb.cmp(&ca))
    });
    let best = ranked
        .first()
        .ok_or_else(|| FunnelError::Internal(anyhow!("dichotomy converged on no place")))?;

    let recommendation = recommend_place(theme_config, best);
    let message = format!("{} {} c'est par ici !", theme_config.emoji, best.name);
    info!("Session {} finalized locally on place {}", s.id, best.id);

    let theme = theme.clone();
    s.enter(FunnelPhase::Result { theme, recommendation, message, exchanges: Vec::new(), activities: ranked });
    Ok(())
}

fn recommend_place(theme: &ThemeConfig, place: &OutdoorActivity) -> Recommendation {
    let mut details = vec![format!("{} {}", theme.emoji, theme.name)];
    if let Some(rating) = place.rating {
        details.push(format!("★ {:.1}", rating));
    }
    if let Some(address) = &place.address {
        details.push(address.clone());
    }
    Recommendation {
        titre: place.name.clone(),
        explication: details.join(" · "),
        actions: vec![Action { kind: "maps".to_string(), label: "Y aller".to_string(), query: place.maps_query() }],
        tags: vec![theme.slug.to_string()],
    }
}

/// Pending action to keep after a failure. An invalid reply is fed back
/// with a correction so the retry does not replay the same text.
fn with_correction(action: &PendingAction, outcome: &Outcome, err: &FunnelError) -> PendingAction {
    match (action, outcome, err) {
        (PendingAction::Oracle { purpose, request, directive, will_finalize, billable }, Outcome::Reply(text), FunnelError::InvalidOracleOutput(reason)) => {
            let mut request = request.clone();
            request.messages.push(ChatMessage::assistant(text.clone()));
            request.messages.push(ChatMessage::user(format!(
                "That reply was rejected ({}). Answer again with the JSON object only.",
                reason
            )));
            PendingAction::Oracle {
                purpose: purpose.clone(),
                request,
                directive: directive.clone(),
                will_finalize: *will_finalize,
                billable: *billable,
            }
        }
        _ => action.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::context::{Budget, SocialGroup};
    use crate::ledger::{
        DailyClaim, PlumesAccount, PromoError, PromoRedemption, SqlitePlumesLedger, DEFAULT_BALANCE,
    };
    use crate::oracle::{OracleError, OracleReply};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use tokio::sync::{Mutex, Notify};

    struct ScriptedOracle {
        replies: Mutex<VecDeque<Result<String, OracleError>>>,
        requests: Mutex<Vec<OracleRequest>>,
    }

    impl ScriptedOracle {
        fn new(replies: Vec<Result<&str, OracleError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().map(|r| r.map(str::to_string)).collect()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Oracle for ScriptedOracle {
        async fn call(&self, request: OracleRequest) -> Result<OracleReply, OracleError> {
            self.requests.lock().await.push(request);
            let next = self.replies.lock().await.pop_front();
            match next {
                Some(Ok(content)) => Ok(OracleReply { content, usage: None }),
                Some(Err(e)) => Err(e),
                None => Err(OracleError::Transport("script exhausted".into())),
            }
        }
    }

    const POOL: &str = r#"{"statut": "en_cours", "phase": "questionnement", "mogogo_message": "Allez !",
        "question": "Quel genre ?", "subcategories": ["Société", "Vidéo", "Cartes"]}"#;
    const POOL_2: &str = r#"{"statut": "en_cours", "question": "Plutôt ?", "options": {"A": "Coop", "B": "Duel"}}"#;
    const FINAL: &str = r#"{"statut": "finalisé", "phase": "resultat", "mogogo_message": "Voilà !",
        "recommandation_finale": {"titre": "Soirée Codenames", "explication": "Fun", "actions": [], "tags": ["jeux"]}}"#;

    async fn orchestrator(oracle: Arc<ScriptedOracle>) -> (FunnelOrchestrator, Arc<SqlitePlumesLedger>, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let ledger = Arc::new(SqlitePlumesLedger::new(temp_file.path()).await.unwrap());
        let settings = FunnelSettings { min_depth: 2, ..FunnelSettings::default() };
        let orchestrator = FunnelOrchestrator::new(oracle, ledger.clone(), OracleSettings::default(), settings);
        (orchestrator, ledger, temp_file)
    }

    fn home_context() -> UserContext {
        UserContext::new(SocialGroup::Friends, 4, Budget::Free, Environment::Home).with_hint("des jeux")
    }

    #[tokio::test]
    async fn test_theme_duel_without_hint() {
        let oracle = ScriptedOracle::new(vec![]);
        let (orchestrator, _ledger, _f) = orchestrator(oracle.clone()).await;
        let ctx = UserContext::new(SocialGroup::Solo, 3, Budget::Free, Environment::Home);

        let view = orchestrator.start("d", ctx).await.unwrap();
        let FunnelView::ThemeDuel { a, b } = &view.view else { panic!("expected duel") };
        assert_ne!(a.slug, b.slug);

        // neither: a new pair without the rejected themes
        let next = orchestrator.choose(&view.session_id, Choice::Neither).await.unwrap();
        let FunnelView::ThemeDuel { a: a2, b: b2 } = &next.view else { panic!("expected duel") };
        for slug in [&a2.slug, &b2.slug] {
            assert!(slug != &a.slug && slug != &b.slug);
        }

        // back restores the first pair
        let back = orchestrator.back(&view.session_id).await.unwrap();
        assert_eq!(back.view, view.view);
        assert!(oracle.requests.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_hint_skips_duel_and_local_neither() {
        let oracle = ScriptedOracle::new(vec![Ok(POOL)]);
        let (orchestrator, _ledger, _f) = orchestrator(oracle.clone()).await;

        let view = orchestrator.start("d", home_context()).await.unwrap();
        let FunnelView::DrillDown { option_a, option_b, depth, .. } = &view.view else { panic!("expected drill-down") };
        assert_eq!(option_a, "Société");
        assert_eq!(option_b.as_deref(), Some("Vidéo"));
        assert_eq!(*depth, 1);

        // neither advances inside the pool without calling the oracle
        let view = orchestrator.choose(&view.session_id, Choice::Neither).await.unwrap();
        let FunnelView::DrillDown { option_a, option_b, .. } = &view.view else { panic!() };
        assert_eq!(option_a, "Cartes");
        assert!(option_b.is_none());
        assert_eq!(oracle.requests.lock().await.len(), 1);

        let view = orchestrator.back(&view.session_id).await.unwrap();
        let FunnelView::DrillDown { option_a, .. } = &view.view else { panic!() };
        assert_eq!(option_a, "Société");
    }

    #[tokio::test]
    async fn test_finalize_bills_once() {
        let oracle = ScriptedOracle::new(vec![Ok(POOL), Ok(POOL_2), Ok(FINAL)]);
        let (orchestrator, ledger, _f) = orchestrator(oracle.clone()).await;

        let view = orchestrator.start("d", home_context()).await.unwrap();
        let id = view.session_id.clone();
        orchestrator.choose(&id, Choice::A).await.unwrap();
        let view = orchestrator.choose(&id, Choice::B).await.unwrap();

        let FunnelView::Result { recommendation, .. } = &view.view else { panic!("expected result") };
        assert_eq!(recommendation.titre, "Soirée Codenames");
        assert!(view.can_reroll);
        assert_eq!(ledger.get_account("d").await.unwrap().balance, DEFAULT_BALANCE - SESSION_COST);

        // the finalizing turn carried the whole conversation
        let requests = oracle.requests.lock().await;
        let last = requests.last().unwrap();
        assert!(last.messages.iter().any(|m| m.content.contains("Coop")));
        assert!(last.messages.last().unwrap().content.contains("\"Duel\""));
    }

    #[tokio::test]
    async fn test_gate_blocks_finalizing_turn() {
        let oracle = ScriptedOracle::new(vec![Ok(POOL), Ok(FINAL)]);
        let (orchestrator, ledger, _f) = orchestrator(oracle.clone()).await;
        ledger.consume("d", DEFAULT_BALANCE).await.unwrap();

        // the first question never finalizes, so it is not gated
        let view = orchestrator.start("d", home_context()).await.unwrap();
        let id = view.session_id.clone();

        let err = orchestrator.choose(&id, Choice::A).await.unwrap_err();
        assert_eq!(err.code(), "no_plumes");
        assert_eq!(oracle.requests.lock().await.len(), 1);

        ledger.reward_ad("d").await.unwrap();
        let view = orchestrator.retry(&id).await.unwrap();
        assert!(matches!(view.view, FunnelView::Result { .. }));
        assert_eq!(ledger.get_account("d").await.unwrap().balance, 30 - SESSION_COST);
    }

    #[tokio::test]
    async fn test_retry_after_transport_failure() {
        let oracle = ScriptedOracle::new(vec![Err(OracleError::Server(503)), Ok(POOL)]);
        let (orchestrator, _ledger, _f) = orchestrator(oracle.clone()).await;

        let view = orchestrator.start("d", home_context()).await.unwrap();
        assert!(view.can_retry);
        assert_eq!(view.error.as_ref().unwrap().code, "oracle_unavailable");
        assert!(matches!(view.view, FunnelView::ThemeDuel { .. }));

        let view = orchestrator.retry(&view.session_id).await.unwrap();
        assert!(!view.can_retry);
        assert!(matches!(view.view, FunnelView::DrillDown { .. }));

        let requests = oracle.requests.lock().await;
        assert_eq!(requests[0], requests[1]);
    }

    #[tokio::test]
    async fn test_invalid_reply_retry_adds_correction() {
        let oracle = ScriptedOracle::new(vec![Ok(POOL), Ok("pas de json"), Ok(POOL_2)]);
        let (orchestrator, _ledger, _f) = orchestrator(oracle.clone()).await;

        let view = orchestrator.start("d", home_context()).await.unwrap();
        let err = orchestrator.choose(&view.session_id, Choice::A).await.unwrap_err();
        assert_eq!(err.code(), "invalid_oracle_output");

        let view = orchestrator.retry(&view.session_id).await.unwrap();
        let FunnelView::DrillDown { option_a, depth, .. } = &view.view else { panic!() };
        assert_eq!(option_a, "Coop");
        assert_eq!(*depth, 2);

        let requests = oracle.requests.lock().await;
        assert!(requests[2].messages.last().unwrap().content.contains("rejected"));
    }

    #[tokio::test]
    async fn test_reroll_and_refine_are_capped() {
        let oracle = ScriptedOracle::new(vec![Ok(POOL), Ok(POOL_2), Ok(FINAL), Ok(FINAL), Ok(POOL_2)]);
        let (orchestrator, ledger, _f) = orchestrator(oracle.clone()).await;

        let view = orchestrator.start("d", home_context()).await.unwrap();
        let id = view.session_id.clone();
        orchestrator.choose(&id, Choice::A).await.unwrap();
        orchestrator.choose(&id, Choice::A).await.unwrap();

        let view = orchestrator.reroll(&id).await.unwrap();
        assert!(!view.can_reroll);
        assert!(matches!(orchestrator.reroll(&id).await, Err(FunnelError::RerollLimit)));

        let view2 = orchestrator.refine(&id).await.unwrap();
        assert!(matches!(view2.view, FunnelView::DrillDown { .. }));
        assert!(matches!(orchestrator.refine(&id).await, Err(FunnelError::InvalidTransition(_))));

        // billed at the first result only
        assert_eq!(ledger.get_account("d").await.unwrap().balance, DEFAULT_BALANCE - SESSION_COST);
        assert!(view.can_refine);
    }

    /// Answers the first call at once, then waits for `release` before sending `second`.
    struct GatedOracle {
        calls: AtomicUsize,
        started: Notify,
        release: Notify,
        second: &'static str,
    }

    impl GatedOracle {
        fn new(second: &'static str) -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), started: Notify::new(), release: Notify::new(), second })
        }
    }

    #[async_trait]
    impl Oracle for GatedOracle {
        async fn call(&self, _request: OracleRequest) -> Result<OracleReply, OracleError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(OracleReply { content: POOL.to_string(), usage: None });
            }
            self.started.notify_one();
            self.release.notified().await;
            Ok(OracleReply { content: self.second.to_string(), usage: None })
        }
    }

    #[tokio::test]
    async fn test_back_drops_stale_reply() {
        let oracle = GatedOracle::new(POOL_2);
        let temp_file = NamedTempFile::new().unwrap();
        let ledger = Arc::new(SqlitePlumesLedger::new(temp_file.path()).await.unwrap());
        let orchestrator = Arc::new(FunnelOrchestrator::new(
            oracle.clone(),
            ledger,
            OracleSettings::default(),
            FunnelSettings::default(),
        ));

        let view = orchestrator.start("d", home_context()).await.unwrap();
        let id = view.session_id.clone();

        let in_flight = {
            let orchestrator = orchestrator.clone();
            let id = id.clone();
            tokio::spawn(async move { orchestrator.choose(&id, Choice::A).await })
        };
        oracle.started.notified().await;

        // user leaves the drill-down while the oracle is still thinking
        let back = orchestrator.back(&id).await.unwrap();
        assert!(matches!(back.view, FunnelView::ThemeDuel { .. }));
        oracle.release.notify_one();

        let late = in_flight.await.unwrap().unwrap();
        assert!(matches!(late.view, FunnelView::ThemeDuel { .. }));
        let session = orchestrator.store().get(&id).await.unwrap();
        assert!(session.pending.is_none());
        assert_eq!(session.generation, 1);
    }

    #[tokio::test]
    async fn test_retry_is_refused_while_the_call_runs() {
        let oracle = GatedOracle::new(FINAL);
        let temp_file = NamedTempFile::new().unwrap();
        let ledger = Arc::new(SqlitePlumesLedger::new(temp_file.path()).await.unwrap());
        let settings = FunnelSettings { min_depth: 2, ..FunnelSettings::default() };
        let orchestrator =
            Arc::new(FunnelOrchestrator::new(oracle.clone(), ledger.clone(), OracleSettings::default(), settings));

        let view = orchestrator.start("d", home_context()).await.unwrap();
        let id = view.session_id.clone();

        let in_flight = {
            let orchestrator = orchestrator.clone();
            let id = id.clone();
            tokio::spawn(async move { orchestrator.choose(&id, Choice::A).await })
        };
        oracle.started.notified().await;

        assert!(matches!(orchestrator.retry(&id).await, Err(FunnelError::InvalidTransition(_))));
        assert!(matches!(orchestrator.choose(&id, Choice::B).await, Err(FunnelError::InvalidTransition(_))));
        assert!(!orchestrator.view(&id).await.unwrap().can_retry);
        oracle.release.notify_one();

        let done = in_flight.await.unwrap().unwrap();
        assert!(matches!(done.view, FunnelView::Result { .. }));
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 2);
        assert_eq!(ledger.get_account("d").await.unwrap().balance, DEFAULT_BALANCE - SESSION_COST);

        let session = orchestrator.store().get(&id).await.unwrap();
        assert!(session.billed);
        assert!(session.pending.is_none());
        assert!(!session.in_flight);
    }

    #[tokio::test]
    async fn test_quota_refusal_is_not_retryable() {
        let oracle = ScriptedOracle::new(vec![Ok(POOL), Ok(POOL_2)]);
        let temp_file = NamedTempFile::new().unwrap();
        let ledger = Arc::new(SqlitePlumesLedger::new(temp_file.path()).await.unwrap());
        let settings = FunnelSettings { min_depth: 2, ..FunnelSettings::default() };
        let orchestrator = FunnelOrchestrator::new(oracle.clone(), ledger, OracleSettings::default(), settings)
            .with_quota(OracleQuota::new(1, Duration::from_secs(3600)));

        let view = orchestrator.start("d", home_context()).await.unwrap();
        let id = view.session_id.clone();

        let err = orchestrator.choose(&id, Choice::A).await.unwrap_err();
        assert_eq!(err.code(), "quota_exceeded");
        assert!(!orchestrator.view(&id).await.unwrap().can_retry);
        assert!(matches!(orchestrator.retry(&id).await, Err(FunnelError::NothingToRetry)));
        assert_eq!(oracle.requests.lock().await.len(), 1);
    }

    /// Sqlite ledger whose first debit fails.
    struct FlakyLedger {
        inner: SqlitePlumesLedger,
        failed: AtomicBool,
    }

    #[async_trait]
    impl PlumesLedger for FlakyLedger {
        async fn get_account(&self, device_id: &str) -> anyhow::Result<PlumesAccount> {
            self.inner.get_account(device_id).await
        }

        async fn consume(&self, device_id: &str, amount: i64) -> anyhow::Result<ConsumeOutcome> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                anyhow::bail!("database is locked");
            }
            self.inner.consume(device_id, amount).await
        }

        async fn credit(&self, device_id: &str, amount: i64) -> anyhow::Result<i64> {
            self.inner.credit(device_id, amount).await
        }

        async fn claim_daily(&self, device_id: &str, now: DateTime<Utc>) -> anyhow::Result<DailyClaim> {
            self.inner.claim_daily(device_id, now).await
        }

        async fn set_premium(&self, device_id: &str, premium: bool) -> anyhow::Result<()> {
            self.inner.set_premium(device_id, premium).await
        }

        async fn register_promo(&self, code: &str, bonus: i64, grants_premium: bool) -> anyhow::Result<()> {
            self.inner.register_promo(code, bonus, grants_premium).await
        }

        async fn redeem_promo(&self, device_id: &str, code: &str) -> Result<PromoRedemption, PromoError> {
            self.inner.redeem_promo(device_id, code).await
        }
    }

    #[tokio::test]
    async fn test_failed_debit_is_retried() {
        let oracle = ScriptedOracle::new(vec![Ok(POOL), Ok(FINAL)]);
        let temp_file = NamedTempFile::new().unwrap();
        let inner = SqlitePlumesLedger::new(temp_file.path()).await.unwrap();
        let ledger = Arc::new(FlakyLedger { inner, failed: AtomicBool::new(false) });
        let settings = FunnelSettings { min_depth: 2, ..FunnelSettings::default() };
        let orchestrator = FunnelOrchestrator::new(oracle.clone(), ledger.clone(), OracleSettings::default(), settings);

        let view = orchestrator.start("d", home_context()).await.unwrap();
        let id = view.session_id.clone();
        assert!(orchestrator.choose(&id, Choice::A).await.is_err());

        // the result is kept and the debit stays owed
        let view = orchestrator.view(&id).await.unwrap();
        assert!(matches!(view.view, FunnelView::Result { .. }));
        assert!(view.can_retry);
        assert_eq!(ledger.get_account("d").await.unwrap().balance, DEFAULT_BALANCE);
        assert!(matches!(orchestrator.reroll(&id).await, Err(FunnelError::InvalidTransition(_))));

        let view = orchestrator.retry(&id).await.unwrap();
        assert!(matches!(view.view, FunnelView::Result { .. }));
        assert!(!view.can_retry);
        assert_eq!(ledger.get_account("d").await.unwrap().balance, DEFAULT_BALANCE - SESSION_COST);
        assert!(matches!(orchestrator.retry(&id).await, Err(FunnelError::NothingToRetry)));
        assert_eq!(oracle.requests.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_neither_on_last_pair_names_the_whole_pool() {
        let oracle = ScriptedOracle::new(vec![Ok(POOL), Ok(POOL_2)]);
        let (orchestrator, _ledger, _f) = orchestrator(oracle.clone()).await;

        let view = orchestrator.start("d", home_context()).await.unwrap();
        let id = view.session_id.clone();
        orchestrator.choose(&id, Choice::Neither).await.unwrap();
        let view = orchestrator.choose(&id, Choice::Neither).await.unwrap();
        let FunnelView::DrillDown { option_a, .. } = &view.view else { panic!("expected drill-down") };
        assert_eq!(option_a, "Coop");

        let requests = oracle.requests.lock().await;
        assert_eq!(requests.len(), 2);
        let directive = &requests[1].messages.last().unwrap().content;
        for label in ["Société", "Vidéo", "Cartes"] {
            assert!(directive.contains(label), "{} missing from {}", label, directive);
        }
    }
}
