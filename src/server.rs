use anyhow::Result;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::FunnelError;
use crate::funnel::{Choice, FunnelOrchestrator, UserContext};
use crate::ledger::{Pack, PromoError};

/// Maps domain errors onto the gate status codes.
pub enum ServerError {
    Funnel(FunnelError),
    Promo(PromoError),
}

impl ServerError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ServerError::Funnel(err) => (
                StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                err.code(),
                err.to_string(),
            ),
            ServerError::Promo(err) => {
                let status = match err {
                    PromoError::Invalid => StatusCode::BAD_REQUEST,
                    PromoError::AlreadyRedeemed => StatusCode::CONFLICT,
                    PromoError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let code = match err {
                    PromoError::Invalid => "invalid_promo",
                    other => other.code(),
                };
                (status, code, err.to_string())
            }
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!("{}: {}", code, message);
        }
        (status, Json(serde_json::json!({ "error": code, "message": message }))).into_response()
    }
}

impl From<FunnelError> for ServerError {
    fn from(err: FunnelError) -> Self {
        Self::Funnel(err)
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Funnel(FunnelError::Internal(err))
    }
}

impl From<PromoError> for ServerError {
    fn from(err: PromoError) -> Self {
        Self::Promo(err)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<FunnelOrchestrator>,
}

#[derive(Deserialize)]
struct StartRequest {
    device_id: String,
    context: UserContext,
}

#[derive(Deserialize)]
struct ChooseRequest {
    choice: Choice,
}

#[derive(Deserialize)]
struct AmountRequest {
    amount: i64,
}

#[derive(Deserialize)]
struct PremiumRequest {
    premium: bool,
}

#[derive(Deserialize)]
struct PromoRequest {
    code: String,
}

#[derive(Deserialize)]
struct PackRequest {
    pack: Pack,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/sessions", post(start_session))
        .route("/v1/sessions/{id}", get(get_session))
        .route("/v1/sessions/{id}/choose", post(choose))
        .route("/v1/sessions/{id}/back", post(back))
        .route("/v1/sessions/{id}/retry", post(retry))
        .route("/v1/sessions/{id}/reroll", post(reroll))
        .route("/v1/sessions/{id}/refine", post(refine))
        .route("/v1/ledger/{device}", get(get_account))
        .route("/v1/ledger/{device}/consume", post(consume))
        .route("/v1/ledger/{device}/credit", post(credit))
        .route("/v1/ledger/{device}/claim-daily", post(claim_daily))
        .route("/v1/ledger/{device}/premium", post(set_premium))
        .route("/v1/ledger/{device}/promo", post(redeem_promo))
        .route("/v1/ledger/{device}/reward-ad", post(reward_ad))
        .route("/v1/ledger/{device}/pack", post(credit_pack))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(state: AppState, addr: &str) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Mogogo server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn start_session(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let view = state.orchestrator.start(&req.device_id, req.context).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ServerError> {
    Ok(Json(state.orchestrator.view(&id).await?))
}

async fn choose(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ChooseRequest>,
) -> Result<impl IntoResponse, ServerError> {
    Ok(Json(state.orchestrator.choose(&id, req.choice).await?))
}

async fn back(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ServerError> {
    Ok(Json(state.orchestrator.back(&id).await?))
}

async fn retry(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ServerError> {
    Ok(Json(state.orchestrator.retry(&id).await?))
}

async fn reroll(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ServerError> {
    Ok(Json(state.orchestrator.reroll(&id).await?))
}

async fn refine(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ServerError> {
    Ok(Json(state.orchestrator.refine(&id).await?))
}

async fn get_account(
    State(state): State<AppState>,
    Path(device): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    Ok(Json(state.orchestrator.ledger().get_account(&device).await?))
}

async fn consume(
    State(state): State<AppState>,
    Path(device): Path<String>,
    Json(req): Json<AmountRequest>,
) -> Result<impl IntoResponse, ServerError> {
    Ok(Json(state.orchestrator.ledger().consume(&device, req.amount).await?))
}

async fn credit(
    State(state): State<AppState>,
    Path(device): Path<String>,
    Json(req): Json<AmountRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let balance = state.orchestrator.ledger().credit(&device, req.amount).await?;
    Ok(Json(serde_json::json!({ "balance": balance })))
}

async fn claim_daily(
    State(state): State<AppState>,
    Path(device): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    Ok(Json(state.orchestrator.ledger().claim_daily(&device, Utc::now()).await?))
}

async fn set_premium(
    State(state): State<AppState>,
    Path(device): Path<String>,
    Json(req): Json<PremiumRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let ledger = state.orchestrator.ledger();
    ledger.set_premium(&device, req.premium).await?;
    Ok(Json(ledger.get_account(&device).await?))
}

async fn redeem_promo(
    State(state): State<AppState>,
    Path(device): Path<String>,
    Json(req): Json<PromoRequest>,
) -> Result<impl IntoResponse, ServerError> {
    Ok(Json(state.orchestrator.ledger().redeem_promo(&device, &req.code).await?))
}

async fn reward_ad(State(state): State<AppState>, Path(device): Path<String>) -> Result<impl IntoResponse, ServerError> {
    let balance = state.orchestrator.ledger().reward_ad(&device).await?;
    Ok(Json(serde_json::json!({ "balance": balance })))
}

async fn credit_pack(
    State(state): State<AppState>,
    Path(device): Path<String>,
    Json(req): Json<PackRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let balance = state.orchestrator.ledger().credit_pack(&device, req.pack).await?;
    Ok(Json(serde_json::json!({ "balance": balance })))
}
