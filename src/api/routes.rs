use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Extension, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;
use uuid::Uuid;

use crate::auth::{auth_middleware, Identity, JwtHandler};
use crate::errors::DomainError;
use crate::matches::{MatchEngine, NewMatch};
use crate::models::{
    LeaderboardEntry, Match, Transaction, TransactionStatus, TransactionType, WalletView,
};
use crate::rooms::RoomRouter;
use crate::settlement::SettlementReport;
use crate::wallet::{TransactionFilter, WalletLedger};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MatchEngine>,
    pub ledger: Arc<WalletLedger>,
    pub rooms: Arc<RoomRouter>,
    pub jwt: Arc<JwtHandler>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/matches", post(create_match))
        .route("/api/matches/:id", get(get_match).delete(delete_match))
        .route("/api/matches/:id/start", post(start_match))
        .route("/api/matches/:id/end", post(end_match))
        .route("/api/matches/:id/cancel", post(cancel_match))
        .route("/api/matches/:id/score", put(update_score))
        .route("/api/matches/:id/settle", post(settle_match))
        .route("/api/matches/:id/leaderboard", get(get_leaderboard))
        .route("/api/matches/competition/:id", get(list_by_competition))
        .route("/api/matches/my/list", get(list_my_matches))
        .route("/api/wallet", get(get_wallet))
        .route("/api/transactions", get(get_transactions))
        .route("/ws/matches/:id", get(websocket_handler))
        .layer(middleware::from_fn_with_state(
            state.jwt.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ===== Route Handlers =====

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn create_match(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<CreateMatchRequest>,
) -> Result<(StatusCode, Json<Match>), ApiError> {
    if req.participants.is_empty() {
        return Err(ApiError::BadRequest(
            "a match needs at least one participant".to_string(),
        ));
    }

    let m = state.engine.create_match(NewMatch {
        competition_id: req.competition_id,
        organizer_id: identity.user_id,
        participants: req.participants,
        scheduled_at: req.scheduled_at,
        prize_pool: req.prize_pool.unwrap_or(0),
        prize_template: req.prize_template.unwrap_or_else(|| "top3".to_string()),
        match_number: req.match_number.unwrap_or(1),
        game_mode: req.game_mode.unwrap_or_default(),
    })?;

    Ok((StatusCode::CREATED, Json(m)))
}

async fn get_match(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Match>, ApiError> {
    Ok(Json(state.engine.get_match(id)?))
}

async fn start_match(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> Result<Json<Match>, ApiError> {
    Ok(Json(state.engine.start_match(id, identity.user_id)?))
}

async fn end_match(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> Result<Json<MatchEndedResponse>, ApiError> {
    let (ended, settlement) = state.engine.end_match(id, identity.user_id)?;
    let leaderboard = ended.leaderboard();
    Ok(Json(MatchEndedResponse {
        r#match: ended,
        leaderboard,
        settlement,
    }))
}

async fn cancel_match(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> Result<Json<Match>, ApiError> {
    Ok(Json(state.engine.cancel_match(id, identity.user_id)?))
}

async fn update_score(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateScoreRequest>,
) -> Result<Json<ScoreUpdatedResponse>, ApiError> {
    let updated = state
        .engine
        .update_score(id, identity.user_id, req.participant_id, req.score)?;
    let leaderboard = updated.leaderboard();
    Ok(Json(ScoreUpdatedResponse {
        r#match: updated,
        leaderboard,
    }))
}

async fn delete_match(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.engine.delete_match(id, identity.user_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Idempotent settlement re-trigger. Awards already paid resolve as
/// duplicates; only unpaid ones move money.
async fn settle_match(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SettlementReport>, ApiError> {
    Ok(Json(state.engine.settle_match(id)?))
}

async fn get_leaderboard(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<LeaderboardResponse>, ApiError> {
    let leaderboard = state.engine.get_leaderboard(id)?;
    Ok(Json(LeaderboardResponse {
        match_id: id,
        leaderboard,
    }))
}

async fn list_by_competition(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<MatchListResponse>, ApiError> {
    let matches = state.engine.list_by_competition(id)?;
    Ok(Json(MatchListResponse {
        count: matches.len(),
        matches,
    }))
}

async fn list_my_matches(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<MatchListResponse>, ApiError> {
    let matches = state.engine.list_for_player(identity.user_id)?;
    Ok(Json(MatchListResponse {
        count: matches.len(),
        matches,
    }))
}

async fn get_wallet(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(params): Query<WalletQuery>,
) -> Result<Json<WalletView>, ApiError> {
    let limit = params.limit.unwrap_or(10).min(100);
    Ok(Json(state.ledger.get_wallet(identity.user_id, limit)?))
}

async fn get_transactions(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(params): Query<TransactionQuery>,
) -> Result<Json<TransactionListResponse>, ApiError> {
    let tx_type = params
        .r#type
        .as_deref()
        .map(|t| {
            TransactionType::from_str(t)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown transaction type: {}", t)))
        })
        .transpose()?;
    let status = params
        .status
        .as_deref()
        .map(|s| {
            TransactionStatus::from_str(s)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown transaction status: {}", s)))
        })
        .transpose()?;

    let filter = TransactionFilter {
        tx_type,
        status,
        source: params.source,
        limit: params.limit,
    };
    let transactions = state.ledger.get_transactions(identity.user_id, &filter)?;
    Ok(Json(TransactionListResponse {
        count: transactions.len(),
        transactions,
    }))
}

// ===== WebSocket room endpoint =====

/// Viewer subscription to a match room. Auth happens in the middleware
/// (token query param); the match must exist before the upgrade.
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    state.engine.get_match(id)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, id, identity.user_id)))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, match_id: Uuid, viewer: Uuid) {
    let mut rx = state.rooms.subscribe(match_id, viewer);

    // Send the current match state up front; the stream only carries changes.
    if send_snapshot(&mut socket, &state, match_id).await.is_err() {
        state.rooms.unsubscribe(match_id, viewer);
        return;
    }

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    let msg = serde_json::to_string(&event)
                        .unwrap_or_else(|e| {
                            warn!("Failed to serialize room event: {}", e);
                            "{}".to_string()
                        });
                    if socket.send(Message::Text(msg)).await.is_err() {
                        break;
                    }
                }
                // Fell behind the room buffer: re-sync from authoritative
                // state instead of redelivering missed events.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(%match_id, %viewer, missed, "viewer lagged, resyncing");
                    if send_snapshot(&mut socket, &state, match_id).await.is_err() {
                        break;
                    }
                }
                // Room torn down after the grace window.
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if text == "ping" {
                        let _ = socket.send(Message::Text("pong".to_string())).await;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }

    state.rooms.unsubscribe(match_id, viewer);
}

async fn send_snapshot(
    socket: &mut WebSocket,
    state: &AppState,
    match_id: Uuid,
) -> Result<(), axum::Error> {
    let Ok(m) = state.engine.get_match(match_id) else {
        return Ok(());
    };
    let leaderboard = m.leaderboard();
    let msg = json!({
        "type": "snapshot",
        "data": { "match": m, "leaderboard": leaderboard },
    });
    socket.send(Message::Text(msg.to_string())).await
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct CreateMatchRequest {
    competition_id: Uuid,
    participants: Vec<Uuid>,
    scheduled_at: Option<DateTime<Utc>>,
    prize_pool: Option<u64>,
    prize_template: Option<String>,
    match_number: Option<u32>,
    game_mode: Option<String>,
}

#[derive(Deserialize)]
struct UpdateScoreRequest {
    participant_id: Uuid,
    /// Non-negative by construction; negative JSON values fail to parse.
    score: u64,
}

#[derive(Deserialize)]
struct WalletQuery {
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct TransactionQuery {
    r#type: Option<String>,
    status: Option<String>,
    source: Option<String>,
    limit: Option<u32>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct MatchEndedResponse {
    r#match: Match,
    leaderboard: Vec<LeaderboardEntry>,
    settlement: Option<SettlementReport>,
}

#[derive(Serialize)]
struct ScoreUpdatedResponse {
    r#match: Match,
    leaderboard: Vec<LeaderboardEntry>,
}

#[derive(Serialize)]
struct LeaderboardResponse {
    match_id: Uuid,
    leaderboard: Vec<LeaderboardEntry>,
}

#[derive(Serialize)]
struct MatchListResponse {
    count: usize,
    matches: Vec<Match>,
}

#[derive(Serialize)]
struct TransactionListResponse {
    count: usize,
    transactions: Vec<Transaction>,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    Domain(DomainError),
    BadRequest(String),
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        ApiError::Domain(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Domain(err) => match err {
                DomainError::NotFound { .. } => (StatusCode::NOT_FOUND, err.to_string()),
                DomainError::Forbidden { .. } => (StatusCode::FORBIDDEN, err.to_string()),
                // State-machine rejections: the command conflicts with the
                // match's current state. Never retried.
                DomainError::InvalidTransition { .. }
                | DomainError::NotOngoing { .. }
                | DomainError::Immutable { .. } => (StatusCode::CONFLICT, err.to_string()),
                DomainError::UnknownParticipant { .. }
                | DomainError::InvalidTemplate { .. }
                | DomainError::InsufficientFunds { .. } => {
                    (StatusCode::BAD_REQUEST, err.to_string())
                }
                // Transient: the whole command is retry-safe.
                DomainError::PersistenceConflict => {
                    (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
                }
                DomainError::Storage(e) => {
                    tracing::error!("Storage error: {}", e);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error".to_string(),
                    )
                }
            },
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
