//! Local command API for xpwatchd.
//!
//! The chat platform is out of scope; whatever fronts the daemon (a chat
//! bridge, a CLI, curl) drives these JSON routes instead.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use xpwatch_common::store::Unsubscribe;

use crate::commands::{CommandError, Commands, SubjectSummary, SubscribeOutcome};
use crate::fetch::CharacterClient;
use crate::registry::{CancelError, StartError};

pub type AppState = Arc<Commands<CharacterClient>>;

pub fn router(commands: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/subscribe", post(subscribe))
        .route("/v1/unsubscribe", post(unsubscribe))
        .route("/v1/subjects", get(list_mine))
        .route("/v1/subjects/all", get(list_all))
        .route("/v1/tracker/start", post(tracker_start))
        .route("/v1/tracker/stop", post(tracker_stop))
        .with_state(commands)
}

fn reject(err: CommandError) -> (StatusCode, String) {
    let status = match err {
        CommandError::InvalidId => StatusCode::BAD_REQUEST,
        CommandError::SubjectUnavailable => StatusCode::NOT_FOUND,
        CommandError::TrackerStart(StartError::AlreadyActive) => StatusCode::CONFLICT,
        CommandError::TrackerCancel(CancelError::NotActive) => StatusCode::NOT_FOUND,
    };
    (status, err.to_string())
}

#[derive(Serialize)]
struct HealthResponse {
    version: &'static str,
    watched: usize,
    active_trackers: usize,
}

async fn health(State(commands): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        version: xpwatch_common::VERSION,
        watched: commands.watched_count().await,
        active_trackers: commands.active_trackers().await,
    })
}

fn default_notify() -> bool {
    true
}

#[derive(Deserialize)]
struct SubscribeRequest {
    id: String,
    user_id: u64,
    note: Option<String>,
    #[serde(default = "default_notify")]
    notify: bool,
}

async fn subscribe(
    State(commands): State<AppState>,
    Json(req): Json<SubscribeRequest>,
) -> Result<Json<SubscribeOutcome>, (StatusCode, String)> {
    commands
        .subscribe(&req.id, req.user_id, req.note, req.notify)
        .await
        .map(Json)
        .map_err(reject)
}

#[derive(Deserialize)]
struct UnsubscribeRequest {
    id: String,
    user_id: u64,
}

#[derive(Serialize)]
struct UnsubscribeResponse {
    outcome: &'static str,
}

async fn unsubscribe(
    State(commands): State<AppState>,
    Json(req): Json<UnsubscribeRequest>,
) -> Json<UnsubscribeResponse> {
    let outcome = match commands.unsubscribe(&req.id, req.user_id).await {
        Unsubscribe::Purged => "purged",
        Unsubscribe::Removed => "removed",
        Unsubscribe::RemovedLast => "removed_last",
        Unsubscribe::NotSubscribed => "not_subscribed",
        Unsubscribe::NotWatched => "not_watched",
    };
    Json(UnsubscribeResponse { outcome })
}

#[derive(Deserialize)]
struct MineQuery {
    user_id: u64,
}

async fn list_mine(
    State(commands): State<AppState>,
    Query(query): Query<MineQuery>,
) -> Json<Vec<SubjectSummary>> {
    Json(commands.list_mine(query.user_id).await)
}

async fn list_all(State(commands): State<AppState>) -> Json<Vec<SubjectSummary>> {
    Json(commands.list_all().await)
}

#[derive(Deserialize)]
struct TrackerStartRequest {
    context: u64,
    base_id: String,
}

#[derive(Serialize)]
struct TrackerResponse {
    status: &'static str,
}

async fn tracker_start(
    State(commands): State<AppState>,
    Json(req): Json<TrackerStartRequest>,
) -> Result<Json<TrackerResponse>, (StatusCode, String)> {
    commands
        .start_tracker(req.context, &req.base_id)
        .await
        .map(|_| Json(TrackerResponse { status: "started" }))
        .map_err(reject)
}

#[derive(Deserialize)]
struct TrackerStopRequest {
    context: u64,
}

async fn tracker_stop(
    State(commands): State<AppState>,
    Json(req): Json<TrackerStopRequest>,
) -> Result<Json<TrackerResponse>, (StatusCode, String)> {
    commands
        .stop_tracker(req.context)
        .await
        .map(|_| Json(TrackerResponse { status: "cancelling" }))
        .map_err(reject)
}
