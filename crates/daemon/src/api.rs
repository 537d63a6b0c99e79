//! HTTP Ingress handlers: `/api/health`, `/api/status`, `/api/pulse/schedule`,
//! `/api/pulse/upcoming`.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pulse_domain::pulse::MAX_PROMPT_CHARS;
use pulse_domain::{Priority, PulseStatus};
use pulse_queue::ScheduleParams;
use serde::{Deserialize, Serialize};

use crate::auth::require_api_token;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/status", get(status))
        .route("/api/pulse/schedule", post(schedule))
        .route("/api/pulse/upcoming", get(upcoming))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), require_api_token));

    Router::new()
        .route("/api/health", get(health))
        .merge(protected)
        .with_state(state)
}

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy", "service": "pulse-daemon" }))
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    uptime_seconds: i64,
    counts: std::collections::HashMap<PulseStatus, usize>,
    config: StatusConfigEcho,
}

#[derive(Serialize)]
struct StatusConfigEcho {
    max_concurrent: usize,
    batch_limit: usize,
    tick_ms: u64,
    executor_timeout_secs: u64,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "running",
        uptime_seconds: state.uptime_seconds(),
        counts: state.queue.counts_by_status(),
        config: StatusConfigEcho {
            max_concurrent: state.daemon_config.max_concurrent,
            batch_limit: state.daemon_config.batch_limit,
            tick_ms: state.daemon_config.tick_ms,
            executor_timeout_secs: state.daemon_config.executor_timeout_secs,
        },
    })
}

fn d_priority() -> Priority {
    Priority::Normal
}

#[derive(Deserialize)]
struct ScheduleRequest {
    prompt: String,
    scheduled_at: String,
    #[serde(default = "d_priority")]
    priority: Priority,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    sticky_notes: Option<Vec<String>>,
    #[serde(default)]
    tags: Option<std::collections::BTreeSet<String>>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Serialize)]
struct ScheduleResponse {
    pulse_id: u64,
    scheduled_at: chrono::DateTime<chrono::Utc>,
    message: String,
}

async fn schedule(State(state): State<AppState>, Json(req): Json<ScheduleRequest>) -> Response {
    if req.prompt.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "prompt must not be empty");
    }
    if req.prompt.chars().count() > MAX_PROMPT_CHARS {
        return api_error(
            StatusCode::BAD_REQUEST,
            format!("prompt exceeds {MAX_PROMPT_CHARS} characters"),
        );
    }

    let now = chrono::Utc::now();
    let scheduled_at = match pulse_time::resolve(&req.scheduled_at, now) {
        Ok(dt) => dt,
        Err(e) => return api_error(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let created_by = req.source.unwrap_or_else(|| "http".to_string());
    let outcome = match state.queue.schedule(ScheduleParams {
        scheduled_at: Some(scheduled_at),
        prompt: req.prompt,
        priority: Some(req.priority),
        session_id: req.session_id,
        sticky_notes: req.sticky_notes,
        tags: req.tags,
        created_by: Some(created_by),
        max_retries: None,
    }) {
        Ok(outcome) => outcome,
        Err(e) => return api_error(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let pulse_id = match state.queue.insert(outcome).await {
        Ok(id) => id,
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    (
        StatusCode::CREATED,
        Json(ScheduleResponse {
            pulse_id,
            scheduled_at,
            message: "pulse scheduled".to_string(),
        }),
    )
        .into_response()
}

fn d_limit() -> usize {
    20
}

#[derive(Deserialize)]
struct UpcomingQuery {
    #[serde(default = "d_limit")]
    limit: usize,
}

#[derive(Serialize)]
struct UpcomingPulse {
    id: u64,
    scheduled_at: chrono::DateTime<chrono::Utc>,
    priority: Priority,
    prompt: String,
    status: PulseStatus,
}

#[derive(Serialize)]
struct UpcomingResponse {
    count: usize,
    pulses: Vec<UpcomingPulse>,
}

async fn upcoming(State(state): State<AppState>, Query(q): Query<UpcomingQuery>) -> Json<UpcomingResponse> {
    let pulses: Vec<UpcomingPulse> = state
        .queue
        .get_upcoming(q.limit, None)
        .into_iter()
        .map(|p| UpcomingPulse {
            id: p.id,
            scheduled_at: p.scheduled_at,
            priority: p.priority,
            prompt: pulse_domain::pulse::excerpt(&p.prompt, 100),
            status: p.status,
        })
        .collect();
    Json(UpcomingResponse {
        count: pulses.len(),
        pulses,
    })
}
