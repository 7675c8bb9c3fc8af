use std::collections::HashSet;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::actuator::DeviceState;
use crate::db::{Db, StoreError};
use crate::history::load_windows;
use crate::program::DeviceId;
use crate::state::SharedState;

const DEFAULT_EVENT_LIMIT: u32 = 100;
const MAX_EVENT_LIMIT: u32 = 1000;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub db: Db,
    /// Decides what "today" is for rain delay input.
    pub timezone: Tz,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/programs", get(api_programs))
        .route("/api/programs/{id}", get(api_program))
        .route(
            "/api/rain-delay",
            get(api_rain_delay)
                .put(api_set_rain_delay)
                .delete(api_clear_rain_delay),
        )
        .route("/api/events", get(api_events))
        .route("/api/irrigation", get(api_irrigation))
        .with_state(state)
}

fn store_failure(what: &str, e: StoreError) -> Response {
    error!("api: {what} failed: {e}");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("failed to {what}")).into_response()
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn api_programs(State(state): State<AppState>) -> Response {
    match state.db.load_programs().await {
        Ok(programs) => Json(programs).into_response(),
        Err(e) => store_failure("load programs", e),
    }
}

async fn api_program(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.db.get_program(&id).await {
        Ok(Some(program)) => Json(program).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, format!("program '{id}' not found")).into_response(),
        Err(e) => store_failure("load program", e),
    }
}

// -- Rain delay ---------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct RainDelay {
    /// Watering resumes the day after this date.
    resume_watering_after: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct SetRainDelay {
    resume_watering_after: NaiveDate,
}

async fn api_rain_delay(State(state): State<AppState>) -> Response {
    match state.db.get_rain_delay().await {
        Ok(resume_watering_after) => Json(RainDelay {
            resume_watering_after,
        })
        .into_response(),
        Err(e) => store_failure("load rain delay", e),
    }
}

async fn api_set_rain_delay(
    State(state): State<AppState>,
    Json(body): Json<SetRainDelay>,
) -> Response {
    let until = body.resume_watering_after;
    let today = Utc::now().with_timezone(&state.timezone).date_naive();
    if until < today {
        return (
            StatusCode::BAD_REQUEST,
            format!("resume_watering_after {until} is before today ({today})"),
        )
            .into_response();
    }

    if let Err(e) = state.db.set_rain_delay(Some(until)).await {
        return store_failure("set rain delay", e);
    }
    info!(%until, "rain delay set");
    state
        .shared
        .write()
        .await
        .record_system(format!("rain delay set until {until}"));
    Json(RainDelay {
        resume_watering_after: Some(until),
    })
    .into_response()
}

async fn api_clear_rain_delay(State(state): State<AppState>) -> Response {
    if let Err(e) = state.db.set_rain_delay(None).await {
        return store_failure("clear rain delay", e);
    }
    info!("rain delay cleared");
    state
        .shared
        .write()
        .await
        .record_system("rain delay cleared".to_string());
    StatusCode::NO_CONTENT.into_response()
}

// -- History ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<u32>,
}

async fn api_events(State(state): State<AppState>, Query(q): Query<EventsQuery>) -> Response {
    let limit = q.limit.unwrap_or(DEFAULT_EVENT_LIMIT).min(MAX_EVENT_LIMIT);
    match state.db.recent_events(limit).await {
        Ok(events) => Json(events).into_response(),
        Err(e) => store_failure("load irrigation events", e),
    }
}

#[derive(Debug, Deserialize)]
struct WindowQuery {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

async fn api_irrigation(State(state): State<AppState>, Query(q): Query<WindowQuery>) -> Response {
    if q.end <= q.start {
        return (StatusCode::BAD_REQUEST, "end must be after start").into_response();
    }

    let on: HashSet<DeviceId> = state
        .shared
        .read()
        .await
        .devices
        .iter()
        .filter(|(_, status)| status.state == DeviceState::On)
        .map(|(id, _)| *id)
        .collect();

    match load_windows(&state.db, q.start, q.end, Utc::now(), |id| on.contains(&id)).await {
        Ok(windows) => Json(windows).into_response(),
        Err(e) => store_failure("load irrigation windows", e),
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("status api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
