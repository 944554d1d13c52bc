use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{
        rejection::{FormRejection, JsonRejection},
        Form, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

use sensornode_common::{ConfigUpdate, LocalRequest, SensorSnapshot};

#[derive(Clone)]
pub struct StatusState {
    pub snapshot: Arc<RwLock<SensorSnapshot>>,
    pub requests: mpsc::Sender<LocalRequest>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct RelayResponse {
    relay: &'static str,
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    accepted: bool,
    #[serde(rename = "restartRequired")]
    restart_required: bool,
}

#[derive(Debug, Serialize)]
struct RestartResponse {
    restarting: bool,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/api/sensors", get(handle_get_sensors))
        .route("/api/relay", post(handle_set_relay))
        .route("/api/config", post(handle_set_config))
        .route("/api/restart", post(handle_restart))
        .with_state(state)
}

async fn handle_get_sensors(State(state): State<StatusState>) -> Json<SensorSnapshot> {
    let snapshot = *state.snapshot.read().await;
    Json(snapshot)
}

async fn handle_set_relay(
    State(state): State<StatusState>,
    Query(params): Query<HashMap<String, String>>,
    form: Result<Form<HashMap<String, String>>, FormRejection>,
) -> axum::response::Response {
    set_relay(&state, params, form.ok().map(|Form(body)| body)).await
}

async fn set_relay(
    state: &StatusState,
    mut params: HashMap<String, String>,
    form: Option<HashMap<String, String>>,
) -> axum::response::Response {
    for (key, value) in form.unwrap_or_default() {
        params.entry(key).or_insert(value);
    }

    let Some(value) = params.get("state") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'state' parameter");
    };
    let (on, label) = match value.trim().to_ascii_lowercase().as_str() {
        "on" => (true, "on"),
        "off" => (false, "off"),
        _ => return error_response(StatusCode::BAD_REQUEST, "Invalid state. Use 'on' or 'off'"),
    };

    if let Err(err) = state.requests.send(LocalRequest::Relay(on)).await {
        warn!("relay request dropped: {err}");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Node loop is not running");
    }
    Json(RelayResponse { relay: label }).into_response()
}

// New network credentials apply after POST /api/restart.
async fn handle_set_config(
    State(state): State<StatusState>,
    update: Result<Json<ConfigUpdate>, JsonRejection>,
) -> axum::response::Response {
    match update {
        Ok(Json(update)) => set_config(&state, update).await,
        Err(err) => {
            warn!("rejected config payload: {err}");
            error_response(StatusCode::BAD_REQUEST, "Invalid config payload")
        }
    }
}

async fn set_config(state: &StatusState, update: ConfigUpdate) -> axum::response::Response {
    if update.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "No settings provided");
    }
    if update
        .network_ssid
        .as_deref()
        .is_some_and(|ssid| ssid.trim().is_empty())
    {
        return error_response(StatusCode::BAD_REQUEST, "wifiSsid must not be empty");
    }

    let restart_required = update.changes_network();
    if let Err(err) = state.requests.send(LocalRequest::Configure(update)).await {
        warn!("config request dropped: {err}");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Node loop is not running");
    }
    Json(ConfigResponse {
        accepted: true,
        restart_required,
    })
    .into_response()
}

async fn handle_restart(State(state): State<StatusState>) -> axum::response::Response {
    if let Err(err) = state.requests.send(LocalRequest::Restart).await {
        warn!("restart request dropped: {err}");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Node loop is not running");
    }
    Json(RestartResponse { restarting: true }).into_response()
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
