//! HTTP surface: REST endpoints under /api/simulation plus the /ws
//! WebSocket endpoint with its in-band authenticate handshake.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use ventylab_protocol::types::VentilatorCommand;

use crate::auth::{bearer_token, TokenVerifier};
use crate::gateway::{
    client_queue, envelope, EV_AUTHENTICATED, EV_AUTH_ERROR, EV_COMMAND_ACK, EV_ERROR,
    EV_NOTIFICATION, EV_PONG, EV_RESERVE_RESPONSE, EV_STATUS,
};
use crate::mediator::{CommandOutcome, Mediator};
use crate::patient::{Condition, Demographics, PatientModel};
use crate::reservation::{ReleaseError, ReserveError};
use crate::simulation::SessionInfo;
use crate::state::now_ms;

/// How long a fresh socket gets to authenticate before being dropped.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Server-side keep-alive ping interval.
const PING_INTERVAL: Duration = Duration::from_secs(25);

const DEFAULT_SESSION_LIMIT: i64 = 20;

// ---------------------------------------------------------------------------
// App state + router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub mediator: Arc<Mediator>,
    pub verifier: Arc<TokenVerifier>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/simulation/status", get(api_status))
        .route("/api/simulation/command", post(api_command))
        .route(
            "/api/simulation/reserve",
            post(api_reserve).delete(api_release),
        )
        .route("/api/simulation/session/save", post(api_session_save))
        .route("/api/simulation/sessions", get(api_sessions))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// REST auth
// ---------------------------------------------------------------------------

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "unauthorized" })),
    )
        .into_response()
}

fn authenticated_user(headers: &HeaderMap, verifier: &TokenVerifier) -> Result<String, Response> {
    let header_value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(unauthorized)?;
    let token = bearer_token(header_value).ok_or_else(unauthorized)?;
    verifier
        .verify(token, now_ms() / 1_000)
        .map_err(|_| unauthorized())
}

// ---------------------------------------------------------------------------
// REST handlers
// ---------------------------------------------------------------------------

async fn api_status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = authenticated_user(&headers, &state.verifier) {
        return resp;
    }
    Json(state.mediator.status().await).into_response()
}

async fn api_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(command): Json<VentilatorCommand>,
) -> Response {
    let user_id = match authenticated_user(&headers, &state.verifier) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    match state.mediator.send_command(&user_id, command).await {
        CommandOutcome::Accepted { command_id } => {
            Json(json!({ "success": true, "commandId": command_id })).into_response()
        }
        CommandOutcome::Invalid { errors } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "success": false, "errors": errors })),
        )
            .into_response(),
        CommandOutcome::Conflict { current_user } => (
            StatusCode::CONFLICT,
            Json(json!({
                "success": false,
                "error": "reservationConflict",
                "currentUser": current_user,
            })),
        )
            .into_response(),
        CommandOutcome::Transport { message } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": message })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReserveRequest {
    #[serde(default = "default_duration")]
    duration_minutes: i64,
    #[serde(default)]
    purpose: Option<String>,
}

fn default_duration() -> i64 {
    60
}

async fn api_reserve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ReserveRequest>,
) -> Response {
    let user_id = match authenticated_user(&headers, &state.verifier) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    match state
        .mediator
        .reservations
        .reserve(&user_id, request.duration_minutes, request.purpose)
        .await
    {
        Ok(reservation) => {
            Json(json!({ "success": true, "reservation": reservation })).into_response()
        }
        Err(ReserveError::Conflict { current_user }) => (
            StatusCode::CONFLICT,
            Json(json!({
                "success": false,
                "error": "reservationConflict",
                "currentUser": current_user,
            })),
        )
            .into_response(),
        Err(ReserveError::Store(e)) => {
            warn!("reserve failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": "store failure" })),
            )
                .into_response()
        }
    }
}

async fn api_release(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user_id = match authenticated_user(&headers, &state.verifier) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    match state.mediator.reservations.release(&user_id).await {
        Ok(reservation) => {
            Json(json!({ "success": true, "reservation": reservation })).into_response()
        }
        Err(ReleaseError::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": "noActiveReservation" })),
        )
            .into_response(),
        Err(ReleaseError::Store(e)) => {
            warn!("release failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": "store failure" })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveSessionRequest {
    #[serde(default)]
    notes: Option<String>,
    /// Fallbacks for saving a session that is no longer running.
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    settings: Option<Value>,
    #[serde(default)]
    started_at: Option<i64>,
    #[serde(default)]
    ended_at: Option<i64>,
}

async fn api_session_save(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SaveSessionRequest>,
) -> Response {
    let user_id = match authenticated_user(&headers, &state.verifier) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    // A running session is the source of truth; the request body covers the
    // save-after-leave case.
    let live: Option<SessionInfo> = state.mediator.simulations.session_info(&user_id).await;
    let (condition, settings_json, started_ms, ended_ms) = match (&live, &request.condition) {
        (Some(info), _) => (
            condition_name(info.patient.condition),
            serde_json::to_string(&info.settings).unwrap_or_else(|_| "{}".to_string()),
            info.started_ms,
            request.ended_at.or(Some(now_ms())),
        ),
        (None, Some(condition)) => (
            condition.clone(),
            request
                .settings
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "{}".to_string()),
            request.started_at.unwrap_or_else(now_ms),
            request.ended_at,
        ),
        (None, None) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "success": false, "error": "no simulation session to save" })),
            )
                .into_response();
        }
    };

    match state
        .mediator
        .db
        .insert_session(
            &user_id,
            started_ms,
            ended_ms,
            &condition,
            &settings_json,
            request.notes.as_deref(),
        )
        .await
    {
        Ok(id) => (
            StatusCode::CREATED,
            Json(json!({ "success": true, "id": id })),
        )
            .into_response(),
        Err(e) => {
            warn!("session save failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": "store failure" })),
            )
                .into_response()
        }
    }
}

/// Wire name of a condition, e.g. `ARDS_MODERATE`.
fn condition_name(condition: Condition) -> String {
    serde_json::to_value(condition)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct SessionsQuery {
    limit: Option<i64>,
}

async fn api_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionsQuery>,
) -> Response {
    let user_id = match authenticated_user(&headers, &state.verifier) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    let limit = query.limit.unwrap_or(DEFAULT_SESSION_LIMIT).clamp(1, 200);
    match state.mediator.db.list_sessions(&user_id, limit).await {
        Ok(sessions) => Json(json!({ "sessions": sessions })).into_response(),
        Err(e) => {
            warn!("session list failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "store failure" })),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket endpoint
// ---------------------------------------------------------------------------

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| client_socket(socket, state))
}

/// Parse the `{event, data}` envelope used in both directions.
pub fn parse_envelope(text: &str) -> Option<(String, Value)> {
    let value: Value = serde_json::from_str(text).ok()?;
    let event = value.get("event")?.as_str()?.to_string();
    let data = value.get("data").cloned().unwrap_or_else(|| json!({}));
    Some((event, data))
}

async fn client_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    let Some(user_id) = authenticate_handshake(&mut sink, &mut stream, &state).await else {
        let _ = sink
            .send(Message::Text(
                envelope(EV_AUTH_ERROR, &json!({ "message": "authentication failed" })).into(),
            ))
            .await;
        return;
    };

    let (tx, mut rx) = client_queue();
    let conn_id = state.mediator.gateway.register(&user_id, tx).await;
    let _ = sink
        .send(Message::Text(
            envelope(EV_AUTHENTICATED, &json!({ "userId": user_id })).into(),
        ))
        .await;
    info!(user = %user_id, "websocket authenticated");

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await; // the first tick fires immediately; skip it

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                // queue dropped: this socket was displaced by a newer login
                None => {
                    debug!(user = %user_id, "socket displaced — closing");
                    break;
                }
            },

            _ = ping.tick() => {
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }

            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    match parse_envelope(text.as_str()) {
                        Some((event, data)) => {
                            dispatch_client_event(&state, &user_id, &event, data).await;
                        }
                        None => warn!(user = %user_id, "unparseable client message"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary / pong — nothing to do
                Some(Err(e)) => {
                    warn!(user = %user_id, "websocket error: {e}");
                    break;
                }
            },
        }
    }

    state.mediator.gateway.deregister(&user_id, conn_id).await;
    info!(user = %user_id, "websocket closed");
}

/// The first event on a fresh socket must be `authenticate` carrying a
/// bearer token; anything else (or silence past the deadline) fails.
async fn authenticate_handshake(
    _sink: &mut SplitSink<WebSocket, Message>,
    stream: &mut SplitStream<WebSocket>,
    state: &AppState,
) -> Option<String> {
    let handshake = tokio::time::timeout(AUTH_TIMEOUT, async {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let Some((event, data)) = parse_envelope(text.as_str()) else {
                        return None;
                    };
                    if event != "authenticate" {
                        return None;
                    }
                    let token = data.get("token").and_then(|t| t.as_str()).unwrap_or("");
                    return state.verifier.verify(token, now_ms() / 1_000).ok();
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    })
    .await;

    handshake.unwrap_or(None)
}

// ---------------------------------------------------------------------------
// Inbound event dispatch
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatientSpec {
    demographics: Demographics,
    condition: Condition,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimulatorJoin {
    patient: PatientSpec,
    #[serde(default)]
    settings: Option<VentilatorCommand>,
}

async fn dispatch_client_event(state: &AppState, user_id: &str, event: &str, data: Value) {
    let mediator = &state.mediator;
    let gateway = &mediator.gateway;

    match event {
        "ping" => {
            gateway
                .send_to_user(user_id, EV_PONG, &json!({ "timestamp": now_ms() }))
                .await;
        }

        "ventilator:command" => match serde_json::from_value::<VentilatorCommand>(data) {
            Ok(command) => match mediator.send_command(user_id, command).await {
                CommandOutcome::Accepted { command_id } => {
                    gateway
                        .send_to_user(
                            user_id,
                            EV_COMMAND_ACK,
                            &json!({ "success": true, "commandId": command_id }),
                        )
                        .await;
                }
                CommandOutcome::Invalid { errors } => {
                    gateway
                        .send_to_user(
                            user_id,
                            EV_COMMAND_ACK,
                            &json!({ "success": false, "errors": errors }),
                        )
                        .await;
                }
                CommandOutcome::Conflict { current_user } => {
                    gateway
                        .send_to_user(
                            user_id,
                            EV_ERROR,
                            &json!({
                                "kind": "reservationConflict",
                                "currentUser": current_user,
                            }),
                        )
                        .await;
                }
                CommandOutcome::Transport { message } => {
                    gateway
                        .send_to_user(
                            user_id,
                            EV_ERROR,
                            &json!({ "kind": "transportUnavailable", "message": message }),
                        )
                        .await;
                }
            },
            Err(e) => {
                gateway
                    .send_to_user(
                        user_id,
                        EV_ERROR,
                        &json!({ "kind": "badRequest", "message": e.to_string() }),
                    )
                    .await;
            }
        },

        "ventilator:reserve" => {
            let duration = data
                .get("durationMinutes")
                .and_then(|v| v.as_i64())
                .unwrap_or(60);
            let purpose = data
                .get("purpose")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            match mediator.reservations.reserve(user_id, duration, purpose).await {
                Ok(reservation) => {
                    gateway
                        .send_to_user(
                            user_id,
                            EV_RESERVE_RESPONSE,
                            &json!({ "success": true, "reservation": reservation }),
                        )
                        .await;
                }
                Err(ReserveError::Conflict { current_user }) => {
                    gateway
                        .send_to_user(
                            user_id,
                            EV_RESERVE_RESPONSE,
                            &json!({ "success": false, "currentUser": current_user }),
                        )
                        .await;
                }
                Err(ReserveError::Store(e)) => {
                    warn!(user = %user_id, "reserve failed: {e:#}");
                    gateway
                        .send_to_user(
                            user_id,
                            EV_ERROR,
                            &json!({ "kind": "storeFailure", "message": "reservation store failed" }),
                        )
                        .await;
                }
            }
        }

        "ventilator:release" => match mediator.reservations.release(user_id).await {
            // success reaches everyone (requester included) via the
            // ventilator:released broadcast
            Ok(_) => {}
            Err(ReleaseError::NotFound) => {
                gateway
                    .send_to_user(user_id, EV_ERROR, &json!({ "kind": "noActiveReservation" }))
                    .await;
            }
            Err(ReleaseError::Store(e)) => {
                warn!(user = %user_id, "release failed: {e:#}");
                gateway
                    .send_to_user(
                        user_id,
                        EV_ERROR,
                        &json!({ "kind": "storeFailure", "message": "reservation store failed" }),
                    )
                    .await;
            }
        },

        "ventilator:status:request" => {
            let status = mediator.status().await;
            if let Ok(data) = serde_json::to_value(&status) {
                gateway.send_to_user(user_id, EV_STATUS, &data).await;
            }
        }

        "simulator:join" => match serde_json::from_value::<SimulatorJoin>(data) {
            Ok(join) => {
                let patient =
                    PatientModel::new(join.patient.demographics, join.patient.condition);
                let patient_json = serde_json::to_value(&patient).ok();
                mediator
                    .simulations
                    .configure_patient(Arc::clone(gateway), user_id, patient, join.settings)
                    .await;
                gateway
                    .send_to_user(
                        user_id,
                        EV_NOTIFICATION,
                        &json!({ "message": "simulation started", "patient": patient_json }),
                    )
                    .await;
            }
            Err(e) => {
                gateway
                    .send_to_user(
                        user_id,
                        EV_ERROR,
                        &json!({ "kind": "badRequest", "message": e.to_string() }),
                    )
                    .await;
            }
        },

        "simulator:leave" => {
            let stopped = mediator.simulations.stop(user_id).await;
            gateway
                .send_to_user(
                    user_id,
                    EV_NOTIFICATION,
                    &json!({ "message": "simulation stopped", "stopped": stopped }),
                )
                .await;
        }

        "subscribe:data" => gateway.set_wants_device_data(user_id, true).await,
        "unsubscribe:data" => gateway.set_wants_device_data(user_id, false).await,

        other => {
            debug!(user = %user_id, event = other, "unknown client event ignored");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
