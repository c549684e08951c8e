use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use super::error::ApiError;
use super::socket::{run_writer, send_json, text_payload};
use super::ws_methods::{self, WsNotification, WsRequest, WsResponse};
use super::AppState;
use crate::bridge::{BridgeDiagnostics, BridgeEvent};

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub(super) async fn diagnostics(State(state): State<AppState>) -> Json<BridgeDiagnostics> {
    Json(state.bridge.diagnostics())
}

/// Query string accepted by both WebSocket endpoints.
#[derive(Debug, Default, Deserialize)]
pub(super) struct ResourceQuery {
    resource: Option<String>,
    #[serde(rename = "fileKey")]
    file_key: Option<String>,
}

impl ResourceQuery {
    fn resource(self) -> Option<String> {
        self.resource
            .or(self.file_key)
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct CommandRequest {
    method: String,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// Run one command against whichever device currently serves `resource`.
pub(super) async fn resource_command(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    Json(req): Json<CommandRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.method.trim().is_empty() {
        return Err(ApiError::InvalidRequest("method must not be empty".into()));
    }
    let params = req.params.unwrap_or(Value::Object(Default::default()));
    let result = state
        .bridge
        .execute_for_resource(
            &resource,
            &req.method,
            params,
            req.timeout_ms.map(Duration::from_millis),
        )
        .await?;
    Ok(Json(serde_json::json!({ "result": result })))
}

// ── Device sockets ─────────────────────────────────────────────────

pub(super) async fn ws_device(
    ws: WebSocketUpgrade,
    Query(query): Query<ResourceQuery>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let resource = query
        .resource()
        .ok_or_else(|| ApiError::InvalidRequest("resource query parameter is required".into()))?;
    Ok(ws
        .on_upgrade(move |socket| handle_device_socket(socket, state, resource))
        .into_response())
}

async fn handle_device_socket(socket: WebSocket, state: AppState, resource: String) {
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let session_id = uuid::Uuid::new_v4().to_string();
    let (conn, outbound_rx) = state.bridge.new_connection(session_id.clone());
    let closed = conn.closed_token();

    let (ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(run_writer(
        ws_tx,
        outbound_rx,
        closed.clone(),
        state.ping_interval,
    ));

    // A socket upgraded after the shutdown signal never sees it change.
    if state.shutdown.is_shutting_down() {
        tracing::debug!(session_id = %session_id, "refusing device connection during shutdown");
        conn.close();
        let _ = writer.await;
        return;
    }

    if let Err(e) = state.bridge.downstream_opened(&resource, conn.clone()) {
        tracing::warn!(session_id = %session_id, error = %e, "rejecting device connection");
        conn.close();
        let _ = writer.await;
        return;
    }

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => match text_payload(&msg) {
                        Some(text) => {
                            state.bridge.frame_received(&session_id, text);
                        }
                        None => {
                            tracing::debug!(session_id = %session_id, "ignoring non-UTF-8 binary frame");
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping/Pong handled automatically
                    Some(Err(e)) => {
                        tracing::debug!(session_id = %session_id, error = %e, "device socket error");
                        break;
                    }
                }
            }

            // Evicted by a newer device, or closed by the bridge.
            _ = closed.cancelled() => {
                tracing::debug!(session_id = %session_id, "device session closed by bridge");
                break;
            }

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!(session_id = %session_id, "device socket received shutdown signal");
                    break;
                }
            }
        }
    }

    state.bridge.downstream_closed(&session_id);
    conn.close();
    let _ = writer.await;
}

// ── Client sockets ─────────────────────────────────────────────────

pub(super) async fn ws_client(
    ws: WebSocketUpgrade,
    Query(query): Query<ResourceQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let resource = query.resource();
    ws.on_upgrade(move |socket| handle_client_socket(socket, state, resource))
}

async fn handle_client_socket(socket: WebSocket, state: AppState, resource: Option<String>) {
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let session_id = uuid::Uuid::new_v4().to_string();
    let (conn, outbound_rx) = state.bridge.new_connection(session_id.clone());
    let closed = conn.closed_token();

    let (ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(run_writer(
        ws_tx,
        outbound_rx,
        closed.clone(),
        state.ping_interval,
    ));

    if state.shutdown.is_shutting_down() {
        tracing::debug!(session_id = %session_id, "refusing client connection during shutdown");
        conn.close();
        let _ = writer.await;
        return;
    }

    // Subscribe before registering so no event for this session is missed.
    let mut events = state.bridge.subscribe_events();

    if let Err(e) = state.bridge.upstream_opened(conn.clone(), resource.as_deref()) {
        tracing::warn!(session_id = %session_id, error = %e, "rejecting client connection");
        conn.close();
        let _ = writer.await;
        return;
    }

    let connected = serde_json::json!({
        "connected": true,
        "session_id": session_id,
        "resource": resource,
    });
    if !send_json(&conn, &connected).await {
        state.bridge.upstream_closed(&session_id);
        let _ = writer.await;
        return;
    }

    // One task per request so a slow device reply never blocks the others.
    let mut requests: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                        let Some(text) = text_payload(&msg) else {
                            tracing::debug!(session_id = %session_id, "rejecting non-UTF-8 binary frame");
                            let resp = WsResponse::protocol_error(
                                "invalid_request",
                                "Binary frames must carry UTF-8 JSON.",
                            );
                            if !send_json(&conn, &resp).await {
                                break;
                            }
                            continue;
                        };
                        match serde_json::from_str::<WsRequest>(text) {
                            Ok(req) => {
                                let bridge = state.bridge.clone();
                                let conn = conn.clone();
                                let session_id = session_id.clone();
                                requests.spawn(async move {
                                    let resp = ws_methods::dispatch(&req, &bridge, &session_id).await;
                                    send_json(&conn, &resp).await;
                                });
                            }
                            Err(e) => {
                                let resp = WsResponse::protocol_error(
                                    "invalid_request",
                                    &format!("Invalid JSON request: {}.", e),
                                );
                                if !send_json(&conn, &resp).await {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(session_id = %session_id, error = %e, "client socket error");
                        break;
                    }
                }
            }

            event = events.recv() => {
                match event {
                    Ok(BridgeEvent::DeviceFrame { resource_id: Some(rid), frame, .. }) => {
                        let bound = state.bridge.upstream().resource_id_for(&session_id);
                        if bound.as_deref() == Some(rid.as_str()) {
                            let note = WsNotification {
                                method: "device_event",
                                params: serde_json::json!({ "resource": rid, "frame": frame }),
                            };
                            if let Ok(text) = serde_json::to_string(&note) {
                                if conn.try_send(text).is_err() {
                                    tracing::debug!(session_id = %session_id, "dropping device event for slow client");
                                }
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!(session_id = %session_id, skipped = n, "client event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            Some(joined) = requests.join_next(), if !requests.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!(session_id = %session_id, "client request task panicked");
                    }
                }
            }

            _ = closed.cancelled() => break,

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!(session_id = %session_id, "client socket received shutdown signal");
                    break;
                }
            }
        }
    }

    // In-flight commands are cancelled; their pending entries are cleared.
    requests.abort_all();
    state.bridge.upstream_closed(&session_id);
    conn.close();
    let _ = writer.await;
}
