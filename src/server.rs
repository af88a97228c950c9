/*
 * Copyright © 2025, the mav_telemetry contributors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License"); you may not
 * use this file except in compliance with the License. You may obtain a copy
 * of the License at http://www.apache.org/licenses/LICENSE-2.0.
 *
 * Unless required by applicable law or agreed to in writing, software distributed under
 * the License is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND,
 * either express or implied. See the License for the specific language governing permissions
 * and limitations under the License.
 */

//! the outward HTTP surface: websocket telemetry streams, a snapshot route and
//! admin routes for the scan set and listeners

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tracing::{debug, info};

use crate::dto::{DroneDto, DronesPayload};
use crate::errors::{op_failed, Result, TelemetryError};
use crate::listener::ListenerRegistry;
use crate::ports::PortSet;
use crate::state::StateEngine;
use crate::ws::BroadcastHub;

#[derive(Clone)]
pub struct ServerState {
    pub engine: Arc<StateEngine>,
    pub hub: Arc<BroadcastHub>,
    pub ports: Arc<PortSet>,
    pub registry: Arc<ListenerRegistry>,
}

pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/telemetry", get(ws_all_handler))
        .route("/telemetry/:port", get(ws_port_handler))
        .route("/drones", get(drones_handler))
        .route("/ports/:port", axum::routing::post(add_port_handler).delete(remove_port_handler))
        .route(
            "/listeners/:port",
            axum::routing::post(start_listener_handler).delete(stop_listener_handler),
        )
        .with_state(state)
}

/// bind is done by the caller so tests and the binary can pick the address
pub async fn serve(listener: tokio::net::TcpListener, state: ServerState) -> Result<()> {
    info!("serving telemetry on http://{}", listener.local_addr()?);
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

async fn ws_all_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, None, state.hub.clone()))
}

async fn ws_port_handler(
    Path(port): Path<u16>,
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, Some(port), state.hub.clone()))
}

/// pump broadcast frames into the socket and drain (ignore) client input until
/// either side closes. This task is the session's single writer.
async fn handle_socket(socket: WebSocket, filter_port: Option<u16>, hub: Arc<BroadcastHub>) {
    let (session_id, mut frames) = hub.add_session(filter_port);
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(text) => {
                    if let Err(e) = sender.send(Message::Text(text)).await {
                        debug!("send to session {session_id} failed: {e}");
                        break;
                    }
                }
                None => break, // hub dropped the session
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // subscriber input is ignored
                Some(Err(_)) => break,
            }
        }
    }

    hub.remove_session(session_id);
}

async fn drones_handler(State(state): State<ServerState>) -> Json<DronesPayload> {
    let drones = state.engine.active_snapshot().iter().map(DroneDto::from).collect();
    Json(DronesPayload { drones })
}

async fn add_port_handler(
    Path(port): Path<u16>,
    State(state): State<ServerState>,
) -> std::result::Result<StatusCode, TelemetryError> {
    if state.ports.add(port) {
        Ok(StatusCode::CREATED)
    } else {
        Err(op_failed(format!("cannot add port {port} to scan set")))
    }
}

async fn remove_port_handler(
    Path(port): Path<u16>,
    State(state): State<ServerState>,
) -> std::result::Result<StatusCode, TelemetryError> {
    if state.ports.remove(port) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(op_failed(format!("port {port} not in scan set")))
    }
}

async fn start_listener_handler(
    Path(port): Path<u16>,
    State(state): State<ServerState>,
) -> std::result::Result<StatusCode, TelemetryError> {
    if state.registry.start(port) {
        Ok(StatusCode::CREATED)
    } else {
        Err(TelemetryError::PortAlreadyInUse(port))
    }
}

async fn stop_listener_handler(
    Path(port): Path<u16>,
    State(state): State<ServerState>,
) -> StatusCode {
    state.registry.stop(port);
    StatusCode::NO_CONTENT
}

#[derive(Serialize, Debug)]
struct ErrorResponse {
    code: &'static str,
    message: String,
}

impl IntoResponse for TelemetryError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            TelemetryError::PortAlreadyInUse(_) => (StatusCode::CONFLICT, "PORT_IN_USE"),
            TelemetryError::SocketError(_)
            | TelemetryError::DecodeError(_)
            | TelemetryError::PersistError(_)
            | TelemetryError::TransportError(_)
            | TelemetryError::OpFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "TELEMETRY_ERROR"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        (status, Json(ErrorResponse { code, message: self.to_string() })).into_response()
    }
}
