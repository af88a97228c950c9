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

//! timer-driven fan-out of state snapshots to websocket subscribers.
//!
//! Producers never push frames; they only mutate the [`StateEngine`]. A 100 ms
//! tick takes the active snapshot, serializes each needed payload at most once
//! and hands frames to the per-session channels. Each session has exactly one
//! writer task draining its channel, which serializes writes on the transport;
//! a full channel drops the frame rather than blocking the tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::dto::{DroneDto, DronesPayload};
use crate::state::StateEngine;
use crate::DroneState;

pub const BROADCAST_INTERVAL: Duration = Duration::from_millis(100);

const SESSION_CHANNEL_CAPACITY: usize = 16;

/// one websocket subscriber: unfiltered (`/telemetry`) or pinned to a port
/// (`/telemetry/{port}`)
pub struct Session {
    pub id: u64,
    pub filter_port: Option<u16>,
    tx: mpsc::Sender<String>,
}

pub struct BroadcastHub {
    engine: Arc<StateEngine>,
    sessions: DashMap<u64, Session>,
    next_session_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new(engine: Arc<StateEngine>) -> Self {
        BroadcastHub {
            engine,
            sessions: DashMap::new(),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// register a subscriber; the returned receiver feeds the session's writer task
    pub fn add_session(&self, filter_port: Option<u16>) -> (u64, mpsc::Receiver<String>) {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        self.sessions.insert(id, Session { id, filter_port, tx });
        info!(
            "websocket session {id} connected, port: {}",
            filter_port.map(|p| p.to_string()).unwrap_or_else(|| "all".to_string())
        );
        (id, rx)
    }

    pub fn remove_session(&self, id: u64) {
        if self.sessions.remove(&id).is_some() {
            info!("websocket session {id} disconnected");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// one broadcast cycle. Serialization caches live for exactly this tick.
    pub fn broadcast_tick(&self) {
        let snapshot = self.engine.active_snapshot();
        if snapshot.is_empty() {
            return;
        }

        let mut all_drones_json: Option<String> = None;
        let mut port_json: HashMap<u16, Option<String>> = HashMap::new();
        let mut closed: Vec<u64> = Vec::new();

        for session in self.sessions.iter() {
            let frame = match session.filter_port {
                Some(port) => port_json
                    .entry(port)
                    .or_insert_with(|| serialize_port_frame(&snapshot, port))
                    .clone(),
                None => {
                    if all_drones_json.is_none() {
                        all_drones_json = serialize_full_frame(&snapshot);
                    }
                    all_drones_json.clone()
                }
            };

            let Some(frame) = frame else { continue }; // nothing for this filter

            match session.tx.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!("session {} channel full, dropping frame", session.id);
                }
                Err(TrySendError::Closed(_)) => closed.push(session.id),
            }
        }

        for id in closed {
            self.remove_session(id);
        }
    }

    pub fn close_all(&self) {
        self.sessions.clear();
    }

    pub fn spawn_tick_task(hub: Arc<BroadcastHub>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(BROADCAST_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                hub.broadcast_tick();
            }
        })
    }
}

fn serialize_full_frame(snapshot: &[DroneState]) -> Option<String> {
    let payload = DronesPayload {
        drones: snapshot.iter().map(DroneDto::from).collect(),
    };
    match serde_json::to_string(&payload) {
        Ok(json) => Some(json),
        Err(e) => {
            error!("failed to serialize telemetry snapshot: {e}");
            None
        }
    }
}

fn serialize_port_frame(snapshot: &[DroneState], port: u16) -> Option<String> {
    let drone = snapshot.iter().find(|d| d.port == port)?;
    let payload = DronesPayload { drones: vec![DroneDto::from(drone)] };
    match serde_json::to_string(&payload) {
        Ok(json) => Some(json),
        Err(e) => {
            error!("failed to serialize telemetry for port {port}: {e}");
            None
        }
    }
}
