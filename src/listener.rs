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

//! long-lived per-port UDP listeners and their registry.
//!
//! Each listener owns one UDP socket, reassembles MAVLink frames out of arriving
//! datagrams and dispatches decoded messages to the [`StateEngine`]. A listener
//! that sees no decoded message within the idle threshold exits on its own; the
//! registry's health tick reaps terminated entries.

use std::io::Cursor;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use mavlink::ardupilotmega::MavMessage;
use mavlink::peek_reader::PeekReader;
use mavlink::MavHeader;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::TelemetryConfig;
use crate::datetime::EpochMillis;
use crate::state::StateEngine;

const MAGIC_V1: u8 = 0xFE;
const MAGIC_V2: u8 = 0xFD;

const READ_TIMEOUT: Duration = Duration::from_secs(1);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// reassembles MAVLink v1/v2 frames out of a raw byte stream. Bytes before the
/// next magic are discarded; frames that fail to parse (CRC, unknown id) are
/// skipped without losing stream sync.
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        FrameBuffer { buf: Vec::with_capacity(2048) }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// extract the next complete frame, or None if more bytes are needed
    pub fn next_frame(&mut self) -> Option<(MavHeader, MavMessage)> {
        loop {
            let magic_pos = self.buf.iter().position(|&b| b == MAGIC_V1 || b == MAGIC_V2);
            let Some(pos) = magic_pos else {
                self.buf.clear();
                return None;
            };
            if pos > 0 {
                self.buf.drain(..pos);
            }

            if self.buf.len() < 2 {
                return None;
            }

            let magic = self.buf[0];
            let payload_len = self.buf[1] as usize;

            let frame_size = if magic == MAGIC_V2 {
                if self.buf.len() < 3 {
                    return None;
                }
                // 10 byte header + payload + 2 CRC, plus a 13 byte signature
                // when incompat_flags bit 0 is set
                let base = 12 + payload_len;
                if (self.buf[2] & 0x01) != 0 {
                    base + 13
                } else {
                    base
                }
            } else {
                // 6 byte header + payload + 2 CRC
                8 + payload_len
            };

            if self.buf.len() < frame_size {
                return None;
            }

            let parsed = parse_frame(&self.buf[..frame_size]);
            self.buf.drain(..frame_size);
            match parsed {
                Some(frame) => return Some(frame),
                None => {
                    debug!("skipping undecodable MAVLink frame ({frame_size} bytes)");
                    continue;
                }
            }
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_frame(data: &[u8]) -> Option<(MavHeader, MavMessage)> {
    if data.is_empty() {
        return None;
    }
    let mut reader = PeekReader::new(Cursor::new(data));
    if data[0] == MAGIC_V2 {
        mavlink::read_v2_msg::<MavMessage, _>(&mut reader).ok()
    } else {
        mavlink::read_v1_msg::<MavMessage, _>(&mut reader).ok()
    }
}

/// bind `0.0.0.0:port` with SO_REUSEADDR set
fn bind_reuse(port: u16) -> std::io::Result<UdpSocket> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// the listener loop for one port. Exits on idle timeout or socket error; the
/// socket and frame buffer are released on every exit path.
async fn run_listener(
    port: u16,
    engine: Arc<StateEngine>,
    config: Arc<TelemetryConfig>,
    last_message: Arc<AtomicI64>,
) {
    let socket = match bind_reuse(port) {
        Ok(socket) => socket,
        Err(e) => {
            error!("failed to bind listener socket on port {port}: {e}");
            return;
        }
    };

    info!("started MAVLink listener on port {port}");

    let idle_threshold = config.idle_threshold_ms as i64;
    let mut buf = vec![0u8; config.buffer_size];
    let mut frames = FrameBuffer::new();
    last_message.store(EpochMillis::now().millis(), Ordering::Relaxed);

    loop {
        match timeout(READ_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, sender))) => {
                frames.extend(&buf[..len]);
                while let Some((header, msg)) = frames.next_frame() {
                    engine.apply(port, sender, &header, &msg);
                    last_message.store(EpochMillis::now().millis(), Ordering::Relaxed);
                }
            }
            Ok(Err(e)) => {
                warn!("socket error on port {port}: {e}");
                break;
            }
            Err(_) => {} // read timeout, fall through to the idle check
        }

        let idle = EpochMillis::now().millis() - last_message.load(Ordering::Relaxed);
        if idle > idle_threshold {
            info!("port {port} idle timeout, stopping listener");
            break;
        }
    }

    info!("MAVLink listener stopped on port {port}");
}

pub struct ListenerHandle {
    pub port: u16,
    pub started_at: EpochMillis,
    task: JoinHandle<()>,
    last_message: Arc<AtomicI64>,
}

impl ListenerHandle {
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn last_message(&self) -> EpochMillis {
        EpochMillis::new(self.last_message.load(Ordering::Relaxed))
    }
}

/// tracks the live listeners, at most one per port
pub struct ListenerRegistry {
    listeners: DashMap<u16, ListenerHandle>,
    engine: Arc<StateEngine>,
    config: Arc<TelemetryConfig>,
}

impl ListenerRegistry {
    pub fn new(engine: Arc<StateEngine>, config: Arc<TelemetryConfig>) -> Self {
        ListenerRegistry {
            listeners: DashMap::new(),
            engine,
            config,
        }
    }

    /// start a listener unless one is already active on the port. A terminated
    /// but not yet reaped entry is replaced.
    pub fn start(&self, port: u16) -> bool {
        match self.listeners.entry(port) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_active() {
                    debug!("listener already active on port {port}");
                    return false;
                }
                occupied.insert(self.launch(port));
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.launch(port));
                true
            }
        }
    }

    fn launch(&self, port: u16) -> ListenerHandle {
        let last_message = Arc::new(AtomicI64::new(EpochMillis::now().millis()));
        let task = tokio::spawn(run_listener(
            port,
            self.engine.clone(),
            self.config.clone(),
            last_message.clone(),
        ));
        info!("started listener on port {port}");

        ListenerHandle {
            port,
            started_at: EpochMillis::now(),
            task,
            last_message,
        }
    }

    pub fn stop(&self, port: u16) {
        if let Some((_, handle)) = self.listeners.remove(&port) {
            handle.task.abort();
            info!("stopped listener on port {port}");
        }
    }

    pub fn is_active(&self, port: u16) -> bool {
        self.listeners.get(&port).map(|h| h.is_active()).unwrap_or(false)
    }

    /// snapshot of registered ports (terminated entries stay until reaped)
    pub fn active(&self) -> Vec<u16> {
        self.listeners.iter().map(|e| *e.key()).collect()
    }

    /// remove entries whose task has terminated
    pub fn reap_dead(&self) -> usize {
        let dead: Vec<u16> = self
            .listeners
            .iter()
            .filter(|e| !e.is_active())
            .map(|e| *e.key())
            .collect();

        for port in &dead {
            self.listeners.remove(port);
            warn!("removed dead listener on port {port}");
        }
        if !dead.is_empty() {
            info!("health check removed {} dead listeners, {} active", dead.len(), self.listeners.len());
        }
        dead.len()
    }

    /// cancel all listeners and await their termination with a deadline
    pub async fn shutdown(&self) {
        let ports: Vec<u16> = self.listeners.iter().map(|e| *e.key()).collect();
        let mut tasks = Vec::with_capacity(ports.len());

        for port in ports {
            if let Some((_, handle)) = self.listeners.remove(&port) {
                handle.task.abort();
                tasks.push(handle.task);
            }
        }

        if timeout(SHUTDOWN_DEADLINE, join_all(tasks)).await.is_err() {
            warn!("listener tasks did not terminate within {SHUTDOWN_DEADLINE:?}");
        }
    }

    pub fn spawn_health_task(registry: Arc<ListenerRegistry>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                registry.reap_dead();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;
    use mavlink::ardupilotmega::HEARTBEAT_DATA;

    fn test_config(idle_threshold_ms: u64) -> Arc<TelemetryConfig> {
        Arc::new(TelemetryConfig {
            port_range: PortRange { min: 1, max: 65535 },
            max_ports: 100,
            thread_pool_size: 1,
            idle_threshold_ms,
            scanner_timeout_ms: 1000,
            buffer_size: 4096,
            stale_threshold_ms: 30_000,
            server_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        })
    }

    fn heartbeat_v1_bytes(system_id: u8) -> Vec<u8> {
        let header = MavHeader { system_id, component_id: 1, sequence: 0 };
        let msg = MavMessage::HEARTBEAT(HEARTBEAT_DATA::default());
        let mut cursor = Cursor::new(Vec::with_capacity(64));
        mavlink::write_v1_msg(&mut cursor, header, &msg).unwrap();
        cursor.into_inner()
    }

    #[test]
    fn test_frame_buffer_parses_whole_frame() {
        let mut frames = FrameBuffer::new();
        frames.extend(&heartbeat_v1_bytes(7));

        let (header, msg) = frames.next_frame().expect("frame");
        assert_eq!(header.system_id, 7);
        assert!(matches!(msg, MavMessage::HEARTBEAT(_)));
        assert!(frames.next_frame().is_none());
    }

    #[test]
    fn test_frame_buffer_skips_garbage_prefix() {
        let mut frames = FrameBuffer::new();
        frames.extend(&[0x00, 0x13, 0x37]);
        frames.extend(&heartbeat_v1_bytes(3));

        let (header, _) = frames.next_frame().expect("frame");
        assert_eq!(header.system_id, 3);
    }

    #[test]
    fn test_frame_buffer_reassembles_split_frame() {
        let bytes = heartbeat_v1_bytes(9);
        let (a, b) = bytes.split_at(4);

        let mut frames = FrameBuffer::new();
        frames.extend(a);
        assert!(frames.next_frame().is_none());
        frames.extend(b);
        assert!(frames.next_frame().is_some());
    }

    #[test]
    fn test_frame_buffer_skips_corrupt_frame() {
        let mut corrupted = heartbeat_v1_bytes(1);
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF; // break the CRC

        let mut frames = FrameBuffer::new();
        frames.extend(&corrupted);
        frames.extend(&heartbeat_v1_bytes(5));

        let (header, _) = frames.next_frame().expect("second frame survives");
        assert_eq!(header.system_id, 5);
    }

    #[tokio::test]
    async fn test_registry_single_listener_per_port() {
        let engine = Arc::new(StateEngine::new(30_000));
        let registry = ListenerRegistry::new(engine, test_config(30_000));

        assert!(registry.start(29_101));
        assert!(!registry.start(29_101));
        assert_eq!(registry.active(), vec![29_101]);

        registry.stop(29_101);
        assert!(registry.active().is_empty());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_listener_dispatches_to_engine() {
        let engine = Arc::new(StateEngine::new(30_000));
        let registry = ListenerRegistry::new(engine.clone(), test_config(30_000));
        let port = 29_102;

        assert!(registry.start(port));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bytes = heartbeat_v1_bytes(42);
        for _ in 0..20 {
            sender.send_to(&bytes, ("127.0.0.1", port)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            if engine.contains(port) {
                break;
            }
        }

        let state = engine.get(port).expect("state created from heartbeat");
        assert_eq!(state.system_id, 42);
        assert_eq!(state.gcs_ip, "127.0.0.1");
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_reap_dead_after_idle_exit() {
        let engine = Arc::new(StateEngine::new(30_000));
        let registry = ListenerRegistry::new(engine, test_config(1000));
        let port = 29_103;

        assert!(registry.start(port));
        // idle threshold is 1s and the read timeout is 1s, so the listener
        // exits within roughly two seconds of silence
        tokio::time::sleep(Duration::from_millis(2_600)).await;

        assert!(!registry.is_active(port));
        assert_eq!(registry.reap_dead(), 1);
        assert!(registry.active().is_empty());
        registry.shutdown().await;
    }
}
