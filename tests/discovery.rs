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

//! end-to-end discovery: quiet range → datagram on one port → probe hit →
//! listener promotion → state record from decoded traffic

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use mavlink::ardupilotmega::{HEARTBEAT_DATA, MavMessage};
use mavlink::MavHeader;
use tokio::net::UdpSocket;

use mav_telemetry::config::{PortRange, TelemetryConfig};
use mav_telemetry::listener::ListenerRegistry;
use mav_telemetry::ports::PortSet;
use mav_telemetry::probe::PortProbe;
use mav_telemetry::scanner::ScanOrchestrator;
use mav_telemetry::state::StateEngine;

fn test_config(min: u16, max: u16) -> TelemetryConfig {
    TelemetryConfig {
        port_range: PortRange { min, max },
        max_ports: 100,
        thread_pool_size: 2,
        idle_threshold_ms: 30_000,
        scanner_timeout_ms: 1000,
        buffer_size: 4096,
        stale_threshold_ms: 30_000,
        server_addr: "127.0.0.1:0".parse().unwrap(),
    }
}

fn heartbeat_bytes(system_id: u8) -> Vec<u8> {
    let header = MavHeader { system_id, component_id: 1, sequence: 0 };
    let msg = MavMessage::HEARTBEAT(HEARTBEAT_DATA::default());
    let mut cursor = Cursor::new(Vec::with_capacity(64));
    mavlink::write_v1_msg(&mut cursor, header, &msg).unwrap();
    cursor.into_inner()
}

#[tokio::test]
async fn test_discovery_promotes_transmitting_port() {
    let config = Arc::new(test_config(25_550, 25_552));
    let engine = Arc::new(StateEngine::new(config.stale_threshold_ms));
    let ports = Arc::new(PortSet::new(&config));
    let probe = Arc::new(PortProbe::new(&config));
    let registry = Arc::new(ListenerRegistry::new(engine.clone(), config.clone()));
    let orchestrator = ScanOrchestrator::new(ports, probe, registry.clone());

    // cycle 1: nothing transmits, so nothing is promoted
    orchestrator.scan_cycle().await;
    assert!(registry.active().is_empty());

    // a GCS appears on 25551
    let sender_task = tokio::spawn(async move {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bytes = heartbeat_bytes(17);
        loop {
            let _ = socket.send_to(&bytes, ("127.0.0.1", 25_551)).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });

    // cycle 2: the probe sees the datagram and the registry starts a listener
    orchestrator.scan_cycle().await;
    assert!(registry.is_active(25_551), "listener should be active on 25551");
    assert!(!registry.is_active(25_550));
    assert!(!registry.is_active(25_552));

    // subsequent datagrams produce a state record with the sender identity
    let mut state = None;
    for _ in 0..100 {
        if let Some(s) = engine.get(25_551) {
            state = Some(s);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let state = state.expect("drone state created from decoded traffic");
    assert_eq!(state.port, 25_551);
    assert_eq!(state.gcs_ip, "127.0.0.1");
    assert_eq!(state.system_id, 17);

    sender_task.abort();
    registry.shutdown().await;
}

#[tokio::test]
async fn test_scan_cycle_skips_active_listeners() {
    let config = Arc::new(test_config(25_560, 25_560));
    let engine = Arc::new(StateEngine::new(config.stale_threshold_ms));
    let ports = Arc::new(PortSet::new(&config));
    let probe = Arc::new(PortProbe::new(&config));
    let registry = Arc::new(ListenerRegistry::new(engine, config.clone()));
    let orchestrator = ScanOrchestrator::new(ports, probe, registry.clone());

    assert!(registry.start(25_560));
    // the only eligible port has an active listener, so the cycle must not
    // probe it (a probe would report InUse, not start anything)
    orchestrator.scan_cycle().await;
    assert_eq!(registry.active(), vec![25_560]);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_idle_listener_exits_and_is_reaped() {
    let mut config = test_config(25_570, 25_570);
    config.idle_threshold_ms = 1000;
    let config = Arc::new(config);
    let engine = Arc::new(StateEngine::new(config.stale_threshold_ms));
    let registry = Arc::new(ListenerRegistry::new(engine, config.clone()));

    assert!(registry.start(25_570));
    assert!(registry.is_active(25_570));

    // no traffic: the listener self-terminates after the idle threshold
    // (checked at the 1 s read timeout granularity)
    tokio::time::sleep(Duration::from_millis(2_600)).await;
    assert!(!registry.is_active(25_570));

    // the health tick reaps the dead entry
    registry.reap_dead();
    assert!(registry.active().is_empty());

    registry.shutdown().await;
}
