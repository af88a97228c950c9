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

//! stateless single-port UDP probing with per-port failure backoff.
//!
//! A probe binds the port, waits up to the scanner timeout for one datagram and
//! releases the socket before returning. Ports that keep failing are skipped for
//! a backoff window so an idle range does not burn CPU and file descriptors.

use std::net::SocketAddr;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::config::TelemetryConfig;
use crate::datetime::EpochMillis;

const MAX_FAILURES: u32 = 5;
const BACKOFF_TIME_MS: i64 = 60_000;
const MAX_CONCURRENT_PROBES: usize = 10;

/// outcome of a single port probe
#[derive(Debug)]
pub enum ProbeOutcome {
    /// a datagram arrived within the timeout; carries the sender address
    Detected(SocketAddr),
    NoData,
    /// the port is bound by someone else (usually one of our own listeners)
    InUse,
    Error(String),
}

#[derive(Debug, Clone, Copy)]
struct ProbeRecord {
    failure_count: u32,
    last_scan: EpochMillis,
}

pub struct PortProbe {
    scan_timeout: Duration,
    buffer_size: usize,
    records: DashMap<u16, ProbeRecord>,
}

impl PortProbe {
    pub fn new(config: &TelemetryConfig) -> Self {
        PortProbe {
            scan_timeout: Duration::from_millis(config.scanner_timeout_ms),
            buffer_size: config.buffer_size,
            records: DashMap::new(),
        }
    }

    /// probe a single port. The socket is bound non-exclusively for at most the
    /// scanner timeout and released before returning.
    pub async fn probe(&self, port: u16) -> ProbeOutcome {
        if self.should_skip(port) {
            trace!("skipping port {port} due to repeated failures");
            return ProbeOutcome::NoData;
        }

        let socket = match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(socket) => socket,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                debug!("port {port} already in use");
                self.reset_failures(port);
                return ProbeOutcome::InUse;
            }
            Err(e) => {
                warn!("error probing port {port}: {e}");
                self.record_failure(port);
                return ProbeOutcome::Error(e.to_string());
            }
        };

        let mut buf = vec![0u8; self.buffer_size];
        match timeout(self.scan_timeout, socket.recv_from(&mut buf)).await {
            Ok(Ok((_len, sender))) => {
                info!("detected data on port {port} from {sender}");
                self.records.remove(&port);
                ProbeOutcome::Detected(sender)
            }
            Ok(Err(e)) => {
                warn!("error probing port {port}: {e}");
                self.record_failure(port);
                ProbeOutcome::Error(e.to_string())
            }
            Err(_) => {
                self.record_failure(port);
                ProbeOutcome::NoData
            }
        }
    }

    /// probe a batch of ports with bounded concurrency, returning the detected
    /// ones with their sender addresses. Probes exceeding the per-probe deadline
    /// are cancelled.
    pub async fn probe_many(&self, ports: &[u16]) -> Vec<(u16, SocketAddr)> {
        let candidates: Vec<u16> = ports.iter().copied().filter(|p| !self.should_skip(*p)).collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        let deadline = self.scan_timeout + Duration::from_secs(1);

        stream::iter(candidates)
            .map(|port| self.probe_with_deadline(port, deadline))
            .buffer_unordered(MAX_CONCURRENT_PROBES)
            .filter_map(|hit| async move { hit })
            .collect()
            .await
    }

    async fn probe_with_deadline(&self, port: u16, deadline: Duration) -> Option<(u16, SocketAddr)> {
        match timeout(deadline, self.probe(port)).await {
            Ok(ProbeOutcome::Detected(sender)) => Some((port, sender)),
            Ok(_) => None,
            Err(_) => {
                warn!("probe of port {port} timed out");
                None
            }
        }
    }

    /// ports that failed [`MAX_FAILURES`] times are skipped while their last scan
    /// is within the backoff window
    fn should_skip(&self, port: u16) -> bool {
        if let Some(record) = self.records.get(&port) {
            if record.failure_count >= MAX_FAILURES {
                return EpochMillis::now().millis_since(record.last_scan) < BACKOFF_TIME_MS;
            }
        }
        false
    }

    fn record_failure(&self, port: u16) {
        let mut record = self.records.entry(port).or_insert(ProbeRecord {
            failure_count: 0,
            last_scan: EpochMillis::new(0),
        });
        record.failure_count += 1;
        record.last_scan = EpochMillis::now();
    }

    /// a port held by someone else is not failing
    fn reset_failures(&self, port: u16) {
        if let Some(mut record) = self.records.get_mut(&port) {
            record.failure_count = 0;
        }
    }

    #[cfg(test)]
    fn failure_count(&self, port: u16) -> u32 {
        self.records.get(&port).map(|r| r.failure_count).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;

    fn probe_config(timeout_ms: u64) -> TelemetryConfig {
        TelemetryConfig {
            port_range: PortRange { min: 1, max: 65535 },
            max_ports: 100,
            thread_pool_size: 1,
            idle_threshold_ms: 5000,
            scanner_timeout_ms: timeout_ms,
            buffer_size: 4096,
            stale_threshold_ms: 30_000,
            server_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }

    #[test]
    fn test_backoff_after_repeated_failures() {
        let probe = PortProbe::new(&probe_config(1000));
        for _ in 0..MAX_FAILURES {
            probe.record_failure(20_001);
        }
        assert!(probe.should_skip(20_001));

        // an old scan time falls out of the backoff window
        probe.records.get_mut(&20_001).unwrap().last_scan =
            EpochMillis::new(EpochMillis::now().millis() - BACKOFF_TIME_MS - 1);
        assert!(!probe.should_skip(20_001));
    }

    #[test]
    fn test_in_use_resets_failures() {
        let probe = PortProbe::new(&probe_config(1000));
        for _ in 0..MAX_FAILURES {
            probe.record_failure(20_002);
        }
        probe.reset_failures(20_002);
        assert_eq!(probe.failure_count(20_002), 0);
        assert!(!probe.should_skip(20_002));
    }

    #[tokio::test]
    async fn test_probe_detects_sender() {
        let probe = PortProbe::new(&probe_config(2000));
        let port = 28_881;

        // keep sending until the probe has bound and received
        let sender_task = tokio::spawn(async move {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            for _ in 0..100 {
                let _ = socket.send_to(b"\xfe\x00", ("127.0.0.1", port)).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        match probe.probe(port).await {
            ProbeOutcome::Detected(sender) => assert!(sender.ip().is_loopback()),
            other => panic!("expected Detected, got {other:?}"),
        }
        assert_eq!(probe.failure_count(port), 0);
        sender_task.abort();
    }

    #[tokio::test]
    async fn test_probe_in_use() {
        let probe = PortProbe::new(&probe_config(1000));
        let held = UdpSocket::bind("0.0.0.0:28882").await.unwrap();

        match probe.probe(28_882).await {
            ProbeOutcome::InUse => {}
            other => panic!("expected InUse, got {other:?}"),
        }
        drop(held);
    }

    #[tokio::test]
    async fn test_probe_quiet_port_reports_no_data() {
        let probe = PortProbe::new(&probe_config(1000));
        match probe.probe(28_883).await {
            ProbeOutcome::NoData => {}
            other => panic!("expected NoData, got {other:?}"),
        }
        assert_eq!(probe.failure_count(28_883), 1);
    }
}
