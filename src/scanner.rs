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

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::listener::ListenerRegistry;
use crate::ports::PortSet;
use crate::probe::PortProbe;

const SCAN_DELAY: Duration = Duration::from_secs(5);

/// periodic scheduler that probes the eligible ports without an active listener
/// and promotes detections to the registry. Cycles run with fixed-delay
/// semantics: the next cycle starts 5 s after the previous one completed, so an
/// overrunning probe batch never piles up concurrent cycles.
pub struct ScanOrchestrator {
    ports: Arc<PortSet>,
    probe: Arc<PortProbe>,
    registry: Arc<ListenerRegistry>,
}

impl ScanOrchestrator {
    pub fn new(ports: Arc<PortSet>, probe: Arc<PortProbe>, registry: Arc<ListenerRegistry>) -> Self {
        ScanOrchestrator { ports, probe, registry }
    }

    /// one scan cycle: (eligible ports) minus (active listeners) → probe → promote
    pub async fn scan_cycle(&self) {
        let active: HashSet<u16> = self.registry.active().into_iter().collect();
        let candidates: Vec<u16> = self
            .ports
            .snapshot()
            .into_iter()
            .filter(|port| !active.contains(port))
            .collect();

        if candidates.is_empty() {
            trace!("no ports to scan");
            return;
        }
        debug!("scanning {} ports", candidates.len());

        let hits = self.probe.probe_many(&candidates).await;
        for (port, sender) in hits {
            if self.registry.start(port) {
                info!("activated listener for port {port} after detecting data from {sender}");
            }
        }
    }

    pub fn spawn(orchestrator: Arc<ScanOrchestrator>) -> JoinHandle<()> {
        info!("starting port scan orchestrator");
        tokio::spawn(async move {
            loop {
                orchestrator.scan_cycle().await;
                tokio::time::sleep(SCAN_DELAY).await;
            }
        })
    }
}
