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
use std::sync::Mutex;

use tracing::{info, warn};

use crate::config::{PortRange, TelemetryConfig};

/// the authoritative, internally synchronized set of ports eligible for scanning.
/// Iteration always goes through [`PortSet::snapshot`], which observes a
/// point-in-time copy.
pub struct PortSet {
    ports: Mutex<HashSet<u16>>,
    range: PortRange,
    max_ports: usize,
}

impl PortSet {
    /// construct with all ports of the configured range
    pub fn new(config: &TelemetryConfig) -> Self {
        let mut ports = HashSet::new();
        for port in config.port_range.min..=config.port_range.max {
            ports.insert(port);
        }
        info!(
            "initialized port set with {} ports ({}-{})",
            ports.len(),
            config.port_range.min,
            config.port_range.max
        );

        PortSet {
            ports: Mutex::new(ports),
            range: config.port_range,
            max_ports: config.max_ports,
        }
    }

    /// add a port to the scan set. Rejects ports outside the configured range
    /// and additions beyond `max_ports`.
    pub fn add(&self, port: u16) -> bool {
        if !self.range.contains(port) {
            warn!("invalid port: {port}");
            return false;
        }

        let mut ports = self.ports.lock().unwrap();
        if ports.len() >= self.max_ports && !ports.contains(&port) {
            warn!("cannot add port {port}: max limit reached");
            return false;
        }

        let added = ports.insert(port);
        if added {
            info!("added port {port} to scan set");
        }
        added
    }

    pub fn remove(&self, port: u16) -> bool {
        let removed = self.ports.lock().unwrap().remove(&port);
        if removed {
            info!("removed port {port} from scan set");
        }
        removed
    }

    pub fn contains(&self, port: u16) -> bool {
        self.ports.lock().unwrap().contains(&port)
    }

    /// unordered point-in-time copy
    pub fn snapshot(&self) -> Vec<u16> {
        self.ports.lock().unwrap().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.ports.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
