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

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{config_error, Result};

/// inclusive range of UDP ports eligible for scanning
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TelemetryConfig {
    pub port_range: PortRange,

    /// upper bound on the size of the scan set
    pub max_ports: usize,

    /// worker threads of the runtime
    pub thread_pool_size: usize,

    /// a listener with no decoded message for this long terminates
    pub idle_threshold_ms: u64,

    /// how long a probe waits for a datagram before reporting no data
    pub scanner_timeout_ms: u64,

    /// per-datagram receive buffer size
    pub buffer_size: usize,

    /// records quieter than this are hidden from broadcasts; evicted at twice this age
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,

    /// bind address of the websocket/admin server
    #[serde(default = "default_server_addr")]
    pub server_addr: SocketAddr,
}

fn default_stale_threshold_ms() -> u64 {
    30_000
}

fn default_server_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

impl TelemetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.port_range.min == 0 {
            return Err(config_error("port_range.min must be >= 1"));
        }
        if self.port_range.min > self.port_range.max {
            return Err(config_error(format!(
                "invalid port range {}..{}",
                self.port_range.min, self.port_range.max
            )));
        }
        if self.max_ports == 0 {
            return Err(config_error("max_ports must be >= 1"));
        }
        if self.thread_pool_size == 0 {
            return Err(config_error("thread_pool_size must be >= 1"));
        }
        if self.idle_threshold_ms < 1000 {
            return Err(config_error("idle_threshold_ms must be >= 1000"));
        }
        if self.scanner_timeout_ms < 1000 {
            return Err(config_error("scanner_timeout_ms must be >= 1000"));
        }
        if self.buffer_size < 265 {
            return Err(config_error("buffer_size must be >= 265"));
        }
        if self.stale_threshold_ms < 1000 {
            return Err(config_error("stale_threshold_ms must be >= 1000"));
        }
        Ok(())
    }
}

/// load and validate a [`TelemetryConfig`] from a RON file
pub fn load_config(path: impl AsRef<Path>) -> Result<TelemetryConfig> {
    let path = path.as_ref();
    let input = std::fs::read_to_string(path)
        .map_err(|e| config_error(format!("cannot read config {}: {e}", path.display())))?;
    let config: TelemetryConfig = ron::from_str(&input)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> TelemetryConfig {
        TelemetryConfig {
            port_range: PortRange { min: 14550, max: 14552 },
            max_ports: 10,
            thread_pool_size: 2,
            idle_threshold_ms: 5000,
            scanner_timeout_ms: 1000,
            buffer_size: 4096,
            stale_threshold_ms: 30_000,
            server_addr: default_server_addr(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_rejects_bounds() {
        let mut c = base_config();
        c.idle_threshold_ms = 999;
        assert!(c.validate().is_err());

        let mut c = base_config();
        c.scanner_timeout_ms = 0;
        assert!(c.validate().is_err());

        let mut c = base_config();
        c.buffer_size = 128;
        assert!(c.validate().is_err());

        let mut c = base_config();
        c.port_range = PortRange { min: 15000, max: 14000 };
        assert!(c.validate().is_err());

        let mut c = base_config();
        c.port_range = PortRange { min: 0, max: 100 };
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_parse_ron() {
        let input = r#"
            TelemetryConfig(
                port_range: PortRange( min: 14550, max: 14600 ),
                max_ports: 100,
                thread_pool_size: 8,
                idle_threshold_ms: 30000,
                scanner_timeout_ms: 2000,
                buffer_size: 4096,
            )
        "#;
        let config: TelemetryConfig = ron::from_str(input).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.port_range.min, 14550);
        assert_eq!(config.stale_threshold_ms, 30_000); // default
        assert_eq!(config.server_addr.port(), 8080); // default
    }
}
