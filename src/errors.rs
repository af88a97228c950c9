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

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TelemetryError>;

/// crate-wide error type. Variants carry opaque strings so that the type stays
/// Clone and does not hold source errors across await points.
#[derive(Error, Debug, Clone)]
pub enum TelemetryError {
    #[error("port {0} already in use")]
    PortAlreadyInUse(u16),

    #[error("socket error {0}")]
    SocketError(String),

    #[error("decode error {0}")]
    DecodeError(String),

    #[error("persist error {0}")]
    PersistError(String),

    #[error("transport error {0}")]
    TransportError(String),

    #[error("config error {0}")]
    ConfigError(String),

    #[error("IO error {0}")]
    IOError(String),

    #[error("JSON error {0}")]
    JsonError(String),

    #[error("operation failed {0}")]
    OpFailed(String),
}

macro_rules! map_to_opaque_error {
    ($from_error:ty => $to_error:ident :: $variant:ident) => {
        impl From<$from_error> for $to_error {
            fn from(e: $from_error) -> Self {
                $to_error::$variant(e.to_string())
            }
        }
    };
}

map_to_opaque_error! { std::io::Error => TelemetryError::IOError }
map_to_opaque_error! { serde_json::Error => TelemetryError::JsonError }
map_to_opaque_error! { ron::error::SpannedError => TelemetryError::ConfigError }
map_to_opaque_error! { std::net::AddrParseError => TelemetryError::ConfigError }

pub fn op_failed(msg: impl ToString) -> TelemetryError {
    TelemetryError::OpFailed(msg.to_string())
}

pub fn config_error(msg: impl ToString) -> TelemetryError {
    TelemetryError::ConfigError(msg.to_string())
}

pub fn socket_error(msg: impl ToString) -> TelemetryError {
    TelemetryError::SocketError(msg.to_string())
}

pub fn persist_error(msg: impl ToString) -> TelemetryError {
    TelemetryError::PersistError(msg.to_string())
}

#[macro_export]
macro_rules! op_failed {
    ($fmt:literal $(, $arg:expr )* ) => {
        $crate::errors::op_failed( format!( $fmt $(, $arg)* ))
    };
}
