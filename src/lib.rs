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

//! Always-on MAVLink telemetry aggregation plane.
//!
//! Ground control stations send MAVLink over UDP to an unpredictable subset of a
//! configured port range. A periodic scan discovers transmitting ports and promotes
//! them to long-lived listeners; decoded messages update a per-port [`DroneState`]
//! record from which derived values (integrated distance, air/throttle timers, ETAs)
//! are computed. Snapshots are fanned out to websocket subscribers and periodically
//! flushed to a port-keyed store.

use serde::{Deserialize, Serialize};

use crate::datetime::EpochMillis;

pub mod config;
pub mod datetime;
pub mod dto;
pub mod errors;
pub mod geo;
pub mod listener;
pub mod persist;
pub mod ports;
pub mod probe;
pub mod scanner;
pub mod server;
pub mod state;
pub mod ws;

pub use config::TelemetryConfig;
pub use errors::{Result, TelemetryError};

/// relative altitude (m) above which a vehicle counts as airborne
pub const AIRBORNE_ALT_THRESHOLD: f64 = 0.5;

/// servo PWM (µs) above which channel 3 counts as throttle-up
pub const THROTTLE_THRESHOLD: u16 = 1050;

/// a mission waypoint as reported by `MISSION_ITEM_INT`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Waypoint {
    pub seq: u16,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

/// the launch location, set from the `seq == 0` mission item
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct HomeLocation {
    pub lat: f64,
    pub lon: f64,
}

/// the full per-port telemetry record. One instance exists per active UDP port;
/// it is only ever mutated by that port's listener task (see [`state::StateEngine`]).
///
/// Time fields are wall-clock epoch millis; the `*_start_time` fields anchor the
/// event-driven counters and are only meaningful while the matching flag is set.
#[derive(Debug, Clone)]
pub struct DroneState {
    pub port: u16,
    pub gcs_ip: String,
    pub system_id: u8,

    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub heading: f32,
    pub target_heading: f32,
    pub previous_heading: f32,

    pub ground_speed: f64,
    pub vertical_speed: f64,
    pub airspeed: f64,
    pub wind_vel: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,

    pub dist_traveled: f64,
    pub dist_to_home: f64,
    pub wp_dist: f64,
    pub tot: f64,
    pub toh: f64,

    pub gps_hdop: f64,

    pub battery_voltage: f64,
    pub battery_current: f64,

    pub ch3out: u16,
    pub ch9out: u16,
    pub ch10out: u16,
    pub ch11out: u16,
    pub ch12out: u16,
    pub ch3percent: f64,

    pub airborne: bool,
    pub start_time: EpochMillis,
    pub time_in_air: i64,

    pub flying: bool,
    pub flight_start_time: EpochMillis,
    pub auto_time: i64,

    pub throttle_active: bool,
    pub throttle_start_time: EpochMillis,
    pub total_throttle_time: i64,
    pub flight_status: i32,

    pub home_location: Option<HomeLocation>,
    pub waypoints: Vec<Waypoint>,
    pub waypoints_count: usize,
}

impl DroneState {
    pub fn new(port: u16) -> Self {
        DroneState {
            port,
            gcs_ip: "unknown".to_string(),
            system_id: 0,
            lat: 0.0,
            lon: 0.0,
            alt: 0.0,
            heading: 0.0,
            target_heading: 0.0,
            previous_heading: 0.0,
            ground_speed: 0.0,
            vertical_speed: 0.0,
            airspeed: 0.0,
            wind_vel: 0.0,
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
            dist_traveled: 0.0,
            dist_to_home: 0.0,
            wp_dist: 0.0,
            tot: 0.0,
            toh: 0.0,
            gps_hdop: 0.0,
            battery_voltage: 0.0,
            battery_current: 0.0,
            ch3out: 0,
            ch9out: 0,
            ch10out: 0,
            ch11out: 0,
            ch12out: 0,
            ch3percent: 0.0,
            airborne: false,
            start_time: EpochMillis::new(0),
            time_in_air: 0,
            flying: false,
            flight_start_time: EpochMillis::new(0),
            auto_time: 0,
            throttle_active: false,
            throttle_start_time: EpochMillis::new(0),
            total_throttle_time: 0,
            flight_status: 0,
            home_location: None,
            waypoints: Vec::new(),
            waypoints_count: 0,
        }
    }
}
