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

//! applies decoded MAVLink messages to per-port [`DroneState`] records.
//!
//! A record is created on first touch for any message type, so mission items
//! arriving before the position stream still land in the right place. Only the
//! owning port's listener task mutates a record; everything else reads cloned
//! snapshots, which keeps the event-driven counters race-free without locks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use mavlink::ardupilotmega::{
    ATTITUDE_DATA, GLOBAL_POSITION_INT_DATA, MISSION_COUNT_DATA, MISSION_ITEM_INT_DATA, MavMessage,
    SERVO_OUTPUT_RAW_DATA, SYS_STATUS_DATA, VFR_HUD_DATA,
};
use mavlink::MavHeader;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::datetime::EpochMillis;
use crate::geo;
use crate::{DroneState, HomeLocation, Waypoint, AIRBORNE_ALT_THRESHOLD, THROTTLE_THRESHOLD};

const EVICTOR_INTERVAL: Duration = Duration::from_secs(60);

struct DroneEntry {
    state: DroneState,
    last_activity: EpochMillis,
    last_position: Option<(f64, f64)>,
}

impl DroneEntry {
    fn new(port: u16, now: EpochMillis) -> Self {
        DroneEntry {
            state: DroneState::new(port),
            last_activity: now,
            last_position: None,
        }
    }
}

pub struct StateEngine {
    cache: DashMap<u16, DroneEntry>,
    dirty: DashSet<u16>,
    stale_threshold_ms: i64,
}

impl StateEngine {
    pub fn new(stale_threshold_ms: u64) -> Self {
        StateEngine {
            cache: DashMap::new(),
            dirty: DashSet::new(),
            stale_threshold_ms: stale_threshold_ms as i64,
        }
    }

    /// apply a decoded message to the port's state record
    pub fn apply(&self, port: u16, sender: SocketAddr, header: &MavHeader, msg: &MavMessage) {
        self.apply_at(port, sender, header, msg, EpochMillis::now())
    }

    /// like [`StateEngine::apply`] with an explicit timestamp (used by replay and tests)
    pub fn apply_at(&self, port: u16, sender: SocketAddr, header: &MavHeader, msg: &MavMessage, now: EpochMillis) {
        let mut entry = self.cache.entry(port).or_insert_with(|| DroneEntry::new(port, now));
        let entry = entry.value_mut();

        entry.state.gcs_ip = sender.ip().to_string();
        entry.state.system_id = header.system_id;
        entry.last_activity = now;

        match msg {
            MavMessage::GLOBAL_POSITION_INT(raw) => Self::apply_global_position(entry, raw, now),
            MavMessage::SYS_STATUS(raw) => Self::apply_sys_status(&mut entry.state, raw),
            MavMessage::VFR_HUD(raw) => Self::apply_vfr_hud(&mut entry.state, raw),
            MavMessage::WIND(raw) => entry.state.wind_vel = raw.speed as f64,
            MavMessage::GPS_RAW_INT(raw) => entry.state.gps_hdop = raw.eph as f64,
            MavMessage::ATTITUDE(raw) => Self::apply_attitude(&mut entry.state, raw),
            MavMessage::NAV_CONTROLLER_OUTPUT(raw) => entry.state.wp_dist = raw.wp_dist as f64,
            MavMessage::SERVO_OUTPUT_RAW(raw) => Self::apply_servo_outputs(&mut entry.state, raw, now),
            MavMessage::MISSION_COUNT(raw) => Self::apply_mission_count(&mut entry.state, raw),
            MavMessage::MISSION_ITEM_INT(raw) => Self::apply_mission_item(&mut entry.state, raw),
            _ => {} // unhandled message types still refresh identity and activity
        }

        self.dirty.insert(port);
    }

    fn apply_global_position(entry: &mut DroneEntry, raw: &GLOBAL_POSITION_INT_DATA, now: EpochMillis) {
        let lat = raw.lat as f64 / 1e7;
        let lon = raw.lon as f64 / 1e7;
        let alt = raw.relative_alt as f64 / 1000.0;

        let state = &mut entry.state;
        state.lat = lat;
        state.lon = lon;
        state.alt = alt;
        state.heading = raw.hdg as f32 / 100.0;
        state.ground_speed = raw.vx as f64 / 100.0;
        state.vertical_speed = raw.vz as f64 / 100.0;

        if let Some((last_lat, last_lon)) = entry.last_position {
            state.dist_traveled += geo::haversine_km(last_lat, last_lon, lat, lon) * 1000.0;
        }
        entry.last_position = Some((lat, lon));

        if let Some(home) = &state.home_location {
            state.dist_to_home = geo::haversine_km(lat, lon, home.lat, home.lon) * 1000.0;
        }

        Self::update_time_in_air(state, alt, now);
    }

    fn update_time_in_air(state: &mut DroneState, alt: f64, now: EpochMillis) {
        if alt > AIRBORNE_ALT_THRESHOLD {
            if !state.airborne {
                state.airborne = true;
                state.start_time = now;
            }
            state.time_in_air = now.millis_since(state.start_time) / 1000;
        } else if state.airborne {
            state.time_in_air = now.millis_since(state.start_time) / 1000;
            state.airborne = false;
        }
    }

    fn apply_sys_status(state: &mut DroneState, raw: &SYS_STATUS_DATA) {
        state.battery_voltage = raw.voltage_battery as f64 / 1000.0;
        state.battery_current = raw.current_battery as f64 / 100.0;
    }

    fn apply_vfr_hud(state: &mut DroneState, raw: &VFR_HUD_DATA) {
        state.airspeed = raw.airspeed as f64;
        state.ground_speed = raw.groundspeed as f64;
        state.vertical_speed = raw.climb as f64;
        state.heading = raw.heading as f32;

        let gs = state.ground_speed;
        state.tot = if gs > 0.0 { round2(state.wp_dist / gs) } else { 0.0 };
        state.toh = if gs > 0.0 { round2(state.dist_to_home / gs) } else { 0.0 };
    }

    fn apply_attitude(state: &mut DroneState, raw: &ATTITUDE_DATA) {
        state.roll = round2((raw.roll as f64).to_degrees());
        state.pitch = round2((raw.pitch as f64).to_degrees());
        state.yaw = round2((raw.yaw as f64).to_degrees());
    }

    fn apply_servo_outputs(state: &mut DroneState, raw: &SERVO_OUTPUT_RAW_DATA, now: EpochMillis) {
        state.ch3out = raw.servo3_raw;
        state.ch3percent = round2(((raw.servo3_raw as f64 - 1000.0) / 1000.0) * 100.0);
        state.ch9out = raw.servo9_raw;
        state.ch10out = raw.servo10_raw;
        state.ch11out = raw.servo11_raw;
        state.ch12out = raw.servo12_raw;

        state.flight_status = if state.ch3out > THROTTLE_THRESHOLD { 1 } else { 0 };

        Self::update_auto_time(state, now);
        Self::update_throttle_time(state, now);
    }

    fn update_auto_time(state: &mut DroneState, now: EpochMillis) {
        if state.ch3out > THROTTLE_THRESHOLD {
            if !state.flying {
                state.flying = true;
                state.flight_start_time = now;
            }
            state.auto_time = now.millis_since(state.flight_start_time) / 1000;
        } else if state.flying {
            state.auto_time = now.millis_since(state.flight_start_time) / 1000;
            state.flying = false;
        }
    }

    /// throttle-in-air accumulation: channels 9..12 up while channel 3 is below
    /// the throttle threshold. While active, each sample adds the elapsed slice
    /// and advances the anchor.
    fn update_throttle_time(state: &mut DroneState, now: EpochMillis) {
        let active = state.ch9out > 1000
            && state.ch10out > 1000
            && state.ch11out > 1000
            && state.ch12out > 1000
            && state.ch3out < THROTTLE_THRESHOLD;

        if active && !state.throttle_active {
            state.throttle_active = true;
            state.throttle_start_time = now;
        } else if !active && state.throttle_active {
            state.total_throttle_time += now.millis_since(state.throttle_start_time);
            state.throttle_active = false;
        } else if active {
            state.total_throttle_time += now.millis_since(state.throttle_start_time);
            state.throttle_start_time = now;
        }
    }

    fn apply_mission_count(state: &mut DroneState, raw: &MISSION_COUNT_DATA) {
        info!("MISSION_COUNT on port {}: {}", state.port, raw.count);
        state.waypoints.clear();
        state.waypoints_count = 0;
    }

    fn apply_mission_item(state: &mut DroneState, raw: &MISSION_ITEM_INT_DATA) {
        let lat = raw.x as f64 / 1e7;
        let lon = raw.y as f64 / 1e7;
        let alt = raw.z as f64;

        if (lat == 0.0 && lon == 0.0) || alt == 0.0 {
            return;
        }

        state.waypoints.push(Waypoint { seq: raw.seq, lat, lon, alt });
        state.waypoints_count = state.waypoints.len();

        if raw.seq == 0 {
            state.home_location = Some(HomeLocation { lat, lon });
        }
    }

    /// cloned state of every record with activity within the stale threshold
    pub fn active_snapshot(&self) -> Vec<DroneState> {
        self.active_snapshot_at(EpochMillis::now())
    }

    pub fn active_snapshot_at(&self, now: EpochMillis) -> Vec<DroneState> {
        self.cache
            .iter()
            .filter(|e| now.millis_since(e.last_activity) <= self.stale_threshold_ms)
            .map(|e| e.state.clone())
            .collect()
    }

    /// cloned state of the given ports, skipping evicted ones
    pub fn snapshot_of(&self, ports: &[u16]) -> Vec<DroneState> {
        ports
            .iter()
            .filter_map(|p| self.cache.get(p).map(|e| e.state.clone()))
            .collect()
    }

    pub fn get(&self, port: u16) -> Option<DroneState> {
        self.cache.get(&port).map(|e| e.state.clone())
    }

    pub fn contains(&self, port: u16) -> bool {
        self.cache.contains_key(&port)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// take the set of ports updated since the last drain
    pub fn drain_dirty(&self) -> Vec<u16> {
        let ports: Vec<u16> = self.dirty.iter().map(|p| *p).collect();
        for port in &ports {
            self.dirty.remove(port);
        }
        ports
    }

    /// re-mark ports as dirty (failed persist batches come back through here)
    pub fn mark_dirty(&self, ports: &[u16]) {
        for port in ports {
            self.dirty.insert(*port);
        }
    }

    /// drop records with no activity for twice the stale threshold
    pub fn evict_stale(&self) -> usize {
        self.evict_stale_at(EpochMillis::now())
    }

    pub fn evict_stale_at(&self, now: EpochMillis) -> usize {
        let evicted: Vec<u16> = self
            .cache
            .iter()
            .filter(|e| now.millis_since(e.last_activity) > 2 * self.stale_threshold_ms)
            .map(|e| *e.key())
            .collect();

        for port in &evicted {
            self.cache.remove(port);
            self.dirty.remove(port);
            warn!("evicted stale drone state for port {port}");
        }
        evicted.len()
    }

    pub fn spawn_evictor(engine: Arc<StateEngine>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(EVICTOR_INTERVAL);
            tick.tick().await; // immediate first tick
            loop {
                tick.tick().await;
                engine.evict_stale();
            }
        })
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
