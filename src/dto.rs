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

//! wire representation of drone records: camelCase JSON, stamped with the local
//! time at mapping

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::datetime::local_now;
use crate::{DroneState, HomeLocation, Waypoint};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WaypointDto {
    pub seq: u16,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HomeLocationDto {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DroneDto {
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
    pub start_time: i64,
    pub time_in_air: i64,
    pub flying: bool,
    pub flight_start_time: i64,
    pub auto_time: i64,
    pub throttle_active: bool,
    pub throttle_start_time: i64,
    pub total_throttle_time: i64,
    pub flight_status: i32,

    pub home_location: HomeLocationDto,
    pub waypoints: Vec<WaypointDto>,
    pub waypoints_count: usize,

    pub timestamp: NaiveDateTime,
}

impl From<&DroneState> for DroneDto {
    fn from(state: &DroneState) -> Self {
        DroneDto {
            port: state.port,
            gcs_ip: state.gcs_ip.clone(),
            system_id: state.system_id,
            lat: state.lat,
            lon: state.lon,
            alt: state.alt,
            heading: state.heading,
            target_heading: state.target_heading,
            previous_heading: state.previous_heading,
            ground_speed: state.ground_speed,
            vertical_speed: state.vertical_speed,
            airspeed: state.airspeed,
            wind_vel: state.wind_vel,
            roll: state.roll,
            pitch: state.pitch,
            yaw: state.yaw,
            dist_traveled: state.dist_traveled,
            dist_to_home: state.dist_to_home,
            wp_dist: state.wp_dist,
            tot: state.tot,
            toh: state.toh,
            gps_hdop: state.gps_hdop,
            battery_voltage: state.battery_voltage,
            battery_current: state.battery_current,
            ch3out: state.ch3out,
            ch9out: state.ch9out,
            ch10out: state.ch10out,
            ch11out: state.ch11out,
            ch12out: state.ch12out,
            ch3percent: state.ch3percent,
            airborne: state.airborne,
            start_time: state.start_time.millis(),
            time_in_air: state.time_in_air,
            flying: state.flying,
            flight_start_time: state.flight_start_time.millis(),
            auto_time: state.auto_time,
            throttle_active: state.throttle_active,
            throttle_start_time: state.throttle_start_time.millis(),
            total_throttle_time: state.total_throttle_time,
            flight_status: state.flight_status,
            home_location: state
                .home_location
                .as_ref()
                .map(|h| HomeLocationDto { lat: h.lat, lon: h.lon })
                .unwrap_or(HomeLocationDto { lat: 0.0, lon: 0.0 }),
            waypoints: state.waypoints.iter().map(WaypointDto::from).collect(),
            waypoints_count: state.waypoints_count,
            timestamp: local_now().naive_local(),
        }
    }
}

impl From<&Waypoint> for WaypointDto {
    fn from(wp: &Waypoint) -> Self {
        WaypointDto { seq: wp.seq, lat: wp.lat, lon: wp.lon, alt: wp.alt }
    }
}

impl From<&HomeLocation> for HomeLocationDto {
    fn from(home: &HomeLocation) -> Self {
        HomeLocationDto { lat: home.lat, lon: home.lon }
    }
}

/// the frame payload sent to websocket subscribers
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DronesPayload {
    pub drones: Vec<DroneDto>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camel_case_keys() {
        let mut state = DroneState::new(14551);
        state.gcs_ip = "10.0.0.5".to_string();
        state.dist_traveled = 12.5;
        state.home_location = Some(HomeLocation { lat: 47.5, lon: 8.5 });
        state.waypoints.push(Waypoint { seq: 0, lat: 47.5, lon: 8.5, alt: 100.0 });
        state.waypoints_count = 1;

        let json = serde_json::to_value(DroneDto::from(&state)).unwrap();
        assert_eq!(json["port"], 14551);
        assert_eq!(json["gcsIp"], "10.0.0.5");
        assert_eq!(json["distTraveled"], 12.5);
        assert_eq!(json["homeLocation"]["lat"], 47.5);
        assert_eq!(json["waypointsCount"], 1);
        assert_eq!(json["waypoints"][0]["seq"], 0);
        assert!(json["timestamp"].is_string());
        assert!(json.get("gcs_ip").is_none());
    }

    #[test]
    fn test_missing_home_maps_to_origin() {
        let state = DroneState::new(1);
        let dto = DroneDto::from(&state);
        assert_eq!(dto.home_location, HomeLocationDto { lat: 0.0, lon: 0.0 });
    }

    #[test]
    fn test_payload_shape() {
        let state = DroneState::new(2);
        let payload = DronesPayload { drones: vec![DroneDto::from(&state)] };
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json["drones"].is_array());
        assert_eq!(json["drones"].as_array().unwrap().len(), 1);
    }
}
