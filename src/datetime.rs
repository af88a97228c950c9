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

use std::fmt;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// milliseconds since the Unix epoch. All derived timers in [`crate::DroneState`]
/// are anchored on this so that elapsed times are plain i64 subtraction.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct EpochMillis(i64);

impl EpochMillis {
    pub fn now() -> Self {
        EpochMillis(Utc::now().timestamp_millis())
    }

    pub fn new(millis: i64) -> Self {
        EpochMillis(millis)
    }

    pub fn from_secs(secs: i64) -> Self {
        EpochMillis(secs * 1000)
    }

    pub fn millis(&self) -> i64 {
        self.0
    }

    /// millis elapsed from `earlier` to `self` (negative if `earlier` is in the future)
    pub fn millis_since(&self, earlier: EpochMillis) -> i64 {
        self.0 - earlier.0
    }
}

impl fmt::Display for EpochMillis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match DateTime::<Utc>::from_timestamp_millis(self.0) {
            Some(dt) => write!(f, "{dt}"),
            None => write!(f, "EpochMillis({})", self.0),
        }
    }
}

#[inline]
pub fn local_now() -> DateTime<Local> {
    Local::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_since() {
        let t0 = EpochMillis::from_secs(10);
        let t1 = EpochMillis::new(12_500);
        assert_eq!(t1.millis_since(t0), 2500);
        assert_eq!(t0.millis_since(t1), -2500);
    }

    #[test]
    fn test_ordering() {
        assert!(EpochMillis::new(1) < EpochMillis::new(2));
    }
}
