// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! A single temperature sample.

use crate::config::SensorConfig;
use chrono::Utc;
use serde::Serialize;

/// One decoded reading, stamped when the read completed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    /// Decoded REAL value.
    pub value: f32,
    /// Capture time, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// `sensor_type` dimension.
    pub sensor_type: String,
    /// `location` dimension.
    pub location: String,
}

impl Measurement {
    /// Stamp a freshly read value with the current time.
    pub fn capture(value: f32, sensor: &SensorConfig) -> Self {
        Self::at(value, Utc::now().timestamp_millis(), sensor)
    }

    /// Build a measurement with an explicit timestamp.
    pub fn at(value: f32, timestamp_ms: i64, sensor: &SensorConfig) -> Self {
        Self {
            value,
            timestamp_ms,
            sensor_type: sensor.sensor_type.clone(),
            location: sensor.location.clone(),
        }
    }
}
