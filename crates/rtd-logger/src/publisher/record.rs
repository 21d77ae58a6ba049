// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Time-series record shape.
//!
//! Mirrors the Timestream `Record` fields so a rejected record can be logged
//! as the JSON the sink would have received.

use crate::measurement::Measurement;
use serde::Serialize;

/// Measure name for every record this logger writes.
pub const MEASURE_NAME: &str = "temperature";

/// Dimension name for the sensor type tag.
pub const DIM_SENSOR_TYPE: &str = "sensor_type";

/// Dimension name for the location tag.
pub const DIM_LOCATION: &str = "location";

/// A named tag on a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

impl Dimension {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeasureValueType {
    Double,
}

impl MeasureValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Double => "DOUBLE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeUnit {
    Milliseconds,
}

impl TimeUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Milliseconds => "MILLISECONDS",
        }
    }
}

/// One record as submitted to the sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TimeseriesRecord {
    pub dimensions: Vec<Dimension>,
    pub measure_name: String,
    pub measure_value: String,
    pub measure_value_type: MeasureValueType,
    pub time: String,
    pub time_unit: TimeUnit,
}

impl TimeseriesRecord {
    /// Build the record for a measurement.
    pub fn from_measurement(m: &Measurement) -> Self {
        Self {
            dimensions: vec![
                Dimension::new(DIM_SENSOR_TYPE, &m.sensor_type),
                Dimension::new(DIM_LOCATION, &m.location),
            ],
            measure_name: MEASURE_NAME.to_string(),
            measure_value: format_measure_value(m.value),
            measure_value_type: MeasureValueType::Double,
            time: m.timestamp_ms.to_string(),
            time_unit: TimeUnit::Milliseconds,
        }
    }

    /// JSON rendering for logs.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("<unserializable: {e}>"))
    }
}

/// Shortest decimal form of `value` that round-trips, always with a
/// fractional part (`21.0`, not `21`).
pub fn format_measure_value(value: f32) -> String {
    format!("{value:?}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorConfig;

    #[test]
    fn test_record_for_23_5() {
        let m = Measurement::at(23.5, 1_700_000_000_123, &SensorConfig::default());
        let r = TimeseriesRecord::from_measurement(&m);

        assert_eq!(r.measure_value, "23.5");
        assert_eq!(r.measure_value_type.as_str(), "DOUBLE");
        assert_eq!(r.measure_name, "temperature");
        assert_eq!(r.time, "1700000000123");
        assert_eq!(r.time_unit.as_str(), "MILLISECONDS");
        assert_eq!(
            r.dimensions,
            vec![
                Dimension::new("sensor_type", "RTD_TP100"),
                Dimension::new("location", "PLC_1"),
            ]
        );
    }

    #[test]
    fn test_format_measure_value() {
        assert_eq!(format_measure_value(21.0), "21.0");
        assert_eq!(format_measure_value(22.3), "22.3");
        assert_eq!(format_measure_value(-40.25), "-40.25");
        assert_eq!(format_measure_value(0.001), "0.001");
    }

    #[test]
    fn test_json_uses_sink_field_names() {
        let m = Measurement::at(21.0, 5, &SensorConfig::default());
        let json = TimeseriesRecord::from_measurement(&m).to_json();

        assert!(json.contains(r#""MeasureName":"temperature""#));
        assert!(json.contains(r#""MeasureValueType":"DOUBLE""#));
        assert!(json.contains(r#""TimeUnit":"MILLISECONDS""#));
        assert!(json.contains(r#"{"Name":"location","Value":"PLC_1"}"#));
    }
}
