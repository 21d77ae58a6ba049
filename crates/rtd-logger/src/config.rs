// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Logger configuration.
//!
//! Values are layered: built-in defaults, an optional TOML file, then
//! [`ConfigOverrides`] collected from environment variables and flags.
//! The merged result is validated once and never changes afterwards.

use crate::publisher::Destination;
use crate::sampler::s7::MAX_BYTE_OFFSET;
use crate::sampler::{ControllerEndpoint, MemoryArea};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Highest rack number addressable through a TSAP.
const MAX_RACK: u16 = 7;

/// Highest slot number addressable through a TSAP.
const MAX_SLOT: u16 = 31;

/// Longest delay the sink client's standard retry waits between attempts.
const SINK_MAX_RETRY_BACKOFF_MS: u64 = 20_000;

/// Slack added on top of the sink's retry budget for the derived timeout.
const PUBLISH_TIMEOUT_MARGIN_MS: u64 = 5_000;

/// Top-level logger configuration.
///
/// Scalar fields come before the tables so the struct serializes to valid TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggerConfig {
    /// Seconds between two samples.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Upper bound for a single append call (milliseconds).
    ///
    /// When unset it is derived from the sink's retry budget, see
    /// [`SinkConfig::call_budget`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_timeout_ms: Option<u64>,

    /// Log filter directive (e.g. `info`, `rtd_logger=debug`).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Controller connection settings.
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Time-series sink settings.
    #[serde(default)]
    pub sink: SinkConfig,

    /// Dimension tags attached to every record.
    #[serde(default)]
    pub sensor: SensorConfig,
}

fn default_interval_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            publish_timeout_ms: None,
            log_level: default_log_level(),
            controller: ControllerConfig::default(),
            sink: SinkConfig::default(),
            sensor: SensorConfig::default(),
        }
    }
}

/// S7 controller addressing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// IPv4 address or hostname.
    #[serde(default = "default_address")]
    pub address: String,

    /// ISO-on-TCP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Rack number (0-7).
    #[serde(default)]
    pub rack: u16,

    /// Slot number (0-31).
    #[serde(default = "default_slot")]
    pub slot: u16,

    /// Data block holding the temperature.
    #[serde(default = "default_db_number")]
    pub db_number: u16,

    /// Byte offset of the REAL inside the data block.
    #[serde(default)]
    pub offset: u32,

    /// Timeout for every network exchange (milliseconds).
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,

    /// Attempts for the initial connect before giving up.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// First delay between connect attempts (milliseconds).
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Cap for the connect backoff (milliseconds).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_address() -> String {
    "192.168.0.1".to_string()
}

fn default_port() -> u16 {
    102
}

fn default_slot() -> u16 {
    1
}

fn default_db_number() -> u16 {
    1
}

fn default_io_timeout_ms() -> u64 {
    5_000
}

fn default_connect_attempts() -> u32 {
    1
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            rack: 0,
            slot: default_slot(),
            db_number: default_db_number(),
            offset: 0,
            io_timeout_ms: default_io_timeout_ms(),
            connect_attempts: default_connect_attempts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

/// Which sink implementation receives the records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Amazon Timestream (`WriteRecords`).
    #[default]
    Timestream,
    /// JSON lines on stdout, for bench setups without cloud credentials.
    Stdout,
}

/// Time-series sink settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub kind: SinkKind,

    /// Cloud region of the sink.
    #[serde(default = "default_region")]
    pub region: String,

    /// Database name.
    #[serde(default = "default_database")]
    pub database: String,

    /// Table name.
    #[serde(default = "default_table")]
    pub table: String,

    /// Attempts made by the client for one call, first try included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Socket read timeout (milliseconds).
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Connect timeout (milliseconds).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Service endpoint override (VPC endpoint or local stand-in).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_database() -> String {
    "TestingDatabase".to_string()
}

fn default_table() -> String {
    "TestingTable".to_string()
}

fn default_max_attempts() -> u32 {
    10
}

fn default_read_timeout_ms() -> u64 {
    20_000
}

fn default_connect_timeout_ms() -> u64 {
    3_100
}

impl SinkConfig {
    /// Worst-case duration of one call: every attempt hitting both timeouts,
    /// plus the longest backoff between attempts.
    pub fn call_budget(&self) -> Duration {
        let attempts = u64::from(self.max_attempts.max(1));
        let per_attempt = self.connect_timeout_ms.saturating_add(self.read_timeout_ms);
        let ms = attempts
            .saturating_mul(per_attempt)
            .saturating_add((attempts - 1).saturating_mul(SINK_MAX_RETRY_BACKOFF_MS));
        Duration::from_millis(ms)
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::default(),
            region: default_region(),
            database: default_database(),
            table: default_table(),
            max_attempts: default_max_attempts(),
            read_timeout_ms: default_read_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            endpoint_url: None,
        }
    }
}

/// Dimension tags describing the sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorConfig {
    #[serde(default = "default_sensor_type")]
    pub sensor_type: String,

    #[serde(default = "default_location")]
    pub location: String,
}

fn default_sensor_type() -> String {
    "RTD_TP100".to_string()
}

fn default_location() -> String {
    "PLC_1".to_string()
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            sensor_type: default_sensor_type(),
            location: default_location(),
        }
    }
}

/// Values supplied on the command line or through the environment.
///
/// `None` leaves the file/default value untouched.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub rack: Option<u16>,
    pub slot: Option<u16>,
    pub db_number: Option<u16>,
    pub offset: Option<u32>,
    pub connect_attempts: Option<u32>,
    pub sink_kind: Option<SinkKind>,
    pub region: Option<String>,
    pub database: Option<String>,
    pub table: Option<String>,
    pub sensor_type: Option<String>,
    pub location: Option<String>,
    pub interval_secs: Option<u64>,
    pub log_level: Option<String>,
}

impl LoggerConfig {
    /// Parse configuration from a TOML string.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Load configuration from a TOML file and validate it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the effective configuration: file (if any), then overrides.
    pub fn load(path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_toml(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides on top of the current values.
    pub fn apply(&mut self, overrides: ConfigOverrides) {
        let ConfigOverrides {
            address,
            port,
            rack,
            slot,
            db_number,
            offset,
            connect_attempts,
            sink_kind,
            region,
            database,
            table,
            sensor_type,
            location,
            interval_secs,
            log_level,
        } = overrides;

        let controller = &mut self.controller;
        if let Some(v) = address {
            controller.address = v;
        }
        if let Some(v) = port {
            controller.port = v;
        }
        if let Some(v) = rack {
            controller.rack = v;
        }
        if let Some(v) = slot {
            controller.slot = v;
        }
        if let Some(v) = db_number {
            controller.db_number = v;
        }
        if let Some(v) = offset {
            controller.offset = v;
        }
        if let Some(v) = connect_attempts {
            controller.connect_attempts = v;
        }

        let sink = &mut self.sink;
        if let Some(v) = sink_kind {
            sink.kind = v;
        }
        if let Some(v) = region {
            sink.region = v;
        }
        if let Some(v) = database {
            sink.database = v;
        }
        if let Some(v) = table {
            sink.table = v;
        }

        if let Some(v) = sensor_type {
            self.sensor.sensor_type = v;
        }
        if let Some(v) = location {
            self.sensor.location = v;
        }
        if let Some(v) = interval_secs {
            self.interval_secs = v;
        }
        if let Some(v) = log_level {
            self.log_level = v;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "interval_secs must be greater than zero".into(),
            ));
        }

        let c = &self.controller;
        require_non_empty("controller.address", &c.address)?;
        if c.rack > MAX_RACK {
            return Err(ConfigError::Invalid(format!(
                "controller.rack must be between 0 and {} (got {})",
                MAX_RACK, c.rack
            )));
        }
        if c.slot > MAX_SLOT {
            return Err(ConfigError::Invalid(format!(
                "controller.slot must be between 0 and {} (got {})",
                MAX_SLOT, c.slot
            )));
        }
        if c.offset > MAX_BYTE_OFFSET {
            return Err(ConfigError::Invalid(format!(
                "controller.offset must be at most {:#X} (got {:#X})",
                MAX_BYTE_OFFSET, c.offset
            )));
        }
        if c.db_number == 0 {
            return Err(ConfigError::Invalid(
                "controller.db_number must be at least 1".into(),
            ));
        }
        if c.io_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "controller.io_timeout_ms must be greater than zero".into(),
            ));
        }
        if c.connect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "controller.connect_attempts must be at least 1".into(),
            ));
        }
        if c.backoff_initial_ms == 0 || c.backoff_max_ms < c.backoff_initial_ms {
            return Err(ConfigError::Invalid(format!(
                "controller backoff must satisfy 0 < initial ({}) <= max ({})",
                c.backoff_initial_ms, c.backoff_max_ms
            )));
        }

        let s = &self.sink;
        require_non_empty("sink.region", &s.region)?;
        require_non_empty("sink.database", &s.database)?;
        require_non_empty("sink.table", &s.table)?;
        if s.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "sink.max_attempts must be at least 1".into(),
            ));
        }
        if s.read_timeout_ms == 0 || s.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sink timeouts must be greater than zero".into(),
            ));
        }

        if let Some(timeout_ms) = self.publish_timeout_ms {
            let budget = s.call_budget();
            if u128::from(timeout_ms) < budget.as_millis() {
                return Err(ConfigError::Invalid(format!(
                    "publish_timeout_ms ({}) is shorter than the sink retry budget ({} ms)",
                    timeout_ms,
                    budget.as_millis()
                )));
            }
        }

        require_non_empty("sensor.sensor_type", &self.sensor.sensor_type)?;
        require_non_empty("sensor.location", &self.sensor.location)?;

        Ok(())
    }

    /// Polling interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Upper bound for one append call.
    pub fn publish_timeout(&self) -> Duration {
        match self.publish_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.sink.call_budget() + Duration::from_millis(PUBLISH_TIMEOUT_MARGIN_MS),
        }
    }

    /// Controller endpoint derived from the controller section.
    pub fn endpoint(&self) -> ControllerEndpoint {
        let c = &self.controller;
        ControllerEndpoint {
            address: c.address.clone(),
            port: c.port,
            rack: c.rack,
            slot: c.slot,
            io_timeout: Duration::from_millis(c.io_timeout_ms),
        }
    }

    /// Memory area holding the temperature value.
    pub fn area(&self) -> MemoryArea {
        MemoryArea::DataBlock(self.controller.db_number)
    }

    /// Destination table in the sink.
    pub fn destination(&self) -> Destination {
        Destination::new(&self.sink.database, &self.sink.table)
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{} must not be empty", field)));
    }
    Ok(())
}
