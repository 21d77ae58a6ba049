// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RTD temperature logger
//!
//! Periodically reads an RTD temperature from a Siemens S7 controller and
//! appends it to an Amazon Timestream table.
//!
//! This crate provides:
//! - An S7comm client over ISO-on-TCP for reading data block registers
//! - Mapping from samples to Timestream records with dimension tags
//! - A cancellable sampling loop with guaranteed session cleanup
//! - Layered configuration (defaults, TOML file, environment, flags)
//!
//! # Overview
//!
//! ```text
//! S7 controller --> Sampler --> Measurement --> Publisher --> Sink (Timestream | stdout)
//!                       \___________ Driver (interval, stop) ___________/
//! ```

pub mod backoff;
pub mod config;
pub mod driver;
pub mod measurement;
pub mod publisher;
pub mod sampler;
pub mod shutdown;

pub use config::{ConfigError, ConfigOverrides, LoggerConfig};
pub use driver::{Driver, DriverError, DriverSettings, DriverState, DriverStats};
pub use measurement::Measurement;
pub use publisher::{Destination, Publisher, Sink, SinkBackend, WriteError};
pub use sampler::{ConnectError, Controller, ReadError, S7Client, Sampler};
pub use shutdown::StopHandle;
