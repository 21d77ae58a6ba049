// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Controller sampling.
//!
//! [`Controller`] is the raw "read N bytes from area A at offset O"
//! capability; [`Sampler`] owns one controller session and turns those
//! bytes into [`Measurement`]s.

pub mod s7;

pub use s7::S7Client;

use crate::config::{LoggerConfig, SensorConfig};
use crate::measurement::Measurement;
use std::time::Duration;
use thiserror::Error;

/// Size of an S7 `REAL` in bytes.
pub const VALUE_LEN: usize = 4;

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerEndpoint {
    pub address: String,
    pub port: u16,
    pub rack: u16,
    pub slot: u16,
    /// Bound for every network exchange, connect included.
    pub io_timeout: Duration,
}

/// Memory area addressed by a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryArea {
    /// Data block with the given number.
    DataBlock(u16),
}

/// Failure to establish a controller session.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("controller unreachable: {0}")]
    Unreachable(#[source] std::io::Error),

    #[error("connection rejected by controller: {0}")]
    Rejected(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
}

impl ConnectError {
    /// Short label used as the `error_kind` log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unreachable(_) => "connect.unreachable",
            Self::Rejected(_) => "connect.rejected",
            Self::Handshake(_) => "connect.handshake",
            Self::Timeout(_) => "connect.timeout",
        }
    }
}

/// Failure to read the current value.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("controller session is not connected")]
    NotConnected,

    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("transport fault: {0}")]
    Transport(#[source] std::io::Error),

    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    #[error("controller refused the read (return code 0x{code:02x})")]
    Device { code: u8 },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ReadError {
    /// Short label used as the `error_kind` log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConnected => "read.not_connected",
            Self::ShortRead { .. } => "read.short",
            Self::Transport(_) => "read.transport",
            Self::Timeout(_) => "read.timeout",
            Self::Device { .. } => "read.device",
            Self::Protocol(_) => "read.protocol",
        }
    }
}

/// Raw register access to an industrial controller.
#[allow(async_fn_in_trait)]
pub trait Controller {
    /// Open a session. Any previous session is dropped first.
    async fn connect(&mut self, endpoint: &ControllerEndpoint) -> Result<(), ConnectError>;

    /// Read `len` bytes from `area` starting at byte `offset`.
    ///
    /// May return fewer bytes than requested if the device truncates the
    /// reply; callers decide whether that is an error.
    async fn read_area(
        &mut self,
        area: MemoryArea,
        offset: u32,
        len: usize,
    ) -> Result<Vec<u8>, ReadError>;

    /// Whether a session is currently open.
    fn is_connected(&self) -> bool;

    /// Close the session. Idempotent.
    fn disconnect(&mut self);
}

/// Decode a big-endian IEEE-754 single from the first four bytes.
pub fn decode_real(bytes: &[u8]) -> Result<f32, ReadError> {
    let raw: [u8; VALUE_LEN] = bytes
        .get(..VALUE_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or(ReadError::ShortRead {
            expected: VALUE_LEN,
            actual: bytes.len(),
        })?;
    Ok(f32::from_be_bytes(raw))
}

/// Owns the controller session and produces measurements.
pub struct Sampler<C> {
    controller: C,
    endpoint: ControllerEndpoint,
    area: MemoryArea,
    offset: u32,
    sensor: SensorConfig,
}

impl<C: Controller> Sampler<C> {
    pub fn new(
        controller: C,
        endpoint: ControllerEndpoint,
        area: MemoryArea,
        offset: u32,
        sensor: SensorConfig,
    ) -> Self {
        Self {
            controller,
            endpoint,
            area,
            offset,
            sensor,
        }
    }

    /// Create a sampler for the configured endpoint and register.
    pub fn from_config(controller: C, config: &LoggerConfig) -> Self {
        Self::new(
            controller,
            config.endpoint(),
            config.area(),
            config.controller.offset,
            config.sensor.clone(),
        )
    }

    /// Establish the controller session.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        self.controller.connect(&self.endpoint).await?;
        tracing::info!(
            address = %self.endpoint.address,
            rack = self.endpoint.rack,
            slot = self.endpoint.slot,
            "Connected to controller"
        );
        Ok(())
    }

    /// Read and decode the current value.
    ///
    /// Never falls back to an earlier reading: any failure is returned.
    pub async fn read_value(&mut self) -> Result<Measurement, ReadError> {
        if !self.controller.is_connected() {
            return Err(ReadError::NotConnected);
        }
        let bytes = self
            .controller
            .read_area(self.area, self.offset, VALUE_LEN)
            .await?;
        let value = decode_real(&bytes)?;
        Ok(Measurement::capture(value, &self.sensor))
    }

    pub fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }

    /// Close the session if one is open.
    pub fn disconnect(&mut self) {
        if self.controller.is_connected() {
            self.controller.disconnect();
            tracing::info!(address = %self.endpoint.address, "Disconnected from controller");
        }
    }

    pub fn endpoint(&self) -> &ControllerEndpoint {
        &self.endpoint
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }
}
