// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Appending measurements to a time-series sink.
//!
//! [`Publisher`] turns a [`Measurement`] into a [`TimeseriesRecord`] and hands
//! it to a [`Sink`]. Retries and timeouts belong to the sink client; the
//! publisher never retries.

pub mod record;
pub mod stdout;
pub mod timestream;

pub use record::{Dimension, MeasureValueType, TimeUnit, TimeseriesRecord};
pub use stdout::StdoutSink;
pub use timestream::TimestreamSink;

use crate::config::{SinkConfig, SinkKind};
use crate::measurement::Measurement;
use thiserror::Error;

/// Database and table receiving the records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub database: String,
    pub table: String,
}

impl Destination {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }
}

/// A record the sink refused, with the reason it gave.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRecord {
    /// Position in the submitted batch.
    pub index: usize,
    pub record: TimeseriesRecord,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum WriteError {
    /// The call went through but individual records were refused.
    #[error("{} record(s) rejected by sink", .0.len())]
    Rejected(Vec<RejectedRecord>),

    /// The call itself failed (network, throttling, credentials, timeout).
    #[error("transient sink failure: {0}")]
    Transient(String),
}

impl WriteError {
    /// Short label used as the `error_kind` log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rejected(_) => "write.rejected",
            Self::Transient(_) => "write.transient",
        }
    }
}

/// Destination-side storage.
#[allow(async_fn_in_trait)]
pub trait Sink {
    /// Write a batch of records in one call.
    async fn write_records(
        &self,
        destination: &Destination,
        records: &[TimeseriesRecord],
    ) -> Result<(), WriteError>;
}

/// Sink selected by configuration.
pub enum SinkBackend {
    Timestream(TimestreamSink),
    Stdout(StdoutSink),
}

impl SinkBackend {
    /// Build the configured sink. Nothing here touches the network, so a
    /// sink that is down surfaces later as a transient write failure.
    pub async fn from_config(config: &SinkConfig) -> Self {
        match config.kind {
            SinkKind::Timestream => Self::Timestream(TimestreamSink::new(config).await),
            SinkKind::Stdout => Self::Stdout(StdoutSink::stdout()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Timestream(_) => "timestream",
            Self::Stdout(_) => "stdout",
        }
    }
}

impl Sink for SinkBackend {
    async fn write_records(
        &self,
        destination: &Destination,
        records: &[TimeseriesRecord],
    ) -> Result<(), WriteError> {
        match self {
            Self::Timestream(s) => s.write_records(destination, records).await,
            Self::Stdout(s) => s.write_records(destination, records).await,
        }
    }
}

/// Appends one measurement per call.
pub struct Publisher<S> {
    sink: S,
    destination: Destination,
}

impl<S: Sink> Publisher<S> {
    pub fn new(sink: S, destination: Destination) -> Self {
        Self { sink, destination }
    }

    /// Serialize `measurement` and append it as a single record.
    ///
    /// Non-finite values are rejected locally without calling the sink.
    pub async fn append_measurement(&self, measurement: &Measurement) -> Result<(), WriteError> {
        let record = TimeseriesRecord::from_measurement(measurement);
        if !measurement.value.is_finite() {
            return Err(WriteError::Rejected(vec![RejectedRecord {
                index: 0,
                reason: format!("measure value {} is not a finite DOUBLE", record.measure_value),
                record,
            }]));
        }

        self.sink
            .write_records(&self.destination, std::slice::from_ref(&record))
            .await?;
        tracing::debug!(
            database = %self.destination.database,
            table = %self.destination.table,
            value = %record.measure_value,
            "Record appended"
        );
        Ok(())
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}
