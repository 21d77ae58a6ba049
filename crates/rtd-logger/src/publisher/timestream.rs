// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Amazon Timestream sink.

use super::{Destination, RejectedRecord, Sink, TimeseriesRecord, WriteError};
use crate::config::SinkConfig;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, ConfigLoader, Region, SdkConfig};
use aws_sdk_timestreamwrite::error::{DisplayErrorContext, SdkError};
use aws_sdk_timestreamwrite::operation::write_records::WriteRecordsError;
use aws_sdk_timestreamwrite::types::{self as ts, MeasureValueType, TimeUnit};
use aws_sdk_timestreamwrite::Client;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Writes records through the Timestream write API.
///
/// Retries and timeouts are configured on the SDK client; the SDK's HTTP
/// client owns connection pooling. Endpoint discovery runs on the first
/// write and is retried on later writes until it succeeds, so an unreachable
/// service only ever shows up as a transient write failure.
pub struct TimestreamSink {
    sdk_config: SdkConfig,
    client: OnceCell<Client>,
}

impl TimestreamSink {
    /// Load region, retry and timeout settings plus the default credential
    /// chain. Nothing is sent to the service yet.
    pub async fn new(config: &SinkConfig) -> Self {
        tracing::info!(
            region = %config.region,
            max_attempts = config.max_attempts,
            "Timestream client configured"
        );
        Self::from_sdk_config(loader(config).load().await)
    }

    pub fn from_sdk_config(sdk_config: SdkConfig) -> Self {
        Self {
            sdk_config,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&Client, WriteError> {
        self.client
            .get_or_try_init(|| async {
                let (client, reload) = Client::new(&self.sdk_config)
                    .with_endpoint_discovery_enabled()
                    .await
                    .map_err(|e| {
                        WriteError::Transient(format!("endpoint discovery failed: {e}"))
                    })?;
                tokio::spawn(reload.reload_task());
                tracing::info!("Timestream endpoint discovered");
                Ok(client)
            })
            .await
    }
}

fn loader(config: &SinkConfig) -> ConfigLoader {
    let timeouts = TimeoutConfig::builder()
        .read_timeout(Duration::from_millis(config.read_timeout_ms))
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .build();

    let loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.region.clone()))
        .retry_config(RetryConfig::standard().with_max_attempts(config.max_attempts))
        .timeout_config(timeouts);
    match &config.endpoint_url {
        Some(url) => loader.endpoint_url(url),
        None => loader,
    }
}

impl Sink for TimestreamSink {
    async fn write_records(
        &self,
        destination: &Destination,
        records: &[TimeseriesRecord],
    ) -> Result<(), WriteError> {
        let sdk_records = records
            .iter()
            .enumerate()
            .map(|(index, r)| {
                to_sdk_record(r).map_err(|reason| {
                    WriteError::Rejected(vec![RejectedRecord {
                        index,
                        record: r.clone(),
                        reason,
                    }])
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.client()
            .await?
            .write_records()
            .database_name(&destination.database)
            .table_name(&destination.table)
            .set_records(Some(sdk_records))
            .send()
            .await
            .map(|_| ())
            .map_err(|err| map_sdk_error(err, records))
    }
}

fn to_sdk_record(record: &TimeseriesRecord) -> Result<ts::Record, String> {
    let dimensions = record
        .dimensions
        .iter()
        .map(|d| {
            ts::Dimension::builder()
                .name(&d.name)
                .value(&d.value)
                .build()
                .map_err(|e| format!("invalid dimension '{}': {e}", d.name))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ts::Record::builder()
        .set_dimensions(Some(dimensions))
        .measure_name(&record.measure_name)
        .measure_value(&record.measure_value)
        .measure_value_type(MeasureValueType::Double)
        .time(&record.time)
        .time_unit(TimeUnit::Milliseconds)
        .build())
}

fn map_sdk_error<R>(err: SdkError<WriteRecordsError, R>, records: &[TimeseriesRecord]) -> WriteError
where
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let rendered = DisplayErrorContext(&err).to_string();
    match err.into_service_error() {
        WriteRecordsError::RejectedRecordsException(e) => {
            let rejected = resolve_rejected(
                e.rejected_records()
                    .iter()
                    .map(|r| (r.record_index(), r.reason())),
                records,
            );
            if rejected.is_empty() {
                WriteError::Transient(rendered)
            } else {
                WriteError::Rejected(rejected)
            }
        }
        _ => WriteError::Transient(rendered),
    }
}

/// Pair each `(record_index, reason)` reported by the service with the
/// submitted record. Indices outside the batch are dropped.
fn resolve_rejected<'a>(
    reported: impl IntoIterator<Item = (i32, Option<&'a str>)>,
    records: &[TimeseriesRecord],
) -> Vec<RejectedRecord> {
    reported
        .into_iter()
        .filter_map(|(index, reason)| {
            let index = usize::try_from(index).ok()?;
            let record = records.get(index)?.clone();
            Some(RejectedRecord {
                index,
                record,
                reason: reason.unwrap_or("no reason given").to_string(),
            })
        })
        .collect()
}
