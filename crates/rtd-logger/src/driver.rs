// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sampling loop.
//!
//! ```text
//! Disconnected -> Connected -> Running -> Terminating -> Stopped
//! ```
//!
//! Each iteration reads one value and, if the read succeeded, appends it.
//! Failures are logged and counted; only the initial connect is fatal.
//! The controller session is closed exactly once on every exit path,
//! unwinding included.

use crate::backoff::Backoff;
use crate::config::LoggerConfig;
use crate::publisher::{Publisher, Sink, WriteError};
use crate::sampler::{ConnectError, Controller, Sampler};
use crate::shutdown::StopHandle;
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Disconnected,
    Connected,
    Running,
    Terminating,
    Stopped,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("controller connect failed after {attempts} attempt(s): {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: ConnectError,
    },
}

impl DriverError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { source, .. } => source.kind(),
        }
    }
}

/// Loop counters, reported at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub iterations: u64,
    pub samples_read: u64,
    pub read_failures: u64,
    pub records_appended: u64,
    pub appends_rejected: u64,
    pub appends_failed: u64,
    pub reconnects: u64,
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Sleep between iterations.
    pub interval: Duration,
    /// Upper bound for one append.
    pub publish_timeout: Duration,
    /// Initial connect retry policy.
    pub backoff: Backoff,
}

impl DriverSettings {
    pub fn from_config(config: &LoggerConfig) -> Self {
        Self {
            interval: config.interval(),
            publish_timeout: config.publish_timeout(),
            backoff: Backoff::from_config(&config.controller),
        }
    }
}

/// Disconnects the sampler when dropped.
struct SessionGuard<'a, C: Controller> {
    sampler: &'a mut Sampler<C>,
}

impl<C: Controller> Deref for SessionGuard<'_, C> {
    type Target = Sampler<C>;

    fn deref(&self) -> &Self::Target {
        self.sampler
    }
}

impl<C: Controller> DerefMut for SessionGuard<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.sampler
    }
}

impl<C: Controller> Drop for SessionGuard<'_, C> {
    fn drop(&mut self) {
        self.sampler.disconnect();
    }
}

pub struct Driver<C, S> {
    sampler: Sampler<C>,
    publisher: Publisher<S>,
    settings: DriverSettings,
    stop: StopHandle,
    state: DriverState,
    stats: DriverStats,
}

impl<C: Controller, S: Sink> Driver<C, S> {
    pub fn new(
        sampler: Sampler<C>,
        publisher: Publisher<S>,
        settings: DriverSettings,
        stop: StopHandle,
    ) -> Self {
        Self {
            sampler,
            publisher,
            settings,
            stop,
            state: DriverState::Disconnected,
            stats: DriverStats::default(),
        }
    }

    /// Connect, then sample until stopped.
    ///
    /// Returns `Ok` on a requested stop (including one that arrives while
    /// waiting to retry the initial connect) and `Err` only when the initial
    /// connect exhausts its attempts.
    pub async fn run(&mut self) -> Result<DriverStats, DriverError> {
        if !self.connect_initial().await? {
            self.state = DriverState::Stopped;
            tracing::info!("Stopped before controller connection was established");
            return Ok(self.stats);
        }

        {
            let mut session = SessionGuard {
                sampler: &mut self.sampler,
            };
            self.state = DriverState::Running;
            tracing::info!(
                interval_secs = self.settings.interval.as_secs_f64(),
                "Sampling started"
            );

            while !self.stop.is_stopped() {
                run_iteration(
                    &mut session,
                    &self.publisher,
                    self.settings.publish_timeout,
                    &mut self.stats,
                )
                .await;

                tokio::select! {
                    _ = tokio::time::sleep(self.settings.interval) => {}
                    _ = self.stop.stopped() => break,
                }
            }

            self.state = DriverState::Terminating;
        }

        self.state = DriverState::Stopped;
        let s = &self.stats;
        tracing::info!(
            iterations = s.iterations,
            samples_read = s.samples_read,
            read_failures = s.read_failures,
            records_appended = s.records_appended,
            appends_rejected = s.appends_rejected,
            appends_failed = s.appends_failed,
            reconnects = s.reconnects,
            "Sampling stopped"
        );
        Ok(self.stats)
    }

    /// Returns `Ok(false)` if stopped while backing off.
    async fn connect_initial(&mut self) -> Result<bool, DriverError> {
        let mut backoff = self.settings.backoff.clone();
        loop {
            let err = match self.sampler.connect().await {
                Ok(()) => {
                    self.state = DriverState::Connected;
                    return Ok(true);
                }
                Err(e) => e,
            };

            let Some(delay) = backoff.next_delay() else {
                tracing::error!(
                    error_kind = err.kind(),
                    error = %err,
                    attempts = backoff.attempts(),
                    "Controller connect failed"
                );
                return Err(DriverError::Connect {
                    attempts: backoff.attempts(),
                    source: err,
                });
            };
            tracing::warn!(
                error_kind = err.kind(),
                error = %err,
                attempt = backoff.attempts(),
                retry_in_ms = delay.as_millis() as u64,
                "Controller connect failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.stop.stopped() => return Ok(false),
            }
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn stats(&self) -> DriverStats {
        self.stats
    }

    pub fn sampler(&self) -> &Sampler<C> {
        &self.sampler
    }

    pub fn publisher(&self) -> &Publisher<S> {
        &self.publisher
    }
}

async fn run_iteration<C: Controller, S: Sink>(
    sampler: &mut Sampler<C>,
    publisher: &Publisher<S>,
    publish_timeout: Duration,
    stats: &mut DriverStats,
) {
    stats.iterations += 1;

    if !sampler.is_connected() {
        match sampler.connect().await {
            Ok(()) => stats.reconnects += 1,
            Err(e) => {
                stats.read_failures += 1;
                tracing::warn!(error_kind = e.kind(), error = %e, "Controller reconnect failed");
                return;
            }
        }
    }

    let measurement = match sampler.read_value().await {
        Ok(m) => m,
        Err(e) => {
            stats.read_failures += 1;
            tracing::warn!(error_kind = e.kind(), error = %e, "Controller read failed");
            return;
        }
    };
    stats.samples_read += 1;
    tracing::info!(
        value = measurement.value,
        timestamp_ms = measurement.timestamp_ms,
        "Temperature sampled"
    );

    let result =
        match tokio::time::timeout(publish_timeout, publisher.append_measurement(&measurement))
            .await
        {
            Ok(r) => r,
            Err(_) => Err(WriteError::Transient(format!(
                "append timed out after {publish_timeout:?}"
            ))),
        };

    match result {
        Ok(()) => stats.records_appended += 1,
        Err(WriteError::Rejected(records)) => {
            stats.appends_rejected += 1;
            for r in &records {
                tracing::warn!(
                    error_kind = "write.rejected",
                    index = r.index,
                    reason = %r.reason,
                    record = %r.record.to_json(),
                    "Record rejected by sink"
                );
            }
        }
        Err(e) => {
            stats.appends_failed += 1;
            tracing::warn!(error_kind = e.kind(), error = %e, "Append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoggerConfig;
    use crate::publisher::{Destination, RejectedRecord, TimeseriesRecord};
    use crate::sampler::{ControllerEndpoint, MemoryArea, ReadError};
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    /// Replays reads in order; requests a stop when handing out the last one.
    struct ScriptedController {
        connects: VecDeque<Result<(), ConnectError>>,
        reads: VecDeque<Result<f32, ReadError>>,
        stop: StopHandle,
        connected: bool,
        connect_calls: usize,
        disconnects: usize,
        // Survives the controller when the driver task unwinds.
        disconnect_count: Arc<AtomicUsize>,
    }

    impl ScriptedController {
        fn new(stop: &StopHandle, reads: Vec<Result<f32, ReadError>>) -> Self {
            Self {
                connects: VecDeque::new(),
                reads: reads.into(),
                stop: stop.clone(),
                connected: false,
                connect_calls: 0,
                disconnects: 0,
                disconnect_count: Arc::default(),
            }
        }

        fn with_connects(mut self, connects: Vec<Result<(), ConnectError>>) -> Self {
            self.connects = connects.into();
            self
        }
    }

    impl Controller for ScriptedController {
        async fn connect(&mut self, _endpoint: &ControllerEndpoint) -> Result<(), ConnectError> {
            self.connect_calls += 1;
            self.connects.pop_front().unwrap_or(Ok(()))?;
            self.connected = true;
            Ok(())
        }

        async fn read_area(
            &mut self,
            _area: MemoryArea,
            _offset: u32,
            _len: usize,
        ) -> Result<Vec<u8>, ReadError> {
            let next = self.reads.pop_front();
            if self.reads.is_empty() {
                self.stop.stop();
            }
            match next {
                Some(Ok(v)) => Ok(v.to_be_bytes().to_vec()),
                Some(Err(e)) => {
                    if matches!(e, ReadError::Transport(_)) {
                        self.connected = false;
                    }
                    Err(e)
                }
                None => Err(ReadError::Protocol("script exhausted".into())),
            }
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn disconnect(&mut self) {
            self.connected = false;
            self.disconnects += 1;
            self.disconnect_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        appended: Mutex<Vec<TimeseriesRecord>>,
        responses: Mutex<VecDeque<Result<(), WriteError>>>,
        stall: Option<Duration>,
        panic_on_write: bool,
    }

    impl RecordingSink {
        fn with_responses(responses: Vec<Result<(), WriteError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                ..Default::default()
            }
        }

        fn values(&self) -> Vec<String> {
            self.appended
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.measure_value.clone())
                .collect()
        }
    }

    impl Sink for RecordingSink {
        async fn write_records(
            &self,
            _destination: &Destination,
            records: &[TimeseriesRecord],
        ) -> Result<(), WriteError> {
            if self.panic_on_write {
                panic!("sink exploded");
            }
            self.appended.lock().unwrap().extend_from_slice(records);
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            let response = self.responses.lock().unwrap().pop_front();
            response.unwrap_or(Ok(()))
        }
    }

    fn settings(interval_secs: u64, connect_attempts: u32) -> DriverSettings {
        DriverSettings {
            interval: Duration::from_secs(interval_secs),
            publish_timeout: Duration::from_secs(30),
            backoff: Backoff::new(
                Duration::from_millis(500),
                Duration::from_secs(10),
                connect_attempts,
            ),
        }
    }

    fn driver(
        controller: ScriptedController,
        sink: RecordingSink,
        settings: DriverSettings,
        stop: &StopHandle,
    ) -> Driver<ScriptedController, RecordingSink> {
        Driver::new(
            Sampler::from_config(controller, &LoggerConfig::default()),
            Publisher::new(sink, Destination::new("TestingDatabase", "TestingTable")),
            settings,
            stop.clone(),
        )
    }

    fn refused() -> ConnectError {
        ConnectError::Unreachable(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_read_skips_append_and_keeps_interval() {
        let stop = StopHandle::new();
        let controller = ScriptedController::new(
            &stop,
            vec![
                Ok(21.0),
                Err(ReadError::ShortRead {
                    expected: 4,
                    actual: 0,
                }),
                Ok(22.3),
            ],
        );
        let mut d = driver(controller, RecordingSink::default(), settings(5, 1), &stop);

        let started = Instant::now();
        let stats = d.run().await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(d.publisher().sink().values(), vec!["21.0", "22.3"]);
        assert_eq!(stats.iterations, 3);
        assert_eq!(stats.samples_read, 2);
        assert_eq!(stats.read_failures, 1);
        assert_eq!(stats.records_appended, 2);
        assert_eq!(d.sampler().controller().disconnects, 1);
        assert_eq!(d.state(), DriverState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_append_does_not_stop_loop() {
        let stop = StopHandle::new();
        let controller = ScriptedController::new(&stop, vec![Ok(21.0), Ok(22.0)]);
        let rejected = WriteError::Rejected(vec![RejectedRecord {
            index: 0,
            record: TimeseriesRecord {
                dimensions: Vec::new(),
                measure_name: "temperature".into(),
                measure_value: "21.0".into(),
                measure_value_type: crate::publisher::MeasureValueType::Double,
                time: "0".into(),
                time_unit: crate::publisher::TimeUnit::Milliseconds,
            },
            reason: "Duplicate record".into(),
        }]);
        let sink = RecordingSink::with_responses(vec![Err(rejected), Ok(())]);
        let mut d = driver(controller, sink, settings(5, 1), &stop);

        let stats = d.run().await.unwrap();

        assert_eq!(stats.iterations, 2);
        assert_eq!(stats.appends_rejected, 1);
        assert_eq!(stats.records_appended, 1);
        assert_eq!(d.publisher().sink().values(), vec!["21.0", "22.0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_append_failure_is_counted() {
        let stop = StopHandle::new();
        let controller = ScriptedController::new(&stop, vec![Ok(21.0)]);
        let sink =
            RecordingSink::with_responses(vec![Err(WriteError::Transient("throttled".into()))]);
        let mut d = driver(controller, sink, settings(5, 1), &stop);

        let stats = d.run().await.unwrap();

        assert_eq!(stats.appends_failed, 1);
        assert_eq!(stats.records_appended, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_after_failed_iteration_disconnects_once() {
        let stop = StopHandle::new();
        let controller = ScriptedController::new(
            &stop,
            vec![Ok(20.0), Err(ReadError::Device { code: 0x0A })],
        );
        let mut d = driver(controller, RecordingSink::default(), settings(5, 1), &stop);

        let stats = d.run().await.unwrap();

        assert_eq!(stats.read_failures, 1);
        assert_eq!(d.sampler().controller().disconnects, 1);
        assert!(!d.sampler().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_sink_still_disconnects_once() {
        let stop = StopHandle::new();
        let controller = ScriptedController::new(&stop, vec![Ok(20.0), Ok(21.0)]);
        let disconnects = Arc::clone(&controller.disconnect_count);
        let sink = RecordingSink {
            panic_on_write: true,
            ..Default::default()
        };
        let mut d = driver(controller, sink, settings(5, 1), &stop);

        let joined = tokio::spawn(async move { d.run().await }).await;

        assert!(joined.unwrap_err().is_panic());
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unready_sink_does_not_stop_sampling() {
        let stop = StopHandle::new();
        let controller = ScriptedController::new(&stop, vec![Ok(21.0), Ok(21.5), Ok(22.0)]);
        let unready = || -> Result<(), WriteError> {
            Err(WriteError::Transient("endpoint discovery failed".into()))
        };
        let sink = RecordingSink::with_responses(vec![unready(), unready(), Ok(())]);
        let mut d = driver(controller, sink, settings(5, 1), &stop);

        let stats = d.run().await.unwrap();

        assert_eq!(d.sampler().controller().connect_calls, 1);
        assert_eq!(stats.iterations, 3);
        assert_eq!(stats.appends_failed, 2);
        assert_eq!(stats.records_appended, 1);
        assert_eq!(d.state(), DriverState::Stopped);
        assert_eq!(d.sampler().controller().disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_wakes_interval_sleep() {
        let stop = StopHandle::new();
        let controller = ScriptedController::new(&stop, vec![Ok(1.0), Ok(2.0), Ok(3.0)]);
        let mut d = driver(controller, RecordingSink::default(), settings(3600, 1), &stop);

        let started = Instant::now();
        let (result, _) = tokio::join!(d.run(), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stop.stop();
        });
        let stats = result.unwrap();

        assert!(started.elapsed() < Duration::from_secs(3600));
        assert_eq!(stats.iterations, 1);
        assert_eq!(d.sampler().controller().disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_session_is_reconnected() {
        let stop = StopHandle::new();
        let lost = ReadError::Transport(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        let controller = ScriptedController::new(&stop, vec![Err(lost), Ok(22.0)]);
        let mut d = driver(controller, RecordingSink::default(), settings(5, 1), &stop);

        let stats = d.run().await.unwrap();

        assert_eq!(stats.reconnects, 1);
        assert_eq!(stats.read_failures, 1);
        assert_eq!(stats.records_appended, 1);
        assert_eq!(d.sampler().controller().connect_calls, 2);
        assert_eq!(d.sampler().controller().disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reconnect_counts_as_read_failure() {
        let stop = StopHandle::new();
        let lost = ReadError::Transport(io::Error::new(io::ErrorKind::BrokenPipe, "broken"));
        let controller = ScriptedController::new(&stop, vec![Err(lost), Ok(5.0)])
            .with_connects(vec![Ok(()), Err(ConnectError::Timeout(Duration::from_secs(5)))]);
        let mut d = driver(controller, RecordingSink::default(), settings(5, 1), &stop);

        let stats = d.run().await.unwrap();

        assert_eq!(stats.iterations, 3);
        assert_eq!(stats.read_failures, 2);
        assert_eq!(stats.reconnects, 1);
        assert_eq!(d.publisher().sink().values(), vec!["5.0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_connect_failure_is_fatal() {
        let stop = StopHandle::new();
        let controller = ScriptedController::new(&stop, vec![Ok(1.0)])
            .with_connects(vec![Err(refused()), Err(refused())]);
        let mut d = driver(controller, RecordingSink::default(), settings(5, 2), &stop);

        let err = d.run().await.unwrap_err();

        assert!(matches!(err, DriverError::Connect { attempts: 2, .. }));
        assert_eq!(err.kind(), "connect.unreachable");
        assert_eq!(d.state(), DriverState::Disconnected);
        assert_eq!(d.stats().iterations, 0);
        assert_eq!(d.sampler().controller().disconnects, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_connect_retries_with_backoff() {
        let stop = StopHandle::new();
        let controller = ScriptedController::new(&stop, vec![Ok(1.0)]).with_connects(vec![
            Err(refused()),
            Err(ConnectError::Rejected("busy".into())),
        ]);
        let mut d = driver(controller, RecordingSink::default(), settings(5, 3), &stop);

        let started = Instant::now();
        let stats = d.run().await.unwrap();

        // 500ms + 1000ms of backoff before the third attempt
        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert_eq!(d.sampler().controller().connect_calls, 3);
        assert_eq!(stats.records_appended, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_connect_backoff_exits_cleanly() {
        let stop = StopHandle::new();
        let controller =
            ScriptedController::new(&stop, vec![Ok(1.0)]).with_connects(vec![Err(refused())]);
        let mut d = driver(controller, RecordingSink::default(), settings(5, 5), &stop);
        stop.stop();

        let stats = d.run().await.unwrap();

        assert_eq!(stats, DriverStats::default());
        assert_eq!(d.state(), DriverState::Stopped);
        assert_eq!(d.sampler().controller().connect_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_sink_is_bounded_by_publish_timeout() {
        let stop = StopHandle::new();
        let controller = ScriptedController::new(&stop, vec![Ok(1.0)]);
        let sink = RecordingSink {
            stall: Some(Duration::from_secs(600)),
            ..Default::default()
        };
        let mut d = driver(controller, sink, settings(5, 1), &stop);

        let started = Instant::now();
        let stats = d.run().await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(600));
        assert_eq!(stats.appends_failed, 1);
    }
}
