// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! JSON-lines sink for running without cloud credentials.

use super::{Destination, Sink, TimeseriesRecord, WriteError};
use serde::Serialize;
use std::io::{self, Write};
use std::sync::Mutex;

#[derive(Serialize)]
struct Line<'a> {
    database: &'a str,
    table: &'a str,
    record: &'a TimeseriesRecord,
}

/// Writes each record as one JSON object per line.
pub struct StdoutSink<W = io::Stdout> {
    out: Mutex<W>,
}

impl StdoutSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> StdoutSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Consume the sink and return the writer.
    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|p| p.into_inner())
    }
}

impl<W: Write> Sink for StdoutSink<W> {
    async fn write_records(
        &self,
        destination: &Destination,
        records: &[TimeseriesRecord],
    ) -> Result<(), WriteError> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| WriteError::Transient("output lock poisoned".into()))?;

        for record in records {
            let line = Line {
                database: &destination.database,
                table: &destination.table,
                record,
            };
            serde_json::to_writer(&mut *out, &line)
                .map_err(|e| WriteError::Transient(format!("encode failed: {e}")))?;
            out.write_all(b"\n")
                .map_err(|e| WriteError::Transient(format!("write failed: {e}")))?;
        }
        out.flush()
            .map_err(|e| WriteError::Transient(format!("flush failed: {e}")))
    }
}
