//! JSON Lines export
//!
//! [`JsonLinesCollector`] appends one JSON object per report to a writer:
//! completed operations, first-stuck reports and internal errors, each tagged
//! with its [`RecordKind`]. Write failures are counted and logged, never
//! propagated to the monitored code.

use std::error::Error;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use log::error;
use parking_lot::Mutex;
use serde::Serialize;

use crate::collector::Collector;
use crate::domain::ExportError;
use crate::operation::OperationSnapshot;

/// What a line in the export describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordKind {
    Completed,
    FirstStuck,
    Error,
}

/// One line of the export.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRecord<'a> {
    pub kind: RecordKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<&'a OperationSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// Collector writing one JSON object per report.
///
/// Every record is flushed as soon as it is written so the file stays
/// readable while the process runs.
pub struct JsonLinesCollector<W: Write + Send> {
    writer: Mutex<W>,
    written: AtomicU64,
    failed: AtomicU64,
}

impl JsonLinesCollector<BufWriter<File>> {
    /// Create (or truncate) `path` and write records to it.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Io`] if the file cannot be created.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, ExportError> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> JsonLinesCollector<W> {
    pub fn new(writer: W) -> Self {
        Self { writer: Mutex::new(writer), written: AtomicU64::new(0), failed: AtomicU64::new(0) }
    }

    /// Serialize and write one record.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError`] if serialization or the write fails.
    pub fn write_record(&self, record: &ExportRecord<'_>) -> Result<(), ExportError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut writer = self.writer.lock();
        writer.write_all(&line)?;
        writer.flush()?;
        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Records successfully written.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Records lost to serialization or I/O errors.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    fn write_or_log(&self, record: &ExportRecord<'_>) {
        if let Err(e) = self.write_record(record) {
            if self.failed.fetch_add(1, Ordering::Relaxed) == 0 {
                error!("Failed to export report: {e}");
            }
        }
    }

    fn write_operation(&self, kind: RecordKind, operation: &OperationSnapshot) {
        self.write_or_log(&ExportRecord { kind, operation: Some(operation), message: None, cause: None });
    }
}

impl<W: Write + Send> Collector for JsonLinesCollector<W> {
    fn collect(&self, operation: OperationSnapshot) {
        self.write_operation(RecordKind::Completed, &operation);
    }

    fn collect_first_stuck(&self, operation: OperationSnapshot) {
        self.write_operation(RecordKind::FirstStuck, &operation);
    }

    fn collect_error(&self, message: &str, cause: Option<&(dyn Error + 'static)>) {
        self.write_or_log(&ExportRecord {
            kind: RecordKind::Error,
            operation: None,
            message: Some(message),
            cause: cause.map(ToString::to_string),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OperationId;
    use crate::metrics::MetricSnapshot;

    fn snapshot() -> OperationSnapshot {
        OperationSnapshot {
            id: OperationId(4),
            description: "checkout".to_string(),
            start_time_millis: 1_700_000_000_000,
            duration_nanos: 5_000_000,
            completed: true,
            stuck: false,
            thread_names: vec!["main".to_string()],
            username: None,
            trace_batch: 0,
            trace: Vec::new(),
            hotspots: Vec::new(),
            metrics: MetricSnapshot::default(),
        }
    }

    #[test]
    fn test_one_json_object_per_line() {
        let collector = JsonLinesCollector::new(Vec::new());
        collector.collect(snapshot());
        collector.collect_first_stuck(snapshot());
        collector.collect_error("tick failed", None);
        assert_eq!(collector.written(), 3);

        let output = String::from_utf8(collector.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> =
            output.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["kind"], "completed");
        assert_eq!(lines[0]["operation"]["id"], 4);
        assert_eq!(lines[0]["operation"]["durationNanos"], 5_000_000);
        assert!(lines[0]["operation"].get("username").is_none());
        assert_eq!(lines[1]["kind"], "firstStuck");
        assert_eq!(lines[2]["kind"], "error");
        assert_eq!(lines[2]["message"], "tick failed");
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_failures_are_counted_not_raised() {
        let collector = JsonLinesCollector::new(BrokenWriter);
        collector.collect(snapshot());
        collector.collect(snapshot());
        assert_eq!(collector.written(), 0);
        assert_eq!(collector.failed(), 2);
    }
}
