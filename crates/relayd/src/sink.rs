//! Durable snapshot log.
//!
//! After every telemetry update the merged snapshot is appended to a sink,
//! one record per update. `append` is called from the relay actor between
//! two commands and must not wait on I/O; the file sink hands records to a
//! writer thread through a bounded queue.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use relay_core::Snapshot;

/// Destination for merged snapshots.
pub trait SnapshotSink: Send {
    /// Appends one record.
    fn append(&mut self, snapshot: &Snapshot) -> Result<(), SinkError>;
}

/// One line of the snapshot log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub recorded_at: DateTime<Utc>,
    pub snapshot: Snapshot,
}

/// Records the file sink buffers before `append` starts failing.
pub const SINK_QUEUE_CAPACITY: usize = 1024;

/// Appends records as JSON lines to a file.
///
/// Writes happen on a dedicated thread. Dropping the sink flushes what is
/// queued and waits for that thread.
pub struct JsonLinesSink {
    path: PathBuf,
    records: Option<mpsc::Sender<SnapshotRecord>>,
    writer: Option<JoinHandle<()>>,
}

impl JsonLinesSink {
    /// Opens (or creates) the log file in append mode.
    ///
    /// Parent directories are created as needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| SinkError::Open {
                    path: path.clone(),
                    error: e.to_string(),
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| SinkError::Open {
                path: path.clone(),
                error: e.to_string(),
            })?;

        let (records, queue) = mpsc::channel(SINK_QUEUE_CAPACITY);
        let writer_path = path.clone();
        let writer = thread::Builder::new()
            .name("snapshot-log".to_string())
            .spawn(move || write_records(BufWriter::new(file), queue, &writer_path))
            .map_err(|e| SinkError::Open {
                path: path.clone(),
                error: e.to_string(),
            })?;

        Ok(Self {
            path,
            records: Some(records),
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotSink for JsonLinesSink {
    fn append(&mut self, snapshot: &Snapshot) -> Result<(), SinkError> {
        let records = self.records.as_ref().ok_or(SinkError::WriterStopped)?;
        let record = SnapshotRecord {
            recorded_at: Utc::now(),
            snapshot: snapshot.clone(),
        };
        records.try_send(record).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Backlogged {
                capacity: SINK_QUEUE_CAPACITY,
            },
            mpsc::error::TrySendError::Closed(_) => SinkError::WriterStopped,
        })
    }
}

impl Drop for JsonLinesSink {
    fn drop(&mut self) {
        // Closing the queue lets the writer drain it and exit
        self.records.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!(path = %self.path.display(), "Snapshot log writer panicked");
            }
        }
    }
}

/// Writer thread body: drains the queue, flushing after each burst.
fn write_records(
    mut writer: BufWriter<File>,
    mut queue: mpsc::Receiver<SnapshotRecord>,
    path: &Path,
) {
    while let Some(record) = queue.blocking_recv() {
        let mut pending = Some(record);
        while let Some(record) = pending {
            if let Err(e) = write_record(&mut writer, &record) {
                warn!(path = %path.display(), error = %e, "Failed to write snapshot record");
            }
            pending = queue.try_recv().ok();
        }
        if let Err(e) = writer.flush() {
            warn!(path = %path.display(), error = %e, "Failed to flush snapshot log");
        }
    }
    debug!(path = %path.display(), "Snapshot log writer stopped");
}

fn write_record(writer: &mut BufWriter<File>, record: &SnapshotRecord) -> Result<(), SinkError> {
    serde_json::to_writer(&mut *writer, record)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Logs every record through tracing. Used when no log file is configured.
#[derive(Debug, Default)]
pub struct TracingSink;

impl SnapshotSink for TracingSink {
    fn append(&mut self, snapshot: &Snapshot) -> Result<(), SinkError> {
        let json = serde_json::to_string(snapshot)?;
        info!(target: "relayd::snapshot", fields = snapshot.len(), snapshot = %json, "Snapshot");
        Ok(())
    }
}

/// Errors that can occur while persisting snapshots.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Failed to open snapshot log {path}: {error}")]
    Open { path: PathBuf, error: String },

    #[error("Failed to write snapshot: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Snapshot log is {capacity} records behind, dropping record")]
    Backlogged { capacity: usize },

    #[error("Snapshot log writer has stopped")]
    WriterStopped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(value: serde_json::Value) -> Snapshot {
        serde_json::from_value(value).unwrap()
    }

    fn read_records(path: &Path) -> Vec<SnapshotRecord> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.jsonl");

        let mut sink = JsonLinesSink::open(&path).unwrap();
        sink.append(&snapshot(json!({"speed": 5}))).unwrap();
        sink.append(&snapshot(json!({"speed": 5, "heading": 90}))).unwrap();
        drop(sink);

        let records = read_records(&path);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].snapshot, snapshot(json!({"speed": 5})));
        assert_eq!(
            records[1].snapshot,
            snapshot(json!({"speed": 5, "heading": 90}))
        );
        assert!(records[0].recorded_at <= records[1].recorded_at);
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.jsonl");

        JsonLinesSink::open(&path)
            .unwrap()
            .append(&snapshot(json!({"a": 1})))
            .unwrap();
        JsonLinesSink::open(&path)
            .unwrap()
            .append(&snapshot(json!({"a": 2})))
            .unwrap();

        assert_eq!(read_records(&path).len(), 2);
    }

    #[test]
    fn test_append_never_waits_for_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.jsonl");
        let total = SINK_QUEUE_CAPACITY * 4;

        let mut sink = JsonLinesSink::open(&path).unwrap();
        let mut accepted = 0;
        for n in 0..total {
            match sink.append(&snapshot(json!({"counter": n}))) {
                Ok(()) => accepted += 1,
                Err(SinkError::Backlogged { capacity }) => {
                    assert_eq!(capacity, SINK_QUEUE_CAPACITY)
                }
                Err(e) => panic!("unexpected sink error: {e}"),
            }
        }
        drop(sink);

        // Every accepted record reaches the file, in order
        let records = read_records(&path);
        assert!(accepted >= SINK_QUEUE_CAPACITY);
        assert_eq!(records.len(), accepted);
        let counters: Vec<u64> = records
            .iter()
            .map(|r| r.snapshot.get("counter").unwrap().as_u64().unwrap())
            .collect();
        assert!(counters.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_sink_error_display() {
        let err = SinkError::Backlogged { capacity: 1024 };
        assert_eq!(
            err.to_string(),
            "Snapshot log is 1024 records behind, dropping record"
        );
        assert_eq!(
            SinkError::WriterStopped.to_string(),
            "Snapshot log writer has stopped"
        );
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("log").join("snapshots.jsonl");

        let sink = JsonLinesSink::open(&path).unwrap();
        assert_eq!(sink.path(), path.as_path());
        assert!(path.exists());
    }

    #[test]
    fn test_open_failure() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as a log file
        let err = JsonLinesSink::open(dir.path()).err().unwrap();
        assert!(matches!(err, SinkError::Open { .. }));
    }

    #[test]
    fn test_tracing_sink_accepts_records() {
        let mut sink = TracingSink;
        assert!(sink.append(&snapshot(json!({"counter": 1}))).is_ok());
    }
}
