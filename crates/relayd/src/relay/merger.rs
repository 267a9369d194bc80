//! Rolling telemetry snapshot with a durable log.

use serde_json::Value;
use tracing::warn;

use relay_core::{DomainResult, Snapshot};

use crate::sink::{SnapshotSink, TracingSink};

/// Owns the last-known telemetry state.
///
/// Each update is shallow-merged into the snapshot and the full result is
/// appended to the sink. A sink failure is logged and the merged snapshot
/// is still returned, so broadcasting never waits on the log.
pub struct StateMerger {
    snapshot: Snapshot,
    sink: Box<dyn SnapshotSink>,
}

impl StateMerger {
    pub fn new(sink: Box<dyn SnapshotSink>) -> Self {
        Self {
            snapshot: Snapshot::new(),
            sink,
        }
    }

    /// Merges a partial update and returns the merged snapshot.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotAnObject` if the update is not a JSON
    /// object; the snapshot and the sink are left untouched.
    pub fn merge(&mut self, update: Value) -> DomainResult<&Snapshot> {
        self.snapshot.merge_value(update)?;

        if let Err(e) = self.sink.append(&self.snapshot) {
            warn!(error = %e, fields = self.snapshot.len(), "Failed to persist snapshot");
        }

        Ok(&self.snapshot)
    }

    /// Current snapshot, used as catch-up state for new clients.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }
}

impl Default for StateMerger {
    fn default() -> Self {
        Self::new(Box::new(TracingSink))
    }
}
