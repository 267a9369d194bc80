//! Last-known telemetry snapshot.
//!
//! The boat reports partial telemetry records: each frame carries only the
//! fields that changed. The snapshot accumulates them so that late joiners
//! and the durable log always see the full picture.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{json_kind, DomainError, DomainResult};

/// Mapping from telemetry field name to its last-seen value.
///
/// Merges are shallow: a key present in an update overwrites the stored
/// value wholesale (nested objects are not merged), and keys absent from an
/// update are kept. Nothing is ever removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(Map<String, Value>);

impl Snapshot {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shallow-merges an update into the snapshot.
    pub fn merge(&mut self, update: Map<String, Value>) {
        for (field, value) in update {
            self.0.insert(field, value);
        }
    }

    /// Merges an arbitrary JSON value, which must be an object.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotAnObject` for arrays, scalars and null.
    pub fn merge_value(&mut self, update: Value) -> DomainResult<()> {
        match update {
            Value::Object(fields) => {
                self.merge(fields);
                Ok(())
            }
            other => Err(DomainError::NotAnObject {
                found: json_kind(&other),
            }),
        }
    }

    /// Returns the last-seen value of a field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Number of fields seen so far.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for Snapshot {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}
