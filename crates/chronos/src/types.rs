//! Measure data types.
//!
//! `Measure` and `SpecialMeasure` live inside the registry until delivery;
//! `MeasureRecord` is the flattened shape a sink receives.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::capabilities::Capabilities;

/// Arbitrary metadata attached to a measure or configured globally.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Field names of [`MeasureRecord`] that metadata may not shadow.
pub const RESERVED_KEYS: &[&str] = &[
    "name",
    "duration",
    "start_time",
    "origin_reference",
    "target_duration",
    "event_name",
];

/// A named span bracketed by explicit start and stop calls.
#[derive(Debug, Clone, PartialEq)]
pub struct Measure {
    /// Measure name, unique while running.
    pub name: String,

    /// Start timestamp in milliseconds relative to the clock origin.
    pub start_time: f64,

    /// Duration in milliseconds, known once stopped in wall-clock mode.
    pub duration: Option<f64>,

    /// Expected duration, carried through to the record untouched.
    pub target_duration: Option<f64>,

    /// Metadata merged at start time.
    pub metadata: Option<Metadata>,
}

/// A measure synthesized from a lifecycle event timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecialMeasure {
    pub name: String,

    /// Lifecycle event the span is measured from.
    pub event_name: String,

    /// Absolute timestamp (epoch milliseconds) of the event.
    pub origin_reference: f64,

    /// Event time relative to the clock origin.
    pub start_time: f64,

    pub duration: f64,

    pub metadata: Option<Metadata>,
}

/// A completed measurement as delivered to a sink.
///
/// Metadata is flattened into the top level of the serialized record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureRecord {
    pub name: String,

    /// Duration in milliseconds.
    pub duration: f64,

    /// Start timestamp in milliseconds relative to the clock origin.
    pub start_time: f64,

    /// Absolute timestamp the start time is relative to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_reference: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_duration: Option<f64>,

    /// Set for special measures only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,

    #[serde(flatten)]
    pub metadata: Metadata,
}

impl Measure {
    /// Create a running measure starting at `start_time`.
    pub fn new(name: impl Into<String>, start_time: f64) -> Self {
        Self {
            name: name.into(),
            start_time,
            duration: None,
            target_duration: None,
            metadata: None,
        }
    }

    pub fn with_target(mut self, target_duration: Option<f64>) -> Self {
        self.target_duration = target_duration;
        self
    }

    pub fn with_metadata(mut self, metadata: Option<Metadata>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Build the delivered record from a realized interval.
    pub fn into_record(
        self,
        start_time: f64,
        duration: f64,
        origin_reference: Option<f64>,
    ) -> MeasureRecord {
        MeasureRecord {
            name: self.name,
            duration,
            start_time,
            origin_reference,
            target_duration: self.target_duration,
            event_name: None,
            metadata: Metadata::new(),
        }
        .with_metadata(self.metadata)
    }
}

impl SpecialMeasure {
    pub fn into_record(self) -> MeasureRecord {
        MeasureRecord {
            name: self.name,
            duration: self.duration,
            start_time: self.start_time,
            origin_reference: Some(self.origin_reference),
            target_duration: None,
            event_name: Some(self.event_name),
            metadata: Metadata::new(),
        }
        .with_metadata(self.metadata)
    }
}

impl MeasureRecord {
    /// Attach metadata, dropping keys that would shadow record fields.
    pub fn with_metadata(mut self, metadata: Option<Metadata>) -> Self {
        for (key, value) in metadata.into_iter().flatten() {
            if RESERVED_KEYS.contains(&key.as_str()) {
                tracing::debug!(measure = %self.name, key = %key, "Dropping reserved metadata key");
                continue;
            }
            self.metadata.insert(key, value);
        }
        self
    }

    /// Look up a metadata value by key.
    pub fn meta(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }
}

/// A running measure as seen in a [`DebugSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunningEntry {
    pub name: String,
    pub start_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_duration: Option<f64>,
}

/// Immutable copy of an instance's internal state, for debugging and tests.
#[derive(Debug, Clone, Serialize)]
pub struct DebugSnapshot {
    pub capabilities: Capabilities,
    pub debug_mode: bool,
    /// Whether an idle-time flush request is outstanding.
    pub flush_scheduled: bool,
    pub running: Vec<RunningEntry>,
    /// Names of stopped measures awaiting delivery, in delivery order.
    pub stored: Vec<String>,
    /// Names of special measures awaiting delivery, in delivery order.
    pub special: Vec<String>,
    pub global_metadata: Metadata,
    /// Merged metadata per measure name, held until flush.
    pub pending_metadata: BTreeMap<String, Metadata>,
}

impl DebugSnapshot {
    pub fn is_running(&self, name: &str) -> bool {
        self.running.iter().any(|entry| entry.name == name)
    }

    /// Count of measures awaiting delivery.
    pub fn pending(&self) -> usize {
        self.stored.len() + self.special.len()
    }
}
