//! Extra-data merge engine.
//!
//! Per-measure metadata is merged against the global metadata once, when the
//! measure is started (or synthesized from an event). Array values present in
//! both maps are unioned; every other key takes the per-measure value. Keys
//! that only exist globally are not copied into the measure.

use serde_json::Value;

use crate::types::Metadata;

/// Holds the global metadata and merges per-measure metadata against it.
///
/// The global map is read-only after construction.
#[derive(Debug, Clone, Default)]
pub struct ExtraData {
    global: Metadata,
}

impl ExtraData {
    pub fn new(global: Metadata) -> Self {
        Self { global }
    }

    pub fn global(&self) -> &Metadata {
        &self.global
    }

    /// Merge per-measure metadata with the global map.
    ///
    /// Returns `None` when the measure supplied no metadata.
    pub fn merge(&self, measure: Option<Metadata>) -> Option<Metadata> {
        let measure = measure?;
        let merged = measure
            .into_iter()
            .map(|(key, value)| {
                let value = match (&value, self.global.get(&key)) {
                    (Value::Array(own), Some(Value::Array(global))) => {
                        Value::Array(union_arrays(own, global))
                    }
                    _ => value,
                };
                (key, value)
            })
            .collect();
        Some(merged)
    }
}

/// Elements of `first` then `second`, in order, without exact duplicates.
pub fn union_arrays(first: &[Value], second: &[Value]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(first.len() + second.len());
    for value in first.iter().chain(second) {
        if !out.contains(value) {
            out.push(value.clone());
        }
    }
    out
}
