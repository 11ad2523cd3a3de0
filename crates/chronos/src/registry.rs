//! Measure registry.
//!
//! Holds running measures, stopped measures awaiting delivery and special
//! (event-derived) measures. Timing uses interval markers when the clock
//! supports them and falls back to two `now` readings otherwise.
//!
//! Both delivery queues are FIFO and keyed by name: stopping a name that is
//! still queued replaces the queued entry in place.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::capabilities::Capabilities;
use crate::clock::{Clock, NAVIGATION_START, SharedClock};
use crate::metadata::ExtraData;
use crate::types::{Measure, MeasureRecord, Metadata, RunningEntry, SpecialMeasure};

fn start_marker(name: &str) -> String {
    format!("{name}_start")
}

fn end_marker(name: &str) -> String {
    format!("{name}_end")
}

/// Running, stored and special measures for one instance.
pub struct MeasureRegistry {
    clock: SharedClock,
    capabilities: Capabilities,
    extra: ExtraData,
    running: HashMap<String, Measure>,
    stored: VecDeque<Measure>,
    special: VecDeque<SpecialMeasure>,
}

impl MeasureRegistry {
    /// Create a registry, detecting the clock's capabilities once.
    pub fn new(clock: SharedClock, extra: ExtraData) -> Self {
        let capabilities = Capabilities::detect(clock.as_ref());
        tracing::debug!(
            mode = capabilities.mode(),
            origin = ?capabilities.origin_timestamp,
            "Detected clock capabilities"
        );
        Self {
            clock,
            capabilities,
            extra,
            running: HashMap::new(),
            stored: VecDeque::new(),
            special: VecDeque::new(),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn extra(&self) -> &ExtraData {
        &self.extra
    }

    fn now(&self) -> Option<f64> {
        if !self.capabilities.supports_now {
            return None;
        }
        self.clock.now()
    }

    /// Open a measure. Re-starting a running name replaces its start time,
    /// target and metadata; in marker mode the earlier start marker stays on
    /// the timeline until residual markers are released.
    pub fn start(&mut self, name: &str, target: Option<f64>, metadata: Option<Metadata>) -> bool {
        let Some(now) = self.now() else {
            return false;
        };

        if self.running.contains_key(name) {
            tracing::debug!(measure = %name, "Restarting running measure");
        }

        if self.capabilities.supports_markers {
            self.clock.mark(&start_marker(name));
        }

        let measure = Measure::new(name, now)
            .with_target(target)
            .with_metadata(self.extra.merge(metadata));
        self.running.insert(name.to_string(), measure);
        true
    }

    /// Close a running measure and queue it for delivery.
    ///
    /// Returns false when the clock is unusable or `name` is not running.
    pub fn stop(&mut self, name: &str) -> bool {
        let Some(now) = self.now() else {
            return false;
        };
        let Some(mut measure) = self.running.remove(name) else {
            return false;
        };

        if self.capabilities.supports_markers {
            self.clock.mark(&end_marker(name));
        } else {
            measure.duration = Some((now - measure.start_time).max(0.0));
        }

        match self.stored.iter().position(|m| m.name == measure.name) {
            Some(pos) => self.stored[pos] = measure,
            None => self.stored.push_back(measure),
        }
        true
    }

    /// Store a special measure spanning from a lifecycle event until now.
    ///
    /// Returns false when the event has no known timestamp or the clock has
    /// no origin to relate it to.
    pub fn measure_from_event(
        &mut self,
        name: &str,
        event_name: &str,
        metadata: Option<Metadata>,
    ) -> bool {
        let Some(now) = self.now() else {
            return false;
        };
        let Some(origin) = self.capabilities.origin_timestamp else {
            return false;
        };
        let Some(event_at) = self.clock.event_timestamp(event_name) else {
            tracing::debug!(measure = %name, event = %event_name, "Unknown lifecycle event");
            return false;
        };

        let start_time = event_at - origin;
        let special = SpecialMeasure {
            name: name.to_string(),
            event_name: event_name.to_string(),
            origin_reference: event_at,
            start_time,
            duration: now - start_time,
            metadata: self.extra.merge(metadata),
        };

        match self.special.iter().position(|m| m.name == special.name) {
            Some(pos) => self.special[pos] = special,
            None => self.special.push_back(special),
        }
        true
    }

    pub fn measure_from_navigation_start(&mut self, name: &str, metadata: Option<Metadata>) -> bool {
        self.measure_from_event(name, NAVIGATION_START, metadata)
    }

    /// Pop the oldest stopped measure and realize its record.
    ///
    /// In marker mode a measure whose markers can no longer be paired is
    /// dropped with a warning and the next one is tried.
    pub fn pop_stored(&mut self) -> Option<MeasureRecord> {
        let origin = self.capabilities.origin_timestamp;
        while let Some(measure) = self.stored.pop_front() {
            if !self.capabilities.supports_markers {
                let duration = measure.duration.unwrap_or_default();
                let start_time = measure.start_time;
                return Some(measure.into_record(start_time, duration, origin));
            }

            let span = self
                .clock
                .measure_between(&start_marker(&measure.name), &end_marker(&measure.name));
            match span {
                Some(span) => {
                    return Some(measure.into_record(span.start_time, span.duration, origin));
                }
                None => {
                    tracing::warn!(measure = %measure.name, "Interval markers missing, dropping measure");
                }
            }
        }
        None
    }

    pub fn pop_special(&mut self) -> Option<MeasureRecord> {
        self.special.pop_front().map(SpecialMeasure::into_record)
    }

    /// Discard residual markers once nothing is running.
    ///
    /// Returns false, leaving markers in place, while any measure is open.
    pub fn release_markers(&mut self) -> bool {
        if !self.running.is_empty() {
            return false;
        }
        if self.capabilities.supports_markers {
            self.clock.clear_marks();
        }
        true
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running.contains_key(name)
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn stored_len(&self) -> usize {
        self.stored.len()
    }

    pub fn special_len(&self) -> usize {
        self.special.len()
    }

    /// Measures awaiting delivery.
    pub fn pending(&self) -> usize {
        self.stored.len() + self.special.len()
    }

    /// Running entries sorted by name.
    pub fn running_entries(&self) -> Vec<RunningEntry> {
        let mut entries: Vec<RunningEntry> = self
            .running
            .values()
            .map(|m| RunningEntry {
                name: m.name.clone(),
                start_time: m.start_time,
                target_duration: m.target_duration,
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn stored_names(&self) -> Vec<String> {
        self.stored.iter().map(|m| m.name.clone()).collect()
    }

    pub fn special_names(&self) -> Vec<String> {
        self.special.iter().map(|m| m.name.clone()).collect()
    }

    /// Merged metadata held for every measure not yet delivered.
    pub fn pending_metadata(&self) -> BTreeMap<String, Metadata> {
        let regular = self
            .running
            .values()
            .chain(self.stored.iter())
            .filter_map(|m| Some((m.name.clone(), m.metadata.clone()?)));
        let special = self
            .special
            .iter()
            .filter_map(|m| Some((m.name.clone(), m.metadata.clone()?)));
        regular.chain(special).collect()
    }
}
