//! Clock provider abstraction.
//!
//! A `Clock` supplies high-resolution timestamps and, optionally, a named
//! interval-marker timeline and lifecycle event timestamps. Every capability
//! is optional; [`Capabilities`](crate::Capabilities) records which ones a
//! provider actually has.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use chrono::Utc;

/// Lifecycle event that coincides with the clock origin.
pub const NAVIGATION_START: &str = "navigationStart";

/// An interval realized from a pair of markers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerSpan {
    /// Start marker time, relative to the clock origin.
    pub start_time: f64,
    pub duration: f64,
}

/// Injected clock provider.
///
/// All timestamps are milliseconds. `now` and marker times are relative to
/// the clock origin; `time_origin` and `event_timestamp` are absolute (epoch).
pub trait Clock {
    /// High-resolution time since origin, or `None` when unsupported.
    fn now(&self) -> Option<f64>;

    /// Whether `mark`/`measure_between`/`clear_marks` are functional.
    fn supports_markers(&self) -> bool {
        false
    }

    /// Place a named marker at the current time.
    fn mark(&self, _name: &str) {}

    /// Realize the interval between two named markers.
    fn measure_between(&self, _start_mark: &str, _end_mark: &str) -> Option<MarkerSpan> {
        None
    }

    /// Discard all markers.
    fn clear_marks(&self) {}

    /// Absolute timestamp of the clock origin.
    fn time_origin(&self) -> Option<f64> {
        None
    }

    /// Absolute timestamp of a named lifecycle event, if it happened.
    fn event_timestamp(&self, _event: &str) -> Option<f64> {
        None
    }
}

/// Type alias for a shared clock.
pub type SharedClock = Rc<dyn Clock>;

/// In-memory interval-marker store.
///
/// Markers with the same name accumulate until cleared; intervals are
/// realized from the most recent matching pair.
#[derive(Debug, Default)]
pub struct MarkerBuffer {
    marks: RefCell<HashMap<String, Vec<f64>>>,
}

impl MarkerBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, name: &str, at: f64) {
        self.marks
            .borrow_mut()
            .entry(name.to_string())
            .or_default()
            .push(at);
    }

    /// Interval from the latest end marker back to the latest start marker
    /// placed at or before it.
    pub fn span(&self, start_mark: &str, end_mark: &str) -> Option<MarkerSpan> {
        let marks = self.marks.borrow();
        let end = *marks.get(end_mark)?.last()?;
        let start = marks
            .get(start_mark)?
            .iter()
            .rev()
            .copied()
            .find(|&start| start <= end)?;
        Some(MarkerSpan {
            start_time: start,
            duration: end - start,
        })
    }

    pub fn clear(&self) {
        self.marks.borrow_mut().clear();
    }

    /// Total number of markers held.
    pub fn len(&self) -> usize {
        self.marks.borrow().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ambient host clock backed by `Instant`, with a marker timeline.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
    origin_epoch_ms: f64,
    markers: Option<MarkerBuffer>,
    events: RefCell<HashMap<String, f64>>,
}

impl SystemClock {
    /// Create a clock whose origin is now, with marker support.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            origin_epoch_ms: Utc::now().timestamp_micros() as f64 / 1000.0,
            markers: Some(MarkerBuffer::new()),
            events: RefCell::new(HashMap::new()),
        }
    }

    /// Create a clock without a marker timeline (wall-clock mode).
    pub fn without_markers() -> Self {
        Self {
            markers: None,
            ..Self::new()
        }
    }

    fn elapsed_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }

    /// Record a lifecycle event as happening now.
    pub fn record_event(&self, event: impl Into<String>) {
        let at = self.origin_epoch_ms + self.elapsed_ms();
        self.events.borrow_mut().insert(event.into(), at);
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Option<f64> {
        Some(self.elapsed_ms())
    }

    fn supports_markers(&self) -> bool {
        self.markers.is_some()
    }

    fn mark(&self, name: &str) {
        if let Some(markers) = &self.markers {
            markers.mark(name, self.elapsed_ms());
        }
    }

    fn measure_between(&self, start_mark: &str, end_mark: &str) -> Option<MarkerSpan> {
        self.markers.as_ref()?.span(start_mark, end_mark)
    }

    fn clear_marks(&self) {
        if let Some(markers) = &self.markers {
            markers.clear();
        }
    }

    fn time_origin(&self) -> Option<f64> {
        Some(self.origin_epoch_ms)
    }

    fn event_timestamp(&self, event: &str) -> Option<f64> {
        if event == NAVIGATION_START {
            return Some(self.origin_epoch_ms);
        }
        self.events.borrow().get(event).copied()
    }
}
