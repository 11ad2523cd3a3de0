//! Deterministic test doubles.
//!
//! - [`FakeClock`]: manually advanced clock with optional capabilities
//! - [`ManualIdleScheduler`]: queues idle requests until the test runs them
//! - [`StepDeadline`]: a slice budget counted in deliveries instead of time

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use crate::clock::{Clock, MarkerBuffer, MarkerSpan, NAVIGATION_START};
use crate::scheduler::{IdleCallback, IdleDeadline, IdleRequestOptions, IdleScheduler};

/// Default absolute origin of a [`FakeClock`], in epoch milliseconds.
pub const FAKE_ORIGIN: f64 = 1_000_000.0;

/// A clock that only moves when told to.
///
/// Starts at 0 ms with markers, an origin of [`FAKE_ORIGIN`] and a
/// `navigationStart` event at the origin.
#[derive(Debug)]
pub struct FakeClock {
    now: Cell<f64>,
    supports_now: bool,
    markers: Option<MarkerBuffer>,
    origin: Option<f64>,
    events: RefCell<HashMap<String, f64>>,
    now_calls: Cell<usize>,
}

impl FakeClock {
    pub fn new() -> Self {
        let mut events = HashMap::new();
        events.insert(NAVIGATION_START.to_string(), FAKE_ORIGIN);
        Self {
            now: Cell::new(0.0),
            supports_now: true,
            markers: Some(MarkerBuffer::new()),
            origin: Some(FAKE_ORIGIN),
            events: RefCell::new(events),
            now_calls: Cell::new(0),
        }
    }

    /// Simulate a host without a high-resolution clock.
    pub fn without_now(mut self) -> Self {
        self.supports_now = false;
        self
    }

    /// Simulate a host without interval markers (wall-clock mode).
    pub fn without_markers(mut self) -> Self {
        self.markers = None;
        self
    }

    /// Simulate a host with no known time origin.
    pub fn without_origin(mut self) -> Self {
        self.origin = None;
        self.events.borrow_mut().remove(NAVIGATION_START);
        self
    }

    /// Register a lifecycle event at an absolute timestamp.
    pub fn with_event(self, event: impl Into<String>, at: f64) -> Self {
        self.events.borrow_mut().insert(event.into(), at);
        self
    }

    pub fn set_now(&self, ms: f64) {
        self.now.set(ms);
    }

    pub fn advance(&self, ms: f64) {
        self.now.set(self.now.get() + ms);
    }

    /// How many times `now` was read.
    pub fn now_calls(&self) -> usize {
        self.now_calls.get()
    }

    /// Markers currently on the timeline.
    pub fn marker_count(&self) -> usize {
        self.markers.as_ref().map_or(0, MarkerBuffer::len)
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Option<f64> {
        if !self.supports_now {
            return None;
        }
        self.now_calls.set(self.now_calls.get() + 1);
        Some(self.now.get())
    }

    fn supports_markers(&self) -> bool {
        self.markers.is_some()
    }

    fn mark(&self, name: &str) {
        if let Some(markers) = &self.markers {
            markers.mark(name, self.now.get());
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
        self.origin
    }

    fn event_timestamp(&self, event: &str) -> Option<f64> {
        self.events.borrow().get(event).copied()
    }
}

/// A deadline that grants a fixed number of budget checks.
///
/// Every `time_remaining` call consumes one step; with the drain loop
/// checking once per record, `StepDeadline::new(n)` delivers at most `n`.
#[derive(Debug)]
pub struct StepDeadline {
    steps: Cell<usize>,
}

impl StepDeadline {
    pub fn new(steps: usize) -> Self {
        Self {
            steps: Cell::new(steps),
        }
    }
}

impl IdleDeadline for StepDeadline {
    fn time_remaining(&self) -> Duration {
        match self.steps.get() {
            0 => Duration::ZERO,
            n => {
                self.steps.set(n - 1);
                Duration::from_millis(1)
            }
        }
    }
}

/// Queues idle requests until the test runs them. Clones share the queue.
#[derive(Clone, Default)]
pub struct ManualIdleScheduler {
    queue: Rc<RefCell<VecDeque<(IdleCallback, IdleRequestOptions)>>>,
    requests: Rc<Cell<usize>>,
    last_options: Rc<Cell<Option<IdleRequestOptions>>>,
}

impl ManualIdleScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests issued and not yet run.
    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Total requests issued since creation.
    pub fn requests(&self) -> usize {
        self.requests.get()
    }

    pub fn last_options(&self) -> Option<IdleRequestOptions> {
        self.last_options.get()
    }

    /// Run the oldest pending request. Returns false if none was pending.
    pub fn run_next(&self, deadline: &dyn IdleDeadline) -> bool {
        // Released before the callback runs, which may request again.
        let next = self.queue.borrow_mut().pop_front();
        match next {
            Some((callback, _)) => {
                callback(deadline);
                true
            }
            None => false,
        }
    }

    /// Run slices of `steps` deliveries until nothing is pending.
    ///
    /// Returns the number of slices run; stops after `max_slices`.
    pub fn run_until_idle(&self, steps: usize, max_slices: usize) -> usize {
        let mut slices = 0;
        while slices < max_slices && self.run_next(&StepDeadline::new(steps)) {
            slices += 1;
        }
        slices
    }
}

impl IdleScheduler for ManualIdleScheduler {
    fn request_idle(&self, callback: IdleCallback, options: IdleRequestOptions) {
        self.requests.set(self.requests.get() + 1);
        self.last_options.set(Some(options));
        self.queue.borrow_mut().push_back((callback, options));
    }
}

impl std::fmt::Debug for ManualIdleScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualIdleScheduler")
            .field("pending", &self.pending())
            .field("requests", &self.requests())
            .finish()
    }
}
