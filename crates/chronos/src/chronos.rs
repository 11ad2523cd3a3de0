//! The instrumentation context.
//!
//! A [`Chronos`] instance owns its registry, sink and flush state. It is a
//! cheap, single-threaded handle: clones share state, separate instances are
//! fully isolated.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::capabilities::Capabilities;
use crate::clock::{SharedClock, SystemClock};
use crate::config::ChronosConfig;
use crate::error::{ChronosError, Result};
use crate::metadata::ExtraData;
use crate::registry::MeasureRegistry;
use crate::scheduler::{
    FlushQueue, IdleDeadline, IdleRequestOptions, InlineIdleScheduler, QueueKind,
    SharedIdleScheduler, drain_slice,
};
use crate::sink::{SharedSink, Sink};
use crate::types::{DebugSnapshot, MeasureRecord, Metadata};

struct Inner {
    registry: MeasureRegistry,
    sink: Option<SharedSink>,
    scheduler: SharedIdleScheduler,
    idle_options: IdleRequestOptions,
    auto_save_on_stop: bool,
    debug_mode: bool,
    /// Single-flight flag: an idle request is outstanding.
    flush_scheduled: bool,
}

/// Builds a [`Chronos`] from configuration and injected capabilities.
pub struct ChronosBuilder {
    config: ChronosConfig,
    sink: Option<SharedSink>,
    clock: Option<SharedClock>,
    scheduler: Option<SharedIdleScheduler>,
}

impl ChronosBuilder {
    /// Start from `config` with no sink, the system clock and inline scheduling.
    pub fn new(config: ChronosConfig) -> Self {
        Self {
            config,
            sink: None,
            clock: None,
            scheduler: None,
        }
    }

    /// Deliver records to `sink`.
    pub fn with_sink(self, sink: impl Sink + 'static) -> Self {
        self.with_shared_sink(Rc::new(sink))
    }

    /// Deliver records to a sink shared with other owners.
    pub fn with_shared_sink(mut self, sink: SharedSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Defaults to [`SystemClock`].
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to [`InlineIdleScheduler`].
    pub fn with_scheduler(mut self, scheduler: SharedIdleScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Detect clock capabilities and create the instance.
    pub fn build(self) -> Chronos {
        let clock = self
            .clock
            .unwrap_or_else(|| Rc::new(SystemClock::new()) as SharedClock);
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Rc::new(InlineIdleScheduler::new()) as SharedIdleScheduler);
        let registry = MeasureRegistry::new(clock, ExtraData::new(self.config.global_metadata.clone()));

        Chronos {
            inner: Rc::new(RefCell::new(Inner {
                registry,
                sink: self.sink,
                scheduler,
                idle_options: self.config.idle_options(),
                auto_save_on_stop: self.config.auto_save_on_stop,
                debug_mode: self.config.debug_mode,
                flush_scheduled: false,
            })),
        }
    }
}

/// Named timing measures with idle-time delivery to a sink.
///
/// Measure operations never fail loudly: they return `false` when the clock
/// lacks support or a stop has no matching start. Only
/// [`save_to_store`](Chronos::save_to_store) without a sink is an error.
#[derive(Clone)]
pub struct Chronos {
    inner: Rc<RefCell<Inner>>,
}

impl Chronos {
    /// A builder with default configuration.
    pub fn builder() -> ChronosBuilder {
        ChronosBuilder::new(ChronosConfig::default())
    }

    /// An instance with default configuration, system clock and inline
    /// scheduling.
    pub fn new(config: ChronosConfig) -> Self {
        ChronosBuilder::new(config).build()
    }

    /// Start a measure.
    ///
    /// Starting a name that is already running replaces its start time and
    /// metadata. In marker mode the earlier start marker is abandoned on the
    /// clock's timeline and released with the other residual markers after
    /// the next complete flush.
    pub fn start(&self, name: &str, metadata: Option<Metadata>) -> bool {
        self.start_measure(name, None, metadata)
    }

    /// Start a measure with an expected duration, reported as
    /// `target_duration` on the record.
    pub fn start_with_target(&self, name: &str, target_ms: f64, metadata: Option<Metadata>) -> bool {
        self.start_measure(name, Some(target_ms), metadata)
    }

    fn start_measure(&self, name: &str, target: Option<f64>, metadata: Option<Metadata>) -> bool {
        let mut inner = self.inner.borrow_mut();
        let started = inner.registry.start(name, target, metadata);
        if !started && inner.debug_mode {
            tracing::debug!(measure = %name, "High resolution time unsupported, start skipped");
        }
        started
    }

    /// Stop a running measure and queue it for delivery.
    ///
    /// Returns false when `name` is not running.
    pub fn stop(&self, name: &str) -> bool {
        let stopped = {
            let mut inner = self.inner.borrow_mut();
            let stopped = inner.registry.stop(name);
            if !stopped && inner.debug_mode {
                tracing::debug!(measure = %name, "Stop without matching start");
            }
            stopped
        };
        if stopped {
            self.auto_save();
        }
        stopped
    }

    /// Measure from a lifecycle event until now.
    pub fn measure_from_event(&self, name: &str, event_name: &str, metadata: Option<Metadata>) -> bool {
        let measured = {
            let mut inner = self.inner.borrow_mut();
            let measured = inner.registry.measure_from_event(name, event_name, metadata);
            if !measured && inner.debug_mode {
                tracing::debug!(measure = %name, event = %event_name, "Event measure skipped");
            }
            measured
        };
        if measured {
            self.auto_save();
        }
        measured
    }

    /// Measure from the clock origin until now.
    pub fn measure_from_navigation_start(&self, name: &str, metadata: Option<Metadata>) -> bool {
        self.measure_from_event(name, crate::clock::NAVIGATION_START, metadata)
    }

    fn auto_save(&self) {
        let (enabled, has_sink) = {
            let inner = self.inner.borrow();
            (inner.auto_save_on_stop, inner.sink.is_some())
        };
        if !enabled {
            return;
        }
        if !has_sink {
            tracing::debug!("Auto-save skipped, no sink configured");
            return;
        }
        if let Err(e) = self.save_to_store() {
            tracing::debug!(error = %e, "Auto-save failed");
        }
    }

    /// Deliver every queued measure to the sink during idle time.
    ///
    /// Fails immediately, before anything is scheduled, if no sink is
    /// configured. A request while one is already outstanding is coalesced.
    pub fn save_to_store(&self) -> Result<()> {
        {
            let inner = self.inner.borrow();
            if inner.sink.is_none() {
                return Err(ChronosError::MissingSink);
            }
            if inner.registry.pending() == 0 {
                tracing::trace!("Nothing to flush");
                return Ok(());
            }
        }
        self.schedule_flush();
        Ok(())
    }

    fn schedule_flush(&self) {
        let (scheduler, options) = {
            let mut inner = self.inner.borrow_mut();
            if inner.flush_scheduled {
                tracing::trace!("Flush already scheduled");
                return;
            }
            inner.flush_scheduled = true;
            (inner.scheduler.clone(), inner.idle_options)
        };

        let handle: Weak<RefCell<Inner>> = Rc::downgrade(&self.inner);
        scheduler.request_idle(
            Box::new(move |deadline| {
                if let Some(inner) = handle.upgrade() {
                    Chronos { inner }.run_slice(deadline);
                }
            }),
            options,
        );
    }

    fn run_slice(&self, deadline: &dyn IdleDeadline) {
        let sink = {
            let mut inner = self.inner.borrow_mut();
            inner.flush_scheduled = false;
            inner.sink.clone()
        };
        let Some(sink) = sink else {
            return;
        };

        let report = drain_slice(&Queues(self), sink.as_ref(), deadline);
        if report.aborted {
            return;
        }

        let remaining = self.pending_count();
        tracing::debug!(
            delivered = report.delivered,
            remaining,
            timed_out = deadline.did_timeout(),
            "Idle slice finished"
        );

        if remaining > 0 {
            self.schedule_flush();
        } else if !self.inner.borrow_mut().registry.release_markers() {
            tracing::trace!("Measures still running, marker cleanup deferred");
        }
    }

    /// Replace the sink.
    pub fn set_sink(&self, sink: impl Sink + 'static) {
        self.inner.borrow_mut().sink = Some(Rc::new(sink));
    }

    /// Whether a sink is configured.
    pub fn has_sink(&self) -> bool {
        self.inner.borrow().sink.is_some()
    }

    /// Toggle logging of skipped operations.
    pub fn set_debug_mode(&self, enabled: bool) {
        self.inner.borrow_mut().debug_mode = enabled;
    }

    /// Whether skipped operations are logged.
    pub fn debug_mode(&self) -> bool {
        self.inner.borrow().debug_mode
    }

    /// Clock capabilities detected at construction.
    pub fn capabilities(&self) -> Capabilities {
        self.inner.borrow().registry.capabilities()
    }

    /// Whether `name` has been started and not yet stopped.
    pub fn is_running(&self, name: &str) -> bool {
        self.inner.borrow().registry.is_running(name)
    }

    /// Measures stopped or synthesized but not yet delivered.
    pub fn pending_count(&self) -> usize {
        self.inner.borrow().registry.pending()
    }

    /// Whether an idle request is outstanding.
    pub fn is_flush_scheduled(&self) -> bool {
        self.inner.borrow().flush_scheduled
    }

    /// Copy of the current internal state.
    pub fn debug_snapshot(&self) -> DebugSnapshot {
        let inner = self.inner.borrow();
        let registry = &inner.registry;
        DebugSnapshot {
            capabilities: registry.capabilities(),
            debug_mode: inner.debug_mode,
            flush_scheduled: inner.flush_scheduled,
            running: registry.running_entries(),
            stored: registry.stored_names(),
            special: registry.special_names(),
            global_metadata: registry.extra().global().clone(),
            pending_metadata: registry.pending_metadata(),
        }
    }
}

/// Drain-side view of an instance's queues.
struct Queues<'a>(&'a Chronos);

impl FlushQueue for Queues<'_> {
    fn is_empty(&self, kind: QueueKind) -> bool {
        let inner = self.0.inner.borrow();
        match kind {
            QueueKind::Stored => inner.registry.stored_len() == 0,
            QueueKind::Special => inner.registry.special_len() == 0,
        }
    }

    fn pop(&self, kind: QueueKind) -> Option<MeasureRecord> {
        let mut inner = self.0.inner.borrow_mut();
        match kind {
            QueueKind::Stored => inner.registry.pop_stored(),
            QueueKind::Special => inner.registry.pop_special(),
        }
    }
}

impl std::fmt::Debug for Chronos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Chronos")
            .field("mode", &inner.registry.capabilities().mode())
            .field("running", &inner.registry.running_len())
            .field("pending", &inner.registry.pending())
            .field("flush_scheduled", &inner.flush_scheduled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use crate::sink::MemorySink;
    use crate::scheduler::SliceDeadline;
    use crate::testing::{FakeClock, ManualIdleScheduler, StepDeadline};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        chronos: Chronos,
        clock: Rc<FakeClock>,
        scheduler: ManualIdleScheduler,
        sink: MemorySink,
    }

    fn harness(config: ChronosConfig, clock: FakeClock) -> Harness {
        let clock = Rc::new(clock);
        let scheduler = ManualIdleScheduler::new();
        let sink = MemorySink::new();
        let chronos = ChronosBuilder::new(config)
            .with_clock(clock.clone())
            .with_scheduler(Rc::new(scheduler.clone()))
            .with_sink(sink.clone())
            .build();
        Harness {
            chronos,
            clock,
            scheduler,
            sink,
        }
    }

    fn manual_save() -> ChronosConfig {
        ChronosConfig::default().with_auto_save(false)
    }

    #[test]
    fn test_start_stop_delivers_one_record() {
        for clock in [FakeClock::new(), FakeClock::new().without_markers()] {
            let h = harness(ChronosConfig::default(), clock);
            assert!(h.chronos.start("foo", None));
            h.clock.advance(8.0);
            assert!(h.chronos.stop("foo"));

            assert_eq!(h.scheduler.pending(), 1);
            h.scheduler.run_until_idle(10, 10);

            let records = h.sink.records();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].name, "foo");
            assert_eq!(records[0].duration, 8.0);
            assert_eq!(h.chronos.pending_count(), 0);
        }
    }

    #[test]
    fn test_unmatched_stop() {
        let h = harness(ChronosConfig::default().with_debug_mode(true), FakeClock::new());
        assert!(!h.chronos.stop("foo"));
        assert_eq!(h.scheduler.requests(), 0);
        assert!(h.sink.is_empty());
    }

    #[test]
    fn test_missing_sink_fails_before_scheduling() {
        let scheduler = ManualIdleScheduler::new();
        let chronos = Chronos::builder()
            .with_clock(Rc::new(FakeClock::new()))
            .with_scheduler(Rc::new(scheduler.clone()))
            .build();

        chronos.start("foo", None);
        // Auto-save is skipped without a sink.
        assert!(chronos.stop("foo"));
        assert!(matches!(chronos.save_to_store(), Err(ChronosError::MissingSink)));
        assert_eq!(scheduler.requests(), 0);
        assert_eq!(chronos.pending_count(), 1);
    }

    #[test]
    fn test_single_flight() {
        let h = harness(manual_save(), FakeClock::new());
        h.chronos.start("a", None);
        h.chronos.stop("a");

        h.chronos.save_to_store().unwrap();
        h.chronos.save_to_store().unwrap();
        assert!(h.chronos.is_flush_scheduled());
        assert_eq!(h.scheduler.requests(), 1);

        h.scheduler.run_until_idle(10, 10);
        assert!(!h.chronos.is_flush_scheduled());
        assert_eq!(h.sink.len(), 1);
    }

    #[test]
    fn test_budget_exhaustion_requeues() {
        let h = harness(manual_save(), FakeClock::new().without_markers());
        for name in ["a", "b", "c"] {
            h.chronos.start(name, None);
            h.chronos.stop(name);
        }
        h.chronos.measure_from_navigation_start("boot", None);

        h.chronos.save_to_store().unwrap();
        assert!(h.scheduler.run_next(&StepDeadline::new(2)));
        assert_eq!(h.sink.names(), vec!["a", "b"]);
        assert_eq!(h.scheduler.pending(), 1);

        assert!(h.scheduler.run_next(&StepDeadline::new(2)));
        assert_eq!(h.sink.names(), vec!["a", "b", "c", "boot"]);
        assert_eq!(h.scheduler.pending(), 0);
        assert_eq!(h.scheduler.requests(), 2);
    }

    #[test]
    fn test_idempotent_save_after_full_flush() {
        let h = harness(manual_save(), FakeClock::new());
        h.chronos.start("a", None);
        h.chronos.stop("a");
        h.chronos.save_to_store().unwrap();
        h.scheduler.run_until_idle(10, 10);

        h.chronos.save_to_store().unwrap();
        assert_eq!(h.scheduler.pending(), 0);
        assert_eq!(h.scheduler.requests(), 1);
        assert_eq!(h.sink.len(), 1);
        assert_eq!(h.clock.marker_count(), 0);
    }

    #[test]
    fn test_marker_cleanup_deferred_while_running() {
        let h = harness(manual_save(), FakeClock::new());
        h.chronos.start("open", None);
        h.chronos.start("closed", None);
        h.chronos.stop("closed");

        h.chronos.save_to_store().unwrap();
        h.scheduler.run_until_idle(10, 10);
        assert_eq!(h.sink.len(), 1);
        assert_eq!(h.clock.marker_count(), 3);

        h.chronos.stop("open");
        h.chronos.save_to_store().unwrap();
        h.scheduler.run_until_idle(10, 10);
        assert_eq!(h.sink.len(), 2);
        assert_eq!(h.clock.marker_count(), 0);
    }

    #[test]
    fn test_metadata_merged_and_discarded() {
        let global = json!({ "tags": ["bar:bar"], "env": "prod" });
        let config = ChronosConfig::default()
            .with_global_metadata(global.as_object().cloned().unwrap());
        let h = harness(config, FakeClock::new());

        let meta = json!({ "tags": ["bar:foobar", "bar:bar"], "foo": "foo" });
        h.chronos.start("foo", meta.as_object().cloned());

        let snapshot = h.chronos.debug_snapshot();
        assert_eq!(
            snapshot.pending_metadata["foo"]["tags"],
            json!(["bar:foobar", "bar:bar"])
        );
        assert_eq!(snapshot.global_metadata["tags"], json!(["bar:bar"]));

        h.chronos.stop("foo");
        h.scheduler.run_until_idle(10, 10);

        let record = &h.sink.records()[0];
        assert_eq!(record.meta("foo"), Some(&json!("foo")));
        assert!(record.meta("env").is_none());
        assert!(h.chronos.debug_snapshot().pending_metadata.is_empty());
    }

    #[test]
    fn test_no_clock_support_delivers_nothing() {
        let h = harness(ChronosConfig::default(), FakeClock::new().without_now());
        assert!(!h.chronos.start("foo", None));
        assert!(!h.chronos.stop("foo"));
        assert!(!h.chronos.measure_from_event("foo", "navigationStart", None));
        assert!(!h.chronos.measure_from_navigation_start("foo", None));
        h.chronos.save_to_store().unwrap();

        assert_eq!(h.scheduler.requests(), 0);
        assert!(h.sink.is_empty());
    }

    #[test]
    fn test_timed_out_slices_progress_with_no_time_left() {
        let h = harness(manual_save(), FakeClock::new());
        for name in ["a", "b", "c"] {
            h.chronos.start(name, None);
            h.chronos.stop(name);
        }
        h.chronos.save_to_store().unwrap();

        let spent = SliceDeadline::new(Duration::ZERO).timed_out();
        let mut slices = 0;
        while h.scheduler.run_next(&spent) {
            slices += 1;
            assert!(slices <= 3, "flush did not progress");
        }
        assert_eq!(slices, 3);
        assert_eq!(h.sink.names(), vec!["a", "b", "c"]);
        assert!(!h.chronos.is_flush_scheduled());
        assert_eq!(h.clock.marker_count(), 0);
    }

    #[test]
    fn test_inline_zero_budget_requeues_iteratively() {
        let sink = MemorySink::new();
        let chronos = ChronosBuilder::new(manual_save())
            .with_clock(Rc::new(FakeClock::new().without_markers()))
            .with_scheduler(Rc::new(InlineIdleScheduler::with_budget(Duration::ZERO)))
            .with_sink(sink.clone())
            .build();

        for i in 0..5_000 {
            let name = format!("m{i}");
            chronos.start(&name, None);
            chronos.stop(&name);
        }
        chronos.save_to_store().unwrap();

        assert_eq!(sink.len(), 5_000);
        assert_eq!(chronos.pending_count(), 0);
        assert!(!chronos.is_flush_scheduled());

        // Auto-save on stop drains the same way.
        let auto = ChronosBuilder::new(ChronosConfig::default())
            .with_clock(Rc::new(FakeClock::new()))
            .with_scheduler(Rc::new(InlineIdleScheduler::with_budget(Duration::ZERO)))
            .with_sink(sink.clone())
            .build();
        auto.start("a", None);
        assert!(auto.stop("a"));
        assert_eq!(sink.len(), 5_001);
    }

    #[test]
    fn test_sink_error_aborts_slice() {
        let clock = Rc::new(FakeClock::new().without_markers());
        let scheduler = ManualIdleScheduler::new();
        let chronos = ChronosBuilder::new(manual_save())
            .with_clock(clock)
            .with_scheduler(Rc::new(scheduler.clone()))
            .with_sink(|_r: MeasureRecord| -> std::result::Result<(), SinkError> {
                Err(SinkError::Rejected("offline".to_string()))
            })
            .build();

        for name in ["a", "b"] {
            chronos.start(name, None);
            chronos.stop(name);
        }
        chronos.save_to_store().unwrap();
        scheduler.run_until_idle(10, 10);

        // The failing record is gone, the rest wait for the next save.
        assert_eq!(scheduler.requests(), 1);
        assert_eq!(chronos.pending_count(), 1);
        assert!(!chronos.is_flush_scheduled());
    }

    #[test]
    fn test_sink_may_reenter() {
        let scheduler = ManualIdleScheduler::new();
        let chronos = ChronosBuilder::new(ChronosConfig::default())
            .with_clock(Rc::new(FakeClock::new()))
            .with_scheduler(Rc::new(scheduler.clone()))
            .build();

        let handle = chronos.clone();
        let sink = MemorySink::new();
        let collected = sink.clone();
        chronos.set_sink(move |r: MeasureRecord| -> std::result::Result<(), SinkError> {
            handle.is_running(&r.name);
            collected.store(r)
        });

        chronos.start("a", None);
        chronos.stop("a");
        scheduler.run_until_idle(10, 10);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_idle_request_carries_timeout() {
        let config = ChronosConfig::default().with_idle_timeout(std::time::Duration::from_millis(300));
        let h = harness(config, FakeClock::new());
        h.chronos.start("a", None);
        h.chronos.stop("a");
        assert_eq!(
            h.scheduler.last_options().unwrap().timeout,
            std::time::Duration::from_millis(300)
        );
    }

    #[test]
    fn test_dropped_instance_ignores_pending_slice() {
        let h = harness(ChronosConfig::default(), FakeClock::new());
        h.chronos.start("a", None);
        h.chronos.stop("a");
        drop(h.chronos);
        assert_eq!(h.scheduler.run_until_idle(10, 10), 1);
        assert!(h.sink.is_empty());
    }
}
