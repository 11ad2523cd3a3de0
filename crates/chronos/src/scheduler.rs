//! Idle-time flush scheduling.
//!
//! The host grants bounded idle slices through an [`IdleScheduler`]. Each
//! slice runs [`drain_slice`], which delivers queued records to the sink until
//! the slice budget runs out. Re-queueing and the single-flight flag live on
//! [`Chronos`](crate::Chronos); this module only knows about slices.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::sink::Sink;
use crate::types::MeasureRecord;

/// Default maximum deferral for an idle request.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Budget granted to a slice by the built-in schedulers.
pub const DEFAULT_SLICE_BUDGET: Duration = Duration::from_millis(50);

/// Remaining-time budget of one idle slice.
pub trait IdleDeadline {
    /// Time left in this slice. Zero means the slice is over.
    fn time_remaining(&self) -> Duration;

    /// Whether the slice was forced by the request timeout.
    fn did_timeout(&self) -> bool {
        false
    }
}

/// Work to run when the host grants an idle slice.
pub type IdleCallback = Box<dyn FnOnce(&dyn IdleDeadline)>;

/// Options attached to every idle request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleRequestOptions {
    /// The host must run the callback within this window, idle or not.
    pub timeout: Duration,
}

impl Default for IdleRequestOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Host capability that runs callbacks during idle time.
///
/// A request is never cancelled: once issued, the callback eventually runs.
pub trait IdleScheduler {
    fn request_idle(&self, callback: IdleCallback, options: IdleRequestOptions);
}

/// Type alias for a shared idle scheduler.
pub type SharedIdleScheduler = Rc<dyn IdleScheduler>;

/// A deadline measured from the moment the slice started.
#[derive(Debug, Clone, Copy)]
pub struct SliceDeadline {
    started: Instant,
    budget: Duration,
    did_timeout: bool,
}

impl SliceDeadline {
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
            did_timeout: false,
        }
    }

    pub fn timed_out(mut self) -> Self {
        self.did_timeout = true;
        self
    }
}

impl IdleDeadline for SliceDeadline {
    fn time_remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    fn did_timeout(&self) -> bool {
        self.did_timeout
    }
}

/// A deadline that never runs out.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnboundedDeadline;

impl IdleDeadline for UnboundedDeadline {
    fn time_remaining(&self) -> Duration {
        Duration::MAX
    }
}

/// Slice deadline for a built-in scheduler. A zero budget can never deliver
/// on its own, so such slices are forced.
fn budget_deadline(budget: Duration) -> SliceDeadline {
    let deadline = SliceDeadline::new(budget);
    if budget.is_zero() {
        deadline.timed_out()
    } else {
        deadline
    }
}

/// Runs each callback on the calling thread, as soon as it is requested.
///
/// Useful for short-lived hosts (CLIs, tests) with no event loop to yield to.
/// Requests issued from inside a running callback are queued and run by the
/// outermost call once the current callback returns, so re-queued slices
/// never nest.
pub struct InlineIdleScheduler {
    budget: Option<Duration>,
    pending: RefCell<VecDeque<IdleCallback>>,
    running: Cell<bool>,
}

impl InlineIdleScheduler {
    /// Slices get the default 50 ms budget.
    pub fn new() -> Self {
        Self::with_budget_option(Some(DEFAULT_SLICE_BUDGET))
    }

    /// Slices never run out of budget.
    pub fn unbounded() -> Self {
        Self::with_budget_option(None)
    }

    /// Slices get `budget`; a zero budget delivers one record per slice.
    pub fn with_budget(budget: Duration) -> Self {
        Self::with_budget_option(Some(budget))
    }

    fn with_budget_option(budget: Option<Duration>) -> Self {
        Self {
            budget,
            pending: RefCell::new(VecDeque::new()),
            running: Cell::new(false),
        }
    }

    /// Requests waiting behind the callback currently running.
    pub fn pending(&self) -> usize {
        self.pending.borrow().len()
    }
}

impl Default for InlineIdleScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleScheduler for InlineIdleScheduler {
    fn request_idle(&self, callback: IdleCallback, _options: IdleRequestOptions) {
        self.pending.borrow_mut().push_back(callback);
        if self.running.replace(true) {
            return;
        }

        loop {
            // Released before the callback runs, which may request again.
            let next = self.pending.borrow_mut().pop_front();
            let Some(callback) = next else {
                break;
            };
            match self.budget {
                Some(budget) => callback(&budget_deadline(budget)),
                None => callback(&UnboundedDeadline),
            }
        }
        self.running.set(false);
    }
}

impl std::fmt::Debug for InlineIdleScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InlineIdleScheduler")
            .field("budget", &self.budget)
            .field("pending", &self.pending())
            .field("running", &self.running.get())
            .finish()
    }
}

/// Schedules slices as local tasks on the current tokio `LocalSet`.
///
/// Each request yields to the runtime for at most `delay` (capped by the
/// request timeout) and then runs with a fresh budget. Requests must be
/// issued from inside a `LocalSet`; `spawn_local` panics otherwise.
#[derive(Debug, Clone, Copy)]
pub struct LocalIdleScheduler {
    delay: Duration,
    budget: Duration,
}

impl LocalIdleScheduler {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(1),
            budget: DEFAULT_SLICE_BUDGET,
        }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Default for LocalIdleScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleScheduler for LocalIdleScheduler {
    fn request_idle(&self, callback: IdleCallback, options: IdleRequestOptions) {
        let delay = self.delay.min(options.timeout);
        let budget = self.budget;
        tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            let mut deadline = budget_deadline(budget);
            if delay == options.timeout {
                deadline = deadline.timed_out();
            }
            callback(&deadline);
        });
    }
}

/// Which delivery queue a record comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Stored,
    Special,
}

/// Source of records for a drain slice.
pub trait FlushQueue {
    fn is_empty(&self, kind: QueueKind) -> bool;

    /// Pop and realize the next record, or `None` once the queue is empty.
    fn pop(&self, kind: QueueKind) -> Option<MeasureRecord>;
}

/// Outcome of one drain slice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliceReport {
    pub delivered: usize,
    /// The sink failed and the slice stopped early.
    pub aborted: bool,
}

/// Deliver records until both queues are empty or the budget is spent.
///
/// Stored measures go first, then special measures under whatever budget is
/// left. A slice forced by its timeout delivers at least one record even with
/// no time remaining, so a flush always progresses. A sink error ends the
/// slice; the failing record is not retried.
pub fn drain_slice(
    queue: &dyn FlushQueue,
    sink: &dyn Sink,
    deadline: &dyn IdleDeadline,
) -> SliceReport {
    let mut report = SliceReport::default();
    let forced = deadline.did_timeout();

    for kind in [QueueKind::Stored, QueueKind::Special] {
        while !queue.is_empty(kind)
            && ((forced && report.delivered == 0) || !deadline.time_remaining().is_zero())
        {
            let Some(record) = queue.pop(kind) else {
                break;
            };
            let name = record.name.clone();
            if let Err(e) = sink.store(record) {
                tracing::warn!(measure = %name, error = %e, "Sink failed, aborting idle slice");
                report.aborted = true;
                return report;
            }
            tracing::trace!(measure = %name, "Delivered measure");
            report.delivered += 1;
        }
    }

    report
}
