//! Named timing measures with budget-bounded, idle-time delivery.
//!
//! This crate brackets named spans, derives spans from lifecycle event
//! timestamps, attaches metadata, and hands completed measurements to a sink
//! without blocking interactive work:
//!
//! - **Clock**: injected `Clock` provider, detected once into `Capabilities`
//! - **Registry**: running, stored and event-derived measures
//! - **Metadata**: global/per-measure merge
//! - **Scheduler**: single-flight flush in host-granted idle slices
//! - **Actions**: adapter from dispatched actions to measure calls
//!
//! # Usage
//!
//! ```rust
//! use chronos::{Chronos, InlineIdleScheduler, MemorySink};
//! use std::rc::Rc;
//!
//! let sink = MemorySink::new();
//! let chronos = Chronos::builder()
//!     .with_sink(sink.clone())
//!     .with_scheduler(Rc::new(InlineIdleScheduler::unbounded()))
//!     .build();
//!
//! chronos.start("render", None);
//! // Do work...
//! chronos.stop("render");
//!
//! assert_eq!(sink.names(), vec!["render"]);
//! ```
//!
//! # Metadata
//!
//! Array values are unioned with the global metadata, measure values first:
//!
//! ```rust
//! use chronos::{Chronos, ChronosConfig};
//! use serde_json::json;
//!
//! let global = json!({ "tags": ["app:web"] }).as_object().cloned().unwrap();
//! let chronos = Chronos::new(ChronosConfig::default().with_global_metadata(global));
//!
//! chronos.start("search", json!({ "tags": ["page:results"] }).as_object().cloned());
//! let snapshot = chronos.debug_snapshot();
//! assert_eq!(
//!     snapshot.pending_metadata["search"]["tags"],
//!     json!(["page:results", "app:web"])
//! );
//! ```

pub mod actions;
pub mod capabilities;
pub mod chronos;
pub mod clock;
pub mod config;
pub mod error;
pub mod metadata;
pub mod registry;
pub mod scheduler;
pub mod sink;
pub mod testing;
pub mod types;

// Re-export main types
pub use actions::{Action, ActionDispatcher, MeasureAction};
pub use capabilities::Capabilities;
pub use chronos::{Chronos, ChronosBuilder};
pub use clock::{Clock, MarkerBuffer, MarkerSpan, NAVIGATION_START, SharedClock, SystemClock};
pub use config::ChronosConfig;
pub use error::{ChronosError, Result, SinkError};
pub use metadata::ExtraData;
pub use scheduler::{
    IdleCallback, IdleDeadline, IdleRequestOptions, IdleScheduler, InlineIdleScheduler,
    LocalIdleScheduler, SharedIdleScheduler, SliceDeadline, UnboundedDeadline,
};
pub use sink::{JsonLinesSink, MemorySink, SharedSink, Sink, read_records};
pub use types::{DebugSnapshot, Measure, MeasureRecord, Metadata, RunningEntry, SpecialMeasure};
