//! Capability detection for an injected clock provider.

use serde::Serialize;

use crate::clock::Clock;

/// What a clock provider supports, detected once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Capabilities {
    /// High-resolution `now` is available. Without it every measure
    /// operation is silently skipped.
    pub supports_now: bool,

    /// Named interval markers are available (marker mode). Otherwise
    /// durations are computed from two `now` readings (wall-clock mode).
    pub supports_markers: bool,

    /// Absolute timestamp of the clock origin, if known.
    pub origin_timestamp: Option<f64>,
}

impl Capabilities {
    pub fn detect(clock: &dyn Clock) -> Self {
        let supports_now = clock.now().is_some();
        Self {
            supports_now,
            supports_markers: supports_now && clock.supports_markers(),
            origin_timestamp: clock.time_origin(),
        }
    }

    /// Name of the timing strategy in use, for logging.
    pub fn mode(&self) -> &'static str {
        match (self.supports_now, self.supports_markers) {
            (false, _) => "disabled",
            (true, true) => "marker",
            (true, false) => "wall-clock",
        }
    }
}
