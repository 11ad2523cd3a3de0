//! Action adapter.
//!
//! Translates dispatched actions (as produced by an event-driven host) into
//! calls on a [`Chronos`] instance. Actions are serde-tagged by `type` so
//! they can arrive as JSON; anything that is not a measure action is carried
//! as raw JSON and forwarded untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chronos::Chronos;
use crate::error::{ChronosError, Result};
use crate::types::Metadata;

/// A measure action the dispatcher understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MeasureAction {
    #[serde(rename = "PERFORMANCE_START_MEASURE", rename_all = "camelCase")]
    StartMeasure {
        measure_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        measure_data: Option<Metadata>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_duration: Option<f64>,
    },

    #[serde(rename = "PERFORMANCE_STOP_MEASURE", rename_all = "camelCase")]
    StopMeasure { measure_name: String },

    #[serde(rename = "MEASURE_FROM_EVENT", rename_all = "camelCase")]
    MeasureFromEvent {
        measure_name: String,
        event_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        measure_data: Option<Metadata>,
    },

    #[serde(rename = "MEASURE_FROM_NAVIGATION_START", rename_all = "camelCase")]
    MeasureFromNavigationStart {
        measure_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        measure_data: Option<Metadata>,
    },
}

impl MeasureAction {
    pub fn start(name: impl Into<String>) -> Self {
        Self::StartMeasure {
            measure_name: name.into(),
            measure_data: None,
            target_duration: None,
        }
    }

    pub fn stop(name: impl Into<String>) -> Self {
        Self::StopMeasure {
            measure_name: name.into(),
        }
    }

    pub fn from_event(name: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self::MeasureFromEvent {
            measure_name: name.into(),
            event_name: event_name.into(),
            measure_data: None,
        }
    }

    pub fn from_navigation_start(name: impl Into<String>) -> Self {
        Self::MeasureFromNavigationStart {
            measure_name: name.into(),
            measure_data: None,
        }
    }

    /// Attach metadata; ignored by actions that carry none.
    pub fn with_data(mut self, data: Metadata) -> Self {
        match &mut self {
            Self::StartMeasure { measure_data, .. }
            | Self::MeasureFromEvent { measure_data, .. }
            | Self::MeasureFromNavigationStart { measure_data, .. } => *measure_data = Some(data),
            Self::StopMeasure { .. } => {}
        }
        self
    }

    /// The wire name of this action's type.
    pub fn action_type(&self) -> &'static str {
        match self {
            Self::StartMeasure { .. } => "PERFORMANCE_START_MEASURE",
            Self::StopMeasure { .. } => "PERFORMANCE_STOP_MEASURE",
            Self::MeasureFromEvent { .. } => "MEASURE_FROM_EVENT",
            Self::MeasureFromNavigationStart { .. } => "MEASURE_FROM_NAVIGATION_START",
        }
    }
}

/// Any dispatched action: a measure action, or some other action kept as
/// the raw JSON it arrived as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Action {
    Measure(MeasureAction),
    Other(Value),
}

impl Action {
    /// The action's `type`, if it has one.
    pub fn action_type(&self) -> Option<&str> {
        match self {
            Self::Measure(action) => Some(action.action_type()),
            Self::Other(value) => value.get("type").and_then(Value::as_str),
        }
    }
}

impl From<MeasureAction> for Action {
    fn from(action: MeasureAction) -> Self {
        Self::Measure(action)
    }
}

/// Routes [`Action`]s to a [`Chronos`] instance.
#[derive(Debug, Clone)]
pub struct ActionDispatcher {
    chronos: Chronos,
}

impl ActionDispatcher {
    /// Wrap an instance. Refuses instances without a sink, since every
    /// measure they take would be lost.
    pub fn new(chronos: Chronos) -> Result<Self> {
        if !chronos.has_sink() {
            return Err(ChronosError::MissingSink);
        }
        Ok(Self { chronos })
    }

    pub fn chronos(&self) -> &Chronos {
        &self.chronos
    }

    /// Apply an action. Returns the underlying operation's result, or false
    /// for actions that are not measure actions.
    pub fn dispatch(&self, action: &Action) -> bool {
        match action {
            Action::Measure(action) => self.dispatch_measure(action),
            Action::Other(_) => {
                tracing::trace!(action = ?action.action_type(), "Ignoring non-measure action");
                false
            }
        }
    }

    /// Apply a measure action.
    pub fn dispatch_measure(&self, action: &MeasureAction) -> bool {
        tracing::trace!(action = action.action_type(), "Dispatching action");
        match action {
            MeasureAction::StartMeasure {
                measure_name,
                measure_data,
                target_duration: Some(target),
            } => self
                .chronos
                .start_with_target(measure_name, *target, measure_data.clone()),
            MeasureAction::StartMeasure {
                measure_name,
                measure_data,
                target_duration: None,
            } => self.chronos.start(measure_name, measure_data.clone()),
            MeasureAction::StopMeasure { measure_name } => self.chronos.stop(measure_name),
            MeasureAction::MeasureFromEvent {
                measure_name,
                event_name,
                measure_data,
            } => self
                .chronos
                .measure_from_event(measure_name, event_name, measure_data.clone()),
            MeasureAction::MeasureFromNavigationStart {
                measure_name,
                measure_data,
            } => self
                .chronos
                .measure_from_navigation_start(measure_name, measure_data.clone()),
        }
    }

    /// Apply an action, then always hand it, unchanged, to `next`.
    pub fn dispatch_then<T>(&self, action: Action, next: impl FnOnce(Action) -> T) -> T {
        self.dispatch(&action);
        next(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChronosConfig;
    use crate::sink::MemorySink;
    use crate::testing::{FakeClock, ManualIdleScheduler};
    use serde_json::json;
    use std::rc::Rc;

    fn dispatcher() -> (ActionDispatcher, Rc<FakeClock>, ManualIdleScheduler, MemorySink) {
        let clock = Rc::new(FakeClock::new());
        let scheduler = ManualIdleScheduler::new();
        let sink = MemorySink::new();
        let chronos = Chronos::builder()
            .with_clock(clock.clone())
            .with_scheduler(Rc::new(scheduler.clone()))
            .with_sink(sink.clone())
            .build();
        (ActionDispatcher::new(chronos).unwrap(), clock, scheduler, sink)
    }

    #[test]
    fn test_requires_sink() {
        let chronos = Chronos::new(ChronosConfig::default());
        assert!(matches!(
            ActionDispatcher::new(chronos),
            Err(ChronosError::MissingSink)
        ));
    }

    #[test]
    fn test_parse_wire_actions() {
        let action: Action = serde_json::from_value(json!({
            "type": "PERFORMANCE_START_MEASURE",
            "measureName": "checkout",
            "measureData": { "tags": ["step:1"] }
        }))
        .unwrap();
        assert_eq!(action.action_type(), Some("PERFORMANCE_START_MEASURE"));
        assert!(matches!(action, Action::Measure(MeasureAction::StartMeasure { .. })));

        let action: Action = serde_json::from_value(json!({
            "type": "MEASURE_FROM_EVENT",
            "measureName": "tti",
            "eventName": "domInteractive"
        }))
        .unwrap();
        assert_eq!(action, MeasureAction::from_event("tti", "domInteractive").into());

        let action: Action =
            serde_json::from_value(json!({ "type": "USER_LOGGED_IN", "id": 4 })).unwrap();
        assert_eq!(action.action_type(), Some("USER_LOGGED_IN"));
        assert!(matches!(action, Action::Other(_)));
    }

    #[test]
    fn test_other_actions_round_trip_unchanged() {
        let raw = json!({ "type": "USER_LOGGED_IN", "id": 4, "roles": ["admin"] });
        let action: Action = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&action).unwrap(), raw);

        // A measure type missing its fields is not a measure action.
        let partial = json!({ "type": "PERFORMANCE_STOP_MEASURE" });
        let action: Action = serde_json::from_value(partial.clone()).unwrap();
        assert_eq!(action, Action::Other(partial));
    }

    #[test]
    fn test_dispatch_start_stop() {
        let (dispatcher, clock, scheduler, sink) = dispatcher();
        let data = json!({ "route": "/cart" }).as_object().cloned().unwrap();

        assert!(dispatcher.dispatch(&MeasureAction::start("checkout").with_data(data).into()));
        clock.advance(15.0);
        assert!(dispatcher.dispatch_measure(&MeasureAction::stop("checkout")));
        assert!(!dispatcher.dispatch_measure(&MeasureAction::stop("checkout")));

        scheduler.run_until_idle(10, 10);
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].duration, 15.0);
        assert_eq!(records[0].meta("route"), Some(&json!("/cart")));
    }

    #[test]
    fn test_dispatch_target_duration() {
        let (dispatcher, _clock, scheduler, sink) = dispatcher();
        let action: Action = serde_json::from_value(json!({
            "type": "PERFORMANCE_START_MEASURE",
            "measureName": "search",
            "targetDuration": 200.0
        }))
        .unwrap();

        dispatcher.dispatch(&action);
        dispatcher.dispatch_measure(&MeasureAction::stop("search"));
        scheduler.run_until_idle(10, 10);
        assert_eq!(sink.records()[0].target_duration, Some(200.0));
    }

    #[test]
    fn test_dispatch_event_measures() {
        let (dispatcher, clock, scheduler, sink) = dispatcher();
        clock.set_now(40.0);

        assert!(dispatcher.dispatch_measure(&MeasureAction::from_navigation_start("boot")));
        assert!(!dispatcher.dispatch_measure(&MeasureAction::from_event("x", "unknownEvent")));

        scheduler.run_until_idle(10, 10);
        assert_eq!(sink.names(), vec!["boot"]);
        assert_eq!(sink.records()[0].event_name.as_deref(), Some("navigationStart"));
    }

    #[test]
    fn test_dispatch_then_forwards_every_action() {
        let (dispatcher, _clock, _scheduler, sink) = dispatcher();
        let raw = json!({ "type": "CART_UPDATED", "items": [1, 2], "total": 9.5 });
        let action: Action = serde_json::from_value(raw.clone()).unwrap();

        let forwarded = dispatcher.dispatch_then(action, |a| serde_json::to_value(a).unwrap());
        assert_eq!(forwarded, raw);
        assert!(sink.is_empty());

        let forwarded = dispatcher.dispatch_then(MeasureAction::start("a").into(), |a| a);
        assert_eq!(forwarded, Action::Measure(MeasureAction::start("a")));
        assert!(dispatcher.chronos().is_running("a"));
    }
}
