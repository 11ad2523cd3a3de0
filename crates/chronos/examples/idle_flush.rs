//! Demo of idle-time flushing on a tokio `LocalSet`, simulating a page load
//! followed by a few user interactions. Records are printed as JSON lines.

use std::rc::Rc;
use std::time::Duration;

use chronos::{ChronosBuilder, ChronosConfig, JsonLinesSink, LocalIdleScheduler, Metadata, SystemClock};
use serde_json::json;

fn tags(values: &[&str]) -> Option<Metadata> {
    json!({ "tags": values }).as_object().cloned()
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let local = tokio::task::LocalSet::new();

    local
        .run_until(async {
            let clock = Rc::new(SystemClock::new());
            let config = ChronosConfig::default()
                .with_global_metadata(tags(&["app:demo"]).unwrap_or_default());
            let chronos = ChronosBuilder::new(config)
                .with_clock(clock.clone())
                .with_scheduler(Rc::new(
                    LocalIdleScheduler::new().with_budget(Duration::from_millis(5)),
                ))
                .with_sink(JsonLinesSink::stdout())
                .build();

            tokio::time::sleep(Duration::from_millis(12)).await;
            clock.record_event("domInteractive");
            chronos.measure_from_event("time_to_interactive", "domInteractive", tags(&["phase:load"]));

            for step in ["search", "filter", "checkout"] {
                let step_tag = format!("step:{step}");
                chronos.start_with_target(step, 10.0, tags(&[step_tag.as_str()]));
                tokio::time::sleep(Duration::from_millis(3)).await;
                chronos.stop(step);
            }

            chronos.measure_from_navigation_start("session_active", None);

            // Let the idle slices run.
            tokio::time::sleep(Duration::from_millis(50)).await;
            eprintln!("pending after flush: {}", chronos.pending_count());
        })
        .await;
}
