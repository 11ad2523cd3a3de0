//! End-to-end tests
//!
//! These tests drive full flows through the public API: configuration from
//! disk, measures through the tokio idle scheduler, and records out to a
//! JSON-lines file.

use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::io::BufReader;
use std::rc::Rc;
use std::time::Duration;

use chronos::{
    Action, ActionDispatcher, ChronosBuilder, ChronosConfig, JsonLinesSink, LocalIdleScheduler,
    MeasureRecord, SinkError, SystemClock, read_records,
};
use serde_json::json;

/// Wait for the outstanding flush, including re-queued slices, to finish.
async fn wait_for_flush(chronos: &chronos::Chronos) {
    for _ in 0..1000 {
        if !chronos.is_flush_scheduled() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("flush did not finish");
}

fn read_back(path: &std::path::Path) -> Vec<MeasureRecord> {
    read_records(BufReader::new(File::open(path).unwrap())).unwrap()
}

/// E2E Test: config file -> local scheduler -> JSON-lines file
///
/// 1. Instance options come from a TOML file
/// 2. Measures are flushed in idle slices on a `LocalSet`
/// 3. Records read back from disk carry merged metadata
#[tokio::test]
async fn test_e2e_config_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.toml");
    std::fs::write(
        &config_path,
        r#"
idle_timeout_ms = 500

[global_metadata]
tags = ["app:e2e"]
release = "1.0.0"
"#,
    )
    .unwrap();
    let config = ChronosConfig::from_file(&config_path).unwrap();

    let out = dir.path().join("measures.jsonl");
    let file = OpenOptions::new().create(true).append(true).open(&out).unwrap();

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let clock = Rc::new(SystemClock::new());
            let chronos = ChronosBuilder::new(config)
                .with_clock(clock.clone())
                .with_scheduler(Rc::new(LocalIdleScheduler::new()))
                .with_sink(JsonLinesSink::new(file))
                .build();
            assert_eq!(chronos.capabilities().mode(), "marker");

            chronos.start("search", json!({ "tags": ["page:results"] }).as_object().cloned());
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(chronos.stop("search"));

            clock.record_event("domInteractive");
            assert!(chronos.measure_from_event("tti", "domInteractive", None));

            wait_for_flush(&chronos).await;
            assert_eq!(chronos.pending_count(), 0);
        })
        .await;

    let records = read_back(&out);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].name, "search");
    assert!(records[0].duration >= 5.0);
    assert_eq!(records[0].meta("tags"), Some(&json!(["page:results", "app:e2e"])));
    assert_eq!(records[0].meta("release"), None);
    assert_eq!(records[1].name, "tti");
    assert_eq!(records[1].event_name.as_deref(), Some("domInteractive"));
    assert!(records[1].origin_reference.is_some());
}

/// E2E Test: small slice budget spreads a large batch across slices
#[tokio::test]
async fn test_e2e_small_budget_delivers_everything() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("measures.jsonl");
    let file = File::create(&out).unwrap();

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let chronos = ChronosBuilder::new(ChronosConfig::default().with_auto_save(false))
                .with_clock(Rc::new(SystemClock::without_markers()))
                .with_scheduler(Rc::new(
                    LocalIdleScheduler::new().with_budget(Duration::from_millis(1)),
                ))
                .with_sink(JsonLinesSink::new(file))
                .build();
            assert_eq!(chronos.capabilities().mode(), "wall-clock");

            for i in 0..200 {
                let name = format!("item-{i}");
                chronos.start(&name, None);
                chronos.stop(&name);
            }
            chronos.save_to_store().unwrap();
            wait_for_flush(&chronos).await;
            assert_eq!(chronos.pending_count(), 0);
        })
        .await;

    let records = read_back(&out);
    assert_eq!(records.len(), 200);
    assert_eq!(records[0].name, "item-0");
    assert_eq!(records[199].name, "item-199");
}

/// E2E Test: dispatched JSON actions produce records
#[tokio::test]
async fn test_e2e_action_dispatch() {
    let delivered = Rc::new(Cell::new(0));
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let counter = delivered.clone();
            let chronos = ChronosBuilder::new(ChronosConfig::default())
                .with_scheduler(Rc::new(LocalIdleScheduler::new()))
                .with_sink(move |record: MeasureRecord| -> Result<(), SinkError> {
                    assert_eq!(record.name, "checkout");
                    assert_eq!(record.target_duration, Some(100.0));
                    counter.set(counter.get() + 1);
                    Ok(())
                })
                .build();
            let dispatcher = ActionDispatcher::new(chronos.clone()).unwrap();

            let wire = [
                json!({ "type": "PERFORMANCE_START_MEASURE", "measureName": "checkout", "targetDuration": 100.0 }),
                json!({ "type": "CART_UPDATED" }),
                json!({ "type": "PERFORMANCE_STOP_MEASURE", "measureName": "checkout" }),
            ];
            let applied = wire
                .into_iter()
                .map(|value| serde_json::from_value::<Action>(value).unwrap())
                .filter(|action| dispatcher.dispatch(action))
                .count();
            assert_eq!(applied, 2);

            wait_for_flush(&chronos).await;
        })
        .await;

    assert_eq!(delivered.get(), 1);
}

/// E2E Test: a failing sink aborts the slice and keeps the rest queued
#[tokio::test]
async fn test_e2e_sink_failure_keeps_remaining() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let calls = Rc::new(Cell::new(0));
            let counter = calls.clone();
            let chronos = ChronosBuilder::new(ChronosConfig::default().with_auto_save(false))
                .with_scheduler(Rc::new(LocalIdleScheduler::new()))
                .with_sink(move |_record: MeasureRecord| -> Result<(), SinkError> {
                    counter.set(counter.get() + 1);
                    Err(SinkError::Rejected("store offline".to_string()))
                })
                .build();

            for name in ["a", "b", "c"] {
                chronos.start(name, None);
                chronos.stop(name);
            }
            chronos.save_to_store().unwrap();
            wait_for_flush(&chronos).await;

            assert_eq!(calls.get(), 1);
            assert_eq!(chronos.pending_count(), 2);
            assert!(!chronos.is_flush_scheduled());
        })
        .await;
}
