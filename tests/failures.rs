//! tests/failures.rs
//! Fatal topology errors, connectivity retries, timeouts and executor failures.

mod common;

use std::time::Duration as StdDuration;

use crate::common::{eventually, setup_tracing, wait_for_run_state, Harness, Step};

use repairkeeper::{RunState, SegmentState};

#[tokio::test]
async fn test_unmappable_range_moves_run_to_error() {
  setup_tracing();
  let harness = Harness::new(StdDuration::from_millis(5));
  harness.topology.clear_ring();
  let run = harness.seed_run(3, 1.0);
  let scheduler = harness.build();

  scheduler.start_or_resume_job(run.id).await.unwrap();

  assert!(
    wait_for_run_state(&harness, run.id, RunState::Error, StdDuration::from_secs(5)).await,
    "Run should move to ERROR"
  );
  assert_eq!(harness.executor.executed_count(), 0, "No segment should be executed");
  assert!(harness.run(run.id).await.end_time.is_some(), "End time should be stamped");
  assert!(harness
    .segments(run.id)
    .iter()
    .all(|s| s.state == SegmentState::NotStarted));

  assert!(
    eventually(StdDuration::from_secs(1), || async {
      scheduler
        .get_metrics_snapshot()
        .await
        .map(|m| m.runs_errored == 1 && m.leases_held_current == 0)
        .unwrap_or(false)
    })
    .await
  );

  scheduler.shutdown_graceful(None).await.unwrap();
}

#[tokio::test]
async fn test_unreachable_cluster_retries_until_reachable() {
  setup_tracing();
  let harness = Harness::new(StdDuration::from_millis(5));
  harness.topology.set_reachable(false);
  let run = harness.seed_run(3, 1.0);
  let scheduler = harness.build();

  scheduler.start_or_resume_job(run.id).await.unwrap();

  // retry_delay is 50ms in the harness; give it a few rounds.
  assert!(
    eventually(StdDuration::from_secs(2), || async {
      scheduler
        .get_metrics_snapshot()
        .await
        .map(|m| m.connectivity_retries >= 3)
        .unwrap_or(false)
    })
    .await,
    "Expected repeated connectivity retries"
  );
  assert_eq!(harness.executor.executed_count(), 0);
  assert_eq!(harness.run_state(run.id).await, RunState::Running, "Run stays RUNNING while unreachable");
  assert!(harness
    .segments(run.id)
    .iter()
    .all(|s| s.state == SegmentState::NotStarted && s.fail_count == 0));

  harness.topology.set_reachable(true);
  assert!(
    wait_for_run_state(&harness, run.id, RunState::Done, StdDuration::from_secs(5)).await,
    "Run should finish once the cluster is reachable"
  );
  assert_eq!(harness.executor.executed_count(), 3);

  scheduler.shutdown_graceful(None).await.unwrap();
}

#[tokio::test]
async fn test_stale_connection_is_replaced() {
  setup_tracing();
  let harness = Harness::new(StdDuration::from_millis(5));
  harness.topology.set_alive(false);
  let run = harness.seed_run(3, 1.0);
  let scheduler = harness.build();

  scheduler.start_or_resume_job(run.id).await.unwrap();
  assert!(wait_for_run_state(&harness, run.id, RunState::Done, StdDuration::from_secs(5)).await);

  // A dead connection is thrown away and re-established before every segment.
  let connects = harness.topology.connects.load(std::sync::atomic::Ordering::SeqCst);
  assert!(connects >= 3, "Expected a reconnect per segment, saw {}", connects);

  scheduler.shutdown_graceful(None).await.unwrap();
}

#[tokio::test]
async fn test_hung_segment_times_out_and_is_retried() {
  setup_tracing();
  let harness = Harness::new(StdDuration::from_millis(5));
  harness.executor.push_steps([Step::Hang]);
  let run = harness.seed_run(3, 1.0);
  let scheduler = harness
    .builder()
    .execution_timeout(StdDuration::from_millis(100))
    .build()
    .unwrap();

  scheduler.start_or_resume_job(run.id).await.unwrap();
  assert!(
    wait_for_run_state(&harness, run.id, RunState::Done, StdDuration::from_secs(5)).await,
    "Run should complete after the hung segment is retried"
  );

  let executed = harness.executor.executed();
  assert_eq!(executed.len(), 4, "Hung segment should run twice: {:?}", executed);
  assert_eq!(executed[0], executed[1], "The timed out segment is picked up again first");

  let segments = harness.segments(run.id);
  let hung = segments.iter().find(|s| s.id == executed[0]).unwrap();
  assert_eq!(hung.state, SegmentState::Done);
  assert_eq!(hung.fail_count, 1, "Timeout should count as one failed attempt");
  assert!(segments
    .iter()
    .filter(|s| s.id != hung.id)
    .all(|s| s.fail_count == 0));

  let metrics = scheduler.get_metrics_snapshot().await.unwrap();
  assert_eq!(metrics.segment_retries, 1);
  assert_eq!(metrics.segments_succeeded, 3);

  scheduler.shutdown_graceful(None).await.unwrap();
}

#[tokio::test]
async fn test_failed_segment_is_postponed_and_retried() {
  setup_tracing();
  let harness = Harness::new(StdDuration::from_millis(5));
  harness.executor.push_steps([Step::Fail, Step::Fail]);
  let run = harness.seed_run(2, 1.0);
  let scheduler = harness.build();

  scheduler.start_or_resume_job(run.id).await.unwrap();
  assert!(wait_for_run_state(&harness, run.id, RunState::Done, StdDuration::from_secs(5)).await);

  let executed = harness.executor.executed();
  assert_eq!(executed.len(), 4);
  let first = harness
    .segments(run.id)
    .into_iter()
    .find(|s| s.id == executed[0])
    .unwrap();
  assert_eq!(first.fail_count, 2);

  let metrics = scheduler.get_metrics_snapshot().await.unwrap();
  assert_eq!(metrics.segment_retries, 2);
  assert_eq!(metrics.invariant_violations, 0);

  scheduler.shutdown_graceful(None).await.unwrap();
}
