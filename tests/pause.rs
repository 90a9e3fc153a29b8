//! tests/pause.rs
//! Pausing and resuming runs through the scheduler handle.

mod common;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::Duration as StdDuration;

use crate::common::{eventually, setup_tracing, wait_for_run_state, Harness};

use repairkeeper::lease::lease_key;
use repairkeeper::{QueryError, RunState};

#[tokio::test]
async fn test_pause_stops_and_resume_finishes() {
  setup_tracing();
  let harness = Harness::new(StdDuration::from_millis(20));
  let run = harness.seed_run(4, 0.1);
  let scheduler = harness.build();

  scheduler.start_or_resume_job(run.id).await.unwrap();
  assert!(
    eventually(StdDuration::from_secs(2), || async {
      harness.executor.executed_count() >= 1
    })
    .await
  );

  scheduler.pause_run(run.id).await.expect("Pause failed");
  assert_eq!(harness.run_state(run.id).await, RunState::Paused);

  // An invocation already in flight may still finish its segment.
  tokio::time::sleep(StdDuration::from_millis(100)).await;
  let paused_at = harness.executor.executed_count();
  tokio::time::sleep(StdDuration::from_millis(500)).await;
  assert_eq!(harness.executor.executed_count(), paused_at, "Paused run must not progress");
  assert!(paused_at < 4);

  let status = scheduler.get_run_status(run.id).await.unwrap();
  assert_eq!(status.run_state, RunState::Paused);
  assert_eq!(status.activity, None);
  assert!(!status.lease_held, "Pausing releases the lease");
  assert!(scheduler.lease_holders().await.unwrap().is_empty());

  scheduler.resume_run(run.id).await.expect("Resume failed");
  assert!(
    wait_for_run_state(&harness, run.id, RunState::Done, StdDuration::from_secs(10)).await,
    "Resumed run should complete"
  );

  let executed = harness.executor.executed();
  let distinct: HashSet<_> = executed.iter().collect();
  assert_eq!(executed.len(), 4, "Each segment once: {:?}", executed);
  assert_eq!(distinct.len(), 4);

  scheduler.shutdown_graceful(None).await.unwrap();
}

#[tokio::test]
async fn test_pause_and_resume_require_matching_state() {
  setup_tracing();
  let harness = Harness::new(StdDuration::from_millis(5));
  let run = harness.seed_run(2, 1.0);
  let scheduler = harness.build();

  assert_eq!(
    scheduler.pause_run(run.id).await,
    Err(QueryError::InvalidRunState {
      run_id: run.id,
      state: RunState::NotStarted
    })
  );
  assert_eq!(
    scheduler.resume_run(run.id).await,
    Err(QueryError::InvalidRunState {
      run_id: run.id,
      state: RunState::NotStarted
    })
  );

  scheduler.start_or_resume_job(run.id).await.unwrap();
  assert!(wait_for_run_state(&harness, run.id, RunState::Done, StdDuration::from_secs(5)).await);
  assert_eq!(
    scheduler.pause_run(run.id).await,
    Err(QueryError::InvalidRunState {
      run_id: run.id,
      state: RunState::Done
    })
  );

  scheduler.shutdown_graceful(None).await.unwrap();
}

#[tokio::test]
async fn test_external_pause_is_honoured() {
  setup_tracing();
  let harness = Harness::new(StdDuration::from_millis(20));
  let run = harness.seed_run(6, 0.1);
  let scheduler = harness.build();

  scheduler.start_or_resume_job(run.id).await.unwrap();
  assert!(
    eventually(StdDuration::from_secs(2), || async {
      harness.executor.executed_count() >= 1
    })
    .await
  );

  // Another component flips the persisted state; the runner notices on its next turn.
  let mut paused = harness.run(run.id).await;
  paused.run_state = RunState::Paused;
  harness.store.put_run(paused);

  assert!(
    eventually(StdDuration::from_secs(2), || async {
      scheduler.list_scheduled_runs().await.map(|l| l.is_empty()).unwrap_or(false)
    })
    .await,
    "Runner should stand down"
  );
  assert_eq!(harness.run_state(run.id).await, RunState::Paused);
  assert!(!scheduler.get_run_status(run.id).await.unwrap().lease_held);

  scheduler.shutdown_graceful(None).await.unwrap();
}

#[tokio::test]
async fn test_pause_keeps_lease_until_in_flight_segment_returns() {
  setup_tracing();
  let harness = Harness::new(StdDuration::from_millis(2500));
  let run = harness.seed_run(2, 1.0);
  let first = harness.build();
  let second = harness.build();

  first.start_or_resume_job(run.id).await.unwrap();
  assert!(
    eventually(StdDuration::from_secs(2), || async {
      harness.executor.executed_count() >= 1
    })
    .await
  );

  first.pause_run(run.id).await.expect("Pause failed");
  assert_eq!(harness.run_state(run.id).await, RunState::Paused);
  assert!(first.get_run_status(run.id).await.unwrap().lease_held);

  // Past the one second TTL, while the paused run's segment is still executing.
  tokio::time::sleep(StdDuration::from_millis(1400)).await;
  assert_eq!(
    second.resume_run(run.id).await,
    Err(QueryError::LeaseHeldElsewhere(run.id))
  );
  assert_eq!(
    harness.run_state(run.id).await,
    RunState::Paused,
    "A refused resume leaves the run paused"
  );

  assert!(
    eventually(StdDuration::from_secs(3), || async {
      harness.leases.get(&lease_key(run.id)).is_none()
    })
    .await,
    "Lease should be released once the in-flight segment reports back"
  );
  assert_eq!(harness.executor.executed_count(), 1);

  second.resume_run(run.id).await.expect("Resume failed");
  assert!(wait_for_run_state(&harness, run.id, RunState::Done, StdDuration::from_secs(10)).await);

  let executed = harness.executor.executed();
  assert_eq!(executed.len(), 2);
  assert_ne!(executed[0], executed[1]);
  assert_eq!(harness.executor.max_active.load(Ordering::SeqCst), 1);

  first.shutdown_graceful(None).await.unwrap();
  second.shutdown_graceful(None).await.unwrap();
}
