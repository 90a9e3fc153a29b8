//! tests/builder.rs
//! Builder validation.

mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::common::{setup_tracing, FakeConnector, Harness};

use repairkeeper::{BuildError, RepairConfig, RepairKeeper};

#[tokio::test]
async fn test_missing_collaborators_are_rejected() {
  setup_tracing();
  let harness = Harness::new(StdDuration::ZERO);

  let err = RepairKeeper::builder().build().unwrap_err();
  assert_eq!(err, BuildError::MissingCollaborator("state store"));

  let err = RepairKeeper::builder()
    .state_store(harness.store.clone())
    .build()
    .unwrap_err();
  assert_eq!(err, BuildError::MissingCollaborator("cluster connector"));

  let err = RepairKeeper::builder()
    .state_store(harness.store.clone())
    .cluster_connector(Arc::new(FakeConnector(harness.topology.clone())))
    .build()
    .unwrap_err();
  assert_eq!(err, BuildError::MissingCollaborator("segment executor"));
}

#[tokio::test]
async fn test_invalid_timings_are_rejected() {
  setup_tracing();
  let harness = Harness::new(StdDuration::ZERO);

  assert_eq!(
    harness.builder().max_workers(0).build().unwrap_err(),
    BuildError::MissingOrZeroMaxWorkers
  );
  assert_eq!(
    harness
      .builder()
      .lease_ttl(StdDuration::from_secs(1))
      .lease_renewal_period(StdDuration::from_secs(1))
      .build()
      .unwrap_err(),
    BuildError::RenewalNotShorterThanTtl {
      renewal: StdDuration::from_secs(1),
      ttl: StdDuration::from_secs(1),
    }
  );
  assert!(matches!(
    harness.builder().retry_delay(StdDuration::ZERO).build(),
    Err(BuildError::ZeroDuration(_))
  ));
}

#[tokio::test]
async fn test_whole_config_can_be_supplied() -> anyhow::Result<()> {
  setup_tracing();
  let harness = Harness::new(StdDuration::ZERO);
  let config = RepairConfig {
    max_workers: 2,
    lease_ttl: StdDuration::from_secs(5),
    lease_renewal_period: StdDuration::from_secs(1),
    ..RepairConfig::default()
  };

  let scheduler = harness.builder().config(config).build()?;
  let metrics = scheduler.get_metrics_snapshot().await?;
  assert_eq!(metrics.workers_active_current, 0);
  scheduler.shutdown_graceful(None).await?;
  Ok(())
}
