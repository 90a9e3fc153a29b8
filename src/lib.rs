//! RepairKeeper: a repair scheduling and lease-based coordination engine
//!
//! Drives anti-entropy repair runs across a cluster of storage nodes. Each run is
//! split into token-range segments that are repaired strictly one at a time,
//! paced by the run's intensity. Several scheduler instances may share one
//! state store; a TTL lease per run guarantees that at most one of them drives
//! a given run at any time, and a crashed instance's runs are picked up again
//! once its leases lapse.
//!
//! # Features
//!
//! - Per-run driver walking segments to completion: `NotStarted` → `Running` → `Done`,
//!   or `Error` when a segment's token range maps onto no node.
//! - Intensity-based pacing after each repaired segment
//!   (`delay = duration / intensity - duration`) and a fixed retry delay after
//!   connectivity failures and timed-out segments.
//! - Execution timeouts enforced around any segment executor; a hung segment is
//!   put back to `NotStarted` instead of staying `Running` forever.
//! - TTL leases per run (`repair_run/<run id>`), renewed in the background and
//!   before every invocation. Losing a lease stops scheduling immediately.
//! - Recovery sweep (`resume_all`) that resets abandoned `Running` segments of
//!   every run it takes over.
//! - Bounded worker pool; waiting between segments never occupies a worker.
//! - Pause/resume, run status and lease queries, metrics snapshots.
//! - Graceful and forced shutdown procedures (with optional timeout).
//! - Optional task-local [`JobContext`] for segment executors (requires `job_context` feature).
//! - Optional Serde support for public types (requires `serde` feature).
//!
//! # Usage
//!
//! ```no_run
//! use repairkeeper::{
//!     ClusterConnector, Cluster, ExecutorError, MemoryStorage, NodeConnection, NodeError,
//!     RepairKeeper, RepairRun, RepairSegment, RepairUnit, RingRange, SegmentExecutor,
//!     SegmentId,
//! };
//! use async_trait::async_trait;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct MyConnector; // Talks to the cluster's nodes.
//!
//! #[async_trait]
//! impl ClusterConnector for MyConnector {
//!     async fn connect(&self, cluster: &Cluster) -> Result<Box<dyn NodeConnection>, NodeError> {
//!         unimplemented!("open a connection to one of {:?}", cluster.seed_hosts)
//!     }
//! }
//!
//! struct MyExecutor; // Triggers the repair of one segment.
//!
//! #[async_trait]
//! impl SegmentExecutor for MyExecutor {
//!     async fn execute(&self, segment_id: SegmentId, coordinators: &[String], timeout: Duration) -> Result<(), ExecutorError> {
//!         unimplemented!("repair {segment_id} through one of {coordinators:?} within {timeout:?}")
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStorage::new());
//!     store.add_cluster(Cluster::new("prod", vec!["10.0.0.1".into()]));
//!     let unit = RepairUnit::new("prod", "my_keyspace", vec![]);
//!     let run = RepairRun::new("prod", unit.id, 0.5)?;
//!     let segments = RepairSegment::for_ranges(run.id, [RingRange::new(0, 100), RingRange::new(100, 0)]);
//!     store.add_repair_unit(unit);
//!     store.add_run(run.clone(), segments)?;
//!
//!     let scheduler = RepairKeeper::builder()
//!         .max_workers(4)
//!         .retry_delay(Duration::from_secs(10))
//!         .state_store(store.clone())
//!         .cluster_connector(Arc::new(MyConnector))
//!         .segment_executor(Arc::new(MyExecutor))
//!         .build()?;
//!
//!     // Pick up whatever a previous process left running, then start the new run.
//!     let report = scheduler.resume_all().await?;
//!     println!("Resumed {} run(s)", report.resumed.len());
//!     scheduler.start_or_resume_job(run.id).await?;
//!
//!     tokio::time::sleep(Duration::from_secs(5)).await;
//!     println!("{:#?}", scheduler.get_run_status(run.id).await?);
//!     println!("{:#?}", scheduler.get_metrics_snapshot().await?);
//!
//!     scheduler.shutdown_graceful(Some(Duration::from_secs(10))).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! Use the [`SchedulerBuilder`] (or a whole [`RepairConfig`]) to configure the scheduler:
//! - `max_workers`: Concurrency limit across all runs.
//! - `execution_timeout`: Hard limit for one segment.
//! - `retry_delay`: Fixed delay after a connectivity failure or a timed-out segment.
//! - `lease_ttl`, `lease_renewal_period`: Lease lifetime and renewal cadence (renewal must be shorter).
//! - `command_buffer_size`, `dispatch_buffer_size`: Internal channel capacities.
//!
//! # Collaborators
//!
//! - [`StateStore`]: persisted runs and segments with compare-and-update writes ([`MemoryStorage`] bundled).
//! - [`LeaseStore`]: linearizable lease records ([`MemoryLeaseStore`] bundled, used by default).
//! - [`ClusterConnector`] / [`NodeConnection`]: liveness and token-range-to-endpoint lookups.
//! - [`SegmentExecutor`]: claims a segment, repairs it, and leaves it `Done` or `NotStarted`.
//!
//! # Observability
//!
//! - Retrieve metrics snapshots using [`RepairKeeper::get_metrics_snapshot`]. See [`MetricsSnapshot`].
//! - Query a run with [`RepairKeeper::get_run_status`] or list driven runs with [`RepairKeeper::list_scheduled_runs`].
//! - Integrate with the `tracing` crate for detailed logs; every invocation runs in a `repair_run` span.

// --- Feature-gated Documentation ---

// This empty module attaches the documentation block below only when
// the `job_context` feature is enabled during doc generation.
#[cfg(all(doc, feature = "job_context"))]
pub mod job_context_docs {
  //! # Accessing Job Context (`job_context` feature)
  //!
  //! When the `job_context` feature is enabled, a segment executor can find out
  //! which run and segment it is working for through Tokio's task-local context.
  //!
  //! 1.  **`try_get_current_job_context() -> Option<JobContext>`**: Returns `None`
  //!     if called outside a runner-driven segment execution.
  //! 2.  **`job_context!() -> JobContext`**: Retrieves the context, but **panics**
  //!     if called outside a runner-driven segment execution.
  //!
  //! ```no_run
  //! # #[cfg(feature = "job_context")] {
  //! use repairkeeper::{try_get_current_job_context, job_context};
  //!
  //! async fn repair_segment() {
  //!     if let Some(ctx) = try_get_current_job_context() {
  //!         println!("Repairing segment {} of run {}", ctx.segment_id, ctx.run_id);
  //!     }
  //!     let required_ctx = job_context!();
  //!     println!("Run {}", required_ctx.run_id);
  //! }
  //! # }
  //! ```
  //!
  //! The context is set by the runner around each `SegmentExecutor::execute` call.
}

// Declare modules within the crate
pub mod command;
pub mod config;
mod coordinator;
pub mod error;
pub mod executor;
pub mod lease;
pub mod metrics;
pub mod node;
pub mod pacing;
pub mod recovery;
pub mod ring;
pub mod run;
mod runner;
pub mod scheduler;
pub mod storage;
mod worker;

// --- Public Re-exports ---

// Core scheduler components
pub use command::{NextAction, ShutdownMode, StopReason};
pub use config::RepairConfig;
pub use scheduler::{RepairKeeper, SchedulerBuilder};

// Error types
pub use error::{
  BuildError, ExecutorError, InvariantViolation, LeaseError, NodeError, PacingError, QueryError,
  RunnerError, ShutdownError, StorageError,
};

// Run related types
pub use run::{
  Cluster, RepairRun, RepairSegment, RepairUnit, RepairUnitId, RunActivity, RunId, RunState,
  RunStatus, RunSummary, SegmentId, SegmentState,
};
// Conditionally export context items
#[cfg(feature = "job_context")]
pub use run::context::{try_get_current_job_context, JobContext};

// Collaborators
pub use executor::{SegmentExecutor, TimeoutEnforcingExecutor};
pub use lease::{Acquisition, HolderId, Lease, LeaseCoordinator, LeaseStore, MemoryLeaseStore};
pub use node::{ClusterConnector, NodeConnection};
pub use storage::{MemoryStorage, StateStore};

// Scheduling helpers
pub use pacing::{intensity_delay, Intensity};
pub use recovery::RecoveryReport;
pub use ring::{RingRange, Token, TokenRing};

// Metrics related types
pub use metrics::{MetricsSnapshot, RepairMetrics};
