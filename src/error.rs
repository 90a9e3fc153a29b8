use crate::run::{RunId, RunState, SegmentId, SegmentState};

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while building the scheduler with `SchedulerBuilder`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("Maximum worker count (`max_workers`) must be specified and greater than zero")]
  MissingOrZeroMaxWorkers,
  #[error("`{0}` must be greater than zero")]
  ZeroDuration(&'static str),
  #[error("Lease renewal period ({renewal:?}) must be strictly shorter than the lease TTL ({ttl:?})")]
  RenewalNotShorterThanTtl { renewal: Duration, ttl: Duration },
  #[error("No {0} was supplied to the builder")]
  MissingCollaborator(&'static str),
}

// --- Collaborator Errors ---

/// Failures reported by a [`StateStore`](crate::storage::StateStore) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
  #[error("Repair run {0} not found.")]
  RunNotFound(RunId),
  #[error("Repair segment {0} not found.")]
  SegmentNotFound(SegmentId),
  #[error("Cluster '{0}' not found.")]
  ClusterNotFound(String),
  #[error("Repair unit {0} not found.")]
  RepairUnitNotFound(Uuid),
  #[error("Storage backend failure: {0}")]
  Backend(String),
}

/// Failures reported by a [`LeaseStore`](crate::lease::LeaseStore) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
  #[error("Lease backend failure: {0}")]
  Backend(String),
}

/// Failures talking to the remote nodes of a cluster.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
  #[error("Could not connect to any of the seed hosts {hosts:?}: {reason}")]
  Connect { hosts: Vec<String>, reason: String },
  #[error("Topology query failed: {0}")]
  Topology(String),
}

/// Failures reported by a segment executor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
  #[error("Segment {0} execution failed: {1}")]
  Failed(SegmentId, String),
  #[error(transparent)]
  Storage(#[from] StorageError),
}

/// Errors from the pacing policy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PacingError {
  #[error("Intensity {0} is outside (0, 1].")]
  IntensityOutOfRange(f64),
  #[error("Segment {0} finished without both a start and an end time.")]
  MissingTimestamps(SegmentId),
}

// --- Runner Errors ---

/// Observations that can only happen if serial execution or leader election is broken.
/// These are defects, never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
  #[error("Repair run {run_id} already has {running} segment(s) running.")]
  ConcurrentSegment { run_id: RunId, running: usize },
  #[error("Segment {segment_id} is {state:?} after execution returned; another driver may own it.")]
  UnexpectedSegmentState {
    segment_id: SegmentId,
    state: SegmentState,
  },
  #[error("Repair run {0} already has an invocation in flight.")]
  OverlappingInvocation(RunId),
}

/// Anything that ends a single runner invocation abnormally.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunnerError {
  #[error("Invariant violated: {0}")]
  Invariant(#[from] InvariantViolation),
  #[error(transparent)]
  Storage(#[from] StorageError),
  #[error(transparent)]
  Pacing(#[from] PacingError),
}

impl RunnerError {
  /// Whether the failure is a defect (as opposed to a transient fault worth retrying).
  ///
  /// Only backend failures are transient. A persisted record that went missing will not
  /// come back by retrying.
  pub fn is_defect(&self) -> bool {
    !matches!(self, RunnerError::Storage(StorageError::Backend(_)))
  }
}

// --- Query Errors ---

/// Errors related to commands sent through the `RepairKeeper` handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
  #[error("Scheduler command channel is closed (likely shut down or panicked).")]
  SchedulerShutdown,
  #[error("Scheduler did not respond to the query (Coordinator task may have panicked or shutdown unexpectedly).")]
  ResponseFailed,
  #[error("Repair run {0} not found.")]
  RunNotFound(RunId),
  #[error("The lease for repair run {0} is held by another instance.")]
  LeaseHeldElsewhere(RunId),
  #[error("Repair run {run_id} is {state:?}, which does not allow this operation.")]
  InvalidRunState { run_id: RunId, state: RunState },
  #[error("Storage failure: {0}")]
  Storage(String),
  #[error("Lease store failure: {0}")]
  Lease(String),
}

impl From<StorageError> for QueryError {
  fn from(err: StorageError) -> Self {
    match err {
      StorageError::RunNotFound(id) => QueryError::RunNotFound(id),
      other => QueryError::Storage(other.to_string()),
    }
  }
}

impl From<LeaseError> for QueryError {
  fn from(err: LeaseError) -> Self {
    QueryError::Lease(err.to_string())
  }
}

// --- Shutdown Errors ---

/// Errors related to the scheduler shutdown process (`shutdown_graceful`, `shutdown_force`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Failed to send shutdown signal (scheduler already shut down or watch channel error).")]
  SignalFailed,
  #[error("Timed out waiting for scheduler tasks (Coordinator, Workers, LeaseKeeper) to complete shutdown.")]
  Timeout,
  #[error("A worker or coordinator task panicked during the shutdown process.")]
  TaskPanic,
  #[error("Shutdown already in progress or completed.")]
  AlreadyShuttingDown,
}
