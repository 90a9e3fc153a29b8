use crate::error::{QueryError, RunnerError};
use crate::lease::HolderId;
use crate::metrics::MetricsSnapshot;
use crate::recovery::RecoveryReport;
use crate::run::{RunId, RunState, RunStatus, RunSummary, WorkerId};
use crate::runner::RepairRunner;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};

/// Commands sent from the `RepairKeeper` handle (and the lease keeper) to the Coordinator task.
///
/// Each handle command carries a `oneshot::Sender` for the Coordinator to
/// send the response back to the requesting task.
#[derive(Debug)]
pub(crate) enum CoordinatorCommand {
  /// Acquire the run's lease and make sure an invocation is pending.
  StartOrResume {
    run_id: RunId,
    responder: oneshot::Sender<Result<(), QueryError>>,
  },
  /// Recovery sweep over every persisted `Running` run.
  ResumeAll {
    responder: oneshot::Sender<Result<RecoveryReport, QueryError>>,
  },
  /// Persist `Paused`, drop the pending invocation and release the lease.
  PauseRun {
    run_id: RunId,
    responder: oneshot::Sender<Result<(), QueryError>>,
  },
  /// Persist `Running` for a paused run, then start it.
  ResumeRun {
    run_id: RunId,
    responder: oneshot::Sender<Result<(), QueryError>>,
  },
  GetRunStatus {
    run_id: RunId,
    responder: oneshot::Sender<Result<RunStatus, QueryError>>,
  },
  ListScheduledRuns {
    responder: oneshot::Sender<Vec<RunSummary>>, // Response is always success unless channel fails
  },
  GetMetricsSnapshot {
    responder: oneshot::Sender<MetricsSnapshot>,
  },
  LeaseHolders {
    responder: oneshot::Sender<Result<HashSet<HolderId>, QueryError>>,
  },
  /// Administrative override for a lease whose holder is known to be dead.
  ForceReleaseRun {
    run_id: RunId,
    responder: oneshot::Sender<Result<(), QueryError>>,
  },
  /// Sent by the lease keeper when a renewal is refused.
  LeaseLost { run_id: RunId },
}

/// Represents the requested shutdown mode. Sent via a `watch` channel.
/// `None` indicates the scheduler is running normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Wait for in-flight invocations to complete, then release held leases.
  Graceful,
  /// Stop processing as soon as possible. Leases are left to expire.
  Force,
}

/// Why a runner stopped rescheduling itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
  /// Every segment is `Done`; the run was moved to `Done`.
  Completed,
  /// A segment could not be mapped onto the ring; the run was moved to `Error`.
  Errored,
  /// The run is in a state this invocation must not touch (paused, finished elsewhere, ...).
  Idle(RunState),
  RunNotFound,
}

/// What a runner invocation asks its scheduler to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
  /// Invoke the runner again no sooner than this delay from now.
  RunAfter(Duration),
  Stop(StopReason),
}

/// A run's driver, locked by whichever worker invokes it.
pub(crate) type RunnerSlot = Arc<Mutex<RepairRunner>>;

/// Sent from the Coordinator to the worker pool when a run is due.
pub(crate) struct Dispatch {
  pub run_id: RunId,
  pub runner: RunnerSlot,
}

/// Message sent from a Worker task back to the Coordinator after an invocation.
#[derive(Debug)]
pub(crate) enum WorkerOutcome {
  /// The runner returned, normally or with an error.
  Finished {
    run_id: RunId,
    worker: WorkerId,
    result: Result<NextAction, RunnerError>,
  },
  /// The worker could not renew the run's lease and skipped the invocation.
  LeaseLost { run_id: RunId, worker: WorkerId },
  /// The invocation task panicked.
  Panicked { run_id: RunId, worker: WorkerId },
}
