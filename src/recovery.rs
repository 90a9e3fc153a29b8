//! Startup and takeover recovery.
//!
//! A previous driver may have crashed mid-segment, leaving a phantom `Running`
//! segment that `next_free_segment` would never return again. Before a run is
//! driven by a new owner, every such segment is put back to `NotStarted`.

use std::collections::HashSet;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{QueryError, StorageError};
use crate::lease::{Acquisition, LeaseCoordinator};
use crate::metrics::RepairMetrics;
use crate::run::RunId;
use crate::storage::{postpone_segment, StateStore};

/// What a [`resume_all`](crate::RepairKeeper::resume_all) sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RecoveryReport {
  /// Runs this instance now drives.
  pub resumed: Vec<RunId>,
  /// Runs left alone because another instance holds their lease (or the lease store failed).
  pub skipped: Vec<RunId>,
  /// Segments moved from `Running` back to `NotStarted`.
  pub segments_reset: usize,
}

pub(crate) struct RecoverySweep {
  store: Arc<dyn StateStore>,
  leases: Arc<LeaseCoordinator>,
  metrics: RepairMetrics,
}

impl RecoverySweep {
  pub fn new(store: Arc<dyn StateStore>, leases: Arc<LeaseCoordinator>, metrics: RepairMetrics) -> Self {
    Self {
      store,
      leases,
      metrics,
    }
  }

  /// Resets every `Running` segment of one run. The caller must hold the run's lease.
  pub async fn recover_run(&self, run_id: RunId) -> Result<usize, StorageError> {
    let mut reset = 0;
    while let Some(segment) = self.store.running_segment(run_id).await? {
      if postpone_segment(self.store.as_ref(), &segment).await? {
        reset += 1;
        self
          .metrics
          .segments_recovered
          .fetch_add(1, AtomicOrdering::Relaxed);
        info!(%run_id, segment_id = %segment.id, "Reset abandoned segment to NOT_STARTED.");
      }
    }
    Ok(reset)
  }

  /// Claims and cleans up every persisted `Running` run whose lease is available.
  ///
  /// Runs are returned in `resumed` for the caller to schedule; nothing is scheduled here.
  /// Segments of runs listed in `in_flight` are left alone.
  pub async fn resume_all(&self, in_flight: &HashSet<RunId>) -> Result<RecoveryReport, QueryError> {
    let mut report = RecoveryReport::default();
    for run in self.store.running_runs().await? {
      match self.leases.acquire(run.id).await {
        Ok(Acquisition::HeldElsewhere) => {
          info!(run_id = %run.id, "Run is driven by another instance; skipping.");
          report.skipped.push(run.id);
          continue;
        }
        // A running segment of a run we are still executing belongs to that invocation.
        Ok(Acquisition::AlreadyHeld) => {
          report.resumed.push(run.id);
          continue;
        }
        Ok(Acquisition::Acquired) if in_flight.contains(&run.id) => {
          report.resumed.push(run.id);
          continue;
        }
        Ok(Acquisition::Acquired) => {}
        Err(e) => {
          warn!(run_id = %run.id, error = %e, "Could not acquire run lease; skipping.");
          report.skipped.push(run.id);
          continue;
        }
      }
      match self.recover_run(run.id).await {
        Ok(reset) => {
          report.segments_reset += reset;
          report.resumed.push(run.id);
        }
        Err(e) => {
          warn!(run_id = %run.id, error = %e, "Recovery failed; releasing lease.");
          if let Err(e) = self.leases.release(run.id).await {
            warn!(run_id = %run.id, error = %e, "Failed to release lease.");
          }
          report.skipped.push(run.id);
        }
      }
    }
    info!(
      resumed = report.resumed.len(),
      skipped = report.skipped.len(),
      segments_reset = report.segments_reset,
      "Recovery sweep finished."
    );
    Ok(report)
  }
}
