use crate::command::{Dispatch, NextAction, RunnerSlot, ShutdownMode, WorkerOutcome};
use crate::error::{InvariantViolation, RunnerError};
use crate::lease::LeaseCoordinator;
use crate::metrics::RepairMetrics;
use crate::run::{RunId, WorkerId};

use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Instant;

use async_channel::Receiver;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn, Instrument};

/// Represents a worker task executing runner invocations.
///
/// Workers wait for due runs from the Coordinator via a shared channel,
/// renew the run's lease, invoke its runner in a separate task (catching
/// panics), and report the outcome back to the Coordinator.
pub(crate) struct Worker {
  id: WorkerId, // Simple numeric ID for logging
  leases: Arc<LeaseCoordinator>,
  metrics: RepairMetrics,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  // Channel to send invocation outcomes back to Coordinator
  worker_outcome_tx: mpsc::Sender<WorkerOutcome>,
  // Shared channel to receive dispatched runs
  dispatch_rx: Receiver<Dispatch>,
}

impl Worker {
  pub fn new(
    id: WorkerId,
    leases: Arc<LeaseCoordinator>,
    metrics: RepairMetrics,
    shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
    worker_outcome_tx: mpsc::Sender<WorkerOutcome>,
    dispatch_rx: Receiver<Dispatch>,
  ) -> Self {
    Self {
      id,
      leases,
      metrics,
      shutdown_rx,
      worker_outcome_tx,
      dispatch_rx,
    }
  }

  /// Runs the main loop for the worker task.
  ///
  /// A graceful shutdown lets the worker drain whatever the Coordinator still
  /// dispatches; the loop ends when the Coordinator drops the dispatch channel.
  /// A forced shutdown ends it immediately.
  pub async fn run(&mut self) {
    info!(worker_id = self.id, "Worker started. Waiting for runs...");

    loop {
      let mut shutdown_rx = self.shutdown_rx.clone();

      let received = tokio::select! {
          biased; // Prioritize checking the shutdown signal

          _ = wait_for_force(&mut shutdown_rx) => {
              info!(worker_id = self.id, "Worker received forced shutdown signal.");
              break;
          }

          received = self.dispatch_rx.recv() => received,
      };

      match received {
        Ok(Dispatch { run_id, runner }) => {
          debug!(worker_id = self.id, %run_id, "Received run dispatch.");
          let span = tracing::span!(
            tracing::Level::INFO,
            "repair_run",
            worker_id = self.id,
            %run_id
          );
          let keep_going = self.execute_and_report(run_id, runner).instrument(span).await;
          if !keep_going {
            break;
          }
        }
        Err(_) => {
          if self.shutdown_rx.borrow().is_none() {
            error!(worker_id = self.id, "Dispatch channel closed unexpectedly. Worker exiting.");
          } else {
            info!(worker_id = self.id, "Dispatch channel closed during shutdown. Worker exiting.");
          }
          break;
        }
      }
    }

    info!(worker_id = self.id, "Worker task shutting down.");
  }

  /// Returns `false` if the worker should stop (forced shutdown or Coordinator gone).
  async fn execute_and_report(&self, run_id: RunId, runner: RunnerSlot) -> bool {
    let outcome = match self.leases.renew(run_id).await {
      Ok(true) => match self.invoke(run_id, runner).await {
        Some(outcome) => outcome,
        None => return false,
      },
      Ok(false) => {
        warn!("Lease renewal refused before invocation; skipping run.");
        WorkerOutcome::LeaseLost {
          run_id,
          worker: self.id,
        }
      }
      Err(e) => {
        warn!(error = %e, "Lease renewal failed before invocation; skipping run.");
        WorkerOutcome::LeaseLost {
          run_id,
          worker: self.id,
        }
      }
    };

    debug!("Sending invocation outcome to coordinator.");
    if self.worker_outcome_tx.send(outcome).await.is_err() {
      warn!("Failed to send invocation outcome to coordinator (scheduler likely shutdown).");
      return false;
    }
    true
  }

  /// Invokes the runner once in its own task, catching panics.
  /// Returns `None` if a forced shutdown aborted the invocation.
  async fn invoke(&self, run_id: RunId, runner: RunnerSlot) -> Option<WorkerOutcome> {
    let Ok(mut guard) = runner.try_lock_owned() else {
      error!("Runner already locked by another invocation.");
      return Some(WorkerOutcome::Finished {
        run_id,
        worker: self.id,
        result: Err(RunnerError::Invariant(InvariantViolation::OverlappingInvocation(run_id))),
      });
    };

    trace!("Starting runner invocation.");
    let started = Instant::now();
    let mut task = tokio::spawn(
      async move { guard.run_once().await }.instrument(tracing::Span::current()),
    );

    let mut shutdown_rx = self.shutdown_rx.clone();
    let joined = tokio::select! {
        joined = &mut task => joined,
        _ = wait_for_force(&mut shutdown_rx) => {
            task.abort();
            warn!("Runner invocation aborted by forced shutdown.");
            return None;
        }
    };

    let elapsed_ms = started.elapsed().as_millis();
    let outcome = match joined {
      Ok(result) => {
        match &result {
          Ok(NextAction::RunAfter(delay)) => {
            info!(elapsed_ms, delay_ms = delay.as_millis(), "Finished runner invocation.")
          }
          Ok(NextAction::Stop(reason)) => info!(elapsed_ms, ?reason, "Finished runner invocation."),
          Err(e) => warn!(elapsed_ms, error = %e, "Runner invocation failed."),
        }
        WorkerOutcome::Finished {
          run_id,
          worker: self.id,
          result,
        }
      }
      Err(join_error) => {
        if join_error.is_panic() {
          error!("Runner invocation panicked!");
        } else {
          warn!("Runner invocation task was cancelled.");
        }
        self
          .metrics
          .invocations_panicked
          .fetch_add(1, AtomicOrdering::Relaxed);
        WorkerOutcome::Panicked {
          run_id,
          worker: self.id,
        }
      }
    };
    Some(outcome)
  }
}

/// Resolves once a forced shutdown is requested. Never resolves if the handle is gone.
async fn wait_for_force(shutdown_rx: &mut watch::Receiver<Option<ShutdownMode>>) {
  loop {
    if *shutdown_rx.borrow_and_update() == Some(ShutdownMode::Force) {
      return;
    }
    if shutdown_rx.changed().await.is_err() {
      std::future::pending::<()>().await;
    }
  }
}
