use crate::command::{
  CoordinatorCommand, Dispatch, NextAction, RunnerSlot, ShutdownMode, StopReason, WorkerOutcome,
};
use crate::error::{QueryError, RunnerError};
use crate::lease::{Acquisition, LeaseCoordinator};
use crate::metrics::RepairMetrics;
use crate::recovery::{RecoveryReport, RecoverySweep};
use crate::run::{RunActivity, RunId, RunState, RunStatus, RunSummary};
use crate::runner::{RepairRunner, RunnerContext};

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use priority_queue::PriorityQueue;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

const IDLE_SLEEP: Duration = Duration::from_secs(60 * 60 * 24 * 7); // ~1 week max sleep
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Channels and shared handles owned by the Coordinator task.
pub(crate) struct CoordinatorState {
  // Receivers
  cmd_rx: mpsc::Receiver<CoordinatorCommand>,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  worker_outcome_rx: mpsc::Receiver<WorkerOutcome>,
  // Sender
  dispatch_tx: async_channel::Sender<Dispatch>,
  // Shared collaborators
  runner_ctx: Arc<RunnerContext>,
  leases: Arc<LeaseCoordinator>,
  recovery: RecoverySweep,
  // Metrics & Counters
  metrics: RepairMetrics,
  active_workers_counter: Arc<AtomicUsize>,
  max_workers: usize,
}

impl CoordinatorState {
  #[allow(clippy::too_many_arguments)] // Necessary complexity for Coordinator setup
  pub fn new(
    cmd_rx: mpsc::Receiver<CoordinatorCommand>,
    shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
    worker_outcome_rx: mpsc::Receiver<WorkerOutcome>,
    dispatch_tx: async_channel::Sender<Dispatch>,
    runner_ctx: Arc<RunnerContext>,
    leases: Arc<LeaseCoordinator>,
    metrics: RepairMetrics,
    active_workers_counter: Arc<AtomicUsize>,
    max_workers: usize,
  ) -> Self {
    let recovery = RecoverySweep::new(runner_ctx.store.clone(), leases.clone(), metrics.clone());
    Self {
      cmd_rx,
      shutdown_rx,
      worker_outcome_rx,
      dispatch_tx,
      runner_ctx,
      leases,
      recovery,
      metrics,
      active_workers_counter,
      max_workers,
    }
  }
}

/// Registry record of a run this instance drives.
struct RunEntry {
  runner: RunnerSlot,
  /// Set while the run waits in the timer queue.
  next_run: Option<DateTime<Utc>>,
  in_flight: bool,
  invocations: u64,
  /// Set after a defect; the run is kept for status queries but not driven.
  faulted: Option<String>,
  /// The run was dropped (paused, lease lost) while an invocation was in flight;
  /// the entry goes away once that invocation reports back.
  detached: bool,
  /// `start_or_resume` arrived while in flight; invoke again right after.
  restart_requested: bool,
}

impl RunEntry {
  fn new(runner: RepairRunner) -> Self {
    Self {
      runner: Arc::new(Mutex::new(runner)),
      next_run: None,
      in_flight: false,
      invocations: 0,
      faulted: None,
      detached: false,
      restart_requested: false,
    }
  }

  fn activity(&self) -> Option<RunActivity> {
    if let Some(reason) = &self.faulted {
      Some(RunActivity::Faulted {
        reason: reason.clone(),
      })
    } else if self.in_flight {
      Some(RunActivity::InFlight)
    } else {
      self
        .next_run
        .map(|next_run| RunActivity::Scheduled { next_run })
    }
  }
}

/// The central Coordinator task.
///
/// Owns the run registry and the timer queue. Invocations are popped from the
/// queue when due and handed to idle workers; their outcomes come back here
/// and decide whether (and when) the run is queued again.
pub(crate) struct Coordinator {
  state: CoordinatorState,
  runs: HashMap<RunId, RunEntry>,
  queue: PriorityQueue<RunId, Reverse<DateTime<Utc>>>,
  shutting_down: Option<ShutdownMode>,
  cmd_open: bool,
}

impl Coordinator {
  pub fn new(state: CoordinatorState) -> Self {
    Self {
      state,
      runs: HashMap::new(),
      queue: PriorityQueue::new(),
      shutting_down: None,
      cmd_open: true,
    }
  }

  /// Runs the main event loop for the Coordinator.
  pub async fn run(&mut self) {
    info!(max_workers = self.state.max_workers, "Coordinator started.");

    loop {
      self.update_gauge_metrics();
      let sleep_duration = self.calculate_sleep();

      tokio::select! {
          biased; // Prioritize checking the shutdown signal

          // --- Shutdown Check ---
          Ok(()) = self.state.shutdown_rx.changed() => {
              let mode = *self.state.shutdown_rx.borrow();
              if mode.is_some() && self.shutting_down.is_none() {
                  self.begin_shutdown(mode);
                  if self.shutting_down == Some(ShutdownMode::Force) {
                      info!("Forced shutdown initiated, coordinator loop breaking.");
                      break;
                  }
              }
          },

          // --- Command Processing ---
          // Always process commands, even during graceful shutdown
          maybe_cmd = self.state.cmd_rx.recv(), if self.cmd_open => {
              match maybe_cmd {
                  Some(cmd) => self.handle_command(cmd).await,
                  None => {
                      self.cmd_open = false;
                      if self.shutting_down.is_none() {
                          warn!("Command channel closed unexpectedly. Initiating graceful shutdown.");
                          self.begin_shutdown(Some(ShutdownMode::Graceful));
                      }
                  }
              }
          },

          // --- Worker Outcome Processing ---
          Some(outcome) = self.state.worker_outcome_rx.recv() => {
              trace!(?outcome, "Received worker outcome.");
              self.handle_worker_outcome(outcome).await;
          },

          // --- Timer Wakeup ---
          _ = sleep(sleep_duration) => {
              trace!("Timer fired.");
              if self.shutting_down.is_none() {
                  self.try_dispatch_runs();
              }
          }
      }

      // --- Post-Select Shutdown Logic ---
      if self.shutting_down == Some(ShutdownMode::Graceful) {
        let active_count = self.state.active_workers_counter.load(AtomicOrdering::Relaxed);
        if active_count == 0 {
          info!("Graceful shutdown: all workers idle. Coordinator exiting.");
          self.release_all_leases().await;
          break;
        }
        trace!(active_workers = active_count, "Graceful shutdown: waiting for active workers.");
      }
    }

    info!("Coordinator task shutting down.");
    // Tell idle workers no more runs are coming.
    self.state.dispatch_tx.close();
  }

  fn begin_shutdown(&mut self, mode: Option<ShutdownMode>) {
    self.shutting_down = mode;
    info!(?mode, queued = self.queue.len(), "Coordinator received shutdown signal.");
  }

  fn update_gauge_metrics(&self) {
    self
      .state
      .metrics
      .scheduled_current
      .store(self.queue.len(), AtomicOrdering::Relaxed);
    self.state.metrics.workers_active_current.store(
      self.state.active_workers_counter.load(AtomicOrdering::Relaxed),
      AtomicOrdering::Relaxed,
    );
  }

  // --- Commands ---

  async fn handle_command(&mut self, cmd: CoordinatorCommand) {
    match cmd {
      CoordinatorCommand::StartOrResume { run_id, responder } => {
        let result = self.start_or_resume(run_id).await;
        let _ = responder.send(result);
      }
      CoordinatorCommand::ResumeAll { responder } => {
        let result = self.resume_all().await;
        let _ = responder.send(result);
      }
      CoordinatorCommand::PauseRun { run_id, responder } => {
        let result = self.pause_run(run_id).await;
        let _ = responder.send(result);
      }
      CoordinatorCommand::ResumeRun { run_id, responder } => {
        let result = self.resume_run(run_id).await;
        let _ = responder.send(result);
      }
      CoordinatorCommand::GetRunStatus { run_id, responder } => {
        let result = self.run_status(run_id).await;
        let _ = responder.send(result);
      }
      CoordinatorCommand::ListScheduledRuns { responder } => {
        let summaries = self
          .runs
          .iter()
          .filter(|(_, entry)| !entry.detached)
          .filter_map(|(run_id, entry)| {
            entry.activity().map(|activity| RunSummary {
              run_id: *run_id,
              activity,
              invocations: entry.invocations,
            })
          })
          .collect();
        let _ = responder.send(summaries);
      }
      CoordinatorCommand::GetMetricsSnapshot { responder } => {
        self.update_gauge_metrics();
        let _ = responder.send(self.state.metrics.snapshot());
      }
      CoordinatorCommand::LeaseHolders { responder } => {
        let result = self.state.leases.holders().await.map_err(QueryError::from);
        let _ = responder.send(result);
      }
      CoordinatorCommand::ForceReleaseRun { run_id, responder } => {
        self.drop_run(run_id);
        let result = self
          .state
          .leases
          .force_release(run_id)
          .await
          .map_err(QueryError::from);
        let _ = responder.send(result);
      }
      CoordinatorCommand::LeaseLost { run_id } => {
        self.on_lease_lost(run_id);
      }
    }
  }

  async fn start_or_resume(&mut self, run_id: RunId) -> Result<(), QueryError> {
    if self.shutting_down.is_some() {
      return Err(QueryError::SchedulerShutdown);
    }
    let run = self
      .state
      .runner_ctx
      .store
      .get_run(run_id)
      .await?
      .ok_or(QueryError::RunNotFound(run_id))?;
    if !matches!(run.run_state, RunState::NotStarted | RunState::Running) {
      debug!(%run_id, state = %run.run_state, "Run is not startable; ignoring.");
      return Ok(());
    }

    self.claim(run_id).await?;
    self.activate(run_id);
    Ok(())
  }

  /// Takes the run's lease, resetting abandoned segments if this instance did not hold it.
  async fn claim(&mut self, run_id: RunId) -> Result<(), QueryError> {
    match self.state.leases.acquire(run_id).await? {
      Acquisition::HeldElsewhere => Err(QueryError::LeaseHeldElsewhere(run_id)),
      // An invocation still in flight owns the running segment, if any.
      Acquisition::Acquired if self.runs.get(&run_id).is_some_and(|entry| entry.in_flight) => Ok(()),
      Acquisition::Acquired => match self.state.recovery.recover_run(run_id).await {
        Ok(_) => Ok(()),
        Err(e) => {
          warn!(%run_id, error = %e, "Recovery failed after acquiring lease; releasing it.");
          self.release_lease(run_id).await;
          Err(e.into())
        }
      },
      Acquisition::AlreadyHeld => Ok(()),
    }
  }

  async fn resume_all(&mut self) -> Result<RecoveryReport, QueryError> {
    if self.shutting_down.is_some() {
      return Err(QueryError::SchedulerShutdown);
    }
    let in_flight: HashSet<RunId> = self
      .runs
      .iter()
      .filter(|(_, entry)| entry.in_flight)
      .map(|(run_id, _)| *run_id)
      .collect();
    let report = self.state.recovery.resume_all(&in_flight).await?;
    for run_id in &report.resumed {
      self.activate(*run_id);
    }
    Ok(report)
  }

  async fn pause_run(&mut self, run_id: RunId) -> Result<(), QueryError> {
    let store = self.state.runner_ctx.store.clone();
    let run = store.get_run(run_id).await?.ok_or(QueryError::RunNotFound(run_id))?;
    if run.run_state != RunState::Running {
      return Err(QueryError::InvalidRunState {
        run_id,
        state: run.run_state,
      });
    }
    if !store
      .update_run_if(&run.with_state(RunState::Paused), RunState::Running)
      .await?
    {
      let state = store
        .get_run(run_id)
        .await?
        .map_or(run.run_state, |current| current.run_state);
      return Err(QueryError::InvalidRunState { run_id, state });
    }
    info!(%run_id, "Repair run paused.");
    if self.drop_run(run_id) {
      debug!(%run_id, "Invocation in flight; lease is released once it reports back.");
    } else {
      self.release_lease(run_id).await;
    }
    Ok(())
  }

  /// The lease is taken before the state flips, so a refused resume leaves the run `Paused`.
  async fn resume_run(&mut self, run_id: RunId) -> Result<(), QueryError> {
    if self.shutting_down.is_some() {
      return Err(QueryError::SchedulerShutdown);
    }
    let store = self.state.runner_ctx.store.clone();
    let run = store.get_run(run_id).await?.ok_or(QueryError::RunNotFound(run_id))?;
    if run.run_state != RunState::Paused {
      return Err(QueryError::InvalidRunState {
        run_id,
        state: run.run_state,
      });
    }
    let was_held = self.state.leases.is_held(run_id);
    self.claim(run_id).await?;
    if !store
      .update_run_if(&run.with_state(RunState::Running), RunState::Paused)
      .await?
    {
      if !was_held {
        self.release_lease(run_id).await;
      }
      let state = store
        .get_run(run_id)
        .await?
        .map_or(run.run_state, |current| current.run_state);
      return Err(QueryError::InvalidRunState { run_id, state });
    }
    info!(%run_id, "Repair run resumed.");
    self.activate(run_id);
    Ok(())
  }

  async fn run_status(&self, run_id: RunId) -> Result<RunStatus, QueryError> {
    let run = self
      .state
      .runner_ctx
      .store
      .get_run(run_id)
      .await?
      .ok_or(QueryError::RunNotFound(run_id))?;
    let activity = self
      .runs
      .get(&run_id)
      .filter(|entry| !entry.detached)
      .and_then(RunEntry::activity);
    Ok(RunStatus {
      run_id,
      run_state: run.run_state,
      activity,
      lease_held: self.state.leases.is_held(run_id),
    })
  }

  // --- Registry ---

  /// Registers the run if needed and makes sure an invocation is due now.
  fn activate(&mut self, run_id: RunId) {
    let ctx = self.state.runner_ctx.clone();
    let entry = self
      .runs
      .entry(run_id)
      .or_insert_with(|| RunEntry::new(RepairRunner::new(run_id, ctx)));
    entry.detached = false;
    entry.faulted = None;
    if entry.in_flight {
      debug!(%run_id, "Invocation in flight; will run again once it returns.");
      entry.restart_requested = true;
      return;
    }
    self.schedule(run_id, Utc::now());
  }

  /// Queues the next invocation at `at`, keeping an earlier one if already queued.
  fn schedule(&mut self, run_id: RunId, at: DateTime<Utc>) {
    let Some(entry) = self.runs.get_mut(&run_id) else {
      warn!(%run_id, "Tried to schedule an unregistered run.");
      return;
    };
    if entry.next_run.is_some_and(|queued| queued <= at) {
      return;
    }
    entry.next_run = Some(at);
    self.queue.push_increase(run_id, Reverse(at));
    trace!(%run_id, next_run = %at, "Queued runner invocation.");
  }

  /// Stops driving a run locally. Store state and leases are not touched.
  /// Returns whether an invocation is still in flight.
  fn drop_run(&mut self, run_id: RunId) -> bool {
    self.queue.remove(&run_id);
    let in_flight = match self.runs.get_mut(&run_id) {
      Some(entry) => {
        entry.next_run = None;
        entry.restart_requested = false;
        entry.in_flight
      }
      None => return false,
    };
    if in_flight {
      if let Some(entry) = self.runs.get_mut(&run_id) {
        entry.detached = true;
      }
    } else {
      self.runs.remove(&run_id);
    }
    debug!(%run_id, in_flight, "Stopped driving run.");
    in_flight
  }

  fn on_lease_lost(&mut self, run_id: RunId) {
    self.state.metrics.leases_lost.fetch_add(1, AtomicOrdering::Relaxed);
    warn!(%run_id, "Lost run lease; no longer scheduling it.");
    self.drop_run(run_id);
  }

  async fn release_lease(&self, run_id: RunId) {
    if let Err(e) = self.state.leases.release(run_id).await {
      warn!(%run_id, error = %e, "Failed to release run lease; it will expire.");
    }
  }

  async fn release_all_leases(&self) {
    for run_id in self.state.leases.held_runs() {
      self.release_lease(run_id).await;
    }
  }

  // --- Worker outcomes ---

  async fn handle_worker_outcome(&mut self, outcome: WorkerOutcome) {
    let run_id = match &outcome {
      WorkerOutcome::Finished { run_id, .. }
      | WorkerOutcome::LeaseLost { run_id, .. }
      | WorkerOutcome::Panicked { run_id, .. } => *run_id,
    };
    let Some(entry) = self.runs.get_mut(&run_id) else {
      warn!(%run_id, "Outcome for an unknown run; discarding.");
      self.state.active_workers_counter.fetch_sub(1, AtomicOrdering::Relaxed);
      return;
    };
    entry.in_flight = false;
    let prev_active = self
      .state
      .active_workers_counter
      .fetch_sub(1, AtomicOrdering::Relaxed);
    self
      .state
      .metrics
      .workers_active_current
      .store(prev_active.saturating_sub(1), AtomicOrdering::Relaxed);
    if entry.detached {
      debug!(%run_id, "Run was dropped while in flight; discarding outcome.");
      self.runs.remove(&run_id);
      // Still held after a pause; already gone after a lost or force-released lease.
      if self.state.leases.is_held(run_id) {
        self.release_lease(run_id).await;
      }
      return;
    }
    let restart = std::mem::take(&mut entry.restart_requested);

    match outcome {
      WorkerOutcome::Finished { result, worker, .. } => match result {
        Ok(NextAction::RunAfter(delay)) => {
          let delay = if restart { Duration::ZERO } else { delay };
          trace!(%run_id, worker_id = worker, delay_ms = delay.as_millis(), "Rescheduling run.");
          self.schedule(run_id, after(delay));
        }
        Ok(NextAction::Stop(_)) if restart => {
          self.schedule(run_id, Utc::now());
        }
        Ok(NextAction::Stop(reason)) => {
          self.on_stopped(run_id, reason).await;
        }
        Err(e) if !e.is_defect() => {
          let delay = self.state.runner_ctx.config.retry_delay;
          warn!(%run_id, worker_id = worker, error = %e, delay_ms = delay.as_millis(), "Invocation failed transiently; retrying later.");
          self.schedule(run_id, after(delay));
        }
        Err(e) => {
          self.on_fault(run_id, e).await;
        }
      },
      WorkerOutcome::LeaseLost { worker, .. } => {
        debug!(%run_id, worker_id = worker, "Worker could not renew lease.");
        self.on_lease_lost(run_id);
      }
      WorkerOutcome::Panicked { worker, .. } => {
        error!(%run_id, worker_id = worker, "Runner invocation panicked; run will not be rescheduled.");
        self.mark_faulted(run_id, "runner invocation panicked".to_string()).await;
      }
    }
  }

  async fn on_stopped(&mut self, run_id: RunId, reason: StopReason) {
    info!(%run_id, ?reason, "Run stopped; releasing lease.");
    self.runs.remove(&run_id);
    self.release_lease(run_id).await;
  }

  async fn on_fault(&mut self, run_id: RunId, err: RunnerError) {
    if matches!(err, RunnerError::Invariant(_)) {
      self
        .state
        .metrics
        .invariant_violations
        .fetch_add(1, AtomicOrdering::Relaxed);
    }
    error!(%run_id, error = %err, "Runner hit a defect; run will not be rescheduled.");
    self.mark_faulted(run_id, err.to_string()).await;
  }

  async fn mark_faulted(&mut self, run_id: RunId, reason: String) {
    if let Some(entry) = self.runs.get_mut(&run_id) {
      entry.faulted = Some(reason);
      entry.next_run = None;
    }
    self.queue.remove(&run_id);
    self.release_lease(run_id).await;
  }

  // --- Dispatch ---

  /// Hands every due run to the worker pool while workers are available.
  fn try_dispatch_runs(&mut self) {
    let now = Utc::now();
    loop {
      let active_workers = self.state.active_workers_counter.load(AtomicOrdering::Relaxed);
      if active_workers >= self.state.max_workers {
        trace!(active_workers, max_workers = self.state.max_workers, "Dispatch check: all workers busy.");
        break;
      }

      let Some((&run_id, &Reverse(due))) = self.queue.peek() else {
        trace!("Dispatch check: queue is empty.");
        break;
      };
      if due > now {
        trace!("Dispatch check: next run is in the future.");
        break;
      }
      self.queue.pop();

      let Some(entry) = self.runs.get_mut(&run_id) else {
        warn!(%run_id, "Queued run has no registry entry; discarding.");
        continue;
      };
      entry.next_run = None;
      if entry.in_flight || entry.faulted.is_some() {
        trace!(%run_id, "Run not dispatchable; skipping.");
        continue;
      }

      let dispatch = Dispatch {
        run_id,
        runner: entry.runner.clone(),
      };
      self.state.active_workers_counter.fetch_add(1, AtomicOrdering::Relaxed);
      match self.state.dispatch_tx.try_send(dispatch) {
        Ok(()) => {
          entry.in_flight = true;
          entry.invocations += 1;
          self.state.metrics.invocations.fetch_add(1, AtomicOrdering::Relaxed);
          trace!(%run_id, "Dispatched run to worker pool.");
        }
        Err(async_channel::TrySendError::Full(_)) => {
          self.state.active_workers_counter.fetch_sub(1, AtomicOrdering::Relaxed);
          entry.next_run = Some(due);
          self.queue.push(run_id, Reverse(due));
          trace!(%run_id, "Dispatch channel full; will retry.");
          break;
        }
        Err(async_channel::TrySendError::Closed(_)) => {
          self.state.active_workers_counter.fetch_sub(1, AtomicOrdering::Relaxed);
          error!(%run_id, "Dispatch channel closed; no workers left.");
          break;
        }
      }
    }
  }

  /// Time until the next queued invocation is due.
  fn calculate_sleep(&self) -> Duration {
    if self.shutting_down.is_some() {
      return SHUTDOWN_POLL;
    }
    let Some((_, Reverse(due))) = self.queue.peek() else {
      return IDLE_SLEEP;
    };
    // A full worker pool is re-checked when an outcome arrives.
    if self.state.active_workers_counter.load(AtomicOrdering::Relaxed) >= self.state.max_workers {
      return IDLE_SLEEP;
    }
    match (*due - Utc::now()).to_std() {
      // Ensure minimum sleep to prevent hot loops if duration is tiny
      Ok(duration) => duration.max(Duration::from_millis(1)),
      // Already due; a full dispatch channel is retried on the next millisecond.
      Err(_) => Duration::from_millis(1),
    }
  }
}

fn after(delay: Duration) -> DateTime<Utc> {
  let now = Utc::now();
  chrono::Duration::from_std(delay)
    .ok()
    .and_then(|delay| now.checked_add_signed(delay))
    .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
