use crate::command::{CoordinatorCommand, Dispatch, ShutdownMode, WorkerOutcome};
use crate::config::RepairConfig;
use crate::coordinator::{Coordinator, CoordinatorState};
use crate::error::{BuildError, QueryError, ShutdownError};
use crate::executor::{SegmentExecutor, TimeoutEnforcingExecutor};
use crate::lease::{HolderId, LeaseCoordinator, LeaseKeeper, LeaseStore, MemoryLeaseStore};
use crate::metrics::{MetricsSnapshot, RepairMetrics};
use crate::node::ClusterConnector;
use crate::recovery::RecoveryReport;
use crate::run::{RunId, RunStatus, RunSummary};
use crate::runner::RunnerContext;
use crate::storage::StateStore;
use crate::worker::Worker;

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Builder for configuring and creating a [`RepairKeeper`] instance.
///
/// A state store, a cluster connector and a segment executor are required.
/// Without an explicit lease store, an in-process [`MemoryLeaseStore`] is
/// used, which only coordinates instances living in the same process.
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use repairkeeper::{RepairKeeper, MemoryStorage, ClusterConnector, SegmentExecutor};
/// # async fn run(
/// #   connector: Arc<dyn ClusterConnector>,
/// #   executor: Arc<dyn SegmentExecutor>,
/// # ) -> Result<(), Box<dyn std::error::Error>> {
/// let scheduler = RepairKeeper::builder()
///     .max_workers(4)
///     .state_store(Arc::new(MemoryStorage::new()))
///     .cluster_connector(connector)
///     .segment_executor(executor)
///     .build()?;
/// let report = scheduler.resume_all().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct SchedulerBuilder {
  config: RepairConfig,
  holder_id: Option<HolderId>,
  state_store: Option<Arc<dyn StateStore>>,
  lease_store: Option<Arc<dyn LeaseStore>>,
  cluster_connector: Option<Arc<dyn ClusterConnector>>,
  segment_executor: Option<Arc<dyn SegmentExecutor>>,
}

impl fmt::Debug for SchedulerBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SchedulerBuilder")
      .field("config", &self.config)
      .field("holder_id", &self.holder_id)
      .field("state_store", &self.state_store.is_some())
      .field("lease_store", &self.lease_store.is_some())
      .field("cluster_connector", &self.cluster_connector.is_some())
      .field("segment_executor", &self.segment_executor.is_some())
      .finish()
  }
}

impl SchedulerBuilder {
  /// Creates a new builder with [`RepairConfig::default`] and no collaborators.
  pub fn new() -> Self {
    Self::default()
  }

  /// Replaces every tunable at once.
  pub fn config(mut self, config: RepairConfig) -> Self {
    self.config = config;
    self
  }

  /// Sets the maximum number of runner invocations executing at once.
  pub fn max_workers(mut self, count: usize) -> Self {
    self.config.max_workers = count;
    self
  }

  pub fn execution_timeout(mut self, timeout: Duration) -> Self {
    self.config.execution_timeout = timeout;
    self
  }

  pub fn retry_delay(mut self, delay: Duration) -> Self {
    self.config.retry_delay = delay;
    self
  }

  pub fn lease_ttl(mut self, ttl: Duration) -> Self {
    self.config.lease_ttl = ttl;
    self
  }

  pub fn lease_renewal_period(mut self, period: Duration) -> Self {
    self.config.lease_renewal_period = period;
    self
  }

  /// Sets the size of the internal buffer for commands and worker outcomes.
  pub fn command_buffer_size(mut self, size: usize) -> Self {
    self.config.command_buffer_size = size;
    self
  }

  /// Sets the size of the channel used to hand due runs to idle workers.
  pub fn dispatch_buffer_size(mut self, size: usize) -> Self {
    self.config.dispatch_buffer_size = size;
    self
  }

  /// Identity used for leases. Defaults to a fresh UUID v4.
  pub fn holder_id(mut self, holder_id: HolderId) -> Self {
    self.holder_id = Some(holder_id);
    self
  }

  pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
    self.state_store = Some(store);
    self
  }

  pub fn lease_store(mut self, store: Arc<dyn LeaseStore>) -> Self {
    self.lease_store = Some(store);
    self
  }

  pub fn cluster_connector(mut self, connector: Arc<dyn ClusterConnector>) -> Self {
    self.cluster_connector = Some(connector);
    self
  }

  /// The executor is always wrapped in a [`TimeoutEnforcingExecutor`].
  pub fn segment_executor(mut self, executor: Arc<dyn SegmentExecutor>) -> Self {
    self.segment_executor = Some(executor);
    self
  }

  /// Builds and starts the scheduler.
  ///
  /// Spawns the Coordinator task, the worker pool and the lease keeper onto the
  /// current tokio runtime. Nothing is driven until `start_or_resume_job` or
  /// `resume_all` is called.
  ///
  /// # Errors
  ///
  /// Returns a [`BuildError`] if the configuration is invalid or a required
  /// collaborator is missing.
  ///
  /// # Panics
  ///
  /// Panics if called outside a tokio runtime.
  pub fn build(self) -> Result<RepairKeeper, BuildError> {
    self.config.validate()?;
    let config = self.config;
    let store = self
      .state_store
      .ok_or(BuildError::MissingCollaborator("state store"))?;
    let connector = self
      .cluster_connector
      .ok_or(BuildError::MissingCollaborator("cluster connector"))?;
    let executor = self
      .segment_executor
      .ok_or(BuildError::MissingCollaborator("segment executor"))?;
    let lease_store = self
      .lease_store
      .unwrap_or_else(|| Arc::new(MemoryLeaseStore::new()));
    let holder_id = self.holder_id.unwrap_or_else(Uuid::new_v4);
    let max_workers = config.max_workers;

    // --- Initialize Shared State & Channels ---
    let metrics = RepairMetrics::new();
    let active_workers_counter = Arc::new(AtomicUsize::new(0));
    let leases = Arc::new(LeaseCoordinator::new(
      lease_store,
      holder_id,
      config.lease_ttl,
      metrics.clone(),
    ));
    let executor: Arc<dyn SegmentExecutor> =
      Arc::new(TimeoutEnforcingExecutor::new(executor, store.clone()));
    let renewal_period = config.lease_renewal_period;
    let command_buffer_size = config.command_buffer_size.max(1);
    let dispatch_buffer_size = config.dispatch_buffer_size.max(1);
    let runner_ctx = Arc::new(RunnerContext {
      store,
      connector,
      executor,
      config,
      metrics: metrics.clone(),
    });

    let (cmd_tx, cmd_rx) = mpsc::channel::<CoordinatorCommand>(command_buffer_size);
    let (shutdown_tx, shutdown_rx) = watch::channel::<Option<ShutdownMode>>(None);
    let (dispatch_tx, dispatch_rx) = async_channel::bounded::<Dispatch>(dispatch_buffer_size);
    let (worker_outcome_tx, worker_outcome_rx) = mpsc::channel::<WorkerOutcome>(command_buffer_size);

    // --- Spawn Coordinator ---
    let coordinator_state = CoordinatorState::new(
      cmd_rx,
      shutdown_rx.clone(),
      worker_outcome_rx,
      dispatch_tx,
      runner_ctx,
      leases.clone(),
      metrics.clone(),
      active_workers_counter,
      max_workers,
    );
    let coordinator_handle = Handle::current().spawn(async move {
      let mut coordinator = Coordinator::new(coordinator_state);
      coordinator.run().await;
      info!("Coordinator task finished.");
    });

    // --- Spawn Workers ---
    let mut worker_handles = Vec::with_capacity(max_workers);
    for worker_id in 0..max_workers {
      let mut worker = Worker::new(
        worker_id,
        leases.clone(),
        metrics.clone(),
        shutdown_rx.clone(),
        worker_outcome_tx.clone(),
        dispatch_rx.clone(),
      );
      worker_handles.push(Handle::current().spawn(async move { worker.run().await }));
    }
    // Drop the original outcome sender, workers hold the clones
    drop(worker_outcome_tx);

    // --- Spawn Lease Keeper ---
    let mut keeper = LeaseKeeper::new(leases, renewal_period, shutdown_rx, cmd_tx.clone());
    let keeper_handle = Handle::current().spawn(async move { keeper.run().await });

    info!(%holder_id, max_workers, "Repair scheduler started.");
    Ok(RepairKeeper {
      holder_id,
      metrics,
      cmd_tx,
      shutdown_tx,
      coordinator_handle: Arc::new(Mutex::new(Some(coordinator_handle))),
      keeper_handle: Arc::new(Mutex::new(Some(keeper_handle))),
      worker_handles: Arc::new(Mutex::new(worker_handles)),
    })
  }
}

/// Handle to a running repair scheduler instance.
///
/// Drives repair runs segment by segment on a bounded worker pool, with one
/// lease per run so that several instances sharing a state store never drive
/// the same run at once.
///
/// Use [`RepairKeeper::builder()`] to create and configure an instance.
#[derive(Debug)]
pub struct RepairKeeper {
  holder_id: HolderId,
  metrics: RepairMetrics, // Cloneable struct containing Arcs
  cmd_tx: mpsc::Sender<CoordinatorCommand>,
  shutdown_tx: watch::Sender<Option<ShutdownMode>>,
  // Task handles for shutdown
  coordinator_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
  keeper_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
  worker_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl RepairKeeper {
  /// Returns a builder to configure and create a `RepairKeeper` instance.
  pub fn builder() -> SchedulerBuilder {
    SchedulerBuilder::new()
  }

  /// The identity this instance uses for leases.
  pub fn holder_id(&self) -> HolderId {
    self.holder_id
  }

  async fn request<T>(
    &self,
    command: impl FnOnce(oneshot::Sender<T>) -> CoordinatorCommand,
  ) -> Result<T, QueryError> {
    let (responder, response_rx) = oneshot::channel();
    self
      .cmd_tx
      .send(command(responder))
      .await
      .map_err(|_| QueryError::SchedulerShutdown)?;
    response_rx.await.map_err(|_| QueryError::ResponseFailed)
  }

  /// (Re)activates a run's driver on this instance.
  ///
  /// Acquires the run's lease; if this instance did not hold it before, any
  /// segment left `Running` by a previous owner is reset first. The first
  /// invocation is due immediately. A run that is `Paused`, `Done` or `Error`
  /// is left untouched.
  ///
  /// # Errors
  ///
  /// - [`QueryError::RunNotFound`]: No such run in the state store.
  /// - [`QueryError::LeaseHeldElsewhere`]: Another instance drives the run.
  /// - [`QueryError::SchedulerShutdown`]: Scheduler is shutting down or gone.
  /// - [`QueryError::Storage`] / [`QueryError::Lease`]: A collaborator failed.
  pub async fn start_or_resume_job(&self, run_id: RunId) -> Result<(), QueryError> {
    self
      .request(|responder| CoordinatorCommand::StartOrResume { run_id, responder })
      .await?
  }

  /// Recovery sweep, meant to be called once at process start.
  ///
  /// Every run persisted as `Running` whose lease this instance can take is
  /// cleaned of abandoned `Running` segments and started.
  ///
  /// # Errors
  ///
  /// - [`QueryError::SchedulerShutdown`]: Scheduler is shutting down or gone.
  /// - [`QueryError::Storage`]: Running runs could not be listed.
  pub async fn resume_all(&self) -> Result<RecoveryReport, QueryError> {
    self
      .request(|responder| CoordinatorCommand::ResumeAll { responder })
      .await?
  }

  /// Moves a `Running` run to `Paused` and stops driving it here.
  ///
  /// An invocation already executing is not interrupted; its outcome is discarded.
  ///
  /// # Errors
  ///
  /// - [`QueryError::RunNotFound`]: No such run.
  /// - [`QueryError::InvalidRunState`]: The run is not `Running`.
  pub async fn pause_run(&self, run_id: RunId) -> Result<(), QueryError> {
    self
      .request(|responder| CoordinatorCommand::PauseRun { run_id, responder })
      .await?
  }

  /// Moves a `Paused` run back to `Running` and starts driving it, as
  /// [`start_or_resume_job`](Self::start_or_resume_job) does.
  ///
  /// # Errors
  ///
  /// - [`QueryError::RunNotFound`]: No such run.
  /// - [`QueryError::InvalidRunState`]: The run is not `Paused`.
  /// - [`QueryError::LeaseHeldElsewhere`]: Another instance holds the lease.
  pub async fn resume_run(&self, run_id: RunId) -> Result<(), QueryError> {
    self
      .request(|responder| CoordinatorCommand::ResumeRun { run_id, responder })
      .await?
  }

  /// Persisted state of a run plus what this instance is doing with it.
  pub async fn get_run_status(&self, run_id: RunId) -> Result<RunStatus, QueryError> {
    self
      .request(|responder| CoordinatorCommand::GetRunStatus { run_id, responder })
      .await?
  }

  /// Runs this instance currently drives (queued, in flight or faulted).
  pub async fn list_scheduled_runs(&self) -> Result<Vec<RunSummary>, QueryError> {
    self
      .request(|responder| CoordinatorCommand::ListScheduledRuns { responder })
      .await
  }

  /// Retrieves a snapshot of the current scheduler metrics.
  ///
  /// Still answers after shutdown, from the counters as the tasks left them.
  pub async fn get_metrics_snapshot(&self) -> Result<MetricsSnapshot, QueryError> {
    match self
      .request(|responder| CoordinatorCommand::GetMetricsSnapshot { responder })
      .await
    {
      Err(QueryError::SchedulerShutdown | QueryError::ResponseFailed) => Ok(self.metrics.snapshot()),
      other => other,
    }
  }

  /// Instances holding at least one unexpired lease in the shared lease store.
  pub async fn lease_holders(&self) -> Result<HashSet<HolderId>, QueryError> {
    self
      .request(|responder| CoordinatorCommand::LeaseHolders { responder })
      .await?
  }

  /// Deletes a run's lease whoever holds it. Meant for a holder known to be dead.
  ///
  /// If this instance was driving the run, it stops doing so.
  pub async fn force_release_run(&self, run_id: RunId) -> Result<(), QueryError> {
    self
      .request(|responder| CoordinatorCommand::ForceReleaseRun { run_id, responder })
      .await?
  }

  /// Initiates a graceful shutdown.
  ///
  /// Stops dispatching, waits for in-flight invocations to report back,
  /// releases every held lease, then waits for all tasks to finish or until
  /// the optional timeout elapses.
  ///
  /// # Errors
  ///
  /// - [`ShutdownError::AlreadyShuttingDown`]: A shutdown was already requested.
  /// - [`ShutdownError::SignalFailed`]: Failed to send the shutdown signal.
  /// - [`ShutdownError::Timeout`]: Waiting for tasks exceeded the timeout.
  /// - [`ShutdownError::TaskPanic`]: A task panicked during shutdown.
  pub async fn shutdown_graceful(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    if self.shutdown_tx.borrow().is_some() {
      return Err(ShutdownError::AlreadyShuttingDown);
    }
    info!("Initiating graceful shutdown...");
    self
      .shutdown_tx
      .send(Some(ShutdownMode::Graceful))
      .map_err(|_| ShutdownError::SignalFailed)?;
    self.await_shutdown(timeout).await
  }

  /// Initiates a forced shutdown.
  ///
  /// In-flight invocations are aborted and leases are left to expire. May
  /// follow a graceful shutdown that timed out.
  ///
  /// # Errors
  ///
  /// Same as [`shutdown_graceful`](Self::shutdown_graceful).
  pub async fn shutdown_force(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    if *self.shutdown_tx.borrow() == Some(ShutdownMode::Force) {
      return Err(ShutdownError::AlreadyShuttingDown);
    }
    info!("Initiating forced shutdown...");
    self
      .shutdown_tx
      .send(Some(ShutdownMode::Force))
      .map_err(|_| ShutdownError::SignalFailed)?;
    self.await_shutdown(timeout).await
  }

  /// Helper to wait for task handles during shutdown.
  async fn await_shutdown(&self, timeout_duration: Option<Duration>) -> Result<(), ShutdownError> {
    let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
    if let Some(handle) = self.coordinator_handle.lock().await.take() {
      handles.push(("coordinator", handle));
    }
    if let Some(handle) = self.keeper_handle.lock().await.take() {
      handles.push(("lease keeper", handle));
    }
    handles.extend(
      std::mem::take(&mut *self.worker_handles.lock().await)
        .into_iter()
        .map(|handle| ("worker", handle)),
    );

    if handles.is_empty() {
      warn!("No tasks found to await during shutdown.");
      return Ok(());
    }

    let join_all_fut = try_join_all(handles.into_iter().map(|(task, handle)| async move {
      handle.await.map_err(|e| {
        error!(task, "Task panicked: {:?}", e);
        ShutdownError::TaskPanic
      })
    }));

    let result = match timeout_duration {
      Some(timeout) => match tokio::time::timeout(timeout, join_all_fut).await {
        Ok(joined) => joined.map(|_| ()),
        Err(_) => {
          error!("Shutdown timed out after {:?}", timeout);
          Err(ShutdownError::Timeout)
        }
      },
      None => join_all_fut.await.map(|_| ()),
    };

    if result.is_ok() {
      info!("All tasks joined successfully.");
    } else {
      error!("Error during shutdown task joining: {:?}", result);
    }
    result
  }
}
