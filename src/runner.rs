//! The per-run driver.
//!
//! A [`RepairRunner`] walks one repair run through its segments, one segment
//! per invocation. It never sleeps: each invocation returns a [`NextAction`]
//! and the coordinator decides when to invoke it again.

use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::command::{NextAction, StopReason};
use crate::config::RepairConfig;
use crate::error::{InvariantViolation, RunnerError, StorageError};
use crate::executor::SegmentExecutor;
use crate::metrics::RepairMetrics;
use crate::node::{ClusterConnector, NodeConnection};
use crate::pacing::delay_after_success;
use crate::run::{RepairRun, RepairSegment, RunId, RunState, SegmentState};
use crate::storage::StateStore;

#[cfg(feature = "job_context")]
use crate::run::context::{JobContext, CURRENT_JOB_CONTEXT};

/// Collaborators and settings shared by every runner of one scheduler instance.
pub(crate) struct RunnerContext {
  pub store: Arc<dyn StateStore>,
  pub connector: Arc<dyn ClusterConnector>,
  pub executor: Arc<dyn SegmentExecutor>,
  pub config: RepairConfig,
  pub metrics: RepairMetrics,
}

pub(crate) struct RepairRunner {
  run_id: RunId,
  /// Owned by this run only; lazily re-established when it goes stale.
  connection: Option<Box<dyn NodeConnection>>,
  ctx: Arc<RunnerContext>,
}

impl RepairRunner {
  pub fn new(run_id: RunId, ctx: Arc<RunnerContext>) -> Self {
    Self {
      run_id,
      connection: None,
      ctx,
    }
  }

  /// One scheduling step: start the run if needed, then handle at most one segment.
  pub async fn run_once(&mut self) -> Result<NextAction, RunnerError> {
    let store = self.ctx.store.clone();
    let Some(run) = store.get_run(self.run_id).await? else {
      warn!(run_id = %self.run_id, "Repair run disappeared from the store.");
      return Ok(NextAction::Stop(StopReason::RunNotFound));
    };

    let run = match run.run_state {
      RunState::NotStarted => {
        let started = RepairRun {
          run_state: RunState::Running,
          start_time: Some(Utc::now()),
          ..run
        };
        if !store.update_run_if(&started, RunState::NotStarted).await? {
          debug!(run_id = %self.run_id, "Run state changed while starting; re-reading.");
          return self.stop_on_current_state().await;
        }
        self.ctx.metrics.runs_started.fetch_add(1, AtomicOrdering::Relaxed);
        info!(run_id = %self.run_id, cluster = %started.cluster_name, "Repair run started.");
        started
      }
      RunState::Running => run,
      state => {
        debug!(run_id = %self.run_id, %state, "Run is not running; nothing to do.");
        return Ok(NextAction::Stop(StopReason::Idle(state)));
      }
    };

    self.advance(&run).await
  }

  async fn advance(&mut self, run: &RepairRun) -> Result<NextAction, RunnerError> {
    let store = self.ctx.store.clone();
    let running = store
      .count_segments_in_state(run.id, SegmentState::Running)
      .await?;
    if running > 0 {
      return Err(
        InvariantViolation::ConcurrentSegment {
          run_id: run.id,
          running,
        }
        .into(),
      );
    }

    let Some(segment) = store.next_free_segment(run.id).await? else {
      return self.finish(run, RunState::Done).await;
    };

    if !self.ensure_connected(run).await? {
      self
        .ctx
        .metrics
        .connectivity_retries
        .fetch_add(1, AtomicOrdering::Relaxed);
      let delay = self.ctx.config.retry_delay;
      warn!(run_id = %run.id, cluster = %run.cluster_name, delay_ms = delay.as_millis(), "Cluster unreachable, retrying later.");
      return Ok(NextAction::RunAfter(delay));
    }

    let coordinators = self.resolve_coordinators(run, &segment).await?;
    if coordinators.is_empty() {
      error!(
        run_id = %run.id,
        segment_id = %segment.id,
        range = %segment.token_range,
        "No coordinator owns the segment's token range; failing the run."
      );
      return self.finish(run, RunState::Error).await;
    }

    self.execute(run, &segment, &coordinators).await
  }

  /// Returns `false` if no live connection could be obtained.
  async fn ensure_connected(&mut self, run: &RepairRun) -> Result<bool, RunnerError> {
    if let Some(connection) = &self.connection {
      if connection.is_connection_alive().await {
        return Ok(true);
      }
      debug!(run_id = %run.id, "Cluster connection went stale; reconnecting.");
      self.connection = None;
    }

    let cluster = self
      .ctx
      .store
      .get_cluster(&run.cluster_name)
      .await?
      .ok_or_else(|| StorageError::ClusterNotFound(run.cluster_name.clone()))?;
    match self.ctx.connector.connect(&cluster).await {
      Ok(connection) => {
        self.connection = Some(connection);
        Ok(true)
      }
      Err(e) => {
        warn!(run_id = %run.id, error = %e, "Failed to connect to cluster.");
        Ok(false)
      }
    }
  }

  async fn resolve_coordinators(&self, run: &RepairRun, segment: &RepairSegment) -> Result<Vec<String>, RunnerError> {
    let unit = self
      .ctx
      .store
      .get_repair_unit(run.repair_unit_id)
      .await?
      .ok_or(StorageError::RepairUnitNotFound(run.repair_unit_id))?;
    let Some(connection) = &self.connection else {
      return Ok(Vec::new());
    };
    match connection
      .token_range_to_endpoints(&unit.keyspace, &segment.token_range)
      .await
    {
      Ok(endpoints) => Ok(endpoints),
      Err(e) => {
        warn!(run_id = %run.id, segment_id = %segment.id, error = %e, "Topology lookup failed.");
        Ok(Vec::new())
      }
    }
  }

  async fn execute(
    &self,
    run: &RepairRun,
    segment: &RepairSegment,
    coordinators: &[String],
  ) -> Result<NextAction, RunnerError> {
    debug!(run_id = %run.id, segment_id = %segment.id, ?coordinators, "Handing segment to executor.");
    let started = Instant::now();
    let execution = self
      .ctx
      .executor
      .execute(segment.id, coordinators, self.ctx.config.execution_timeout);

    #[cfg(feature = "job_context")]
    let result = {
      let context = JobContext {
        run_id: run.id,
        segment_id: segment.id,
      };
      CURRENT_JOB_CONTEXT.scope(context, execution).await
    };
    #[cfg(not(feature = "job_context"))]
    let result = execution.await;

    let elapsed = started.elapsed();
    self.ctx.metrics.segment_execution_duration.record(elapsed);
    if let Err(e) = result {
      warn!(run_id = %run.id, segment_id = %segment.id, error = %e, "Segment executor reported an error.");
    }

    let after = self
      .ctx
      .store
      .get_segment(segment.id)
      .await?
      .ok_or(StorageError::SegmentNotFound(segment.id))?;
    match after.state {
      SegmentState::NotStarted => {
        self
          .ctx
          .metrics
          .segment_retries
          .fetch_add(1, AtomicOrdering::Relaxed);
        let delay = self.ctx.config.retry_delay;
        warn!(
          run_id = %run.id,
          segment_id = %segment.id,
          fail_count = after.fail_count,
          delay_ms = delay.as_millis(),
          "Segment did not complete, retrying later."
        );
        Ok(NextAction::RunAfter(delay))
      }
      SegmentState::Done => {
        self
          .ctx
          .metrics
          .segments_succeeded
          .fetch_add(1, AtomicOrdering::Relaxed);
        let delay = delay_after_success(run.intensity, &after)?;
        info!(
          run_id = %run.id,
          segment_id = %segment.id,
          elapsed_ms = elapsed.as_millis(),
          delay_ms = delay.as_millis(),
          "Segment repaired."
        );
        Ok(NextAction::RunAfter(delay))
      }
      state => Err(
        InvariantViolation::UnexpectedSegmentState {
          segment_id: segment.id,
          state,
        }
        .into(),
      ),
    }
  }

  /// Moves the run from `Running` to `Done` or `Error` and stamps its end time.
  async fn finish(&self, run: &RepairRun, state: RunState) -> Result<NextAction, RunnerError> {
    let finished = RepairRun {
      run_state: state,
      end_time: Some(Utc::now()),
      ..run.clone()
    };
    if !self
      .ctx
      .store
      .update_run_if(&finished, RunState::Running)
      .await?
    {
      debug!(run_id = %run.id, target = %state, "Run state changed before it could be finished.");
      return self.stop_on_current_state().await;
    }
    if state == RunState::Done {
      self.ctx.metrics.runs_completed.fetch_add(1, AtomicOrdering::Relaxed);
      info!(run_id = %run.id, "Repair run done.");
      Ok(NextAction::Stop(StopReason::Completed))
    } else {
      self.ctx.metrics.runs_errored.fetch_add(1, AtomicOrdering::Relaxed);
      error!(run_id = %run.id, "Repair run moved to ERROR.");
      Ok(NextAction::Stop(StopReason::Errored))
    }
  }

  /// After losing a compare-and-update: stop if the run left `Running`, otherwise try again right away.
  async fn stop_on_current_state(&self) -> Result<NextAction, RunnerError> {
    match self.ctx.store.get_run(self.run_id).await? {
      None => Ok(NextAction::Stop(StopReason::RunNotFound)),
      Some(run) if matches!(run.run_state, RunState::Running | RunState::NotStarted) => {
        Ok(NextAction::RunAfter(Duration::ZERO))
      }
      Some(run) => Ok(NextAction::Stop(StopReason::Idle(run.run_state))),
    }
  }
}
