//! The segment executor seam.
//!
//! An executor claims a segment (`NotStarted` → `Running`), triggers the repair
//! on one of the candidate coordinators, and records the outcome. The runner
//! only looks at the segment's persisted state once `execute` returns.
//!
//! The executor owns timeouts: when `execute` returns, the segment is either
//! `Done` (with both timestamps set) or back in `NotStarted`.
//! [`TimeoutEnforcingExecutor`] guarantees that for any inner executor, and the
//! scheduler builder always installs it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::ExecutorError;
use crate::run::{SegmentId, SegmentState};
use crate::storage::{postpone_segment, StateStore};

#[async_trait]
pub trait SegmentExecutor: Send + Sync {
  /// Repairs one segment using one of `coordinators`, giving up after `timeout`.
  async fn execute(&self, segment_id: SegmentId, coordinators: &[String], timeout: Duration) -> Result<(), ExecutorError>;
}

/// Wraps an executor so that a hung or failed attempt never leaves its segment `Running`.
///
/// If the inner executor overruns `timeout`, it is dropped (cancelling the attempt)
/// and the segment is postponed. If it fails while the segment is still
/// `Running`, the segment is postponed as well. A successful return is passed
/// through untouched.
pub struct TimeoutEnforcingExecutor {
  inner: Arc<dyn SegmentExecutor>,
  store: Arc<dyn StateStore>,
}

impl TimeoutEnforcingExecutor {
  pub fn new(inner: Arc<dyn SegmentExecutor>, store: Arc<dyn StateStore>) -> Self {
    Self { inner, store }
  }

  async fn postpone_if_running(&self, segment_id: SegmentId) -> Result<(), ExecutorError> {
    if let Some(segment) = self.store.get_segment(segment_id).await? {
      if segment.state == SegmentState::Running {
        postpone_segment(self.store.as_ref(), &segment).await?;
      }
    }
    Ok(())
  }
}

#[async_trait]
impl SegmentExecutor for TimeoutEnforcingExecutor {
  async fn execute(&self, segment_id: SegmentId, coordinators: &[String], timeout: Duration) -> Result<(), ExecutorError> {
    match tokio::time::timeout(timeout, self.inner.execute(segment_id, coordinators, timeout)).await {
      Ok(Ok(())) => {
        debug!(%segment_id, "Segment executor returned.");
        Ok(())
      }
      Ok(Err(e)) => {
        warn!(%segment_id, error = %e, "Segment execution failed, postponing segment.");
        self.postpone_if_running(segment_id).await?;
        Err(e)
      }
      Err(_) => {
        warn!(%segment_id, timeout_ms = timeout.as_millis(), "Segment execution timed out, postponing segment.");
        self.postpone_if_running(segment_id).await?;
        Ok(())
      }
    }
  }
}
