use super::{RunId, SegmentId};

/// Contextual information available to a segment executor via task-locals.
/// Accessible inside `SegmentExecutor::execute` using `try_get_current_job_context()`
/// or the `job_context!()` macro when the `job_context` feature is enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobContext {
  /// The repair run being driven.
  pub run_id: RunId,
  /// The segment handed to the executor.
  pub segment_id: SegmentId,
}

tokio::task_local! {
    /// Provides access to the current `JobContext` within a segment execution scope.
    /// Set by the repair runner if the `job_context` feature is enabled.
    pub static CURRENT_JOB_CONTEXT: JobContext;
}

/// Attempts to retrieve the current `JobContext` for the executing segment.
///
/// Returns `Some(JobContext)` when called from inside a segment executor driven
/// by the runner, `None` otherwise.
pub fn try_get_current_job_context() -> Option<JobContext> {
  CURRENT_JOB_CONTEXT.try_with(|ctx| *ctx).ok()
}

/// Retrieves the current `JobContext`, panicking if called outside a
/// runner-driven segment execution.
///
/// # Panics
/// Panics if the `CURRENT_JOB_CONTEXT` task local has not been set.
#[macro_export]
macro_rules! job_context {
  () => {
    $crate::run::context::CURRENT_JOB_CONTEXT.with(|ctx| *ctx)
  };
}
