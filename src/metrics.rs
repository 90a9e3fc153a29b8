use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// --- Simple Histogram Implementation ---

/// A basic concurrent histogram storing count and sum.
///
/// Suitable for simple latency tracking without detailed percentile information.
/// Uses `Relaxed` ordering for potentially higher performance where strict
/// inter-metric consistency isn't critical.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  /// Records a duration observation in the histogram.
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  /// Gets the total number of observations recorded.
  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Gets the total sum of durations recorded (in microseconds).
  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Main Metrics Struct (Internal State) ---

/// Internal state for tracking scheduler metrics using atomic counters.
///
/// Cloned into the Coordinator, Workers, runners and the lease coordinator.
/// Cloning only clones the `Arc`s.
#[derive(Debug, Clone, Default)]
pub struct RepairMetrics {
  // --- Counters (Monotonically increasing) ---
  /// Runner invocations dispatched to workers.
  pub invocations: Arc<AtomicUsize>,
  /// Runs moved from `NotStarted` to `Running` by this instance.
  pub runs_started: Arc<AtomicUsize>,
  /// Runs this instance moved to `Done`.
  pub runs_completed: Arc<AtomicUsize>,
  /// Runs this instance moved to `Error` (unmappable token range).
  pub runs_errored: Arc<AtomicUsize>,
  /// Segments observed `Done` after execution.
  pub segments_succeeded: Arc<AtomicUsize>,
  /// Segments observed back in `NotStarted` after execution (timed out or failed).
  pub segment_retries: Arc<AtomicUsize>,
  /// Invocations postponed because the cluster connection could not be re-established.
  pub connectivity_retries: Arc<AtomicUsize>,
  /// Leases acquired (not counting renewals).
  pub leases_acquired: Arc<AtomicUsize>,
  /// Runs dropped because their lease could not be renewed.
  pub leases_lost: Arc<AtomicUsize>,
  /// Segments reset from `Running` to `NotStarted` by recovery.
  pub segments_recovered: Arc<AtomicUsize>,
  /// Invocations that ended in an invariant violation.
  pub invariant_violations: Arc<AtomicUsize>,
  /// Invocations that panicked.
  pub invocations_panicked: Arc<AtomicUsize>,

  // --- Gauges (Current state values) ---
  /// Invocations waiting in the timer queue.
  pub scheduled_current: Arc<AtomicUsize>,
  /// Workers currently executing an invocation.
  pub workers_active_current: Arc<AtomicUsize>,
  /// Run leases this instance currently holds.
  pub leases_held_current: Arc<AtomicUsize>,

  // --- Histograms/Summaries ---
  /// Wall time of segment executions, as seen by the runner.
  pub segment_execution_duration: Arc<SimpleHistogram>,
}

impl RepairMetrics {
  /// Creates a new `RepairMetrics` instance with all counters initialized to zero.
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates a snapshot of the current metric values.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;

    MetricsSnapshot {
      invocations: self.invocations.load(order),
      runs_started: self.runs_started.load(order),
      runs_completed: self.runs_completed.load(order),
      runs_errored: self.runs_errored.load(order),
      segments_succeeded: self.segments_succeeded.load(order),
      segment_retries: self.segment_retries.load(order),
      connectivity_retries: self.connectivity_retries.load(order),
      leases_acquired: self.leases_acquired.load(order),
      leases_lost: self.leases_lost.load(order),
      segments_recovered: self.segments_recovered.load(order),
      invariant_violations: self.invariant_violations.load(order),
      invocations_panicked: self.invocations_panicked.load(order),
      scheduled_current: self.scheduled_current.load(order),
      workers_active_current: self.workers_active_current.load(order),
      leases_held_current: self.leases_held_current.load(order),
      segment_execution_duration_count: self.segment_execution_duration.get_count(),
      segment_execution_duration_sum_micros: self.segment_execution_duration.get_sum_micros(),
    }
  }
}

// --- Metrics Snapshot Struct (Public Data) ---

/// A snapshot of the scheduler's metrics at a specific point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricsSnapshot {
  // Counters
  pub invocations: usize,
  pub runs_started: usize,
  pub runs_completed: usize,
  pub runs_errored: usize,
  pub segments_succeeded: usize,
  pub segment_retries: usize,
  pub connectivity_retries: usize,
  pub leases_acquired: usize,
  pub leases_lost: usize,
  pub segments_recovered: usize,
  pub invariant_violations: usize,
  pub invocations_panicked: usize,
  // Gauges
  pub scheduled_current: usize,
  pub workers_active_current: usize,
  pub leases_held_current: usize,
  // Histogram Data
  pub segment_execution_duration_count: usize,
  pub segment_execution_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean segment execution duration, if any segment was executed.
  pub fn mean_segment_duration(&self) -> Option<Duration> {
    if self.segment_execution_duration_count == 0 {
      None
    } else {
      Some(Duration::from_micros(
        (self.segment_execution_duration_sum_micros / self.segment_execution_duration_count) as u64,
      ))
    }
  }
}
