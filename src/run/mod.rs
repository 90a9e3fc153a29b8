#[cfg(feature = "job_context")]
pub mod context;

use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::PacingError;
use crate::pacing::Intensity;
use crate::ring::RingRange;

// --- Public Type Aliases ---

/// Unique identifier of a repair run. Uses UUID v4.
pub type RunId = Uuid;

/// Unique identifier of a repair segment. Uses UUID v4.
pub type SegmentId = Uuid;

/// Unique identifier of a repair unit (keyspace/table group).
pub type RepairUnitId = Uuid;

/// Simple numeric ID assigned to worker tasks for logging.
pub(crate) type WorkerId = usize;

// --- States ---

/// Lifecycle state of a repair run.
///
/// `Done` and `Error` are terminal. `Paused` is set from outside and makes the
/// runner stand down without rescheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RunState {
  NotStarted,
  Running,
  Paused,
  Done,
  Error,
}

impl RunState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, RunState::Done | RunState::Error)
  }
}

impl fmt::Display for RunState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RunState::NotStarted => write!(f, "NOT_STARTED"),
      RunState::Running => write!(f, "RUNNING"),
      RunState::Paused => write!(f, "PAUSED"),
      RunState::Done => write!(f, "DONE"),
      RunState::Error => write!(f, "ERROR"),
    }
  }
}

/// Lifecycle state of a repair segment.
///
/// A failed or timed out attempt shows up as a return to `NotStarted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SegmentState {
  NotStarted,
  Running,
  Done,
}

impl fmt::Display for SegmentState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SegmentState::NotStarted => write!(f, "NOT_STARTED"),
      SegmentState::Running => write!(f, "RUNNING"),
      SegmentState::Done => write!(f, "DONE"),
    }
  }
}

// --- Records ---

/// A cluster the scheduler can connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Cluster {
  pub name: String,
  /// Hosts tried, in order, when (re)establishing a connection.
  pub seed_hosts: Vec<String>,
}

impl Cluster {
  pub fn new(name: &str, seed_hosts: Vec<String>) -> Self {
    Self {
      name: name.to_string(),
      seed_hosts,
    }
  }
}

/// The logical data a repair run covers: one keyspace (and optionally a subset of its tables).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RepairUnit {
  pub id: RepairUnitId,
  pub cluster_name: String,
  pub keyspace: String,
  /// Empty means every table of the keyspace.
  pub column_families: Vec<String>,
}

impl RepairUnit {
  pub fn new(cluster_name: &str, keyspace: &str, column_families: Vec<String>) -> Self {
    Self {
      id: Uuid::new_v4(),
      cluster_name: cluster_name.to_string(),
      keyspace: keyspace.to_string(),
      column_families,
    }
  }
}

/// One repair campaign over one repair unit on one cluster.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RepairRun {
  pub id: RunId,
  pub cluster_name: String,
  pub repair_unit_id: RepairUnitId,
  pub run_state: RunState,
  /// Fraction of wall-clock time spent repairing; always in (0, 1].
  pub intensity: Intensity,
  pub start_time: Option<DateTime<Utc>>,
  pub end_time: Option<DateTime<Utc>>,
}

impl RepairRun {
  /// Creates a `NotStarted` run.
  ///
  /// # Errors
  ///
  /// Returns [`PacingError::IntensityOutOfRange`] if `intensity` is not in (0, 1].
  pub fn new(cluster_name: &str, repair_unit_id: RepairUnitId, intensity: f64) -> Result<Self, PacingError> {
    Ok(Self {
      id: Uuid::new_v4(),
      cluster_name: cluster_name.to_string(),
      repair_unit_id,
      run_state: RunState::NotStarted,
      intensity: Intensity::new(intensity)?,
      start_time: None,
      end_time: None,
    })
  }

  /// Copy of this run moved to `state`.
  pub fn with_state(&self, state: RunState) -> Self {
    Self {
      run_state: state,
      ..self.clone()
    }
  }
}

/// One bounded token range of a repair run.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RepairSegment {
  pub id: SegmentId,
  pub run_id: RunId,
  pub token_range: RingRange,
  pub state: SegmentState,
  /// How many attempts were abandoned (timed out, failed, or reset by recovery).
  pub fail_count: u32,
  pub start_time: Option<DateTime<Utc>>,
  pub end_time: Option<DateTime<Utc>>,
}

impl RepairSegment {
  pub fn new(run_id: RunId, token_range: RingRange) -> Self {
    Self {
      id: Uuid::new_v4(),
      run_id,
      token_range,
      state: SegmentState::NotStarted,
      fail_count: 0,
      start_time: None,
      end_time: None,
    }
  }

  /// Splits `ranges` into fresh segments for `run_id`.
  pub fn for_ranges(run_id: RunId, ranges: impl IntoIterator<Item = RingRange>) -> Vec<Self> {
    ranges
      .into_iter()
      .map(|range| Self::new(run_id, range))
      .collect()
  }
}

// --- Public Snapshot Structs for Querying ---

/// Where a run currently is inside this scheduler instance.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RunActivity {
  /// Waiting in the timer queue.
  Scheduled { next_run: DateTime<Utc> },
  /// An invocation is executing on a worker.
  InFlight,
  /// The last invocation hit a defect; the run is no longer driven.
  Faulted { reason: String },
}

/// Status of a run as seen by this scheduler instance.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RunStatus {
  pub run_id: RunId,
  /// Persisted state, read from the state store.
  pub run_state: RunState,
  /// `None` if this instance is not driving the run.
  pub activity: Option<RunActivity>,
  /// Whether this instance believes it holds the run's lease.
  pub lease_held: bool,
}

/// Summary of a run this instance is driving.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RunSummary {
  pub run_id: RunId,
  pub activity: RunActivity,
  pub invocations: u64,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn new_run_rejects_bad_intensity() {
    let unit = Uuid::new_v4();
    assert!(RepairRun::new("c", unit, 0.0).is_err());
    assert!(RepairRun::new("c", unit, 1.5).is_err());
    let run = RepairRun::new("c", unit, 0.5).unwrap();
    assert_eq!(run.run_state, RunState::NotStarted);
    assert!(run.start_time.is_none());
  }

  #[test]
  fn terminal_states() {
    assert!(RunState::Done.is_terminal());
    assert!(RunState::Error.is_terminal());
    assert!(!RunState::Paused.is_terminal());
    assert!(!RunState::Running.is_terminal());
  }
}
