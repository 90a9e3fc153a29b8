//! Delay policy between segments.
//!
//! Two delays exist. After a successful segment the next one waits long enough
//! that repairing takes up only `intensity` of the wall-clock time. After a
//! connectivity failure or a timed out segment the runner waits a fixed,
//! configured retry delay regardless of intensity.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::PacingError;
use crate::run::RepairSegment;

/// Fraction of wall-clock time a run spends repairing. Always in (0, 1].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "f64", into = "f64"))]
pub struct Intensity(f64);

impl Intensity {
  /// Full speed: segments run back to back.
  pub const FULL: Intensity = Intensity(1.0);

  /// # Errors
  ///
  /// Returns [`PacingError::IntensityOutOfRange`] for values outside (0, 1], including NaN.
  pub fn new(value: f64) -> Result<Self, PacingError> {
    if value > 0.0 && value <= 1.0 {
      Ok(Self(value))
    } else {
      Err(PacingError::IntensityOutOfRange(value))
    }
  }

  pub fn get(&self) -> f64 {
    self.0
  }
}

impl TryFrom<f64> for Intensity {
  type Error = PacingError;

  fn try_from(value: f64) -> Result<Self, Self::Error> {
    Intensity::new(value)
  }
}

impl From<Intensity> for f64 {
  fn from(intensity: Intensity) -> f64 {
    intensity.0
  }
}

/// Idle time to insert after a segment that took `segment_duration`.
///
/// `delay = duration / intensity - duration`, so work plus idle equals
/// `duration / intensity`. Zero at intensity 1.
pub fn intensity_delay(intensity: Intensity, segment_duration: Duration) -> Duration {
  let work_ms = segment_duration.as_millis() as f64;
  let delay_ms = work_ms / intensity.get() - work_ms;
  // Saturating float-to-int cast; rounding noise below zero becomes zero.
  Duration::from_millis(delay_ms.max(0.0) as u64)
}

/// Duration of a finished segment. A clock step that puts the end before the start counts as zero.
pub fn segment_duration(start: DateTime<Utc>, end: DateTime<Utc>) -> Duration {
  (end - start).to_std().unwrap_or(Duration::ZERO)
}

/// Intensity-based delay for a segment that just reached `Done`.
///
/// # Errors
///
/// Returns [`PacingError::MissingTimestamps`] if the executor did not record both
/// timestamps on the segment.
pub fn delay_after_success(intensity: Intensity, segment: &RepairSegment) -> Result<Duration, PacingError> {
  match (segment.start_time, segment.end_time) {
    (Some(start), Some(end)) => Ok(intensity_delay(intensity, segment_duration(start, end))),
    _ => Err(PacingError::MissingTimestamps(segment.id)),
  }
}
