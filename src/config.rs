use std::time::Duration;

use crate::error::BuildError;

const DEFAULT_MAX_WORKERS: usize = 15;
const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(90);
const DEFAULT_LEASE_RENEWAL_PERIOD: Duration = Duration::from_secs(30);
const DEFAULT_CHANNEL_BOUND: usize = 128; // For command and outcome channels
const DEFAULT_DISPATCH_BOUND: usize = 1; // For coordinator -> worker dispatch

/// Tunables of a scheduler instance.
///
/// Every value is supplied by the host; nothing is derived or loaded here.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RepairConfig {
  /// Runner invocations that may execute at the same time, across all runs.
  pub max_workers: usize,
  /// Hard limit handed to the segment executor for one segment.
  pub execution_timeout: Duration,
  /// Fixed delay before retrying after a connectivity failure or a timed-out segment.
  pub retry_delay: Duration,
  /// Lifetime of a run lease between renewals.
  pub lease_ttl: Duration,
  /// How often held leases are renewed. Must be strictly shorter than `lease_ttl`.
  pub lease_renewal_period: Duration,
  pub command_buffer_size: usize,
  /// Size of the channel handing runs to idle workers. 1 gives the tightest backpressure.
  pub dispatch_buffer_size: usize,
}

impl Default for RepairConfig {
  fn default() -> Self {
    Self {
      max_workers: DEFAULT_MAX_WORKERS,
      execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
      retry_delay: DEFAULT_RETRY_DELAY,
      lease_ttl: DEFAULT_LEASE_TTL,
      lease_renewal_period: DEFAULT_LEASE_RENEWAL_PERIOD,
      command_buffer_size: DEFAULT_CHANNEL_BOUND,
      dispatch_buffer_size: DEFAULT_DISPATCH_BOUND,
    }
  }
}

impl RepairConfig {
  /// Checks the values against each other.
  ///
  /// # Errors
  ///
  /// - [`BuildError::MissingOrZeroMaxWorkers`] if `max_workers` is zero.
  /// - [`BuildError::ZeroDuration`] if any duration is zero.
  /// - [`BuildError::RenewalNotShorterThanTtl`] if leases could expire between renewals.
  pub fn validate(&self) -> Result<(), BuildError> {
    if self.max_workers == 0 {
      return Err(BuildError::MissingOrZeroMaxWorkers);
    }
    for (name, value) in [
      ("execution_timeout", self.execution_timeout),
      ("retry_delay", self.retry_delay),
      ("lease_ttl", self.lease_ttl),
      ("lease_renewal_period", self.lease_renewal_period),
    ] {
      if value.is_zero() {
        return Err(BuildError::ZeroDuration(name));
      }
    }
    if self.lease_renewal_period >= self.lease_ttl {
      return Err(BuildError::RenewalNotShorterThanTtl {
        renewal: self.lease_renewal_period,
        ttl: self.lease_ttl,
      });
    }
    Ok(())
  }
}
