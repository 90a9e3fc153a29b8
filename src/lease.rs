//! TTL-based leases used to elect a single driver per repair run.
//!
//! A lease is mutual exclusion with self-healing: at most one unexpired lease
//! exists per key, and a crashed holder's lease simply lapses. The backing
//! [`LeaseStore`] must implement acquire/renew as linearizable
//! compare-and-set operations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::command::{CoordinatorCommand, ShutdownMode};
use crate::error::LeaseError;
use crate::metrics::RepairMetrics;
use crate::run::RunId;

/// Opaque identifier of a control-plane instance. Uses UUID v4.
pub type HolderId = Uuid;

/// Coordination key guarding a repair run.
pub fn lease_key(run_id: RunId) -> String {
  format!("repair_run/{run_id}")
}

/// A time-bounded ownership record.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Lease {
  pub key: String,
  pub holder: HolderId,
  pub expires_at: DateTime<Utc>,
}

impl Lease {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now >= self.expires_at
  }
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
  /// Creates the lease if absent or expired. Returns whether `holder` owns it afterwards.
  /// A holder re-acquiring its own unexpired lease succeeds and extends it.
  async fn acquire(&self, key: &str, holder: HolderId, ttl: Duration) -> Result<bool, LeaseError>;

  /// Extends the lease only if `holder` owns it and it has not expired.
  async fn renew(&self, key: &str, holder: HolderId, ttl: Duration) -> Result<bool, LeaseError>;

  /// Deletes the lease if owned by `holder`; no-op otherwise.
  async fn release(&self, key: &str, holder: HolderId) -> Result<(), LeaseError>;

  /// Holders of at least one unexpired lease.
  async fn holders(&self) -> Result<HashSet<HolderId>, LeaseError>;

  /// Deletes the lease whoever holds it.
  async fn force_release(&self, key: &str) -> Result<(), LeaseError>;
}

fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
  match ChronoDuration::from_std(ttl) {
    Ok(ttl) => now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
    Err(_) => DateTime::<Utc>::MAX_UTC,
  }
}

/// In-process [`LeaseStore`]. A single mutex makes every operation linearizable,
/// which is enough for several scheduler instances sharing one process (and for tests).
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
  leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryLeaseStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Current lease for `key`, expired or not.
  pub fn get(&self, key: &str) -> Option<Lease> {
    self.leases.lock().get(key).cloned()
  }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
  async fn acquire(&self, key: &str, holder: HolderId, ttl: Duration) -> Result<bool, LeaseError> {
    let now = Utc::now();
    let mut leases = self.leases.lock();
    match leases.get(key) {
      Some(existing) if !existing.is_expired(now) && existing.holder != holder => Ok(false),
      _ => {
        leases.insert(
          key.to_string(),
          Lease {
            key: key.to_string(),
            holder,
            expires_at: expiry_after(now, ttl),
          },
        );
        Ok(true)
      }
    }
  }

  async fn renew(&self, key: &str, holder: HolderId, ttl: Duration) -> Result<bool, LeaseError> {
    let now = Utc::now();
    let mut leases = self.leases.lock();
    match leases.get_mut(key) {
      Some(existing) if existing.holder == holder && !existing.is_expired(now) => {
        existing.expires_at = expiry_after(now, ttl);
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  async fn release(&self, key: &str, holder: HolderId) -> Result<(), LeaseError> {
    let mut leases = self.leases.lock();
    if leases.get(key).is_some_and(|l| l.holder == holder) {
      leases.remove(key);
    }
    Ok(())
  }

  async fn holders(&self) -> Result<HashSet<HolderId>, LeaseError> {
    let now = Utc::now();
    Ok(
      self
        .leases
        .lock()
        .values()
        .filter(|l| !l.is_expired(now))
        .map(|l| l.holder)
        .collect(),
    )
  }

  async fn force_release(&self, key: &str) -> Result<(), LeaseError> {
    self.leases.lock().remove(key);
    Ok(())
  }
}

// --- Per-instance coordinator ---

/// Result of asking for a run's lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
  /// This instance already held the lease; it was extended.
  AlreadyHeld,
  /// The lease was free (or expired) and now belongs to this instance.
  Acquired,
  /// Another instance holds an unexpired lease.
  HeldElsewhere,
}

/// Binds a [`LeaseStore`] to this instance's holder id and TTL and remembers
/// which runs this instance believes it drives.
pub struct LeaseCoordinator {
  store: Arc<dyn LeaseStore>,
  holder_id: HolderId,
  ttl: Duration,
  held: Mutex<HashSet<RunId>>,
  metrics: RepairMetrics,
}

impl std::fmt::Debug for LeaseCoordinator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LeaseCoordinator")
      .field("holder_id", &self.holder_id)
      .field("ttl", &self.ttl)
      .field("held", &*self.held.lock())
      .finish()
  }
}

impl LeaseCoordinator {
  pub fn new(store: Arc<dyn LeaseStore>, holder_id: HolderId, ttl: Duration, metrics: RepairMetrics) -> Self {
    Self {
      store,
      holder_id,
      ttl,
      held: Mutex::new(HashSet::new()),
      metrics,
    }
  }

  pub fn holder_id(&self) -> HolderId {
    self.holder_id
  }

  pub fn is_held(&self, run_id: RunId) -> bool {
    self.held.lock().contains(&run_id)
  }

  pub fn held_runs(&self) -> Vec<RunId> {
    self.held.lock().iter().copied().collect()
  }

  pub async fn acquire(&self, run_id: RunId) -> Result<Acquisition, LeaseError> {
    let was_held = self.is_held(run_id);
    let owned = self
      .store
      .acquire(&lease_key(run_id), self.holder_id, self.ttl)
      .await?;
    if !owned {
      self.forget(run_id);
      debug!(%run_id, holder = %self.holder_id, "Lease held by another instance.");
      return Ok(Acquisition::HeldElsewhere);
    }
    if was_held {
      return Ok(Acquisition::AlreadyHeld);
    }
    self.held.lock().insert(run_id);
    self.update_gauge();
    self
      .metrics
      .leases_acquired
      .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    info!(%run_id, holder = %self.holder_id, ttl_ms = self.ttl.as_millis(), "Acquired run lease.");
    Ok(Acquisition::Acquired)
  }

  /// Extends the lease. A `false` (or an error) means this instance must stop driving the run;
  /// the run is forgotten locally either way.
  pub async fn renew(&self, run_id: RunId) -> Result<bool, LeaseError> {
    let renewed = self
      .store
      .renew(&lease_key(run_id), self.holder_id, self.ttl)
      .await;
    match renewed {
      Ok(true) => {
        trace!(%run_id, "Renewed run lease.");
        Ok(true)
      }
      Ok(false) => {
        self.forget(run_id);
        Ok(false)
      }
      Err(e) => {
        self.forget(run_id);
        Err(e)
      }
    }
  }

  pub async fn release(&self, run_id: RunId) -> Result<(), LeaseError> {
    self.forget(run_id);
    self.store.release(&lease_key(run_id), self.holder_id).await?;
    info!(%run_id, holder = %self.holder_id, "Released run lease.");
    Ok(())
  }

  /// Administrative override for a holder known to be dead.
  pub async fn force_release(&self, run_id: RunId) -> Result<(), LeaseError> {
    self.forget(run_id);
    warn!(%run_id, "Force-releasing run lease.");
    self.store.force_release(&lease_key(run_id)).await
  }

  pub async fn holders(&self) -> Result<HashSet<HolderId>, LeaseError> {
    self.store.holders().await
  }

  fn forget(&self, run_id: RunId) {
    if self.held.lock().remove(&run_id) {
      self.update_gauge();
    }
  }

  fn update_gauge(&self) {
    let held = self.held.lock().len();
    self
      .metrics
      .leases_held_current
      .store(held, std::sync::atomic::Ordering::Relaxed);
  }
}

// --- Renewal task ---

/// Periodically renews every lease this instance holds and reports the ones it lost.
pub(crate) struct LeaseKeeper {
  leases: Arc<LeaseCoordinator>,
  period: Duration,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  cmd_tx: mpsc::Sender<CoordinatorCommand>,
}

impl LeaseKeeper {
  pub fn new(
    leases: Arc<LeaseCoordinator>,
    period: Duration,
    shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
    cmd_tx: mpsc::Sender<CoordinatorCommand>,
  ) -> Self {
    Self {
      leases,
      period,
      shutdown_rx,
      cmd_tx,
    }
  }

  pub async fn run(&mut self) {
    info!(period_ms = self.period.as_millis(), "Lease keeper started.");
    let mut interval = tokio::time::interval(self.period);
    // The first tick completes immediately; leases were just acquired.
    interval.tick().await;

    // A graceful drain keeps renewing: in-flight segments may outlive the TTL.
    let mut watching = true;
    loop {
      tokio::select! {
          biased;

          changed = self.shutdown_rx.changed(), if watching => {
              match changed {
                  Ok(()) if *self.shutdown_rx.borrow() == Some(ShutdownMode::Force) => break,
                  Ok(()) => debug!("Graceful shutdown requested; renewing until the coordinator exits."),
                  Err(_) => watching = false,
              }
          }

          // The coordinator only exits once in-flight invocations reported back and leases were released.
          _ = self.cmd_tx.closed() => break,

          _ = interval.tick() => {
              self.renew_all().await;
          }
      }
    }
    info!("Lease keeper shutting down.");
  }

  async fn renew_all(&self) {
    for run_id in self.leases.held_runs() {
      let lost = match self.leases.renew(run_id).await {
        Ok(true) => false,
        Ok(false) => {
          warn!(%run_id, "Lease renewal refused; another instance may own the run now.");
          true
        }
        Err(e) => {
          warn!(%run_id, error = %e, "Lease renewal failed; standing down.");
          true
        }
      };
      if lost && self.cmd_tx.send(CoordinatorCommand::LeaseLost { run_id }).await.is_err() {
        debug!(%run_id, "Coordinator gone while reporting lease loss.");
        return;
      }
    }
  }
}
