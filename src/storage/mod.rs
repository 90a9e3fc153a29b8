//! Persistence contract for repair runs and segments.
//!
//! The store is the single source of truth shared by every scheduler instance.
//! All mutation goes through the compare-and-update methods
//! ([`StateStore::update_run_if`], [`StateStore::update_segment_if`]), which
//! must be atomic in any implementation backing a multi-instance deployment.

mod memory;

pub use memory::MemoryStorage;

use async_trait::async_trait;
use tracing::debug;

use crate::error::StorageError;
use crate::run::{
  Cluster, RepairRun, RepairSegment, RepairUnit, RepairUnitId, RunId, RunState, SegmentId,
  SegmentState,
};

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait StateStore: Send + Sync {
  async fn get_cluster(&self, name: &str) -> StorageResult<Option<Cluster>>;

  async fn get_repair_unit(&self, id: RepairUnitId) -> StorageResult<Option<RepairUnit>>;

  async fn get_run(&self, id: RunId) -> StorageResult<Option<RepairRun>>;

  /// Replaces the stored run with `run` only if its current state is `expected`.
  /// Returns whether the write happened.
  async fn update_run_if(&self, run: &RepairRun, expected: RunState) -> StorageResult<bool>;

  /// All runs persisted in `Running`.
  async fn running_runs(&self) -> StorageResult<Vec<RepairRun>>;

  /// The next `NotStarted` segment of a run, ordered by range start then segment id.
  async fn next_free_segment(&self, run_id: RunId) -> StorageResult<Option<RepairSegment>>;

  async fn get_segment(&self, id: SegmentId) -> StorageResult<Option<RepairSegment>>;

  /// Replaces the stored segment with `segment` only if its current state is `expected`.
  /// Returns whether the write happened.
  async fn update_segment_if(&self, segment: &RepairSegment, expected: SegmentState) -> StorageResult<bool>;

  async fn count_segments_in_state(&self, run_id: RunId, state: SegmentState) -> StorageResult<usize>;

  /// The segment of a run currently `Running`, if any.
  async fn running_segment(&self, run_id: RunId) -> StorageResult<Option<RepairSegment>>;
}

/// Returns a `Running` segment to `NotStarted`, abandoning the attempt.
///
/// Clears both timestamps and bumps `fail_count`. Returns `false` if the segment
/// had already left `Running` (someone else finished or reset it).
pub async fn postpone_segment(store: &dyn StateStore, segment: &RepairSegment) -> StorageResult<bool> {
  let postponed = RepairSegment {
    state: SegmentState::NotStarted,
    fail_count: segment.fail_count.saturating_add(1),
    start_time: None,
    end_time: None,
    ..segment.clone()
  };
  let updated = store
    .update_segment_if(&postponed, SegmentState::Running)
    .await?;
  debug!(segment_id = %segment.id, run_id = %segment.run_id, updated, "Postponed segment.");
  Ok(updated)
}
