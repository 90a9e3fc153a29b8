use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{StateStore, StorageResult};
use crate::error::StorageError;
use crate::run::{
  Cluster, RepairRun, RepairSegment, RepairUnit, RepairUnitId, RunId, RunState, SegmentId,
  SegmentState,
};

#[derive(Debug, Default)]
struct Tables {
  clusters: HashMap<String, Cluster>,
  repair_units: HashMap<RepairUnitId, RepairUnit>,
  runs: HashMap<RunId, RepairRun>,
  segments: HashMap<SegmentId, RepairSegment>,
  segments_by_run: HashMap<RunId, Vec<SegmentId>>,
}

/// In-process [`StateStore`]. One `RwLock` guards every table, so each
/// compare-and-update is atomic. Suitable for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
  tables: RwLock<Tables>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_cluster(&self, cluster: Cluster) {
    self.tables.write().clusters.insert(cluster.name.clone(), cluster);
  }

  pub fn add_repair_unit(&self, unit: RepairUnit) {
    self.tables.write().repair_units.insert(unit.id, unit);
  }

  /// Stores a run together with its segments.
  ///
  /// # Errors
  ///
  /// Returns [`StorageError::Backend`] if a segment belongs to another run.
  pub fn add_run(&self, run: RepairRun, segments: Vec<RepairSegment>) -> StorageResult<()> {
    if let Some(stray) = segments.iter().find(|s| s.run_id != run.id) {
      return Err(StorageError::Backend(format!(
        "segment {} belongs to run {}, not {}",
        stray.id, stray.run_id, run.id
      )));
    }
    let mut tables = self.tables.write();
    let ids = segments.iter().map(|s| s.id).collect();
    for segment in segments {
      tables.segments.insert(segment.id, segment);
    }
    tables.segments_by_run.insert(run.id, ids);
    tables.runs.insert(run.id, run);
    Ok(())
  }

  /// Every segment of a run, in no particular order.
  pub fn segments_of(&self, run_id: RunId) -> Vec<RepairSegment> {
    let tables = self.tables.read();
    let segments = Self::run_segments(&tables, run_id).cloned().collect();
    segments
  }

  /// Overwrites a run unconditionally, as an external API layer would (e.g. forcing `Paused`).
  pub fn put_run(&self, run: RepairRun) {
    self.tables.write().runs.insert(run.id, run);
  }

  /// Overwrites a segment unconditionally.
  pub fn put_segment(&self, segment: RepairSegment) {
    self.tables.write().segments.insert(segment.id, segment);
  }

  fn run_segments<'a>(tables: &'a Tables, run_id: RunId) -> impl Iterator<Item = &'a RepairSegment> {
    tables
      .segments_by_run
      .get(&run_id)
      .into_iter()
      .flatten()
      .filter_map(|id| tables.segments.get(id))
  }
}

#[async_trait]
impl StateStore for MemoryStorage {
  async fn get_cluster(&self, name: &str) -> StorageResult<Option<Cluster>> {
    Ok(self.tables.read().clusters.get(name).cloned())
  }

  async fn get_repair_unit(&self, id: RepairUnitId) -> StorageResult<Option<RepairUnit>> {
    Ok(self.tables.read().repair_units.get(&id).cloned())
  }

  async fn get_run(&self, id: RunId) -> StorageResult<Option<RepairRun>> {
    Ok(self.tables.read().runs.get(&id).cloned())
  }

  async fn update_run_if(&self, run: &RepairRun, expected: RunState) -> StorageResult<bool> {
    let mut tables = self.tables.write();
    match tables.runs.get_mut(&run.id) {
      Some(current) if current.run_state == expected => {
        *current = run.clone();
        Ok(true)
      }
      Some(_) => Ok(false),
      None => Err(StorageError::RunNotFound(run.id)),
    }
  }

  async fn running_runs(&self) -> StorageResult<Vec<RepairRun>> {
    let tables = self.tables.read();
    let runs = tables
      .runs
      .values()
      .filter(|run| run.run_state == RunState::Running)
      .cloned()
      .collect();
    Ok(runs)
  }

  async fn next_free_segment(&self, run_id: RunId) -> StorageResult<Option<RepairSegment>> {
    let tables = self.tables.read();
    let next = Self::run_segments(&tables, run_id)
      .filter(|s| s.state == SegmentState::NotStarted)
      .min_by_key(|s| (s.token_range.start, s.id))
      .cloned();
    Ok(next)
  }

  async fn get_segment(&self, id: SegmentId) -> StorageResult<Option<RepairSegment>> {
    Ok(self.tables.read().segments.get(&id).cloned())
  }

  async fn update_segment_if(&self, segment: &RepairSegment, expected: SegmentState) -> StorageResult<bool> {
    let mut tables = self.tables.write();
    match tables.segments.get_mut(&segment.id) {
      Some(current) if current.state == expected => {
        *current = segment.clone();
        Ok(true)
      }
      Some(_) => Ok(false),
      None => Err(StorageError::SegmentNotFound(segment.id)),
    }
  }

  async fn count_segments_in_state(&self, run_id: RunId, state: SegmentState) -> StorageResult<usize> {
    let tables = self.tables.read();
    let count = Self::run_segments(&tables, run_id)
      .filter(|s| s.state == state)
      .count();
    Ok(count)
  }

  async fn running_segment(&self, run_id: RunId) -> StorageResult<Option<RepairSegment>> {
    let tables = self.tables.read();
    let running = Self::run_segments(&tables, run_id)
      .find(|s| s.state == SegmentState::Running)
      .cloned();
    Ok(running)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ring::RingRange;
  use crate::storage::postpone_segment;
  use chrono::Utc;
  use uuid::Uuid;

  fn seeded() -> (MemoryStorage, RepairRun, Vec<RepairSegment>) {
    let store = MemoryStorage::new();
    let run = RepairRun::new("test", Uuid::new_v4(), 1.0).unwrap();
    let segments = RepairSegment::for_ranges(
      run.id,
      [RingRange::new(200, 300), RingRange::new(0, 100), RingRange::new(100, 200)],
    );
    store.add_run(run.clone(), segments.clone()).unwrap();
    (store, run, segments)
  }

  #[tokio::test]
  async fn next_free_segment_is_ordered_by_range_start() {
    let (store, run, _) = seeded();
    let first = store.next_free_segment(run.id).await.unwrap().unwrap();
    assert_eq!(first.token_range.start, 0);

    let mut done = first.clone();
    done.state = SegmentState::Done;
    assert!(store.update_segment_if(&done, SegmentState::NotStarted).await.unwrap());

    let second = store.next_free_segment(run.id).await.unwrap().unwrap();
    assert_eq!(second.token_range.start, 100);
  }

  #[tokio::test]
  async fn run_update_is_compare_and_set() {
    let (store, run, _) = seeded();
    let running = run.with_state(RunState::Running);
    assert!(store.update_run_if(&running, RunState::NotStarted).await.unwrap());
    // Second writer expecting the old state loses.
    assert!(!store.update_run_if(&running, RunState::NotStarted).await.unwrap());
    assert_eq!(store.running_runs().await.unwrap().len(), 1);

    let unknown = RepairRun::new("test", Uuid::new_v4(), 1.0).unwrap();
    assert_eq!(
      store.update_run_if(&unknown, RunState::NotStarted).await,
      Err(StorageError::RunNotFound(unknown.id))
    );
  }

  #[tokio::test]
  async fn postpone_resets_running_segment() {
    let (store, run, segments) = seeded();
    let mut claimed = segments[0].clone();
    claimed.state = SegmentState::Running;
    claimed.start_time = Some(Utc::now());
    assert!(store.update_segment_if(&claimed, SegmentState::NotStarted).await.unwrap());
    assert_eq!(store.running_segment(run.id).await.unwrap().map(|s| s.id), Some(claimed.id));

    assert!(postpone_segment(&store, &claimed).await.unwrap());
    let reset = store.get_segment(claimed.id).await.unwrap().unwrap();
    assert_eq!(reset.state, SegmentState::NotStarted);
    assert_eq!(reset.fail_count, 1);
    assert!(reset.start_time.is_none());
    assert_eq!(store.count_segments_in_state(run.id, SegmentState::Running).await.unwrap(), 0);

    // Already reset: a second postpone is a no-op.
    assert!(!postpone_segment(&store, &claimed).await.unwrap());
  }

  #[tokio::test]
  async fn running_segment_only_sees_its_own_run() {
    let (store, run, segments) = seeded();
    let other_run = RepairRun::new("test", Uuid::new_v4(), 1.0).unwrap();
    let other_segments = RepairSegment::for_ranges(other_run.id, [RingRange::new(0, 50)]);
    store.add_run(other_run.clone(), other_segments.clone()).unwrap();
    assert_eq!(store.running_segment(run.id).await.unwrap(), None);

    let mut claimed = other_segments[0].clone();
    claimed.state = SegmentState::Running;
    store.put_segment(claimed.clone());
    assert_eq!(store.running_segment(run.id).await.unwrap(), None);
    assert_eq!(store.running_segment(other_run.id).await.unwrap(), Some(claimed));
    assert_eq!(store.segments_of(run.id).len(), segments.len());
  }

  #[test]
  fn add_run_rejects_foreign_segments() {
    let store = MemoryStorage::new();
    let run = RepairRun::new("test", Uuid::new_v4(), 1.0).unwrap();
    let foreign = RepairSegment::new(Uuid::new_v4(), RingRange::new(0, 1));
    assert!(store.add_run(run, vec![foreign]).is_err());
  }
}
