//! tests/common.rs
//! Shared fakes and helper functions for integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing_subscriber::fmt::TestWriter;

use repairkeeper::{
  Cluster, ClusterConnector, ExecutorError, MemoryLeaseStore, MemoryStorage, NodeConnection,
  NodeError, RepairKeeper, RepairRun, RepairSegment, RepairUnit, RingRange, RunId, RunState,
  SchedulerBuilder, SegmentExecutor, SegmentId, SegmentState, StateStore, TokenRing,
};

pub const CLUSTER: &str = "test-cluster";

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG) // Show debug/trace for scheduler internals
    .with_writer(TestWriter::new()) // Write to test output
    .with_test_writer() // Enable per-test log capture
    .try_init();
}

// --- Fake cluster ---

// Topology and connectivity toggles shared by the fake connector and its connections.
#[derive(Debug)]
pub struct FakeTopology {
  pub reachable: AtomicBool,
  pub alive: AtomicBool,
  pub connects: AtomicUsize,
  ring: Mutex<TokenRing>,
}

impl FakeTopology {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      reachable: AtomicBool::new(true),
      alive: AtomicBool::new(true),
      connects: AtomicUsize::new(0),
      ring: Mutex::new(full_ring()),
    })
  }

  pub fn set_reachable(&self, reachable: bool) {
    self.reachable.store(reachable, Ordering::SeqCst);
  }

  pub fn set_alive(&self, alive: bool) {
    self.alive.store(alive, Ordering::SeqCst);
  }

  // Drops every range so no segment maps onto a node.
  pub fn clear_ring(&self) {
    *self.ring.lock() = TokenRing::new();
  }
}

fn full_ring() -> TokenRing {
  TokenRing::new().with_range(
    RingRange::new(0, 0),
    vec!["10.0.0.1".to_string(), "10.0.0.2".to_string(), "10.0.0.3".to_string()],
  )
}

pub struct FakeConnector(pub Arc<FakeTopology>);

#[async_trait]
impl ClusterConnector for FakeConnector {
  async fn connect(&self, cluster: &Cluster) -> Result<Box<dyn NodeConnection>, NodeError> {
    self.0.connects.fetch_add(1, Ordering::SeqCst);
    if !self.0.reachable.load(Ordering::SeqCst) {
      return Err(NodeError::Connect {
        hosts: cluster.seed_hosts.clone(),
        reason: "connection refused".to_string(),
      });
    }
    Ok(Box::new(FakeNode(self.0.clone())))
  }
}

struct FakeNode(Arc<FakeTopology>);

#[async_trait]
impl NodeConnection for FakeNode {
  async fn is_connection_alive(&self) -> bool {
    self.0.alive.load(Ordering::SeqCst)
  }

  async fn token_range_to_endpoints(&self, _keyspace: &str, range: &RingRange) -> Result<Vec<String>, NodeError> {
    Ok(self.0.ring.lock().endpoints_for(range))
  }
}

// --- Scripted executor ---

// What the executor does with the next segment it is handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
  // Claim, work, mark Done.
  Repair,
  // Claim, then never return.
  Hang,
  // Claim, then report a failure.
  Fail,
  // Panic before touching the segment.
  Panic,
}

// Executes segments against a `MemoryStorage` the way a real repair agent would:
// claims the segment (`NotStarted` -> `Running`), works, then marks it `Done`.
pub struct ScriptedExecutor {
  store: Arc<MemoryStorage>,
  work: StdDuration,
  script: Mutex<VecDeque<Step>>,
  executed: Mutex<Vec<SegmentId>>,
  active: AtomicUsize,
  pub max_active: AtomicUsize,
  pub max_running_per_run: AtomicUsize,
  #[cfg(feature = "job_context")]
  pub contexts: Mutex<Vec<Option<repairkeeper::JobContext>>>,
}

impl ScriptedExecutor {
  pub fn new(store: Arc<MemoryStorage>, work: StdDuration) -> Arc<Self> {
    Arc::new(Self {
      store,
      work,
      script: Mutex::new(VecDeque::new()),
      executed: Mutex::new(Vec::new()),
      active: AtomicUsize::new(0),
      max_active: AtomicUsize::new(0),
      max_running_per_run: AtomicUsize::new(0),
      #[cfg(feature = "job_context")]
      contexts: Mutex::new(Vec::new()),
    })
  }

  // Queues steps for the next executions; once drained every segment is repaired.
  pub fn push_steps(&self, steps: impl IntoIterator<Item = Step>) {
    self.script.lock().extend(steps);
  }

  pub fn executed(&self) -> Vec<SegmentId> {
    self.executed.lock().clone()
  }

  pub fn executed_count(&self) -> usize {
    self.executed.lock().len()
  }

  async fn claim(&self, segment_id: SegmentId) -> Result<RepairSegment, ExecutorError> {
    let mut segment = self
      .store
      .get_segment(segment_id)
      .await?
      .ok_or_else(|| ExecutorError::Failed(segment_id, "segment vanished".to_string()))?;
    segment.state = SegmentState::Running;
    segment.start_time = Some(Utc::now());
    if !self.store.update_segment_if(&segment, SegmentState::NotStarted).await? {
      return Err(ExecutorError::Failed(segment_id, "segment already claimed".to_string()));
    }
    let running = self
      .store
      .count_segments_in_state(segment.run_id, SegmentState::Running)
      .await?;
    self.max_running_per_run.fetch_max(running, Ordering::SeqCst);
    Ok(segment)
  }
}

#[async_trait]
impl SegmentExecutor for ScriptedExecutor {
  async fn execute(&self, segment_id: SegmentId, coordinators: &[String], _timeout: StdDuration) -> Result<(), ExecutorError> {
    assert!(!coordinators.is_empty(), "executor called without coordinators");
    self.executed.lock().push(segment_id);
    #[cfg(feature = "job_context")]
    self
      .contexts
      .lock()
      .push(repairkeeper::try_get_current_job_context());

    let step = self.script.lock().pop_front().unwrap_or(Step::Repair);
    tracing::debug!(%segment_id, ?step, "Scripted executor handling segment");
    match step {
      Step::Panic => panic!("Scripted executor forced panic!"),
      Step::Hang => {
        self.claim(segment_id).await?;
        std::future::pending::<()>().await;
        Ok(())
      }
      Step::Fail => {
        self.claim(segment_id).await?;
        Err(ExecutorError::Failed(segment_id, "repair session failed".to_string()))
      }
      Step::Repair => {
        let mut segment = self.claim(segment_id).await?;
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        tokio::time::sleep(self.work).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        segment.state = SegmentState::Done;
        segment.end_time = Some(Utc::now());
        self.store.update_segment_if(&segment, SegmentState::Running).await?;
        Ok(())
      }
    }
  }
}

// --- Harness ---

// One shared "cluster": state store, lease store, topology and executor.
// Every scheduler built from the same harness competes for the same runs.
pub struct Harness {
  pub store: Arc<MemoryStorage>,
  pub leases: Arc<MemoryLeaseStore>,
  pub topology: Arc<FakeTopology>,
  pub executor: Arc<ScriptedExecutor>,
}

impl Harness {
  pub fn new(work: StdDuration) -> Self {
    let store = Arc::new(MemoryStorage::new());
    store.add_cluster(Cluster::new(CLUSTER, vec!["10.0.0.1".to_string()]));
    Self {
      executor: ScriptedExecutor::new(store.clone(), work),
      store,
      leases: Arc::new(MemoryLeaseStore::new()),
      topology: FakeTopology::new(),
    }
  }

  // Seeds a `NotStarted` run with `segments` adjacent token ranges.
  pub fn seed_run(&self, segments: usize, intensity: f64) -> RepairRun {
    let unit = RepairUnit::new(CLUSTER, "test_keyspace", vec![]);
    let run = RepairRun::new(CLUSTER, unit.id, intensity).expect("valid intensity");
    let ranges = (0..segments as i128).map(|i| RingRange::new(i * 100, (i + 1) * 100));
    self.store.add_repair_unit(unit);
    self
      .store
      .add_run(run.clone(), RepairSegment::for_ranges(run.id, ranges))
      .expect("seed run");
    run
  }

  // Builder wired to the harness with short delays and lease timings.
  pub fn builder(&self) -> SchedulerBuilder {
    RepairKeeper::builder()
      .max_workers(4)
      .execution_timeout(StdDuration::from_secs(5))
      .retry_delay(StdDuration::from_millis(50))
      .lease_ttl(StdDuration::from_secs(1))
      .lease_renewal_period(StdDuration::from_millis(200))
      .state_store(self.store.clone())
      .lease_store(self.leases.clone())
      .cluster_connector(Arc::new(FakeConnector(self.topology.clone())))
      .segment_executor(self.executor.clone())
  }

  pub fn build(&self) -> RepairKeeper {
    self.builder().build().expect("Failed to build scheduler")
  }

  pub async fn run_state(&self, run_id: RunId) -> RunState {
    self.run(run_id).await.run_state
  }

  pub async fn run(&self, run_id: RunId) -> RepairRun {
    self
      .store
      .get_run(run_id)
      .await
      .expect("store read")
      .expect("run exists")
  }

  pub fn segments(&self, run_id: RunId) -> Vec<RepairSegment> {
    self.store.segments_of(run_id)
  }
}

// Polls `check` every 10ms until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: StdDuration, mut check: F) -> bool
where
  F: FnMut() -> Fut,
  Fut: Future<Output = bool>,
{
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    if check().await {
      return true;
    }
    if tokio::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(StdDuration::from_millis(10)).await;
  }
}

// Waits until the persisted run reaches `state`.
pub async fn wait_for_run_state(harness: &Harness, run_id: RunId, state: RunState, timeout: StdDuration) -> bool {
  eventually(timeout, || async { harness.run_state(run_id).await == state }).await
}
