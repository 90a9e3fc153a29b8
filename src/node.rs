//! Capabilities the runner needs from the remote-node protocol client.
//!
//! The protocol itself (connection setup, JMX or otherwise) lives outside this
//! crate. Implementations only have to answer liveness and "which nodes can
//! coordinate this token range" questions.

use async_trait::async_trait;

use crate::error::NodeError;
use crate::ring::RingRange;
use crate::run::Cluster;

/// An established connection to one node of a cluster.
#[async_trait]
pub trait NodeConnection: Send + Sync {
  /// Whether the connection can still be used. Checked before every segment.
  async fn is_connection_alive(&self) -> bool;

  /// Endpoints that replicate `range` for `keyspace`, i.e. candidates to coordinate its repair.
  /// An empty list means the range cannot be mapped onto the ring.
  async fn token_range_to_endpoints(&self, keyspace: &str, range: &RingRange) -> Result<Vec<String>, NodeError>;
}

/// Opens connections to a cluster through its seed hosts.
#[async_trait]
pub trait ClusterConnector: Send + Sync {
  /// Connects to any reachable host among `cluster.seed_hosts`.
  async fn connect(&self, cluster: &Cluster) -> Result<Box<dyn NodeConnection>, NodeError>;
}
