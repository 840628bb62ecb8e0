//! Cluster topology
//!
//! The repair coordinator and the backup uploader need three things from the
//! cluster: which token ranges this node primarily owns, a fingerprint of the
//! current membership so that a topology change mid-run can be detected, and
//! the list of controller nodes for naming uploaded archives.

pub mod ring;
pub mod token;

pub use ring::{NodeInfo, NodeStatus, StaticTopology};
pub use token::{Token, TokenRange, TokenRangeSet};

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Node identifier
pub type NodeId = String;

/// Opaque fingerprint of cluster membership and topology.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterStateDigest(pub String);

impl fmt::Display for ClusterStateDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cluster topology interface
#[async_trait]
pub trait ClusterTopology: Send + Sync {
    /// Primary ranges of `keyspace` owned by the local node, in any order.
    async fn local_primary_ranges(&self, keyspace: &str) -> Result<Vec<TokenRange>>;

    /// Fingerprint of the current membership/topology.
    async fn cluster_state_digest(&self) -> Result<ClusterStateDigest>;

    /// Ids of all controller nodes in the cluster, reachable or not.
    async fn controller_nodes(&self) -> Result<BTreeSet<NodeId>>;

    /// Id of the local node.
    fn local_node_id(&self) -> &str;

    /// Id of the site (data center) this cluster belongs to.
    fn site_id(&self) -> &str;

    /// Human-readable site name, used in audit records.
    fn site_name(&self) -> &str {
        self.site_id()
    }
}
