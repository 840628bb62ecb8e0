//! In-process token ring for single-process deployments and tests
//!
//! Every node owns one or more tokens; the node owning token `t` is the primary
//! owner of `(previous token, t]`.

use super::{ClusterStateDigest, ClusterTopology, NodeId, Token, TokenRange};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;
use tracing::info;

/// Liveness of a ring member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Up,
    Down,
    Joining,
    Leaving,
}

impl NodeStatus {
    fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Up => "up",
            NodeStatus::Down => "down",
            NodeStatus::Joining => "joining",
            NodeStatus::Leaving => "leaving",
        }
    }
}

/// A member of the ring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: String,
    pub tokens: Vec<Token>,
    pub status: NodeStatus,
}

impl NodeInfo {
    pub fn new(id: impl Into<String>, addr: impl Into<String>, tokens: Vec<Token>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
            tokens,
            status: NodeStatus::Up,
        }
    }
}

/// Static ring topology
pub struct StaticTopology {
    local_node_id: NodeId,
    site_id: String,
    site_name: String,
    nodes: RwLock<BTreeMap<NodeId, NodeInfo>>,
}

impl StaticTopology {
    pub fn new(local_node_id: impl Into<String>, site_id: impl Into<String>) -> Self {
        let site_id = site_id.into();
        Self {
            local_node_id: local_node_id.into(),
            site_name: site_id.clone(),
            site_id,
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn with_site_name(mut self, name: impl Into<String>) -> Self {
        self.site_name = name.into();
        self
    }

    /// Build a ring where `node_ids` own `tokens_per_node` evenly spaced
    /// tokens each, assigned round-robin.
    pub fn evenly_spaced(
        node_ids: &[&str],
        local_node_id: &str,
        site_id: &str,
        tokens_per_node: usize,
    ) -> Result<Self> {
        if node_ids.is_empty() || tokens_per_node == 0 {
            return Err(Error::Config(
                "evenly spaced ring needs at least one node and one token per node".to_string(),
            ));
        }
        let total = (node_ids.len() * tokens_per_node) as i128;
        let span = (i64::MAX as i128 - i64::MIN as i128) / total;

        let mut nodes = BTreeMap::new();
        for k in 0..total {
            let token = Token((i64::MIN as i128 + span * (k + 1)) as i64);
            let owner = node_ids[(k as usize) % node_ids.len()];
            nodes
                .entry(owner.to_string())
                .or_insert_with(|| NodeInfo::new(owner, owner, Vec::new()))
                .tokens
                .push(token);
        }

        let topology = Self::new(local_node_id, site_id);
        Ok(Self {
            nodes: RwLock::new(nodes),
            ..topology
        })
    }

    /// Register a node or replace an existing one
    pub async fn add_node(&self, node: NodeInfo) {
        info!("Registering node {} at {} with {} tokens", node.id, node.addr, node.tokens.len());
        self.nodes.write().await.insert(node.id.clone(), node);
    }

    /// Remove a node from the ring
    pub async fn remove_node(&self, node_id: &str) {
        if self.nodes.write().await.remove(node_id).is_some() {
            info!("Removed node {} from ring", node_id);
        }
    }

    /// Update a node's liveness
    pub async fn set_status(&self, node_id: &str, status: NodeStatus) {
        if let Some(node) = self.nodes.write().await.get_mut(node_id) {
            node.status = status;
        }
    }

    pub async fn nodes(&self) -> Vec<NodeInfo> {
        self.nodes.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl ClusterTopology for StaticTopology {
    async fn local_primary_ranges(&self, _keyspace: &str) -> Result<Vec<TokenRange>> {
        let nodes = self.nodes.read().await;
        if !nodes.contains_key(&self.local_node_id) {
            return Err(Error::Topology(format!(
                "local node {} is not a ring member",
                self.local_node_id
            )));
        }

        let ring: BTreeMap<Token, &str> = nodes
            .values()
            .flat_map(|n| n.tokens.iter().map(move |t| (*t, n.id.as_str())))
            .collect();
        let tokens: Vec<(Token, &str)> = ring.into_iter().collect();

        let mut ranges = Vec::new();
        for (i, (token, owner)) in tokens.iter().enumerate() {
            if *owner != self.local_node_id {
                continue;
            }
            let prev = tokens[(i + tokens.len() - 1) % tokens.len()].0;
            ranges.push(TokenRange::new(prev, *token));
        }
        Ok(ranges)
    }

    async fn cluster_state_digest(&self) -> Result<ClusterStateDigest> {
        let nodes = self.nodes.read().await;
        let mut hasher = crc32fast::Hasher::new();
        for node in nodes.values() {
            let mut tokens = node.tokens.clone();
            tokens.sort();
            let line = format!(
                "{}|{}|{}|{}\n",
                node.id,
                node.addr,
                node.status.as_str(),
                tokens.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(",")
            );
            hasher.update(line.as_bytes());
        }
        Ok(ClusterStateDigest(format!("{:08x}", hasher.finalize())))
    }

    async fn controller_nodes(&self) -> Result<BTreeSet<NodeId>> {
        Ok(self.nodes.read().await.keys().cloned().collect())
    }

    fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    fn site_id(&self) -> &str {
        &self.site_id
    }

    fn site_name(&self) -> &str {
        &self.site_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::TokenRangeSet;

    #[tokio::test]
    async fn test_primary_ranges_cover_previous_token() {
        let topology = StaticTopology::new("node1", "site-a");
        topology
            .add_node(NodeInfo::new("node1", "10.0.0.1", vec![Token(100), Token(300)]))
            .await;
        topology
            .add_node(NodeInfo::new("node2", "10.0.0.2", vec![Token(200)]))
            .await;

        let set = TokenRangeSet::local(&topology, "ks").await.unwrap();
        let ranges: Vec<TokenRange> = set.iter().copied().collect();
        assert_eq!(
            ranges,
            vec![
                TokenRange::new(Token(200), Token(300)),
                TokenRange::new(Token(300), Token(100)),
            ]
        );
    }

    #[tokio::test]
    async fn test_digest_changes_with_membership() {
        let topology = StaticTopology::evenly_spaced(&["n1", "n2", "n3"], "n1", "site", 2).unwrap();
        let before = topology.cluster_state_digest().await.unwrap();
        assert_eq!(before, topology.cluster_state_digest().await.unwrap());

        topology.set_status("n2", NodeStatus::Down).await;
        let after = topology.cluster_state_digest().await.unwrap();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_evenly_spaced_ring_partitions_tokens() {
        let topology = StaticTopology::evenly_spaced(&["n1", "n2"], "n1", "site", 4).unwrap();
        let local = topology.local_primary_ranges("ks").await.unwrap();
        assert_eq!(local.len(), 4);
        assert_eq!(topology.controller_nodes().await.unwrap().len(), 2);
        assert!(TokenRangeSet::from_ranges(local).is_ok());
    }

    #[tokio::test]
    async fn test_non_member_local_node_is_an_error() {
        let topology = StaticTopology::evenly_spaced(&["n1"], "n9", "site", 1).unwrap();
        assert!(topology.local_primary_ranges("ks").await.is_err());
    }
}
