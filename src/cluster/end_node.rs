use std::sync::Arc;

use log::debug;
use time::OffsetDateTime;

use super::Cluster;
use crate::{
    node::{Node, NodeIdentity},
    node_manager::NodeManager,
};

/// The single-cluster view an end node keeps.
///
/// The optional center node lives in its own table so that it is contacted like
/// any peer but never evicted and never targeted by operations.
pub struct EndNodeClusterManager {
    this_node: NodeIdentity,
    cluster: Arc<Cluster>,
    center: NodeManager,
}

impl EndNodeClusterManager {
    pub fn new(this_node: NodeIdentity, cluster_token: impl Into<String>) -> Self {
        let cluster = Cluster::new(this_node.cluster_name.clone(), cluster_token);
        Self {
            this_node,
            cluster: Arc::new(cluster),
            center: NodeManager::new(),
        }
    }

    pub fn this_node(&self) -> &NodeIdentity {
        &self.this_node
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn center(&self) -> &NodeManager {
        &self.center
    }

    /// Replaces the center node this end node reports to.
    pub async fn set_center(&self, center: NodeIdentity) {
        let now = OffsetDateTime::now_utc();
        for previous in self.center.get_all().await.into_keys() {
            self.center.delete(&previous).await;
        }
        self.center
            .add(center.name.clone(), Node::local(center, now))
            .await;
    }

    /// True if `name` is a known, live peer.
    pub async fn is_valid(&self, name: &str) -> bool {
        self.cluster
            .nodes()
            .get(name)
            .await
            .map_or(false, |n| n.is_valid())
    }

    /// Names of all known peers, sorted.
    pub async fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cluster.nodes().get_all().await.into_keys().collect();
        names.sort();
        names
    }

    /// All known peers, sorted by name.
    pub async fn all_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.cluster.nodes().get_all().await.into_values().collect();
        nodes.sort_by(|a, b| a.name().cmp(b.name()));
        nodes
    }

    /// Adds peers learned from a heartbeat response. Returns how many were new.
    pub async fn merge_peers(&self, peers: Vec<NodeIdentity>, now: OffsetDateTime) -> usize {
        let mut added = 0;
        for peer in peers {
            if peer.name == self.this_node.name || peer.cluster_name != self.this_node.cluster_name {
                continue;
            }
            if self.center.contains(&peer.name).await {
                continue;
            }
            let description = peer.to_string();
            let name = peer.name.clone();
            if self.cluster.nodes().add_if_absent(&name, Node::new(peer, now)).await {
                debug!("learned about peer {}", description);
                added += 1;
            }
        }
        added
    }

    pub async fn evict(&self, now: OffsetDateTime) -> Vec<String> {
        self.cluster.evict_stale_at(now).await
    }
}
