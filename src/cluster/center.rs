use std::{collections::HashMap, sync::Arc};

use log::info;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use super::Cluster;

/// A directory of independent clusters, keyed by cluster name.
pub struct CenterClusterManager {
    name: String,
    clusters: RwLock<HashMap<String, Arc<Cluster>>>,
}

impl CenterClusterManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clusters: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts serving a cluster. An existing cluster of the same name is kept as is.
    pub async fn add_cluster(&self, name: impl Into<String>, token: impl Into<String>) -> Arc<Cluster> {
        let name = name.into();
        let mut clusters = self.clusters.write().await;
        if let Some(existing) = clusters.get(&name) {
            return Arc::clone(existing);
        }
        info!("center {} now serves cluster {}", self.name, name);
        let cluster = Arc::new(Cluster::new(name.clone(), token));
        clusters.insert(name, Arc::clone(&cluster));
        cluster
    }

    pub async fn cluster(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.read().await.get(name).cloned()
    }

    pub async fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Evicts stale nodes from every cluster. Returns how many were dropped.
    pub async fn evict(&self, now: OffsetDateTime) -> usize {
        let clusters: Vec<Arc<Cluster>> = self.clusters.read().await.values().cloned().collect();
        let mut evicted = 0;
        for cluster in clusters {
            evicted += cluster.evict_stale_at(now).await.len();
        }
        evicted
    }
}
