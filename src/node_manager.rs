use std::collections::HashMap;

use log::{debug, info};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::{
    config::{ConfigStore, ConfigStoreExt, StaticNode, STATIC_NODES_KEY},
    error::ConfigError,
    node::{Node, NodeIdentity},
};

/// Statically configured peers must listen above this port.
const MIN_STATIC_PORT: u16 = 1000;

/// A table of nodes keyed by name, guarded by a single reader/writer lock.
///
/// Nodes are stored by value; reads hand out clones, so a caller's snapshot
/// never changes under its feet. Mutations of a single entry go through
/// [NodeManager::update].
#[derive(Default)]
pub struct NodeManager {
    table: RwLock<Table>,
}

#[derive(Default)]
struct Table {
    nodes: HashMap<String, Node>,
    // bumped on every change, including in-place updates; lets `filter` detect a concurrent writer
    version: u64,
}

impl NodeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the node stored under `key`.
    pub async fn add(&self, key: impl Into<String>, node: Node) {
        let mut table = self.table.write().await;
        table.nodes.insert(key.into(), node);
        table.version += 1;
    }

    /// Removes the node stored under `key`, returning it if it was present.
    pub async fn delete(&self, key: &str) -> Option<Node> {
        let mut table = self.table.write().await;
        let removed = table.nodes.remove(key);
        if removed.is_some() {
            table.version += 1;
        }
        removed
    }

    pub async fn get(&self, key: &str) -> Option<Node> {
        self.table.read().await.nodes.get(key).cloned()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.table.read().await.nodes.contains_key(key)
    }

    /// A point-in-time copy of the whole table.
    pub async fn get_all(&self) -> HashMap<String, Node> {
        self.table.read().await.nodes.clone()
    }

    pub async fn get_with_filter<F>(&self, predicate: F) -> Vec<Node>
    where
        F: Fn(&Node) -> bool,
    {
        self.table
            .read()
            .await
            .nodes
            .values()
            .filter(|n| predicate(n))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Applies `f` to the node stored under `key` while holding the write lock,
    /// and returns the updated node.
    pub async fn update<F>(&self, key: &str, f: F) -> Option<Node>
    where
        F: FnOnce(&mut Node),
    {
        self.modify(key, |node| {
            f(node);
            node.clone()
        })
        .await
    }

    /// Like [NodeManager::update], but returns whatever `f` returns.
    /// Lets a caller decide and mutate in one critical section.
    pub async fn modify<F, R>(&self, key: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Node) -> R,
    {
        let mut table = self.table.write().await;
        let result = table.nodes.get_mut(key).map(f);
        if result.is_some() {
            table.version += 1;
        }
        result
    }

    /// Inserts `node` under `key` unless an entry already exists.
    /// Returns true if the node was inserted.
    pub async fn add_if_absent(&self, key: &str, node: Node) -> bool {
        let mut table = self.table.write().await;
        if table.nodes.contains_key(key) {
            return false;
        }
        table.nodes.insert(key.to_string(), node);
        table.version += 1;
        true
    }

    /// Keeps only the nodes matching `predicate` and returns the names of the dropped ones.
    ///
    /// The replacement table is built under the read lock and swapped in under the
    /// write lock. If the table changed in between, the predicate is re-applied in
    /// place so that entries added concurrently are not lost.
    pub async fn filter<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&Node) -> bool,
    {
        let (kept, evicted, seen_version) = {
            let table = self.table.read().await;
            let mut kept = HashMap::with_capacity(table.nodes.len());
            let mut evicted = Vec::new();
            for (key, node) in table.nodes.iter() {
                if predicate(node) {
                    kept.insert(key.clone(), node.clone());
                } else {
                    evicted.push(key.clone());
                }
            }
            (kept, evicted, table.version)
        };

        if evicted.is_empty() {
            return evicted;
        }

        let mut table = self.table.write().await;
        if table.version == seen_version {
            table.nodes = kept;
            table.version += 1;
            evicted
        } else {
            debug!("node table changed during filter, re-applying predicate under write lock");
            let mut evicted = Vec::new();
            table.nodes.retain(|key, node| {
                let keep = predicate(node);
                if !keep {
                    evicted.push(key.clone());
                }
                keep
            });
            table.version += 1;
            evicted
        }
    }

    /// Adds every statically configured peer as a local node.
    ///
    /// All entries are validated before any is inserted: one bad entry fails the
    /// whole load and leaves the table untouched.
    pub async fn load_static_nodes(
        &self,
        entries: &[StaticNode],
        this_node: &NodeIdentity,
    ) -> Result<usize, ConfigError> {
        for entry in entries {
            validate_static_node(entry, this_node)?;
        }

        let now = OffsetDateTime::now_utc();
        let mut table = self.table.write().await;
        for entry in entries {
            let identity = NodeIdentity::new(
                entry.name.clone(),
                entry.host.clone(),
                entry.port,
                this_node.cluster_name.clone(),
            );
            info!("loaded static node {}", identity);
            table
                .nodes
                .insert(entry.name.clone(), Node::local(identity, now));
        }
        table.version += 1;
        Ok(entries.len())
    }

    /// Reads the static node list from `store` and loads it. A missing list loads nothing.
    pub async fn load_static_nodes_from(
        &self,
        store: &dyn ConfigStore,
        this_node: &NodeIdentity,
    ) -> Result<usize, ConfigError> {
        let entries: Vec<StaticNode> = match store.unmarshal_key(STATIC_NODES_KEY) {
            Ok(entries) => entries,
            Err(ConfigError::MissingKey(_)) => return Ok(0),
            Err(e) => return Err(e),
        };
        self.load_static_nodes(&entries, this_node).await
    }
}

pub(crate) fn validate_static_node(
    entry: &StaticNode,
    this_node: &NodeIdentity,
) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidStaticNode {
        name: entry.name.clone(),
        reason: reason.to_string(),
    };
    if entry.name.is_empty() {
        return Err(invalid("empty name"));
    }
    if entry.host.is_empty() {
        return Err(invalid("empty host"));
    }
    if entry.port <= MIN_STATIC_PORT {
        return Err(invalid("port must be greater than 1000"));
    }
    if entry.name == this_node.name {
        return Err(invalid("name is the same as this node's name"));
    }
    if entry.host == this_node.host && entry.port == this_node.port {
        return Err(invalid("address is the same as this node's address"));
    }
    Ok(())
}
