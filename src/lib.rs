//! Cluster membership, peer authentication and fan-out RPC for a fleet of
//! proxy-server nodes.
//!
//! An [EndNode] registers with the peers it knows about, keeps heartbeating
//! them, learns further peers from their heartbeat replies and forwards proxy
//! operations to all of them at once. A [CenterNode] is an optional directory
//! that end nodes of one or more clusters report to, so that they can find each
//! other without listing every peer statically.

use std::{future::Future, sync::Arc};

use log::{error, info};
use time::OffsetDateTime;
use tokio::{
    net::TcpListener,
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use cluster::EndNodeClusterManager;
use config::{ConfigStore, ConfigStoreExt, StaticNode, STATIC_NODES_KEY};
use engine::{CertManager, ProxyEngine};
use error::{AuthError, ConfigError, FanOutError};
use fanout::{EndNodeClient, FanOutResult, Operation};
use grpc::TonicChannelFactory;
use membership::shutdown_signal;
use node::{Node, NodeIdentity};
use node_manager::validate_static_node;

#[cfg(test)]
extern crate quickcheck;
#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

mod builder;
mod center_node;
mod membership;

pub mod cluster;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod grpc;
pub mod node;
pub mod node_manager;

pub use self::builder::*;
pub use self::center_node::CenterNode;

/// A running end node. Dropping it stops the background loops; [EndNode::shutdown]
/// does the same and waits for them to finish.
pub struct EndNode {
    pub(crate) manager: Arc<EndNodeClusterManager>,
    pub(crate) client: EndNodeClient,
    pub(crate) engine: Arc<dyn ProxyEngine>,
    pub(crate) certs: Arc<dyn CertManager>,
    pub(crate) tonic_channel_factory: Arc<dyn TonicChannelFactory + Send + Sync>,
    pub(crate) config_store: Option<Arc<dyn ConfigStore>>,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EndNode {
    pub fn builder(this_node: NodeIdentity, cluster_token: impl Into<String>) -> EndNodeBuilder {
        EndNodeBuilder::new(this_node, cluster_token)
    }

    pub fn this_node(&self) -> &NodeIdentity {
        self.manager.this_node()
    }

    pub fn cluster_manager(&self) -> &Arc<EndNodeClusterManager> {
        &self.manager
    }

    /// The client operations are fanned out with. Clones share the in-flight limit.
    pub fn client(&self) -> &EndNodeClient {
        &self.client
    }

    /// The [TonicChannelFactory] that this node uses to communicate with other nodes.
    /// This is exposed so you can use it in your application to obtain gRPC channels,
    /// reusing channels the node has already opened.
    pub fn tonic_channel_factory(&self) -> &(dyn TonicChannelFactory + Send + Sync) {
        self.tonic_channel_factory.as_ref()
    }

    /// Serves both gRPC services on `listener` until [EndNode::shutdown] is called.
    pub fn serve(
        &self,
        listener: TcpListener,
    ) -> impl Future<Output = Result<(), tonic::transport::Error>> + Send + 'static {
        let router = Server::builder()
            .add_service(self.membership_grpc_service())
            .add_service(self.operation_grpc_service());
        router.serve_with_incoming_shutdown(
            TcpListenerStream::new(listener),
            shutdown_signal(self.shutdown.subscribe()),
        )
    }

    pub async fn is_valid(&self, name: &str) -> bool {
        self.manager.is_valid(name).await
    }

    pub async fn node_names(&self) -> Vec<String> {
        self.manager.node_names().await
    }

    pub async fn all_nodes(&self) -> Vec<Node> {
        self.manager.all_nodes().await
    }

    pub async fn nodes_with_filter<F>(&self, predicate: F) -> Vec<Node>
    where
        F: Fn(&Node) -> bool,
    {
        self.manager.cluster().get_nodes_with_filter(predicate).await
    }

    /// Like [EndNode::nodes_with_filter], in wire form.
    pub async fn proto_nodes_with_filter<F>(&self, predicate: F) -> Vec<grpc::protos::NodeIdentity>
    where
        F: Fn(&Node) -> bool,
    {
        self.manager.cluster().get_proto_nodes_with_filter(predicate).await
    }

    /// The center this node reports to, if any.
    pub async fn center_node(&self) -> Option<Node> {
        self.manager.center().get_all().await.into_values().next()
    }

    /// Runs `operation` on the named peers. Names we know nothing about are
    /// reported in [FanOutResult::failed].
    pub async fn fan_out(
        &self,
        operation: Operation,
        payload: &serde_json::Value,
        targets: &[String],
    ) -> Result<FanOutResult, FanOutError> {
        let nodes = self.manager.cluster().nodes();
        let mut known = Vec::with_capacity(targets.len());
        let mut unknown = Vec::new();
        for name in targets {
            match nodes.get(name).await {
                Some(node) => known.push(node),
                None => unknown.push(name.clone()),
            }
        }

        let mut result = self.client.fan_out(operation, payload, &known).await?;
        for name in unknown {
            let reason = AuthError::NodeNotExist(name.clone()).to_string();
            result.failed.insert(name, reason);
        }
        Ok(result)
    }

    /// Runs `operation` on every known peer.
    pub async fn fan_out_all(
        &self,
        operation: Operation,
        payload: &serde_json::Value,
    ) -> Result<FanOutResult, FanOutError> {
        let targets = self.manager.all_nodes().await;
        self.client.fan_out(operation, payload, &targets).await
    }

    /// Adds a static peer at runtime and, when the node was built with a config
    /// store, writes it to the persisted `static_nodes` list.
    pub async fn add_local_node(&self, entry: StaticNode) -> Result<(), ConfigError> {
        validate_static_node(&entry, self.this_node())?;
        if let Some(store) = &self.config_store {
            let mut entries = stored_static_nodes(store.as_ref())?;
            entries.retain(|e| e.name != entry.name);
            entries.push(entry.clone());
            store.set_serialized(STATIC_NODES_KEY, &entries)?;
            store.flush()?;
        }

        let identity = NodeIdentity::new(
            entry.name.clone(),
            entry.host,
            entry.port,
            self.this_node().cluster_name.clone(),
        );
        let nodes = self.manager.cluster().nodes();
        let promoted = nodes
            .modify(&entry.name, |n| {
                let same = n.compare(&identity);
                if same {
                    n.mark_local();
                }
                same
            })
            .await;
        if promoted != Some(true) {
            nodes
                .add(entry.name, Node::local(identity.clone(), OffsetDateTime::now_utc()))
                .await;
        }
        info!("added static node {}", identity);
        Ok(())
    }

    /// Forgets a peer, and removes it from the persisted `static_nodes` list if it is there.
    pub async fn delete_node(&self, name: &str) -> Result<Option<Node>, ConfigError> {
        if let Some(store) = &self.config_store {
            let mut entries = stored_static_nodes(store.as_ref())?;
            let before = entries.len();
            entries.retain(|e| e.name != name);
            if entries.len() != before {
                store.set_serialized(STATIC_NODES_KEY, &entries)?;
                store.flush()?;
            }
        }
        let removed = self.manager.cluster().nodes().delete(name).await;
        if removed.is_some() {
            info!("deleted node {}", name);
        }
        Ok(removed)
    }

    /// Stops the heartbeat and eviction loops and the gRPC server, and waits for the loops to exit.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.background_tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                error!("background task of {} did not complete: {}", self.this_node(), e);
            }
        }
    }
}

fn stored_static_nodes(store: &dyn ConfigStore) -> Result<Vec<StaticNode>, ConfigError> {
    match store.unmarshal_key(STATIC_NODES_KEY) {
        Ok(entries) => Ok(entries),
        Err(ConfigError::MissingKey(_)) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}
