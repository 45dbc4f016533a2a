use std::{sync::Arc, time::Duration};

use tokio::sync::{watch, Mutex};

use crate::{
    cluster::{CenterClusterManager, EndNodeClusterManager},
    config::{ClusterCredentials, ConfigStore, ConfigStoreExt, StaticNode},
    engine::{CertManager, ProxyEngine, Unconfigured},
    error::ConfigError,
    fanout::{EndNodeClient, DEFAULT_MAX_IN_FLIGHT},
    grpc::{
        client::MembershipClient, DefaultTonicChannelFactory, GrpcTransport, NodeTransport,
        TonicChannelFactory,
    },
    membership::{periodic, MembershipDriver},
    node::{NodeIdentity, HEARTBEAT_TIMEOUT},
    CenterNode, EndNode,
};

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_EVICTION_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(3);
// the heartbeat interval must leave room for this many missed beats before a peer times out
const MISSED_HEARTBEATS_TOLERATED: u32 = 3;

pub struct EndNodeBuilder {
    this_node: NodeIdentity,
    cluster_token: String,
    static_nodes: Vec<StaticNode>,
    center: Option<NodeIdentity>,
    heartbeat_interval: Duration,
    eviction_interval: Duration,
    rpc_timeout: Duration,
    max_in_flight: usize,
    engine: Arc<dyn ProxyEngine>,
    certs: Arc<dyn CertManager>,
    tonic_channel_factory: Arc<dyn TonicChannelFactory + Send + Sync>,
    transport: Option<Arc<dyn NodeTransport>>,
    config_store: Option<Arc<dyn ConfigStore>>,
}

impl EndNodeBuilder {
    pub fn new(this_node: NodeIdentity, cluster_token: impl Into<String>) -> Self {
        Self {
            this_node,
            cluster_token: cluster_token.into(),
            static_nodes: Vec::new(),
            center: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            eviction_interval: DEFAULT_EVICTION_INTERVAL,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            engine: Arc::new(Unconfigured),
            certs: Arc::new(Unconfigured),
            tonic_channel_factory: Arc::new(DefaultTonicChannelFactory::new()),
            transport: None,
            config_store: None,
        }
    }

    /// Seeds a builder from `node.*`, `cluster.*`, `center.*`, `membership.*` and
    /// `static_nodes` in `store`. The store is kept, so that [EndNode::add_local_node]
    /// and [EndNode::delete_node] write the static node list back to it.
    pub fn from_config(store: Arc<dyn ConfigStore>) -> Result<Self, ConfigError> {
        let this_node = NodeIdentity::new(
            store.get_string("node.name")?,
            store.get_string("node.host")?,
            read_port(store.as_ref(), "node.port")?,
            store.get_string("cluster.name")?,
        );
        let mut builder = Self::new(this_node, store.get_string("cluster.token")?);

        if store.get("center").is_some() {
            builder.center = Some(NodeIdentity::new(
                store.get_string("center.name")?,
                store.get_string("center.host")?,
                read_port(store.as_ref(), "center.port")?,
                builder.this_node.cluster_name.clone(),
            ));
        }
        if let Some(secs) = optional_positive(store.as_ref(), "membership.heartbeat_interval_secs")? {
            builder.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = optional_positive(store.as_ref(), "membership.eviction_interval_secs")? {
            builder.eviction_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = optional_positive(store.as_ref(), "membership.rpc_timeout_secs")? {
            builder.rpc_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = optional_positive(store.as_ref(), "membership.max_in_flight")? {
            builder.max_in_flight = max as usize;
        }
        builder.config_store = Some(store);
        Ok(builder)
    }

    pub fn with_static_nodes(mut self, static_nodes: &[StaticNode]) -> Self {
        self.static_nodes.extend(static_nodes.iter().cloned());
        self
    }

    /// Reports to a center node, in addition to the peers.
    pub fn with_center(mut self, center: NodeIdentity) -> Self {
        self.center = Some(center);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn with_proxy_engine(mut self, engine: Arc<dyn ProxyEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_cert_manager(mut self, certs: Arc<dyn CertManager>) -> Self {
        self.certs = certs;
        self
    }

    pub fn with_tonic_channel_factory<F>(self, factory: F) -> Self
    where
        F: TonicChannelFactory + Send + Sync + 'static,
    {
        self.with_tonic_channel_factory_arc(Arc::new(factory))
    }

    pub fn with_tonic_channel_factory_arc(
        mut self,
        factory: Arc<dyn TonicChannelFactory + Send + Sync>,
    ) -> Self {
        self.tonic_channel_factory = factory;
        self
    }

    /// Replaces the gRPC transport altogether. Mostly useful in tests.
    pub fn with_transport(mut self, transport: Arc<dyn NodeTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_config_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.config_store = Some(store);
        self
    }

    /// Validates the configuration, loads the static nodes and starts the heartbeat
    /// and eviction loops. Must be called from within a Tokio runtime.
    pub async fn build(self) -> Result<EndNode, ConfigError> {
        validate_identity(&self.this_node)?;
        validate_intervals(self.heartbeat_interval, self.eviction_interval, self.rpc_timeout)?;

        let manager = Arc::new(EndNodeClusterManager::new(
            self.this_node.clone(),
            self.cluster_token.clone(),
        ));
        let nodes = manager.cluster().nodes();
        nodes
            .load_static_nodes(&self.static_nodes, &self.this_node)
            .await?;
        if let Some(store) = &self.config_store {
            nodes
                .load_static_nodes_from(store.as_ref(), &self.this_node)
                .await?;
        }
        if let Some(center) = self.center {
            if center.name == self.this_node.name || center.host.is_empty() || center.port == 0 {
                return Err(ConfigError::InvalidIdentity(format!("invalid center node {}", center)));
            }
            manager.set_center(center).await;
        }

        let transport: Arc<dyn NodeTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(GrpcTransport::new(Arc::clone(&self.tonic_channel_factory))),
        };
        let client = EndNodeClient::new(
            self.this_node.clone(),
            Arc::clone(&transport),
            self.max_in_flight,
            self.rpc_timeout,
        );
        let driver = Arc::new(MembershipDriver::new(
            Arc::clone(&manager),
            MembershipClient::new(
                transport,
                self.this_node.clone(),
                self.cluster_token,
                self.rpc_timeout,
            ),
        ));

        let (shutdown, shutdown_receiver) = watch::channel(false);
        let heartbeats = {
            let driver = Arc::clone(&driver);
            tokio::spawn(periodic(
                self.heartbeat_interval,
                shutdown_receiver.clone(),
                move || {
                    let driver = Arc::clone(&driver);
                    async move { driver.heartbeat_cycle().await }
                },
            ))
        };
        let eviction = tokio::spawn(periodic(
            self.eviction_interval,
            shutdown_receiver,
            move || {
                let driver = Arc::clone(&driver);
                async move { driver.eviction_cycle().await }
            },
        ));

        Ok(EndNode {
            manager,
            client,
            engine: self.engine,
            certs: self.certs,
            tonic_channel_factory: self.tonic_channel_factory,
            config_store: self.config_store,
            shutdown,
            background_tasks: Mutex::new(vec![heartbeats, eviction]),
        })
    }
}

pub struct CenterNodeBuilder {
    name: String,
    clusters: Vec<ClusterCredentials>,
    eviction_interval: Duration,
}

impl CenterNodeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clusters: Vec::new(),
            eviction_interval: DEFAULT_EVICTION_INTERVAL,
        }
    }

    /// Seeds a builder from `center.name`, the `clusters` list and
    /// `membership.eviction_interval_secs` in `store`.
    pub fn from_config(store: &dyn ConfigStore) -> Result<Self, ConfigError> {
        let mut builder = Self::new(store.get_string("center.name")?);
        builder.clusters = store.unmarshal_key("clusters")?;
        if let Some(secs) = optional_positive(store, "membership.eviction_interval_secs")? {
            builder.eviction_interval = Duration::from_secs(secs);
        }
        Ok(builder)
    }

    pub fn with_cluster(mut self, name: impl Into<String>, token: impl Into<String>) -> Self {
        self.clusters.push(ClusterCredentials {
            name: name.into(),
            token: token.into(),
        });
        self
    }

    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    pub async fn build(self) -> Result<CenterNode, ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::InvalidIdentity("center name is empty".to_string()));
        }
        if self.eviction_interval.is_zero() {
            return Err(ConfigError::InvalidIntervals("eviction interval is zero".to_string()));
        }
        let manager = Arc::new(CenterClusterManager::new(self.name));
        for cluster in self.clusters {
            if cluster.name.is_empty() {
                return Err(ConfigError::InvalidIdentity("cluster name is empty".to_string()));
            }
            manager.add_cluster(cluster.name, cluster.token).await;
        }

        let (shutdown, shutdown_receiver) = watch::channel(false);
        let eviction = {
            let manager = Arc::clone(&manager);
            tokio::spawn(periodic(self.eviction_interval, shutdown_receiver, move || {
                let manager = Arc::clone(&manager);
                async move {
                    manager.evict(time::OffsetDateTime::now_utc()).await;
                }
            }))
        };

        Ok(CenterNode {
            manager,
            shutdown,
            background_tasks: Mutex::new(vec![eviction]),
        })
    }
}

fn validate_identity(this_node: &NodeIdentity) -> Result<(), ConfigError> {
    if this_node.name.is_empty() {
        return Err(ConfigError::InvalidIdentity("node name is empty".to_string()));
    }
    if this_node.host.is_empty() || this_node.port == 0 {
        return Err(ConfigError::InvalidIdentity(format!(
            "invalid address {}",
            this_node.address()
        )));
    }
    if this_node.cluster_name.is_empty() {
        return Err(ConfigError::InvalidIdentity("cluster name is empty".to_string()));
    }
    Ok(())
}

fn validate_intervals(
    heartbeat_interval: Duration,
    eviction_interval: Duration,
    rpc_timeout: Duration,
) -> Result<(), ConfigError> {
    if heartbeat_interval.is_zero() || eviction_interval.is_zero() || rpc_timeout.is_zero() {
        return Err(ConfigError::InvalidIntervals("intervals must be positive".to_string()));
    }
    if (heartbeat_interval * MISSED_HEARTBEATS_TOLERATED).as_secs_f64()
        > HEARTBEAT_TIMEOUT.as_seconds_f64()
    {
        return Err(ConfigError::InvalidIntervals(format!(
            "heartbeat interval {:?} is too long for a {} heartbeat timeout",
            heartbeat_interval, HEARTBEAT_TIMEOUT
        )));
    }
    if rpc_timeout >= heartbeat_interval {
        return Err(ConfigError::InvalidIntervals(format!(
            "rpc timeout {:?} must be shorter than the heartbeat interval {:?}",
            rpc_timeout, heartbeat_interval
        )));
    }
    Ok(())
}

fn read_port(store: &dyn ConfigStore, key: &str) -> Result<u16, ConfigError> {
    let port = store.get_int(key)?;
    u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| ConfigError::InvalidIdentity(format!("{} = {} is not a valid port", key, port)))
}

fn optional_positive(store: &dyn ConfigStore, key: &str) -> Result<Option<u64>, ConfigError> {
    match store.get_int(key) {
        Ok(value) if value > 0 => Ok(Some(value as u64)),
        Ok(value) => Err(ConfigError::InvalidIntervals(format!("{} = {} must be positive", key, value))),
        Err(ConfigError::MissingKey(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
