use log::{debug, info, warn};
use rand::{distributions::Alphanumeric, Rng};
use time::OffsetDateTime;

use crate::{
    error::{AuthError, HeartbeatError, RegisterError, ResponseCode},
    grpc::protos,
    node::{Node, NodeIdentity, HEARTBEAT_TIMEOUT},
    node_manager::NodeManager,
};

pub mod center;
pub mod end_node;


pub use center::CenterClusterManager;
pub use end_node::EndNodeClusterManager;

const TOKEN_LEN: usize = 32;

/// One cluster: its credentials, the nodes that belong to it, and a holding area
/// for nodes that tried to join with the wrong credentials.
pub struct Cluster {
    name: String,
    token: String,
    nodes: NodeManager,
    wrong_token_nodes: NodeManager,
}

/// The outcome of a successful registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    /// The token the registrant must present to us from now on
    pub token: String,
    /// The registrant already held a live token, which is returned unchanged.
    pub already_registered: bool,
}

impl Registration {
    pub fn code(&self) -> ResponseCode {
        if self.already_registered {
            ResponseCode::AlreadyRegistered
        } else {
            ResponseCode::Ok
        }
    }
}

impl Cluster {
    pub fn new(name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
            nodes: NodeManager::new(),
            wrong_token_nodes: NodeManager::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn token(&self) -> &str {
        &self.token
    }

    pub fn nodes(&self) -> &NodeManager {
        &self.nodes
    }

    /// Checks a registrant's claim to belong to this cluster.
    pub fn is_same_cluster(&self, name: &str, token: &str) -> Result<(), RegisterError> {
        if name != self.name || token != self.token {
            return Err(RegisterError::WrongCluster(name.to_string()));
        }
        Ok(())
    }

    pub async fn auth_remote_node(&self, claimed: &NodeIdentity, token: &str) -> Result<Node, AuthError> {
        self.auth_remote_node_at(claimed, token, OffsetDateTime::now_utc())
            .await
    }

    /// Authenticates a request from `claimed` carrying `token`.
    ///
    /// A successful authentication counts as an inbound heartbeat, and the stored
    /// record is returned so the caller works with the canonical node.
    pub async fn auth_remote_node_at(
        &self,
        claimed: &NodeIdentity,
        token: &str,
        now: OffsetDateTime,
    ) -> Result<Node, AuthError> {
        let node = self
            .nodes
            .modify(&claimed.name, |node| {
                check_credentials(node, claimed, token, now)?;
                node.touch_get_heartbeat(now);
                Ok(node.clone())
            })
            .await
            .ok_or_else(|| AuthError::NodeNotExist(claimed.name.clone()))??;
        self.wrong_token_nodes.delete(&claimed.name).await;
        Ok(node)
    }

    pub async fn get_nodes_with_filter<F>(&self, predicate: F) -> Vec<Node>
    where
        F: Fn(&Node) -> bool,
    {
        self.nodes.get_with_filter(predicate).await
    }

    pub async fn get_proto_nodes_with_filter<F>(&self, predicate: F) -> Vec<protos::NodeIdentity>
    where
        F: Fn(&Node) -> bool,
    {
        self.nodes
            .get_with_filter(predicate)
            .await
            .iter()
            .map(|n| n.identity().into())
            .collect()
    }

    /// Quarantines `identity`. Returns true the first time the name is seen.
    pub async fn add_to_wrong_node_list(&self, identity: NodeIdentity, now: OffsetDateTime) -> bool {
        let name = identity.name.clone();
        let first_time = !self.wrong_token_nodes.contains(&name).await;
        // re-adding refreshes the create time, so a registrant that keeps retrying stays quarantined
        self.wrong_token_nodes.add(name, Node::new(identity, now)).await;
        first_time
    }

    pub async fn get_node_from_wrong_node_list(&self, name: &str) -> Option<Node> {
        self.wrong_token_nodes.get(name).await
    }

    pub async fn delete_from_wrong_token_node_list(&self, name: &str) -> Option<Node> {
        self.wrong_token_nodes.delete(name).await
    }

    pub async fn register_node(
        &self,
        claimed: &NodeIdentity,
        cluster_token: &str,
        server_name: &str,
    ) -> Result<Registration, RegisterError> {
        self.register_node_at(claimed, cluster_token, server_name, OffsetDateTime::now_utc())
            .await
    }

    /// Handles a registration from `claimed`, which proved its membership with `cluster_token`.
    pub async fn register_node_at(
        &self,
        claimed: &NodeIdentity,
        cluster_token: &str,
        server_name: &str,
        now: OffsetDateTime,
    ) -> Result<Registration, RegisterError> {
        if claimed.host.is_empty() || claimed.port == 0 {
            return Err(RegisterError::InvalidAddress {
                host: claimed.host.clone(),
                port: claimed.port as u32,
            });
        }
        if claimed.name == server_name {
            return Err(RegisterError::SameNameAsServer(claimed.name.clone()));
        }
        if let Err(e) = self.is_same_cluster(&claimed.cluster_name, cluster_token) {
            self.quarantine(claimed.clone(), now).await;
            return Err(e);
        }
        if self.delete_from_wrong_token_node_list(&claimed.name).await.is_some() {
            info!("{} registered with valid credentials, lifted quarantine", claimed);
        }

        loop {
            let known = self
                .nodes
                .modify(&claimed.name, |node| reregister(node, claimed, now))
                .await;
            if let Some(outcome) = known {
                return outcome;
            }

            let token = mint_token();
            let node = Node::registered(claimed.clone(), token.clone(), now);
            if self.nodes.add_if_absent(&claimed.name, node).await {
                info!("registered new node {} in cluster {}", claimed, self.name);
                return Ok(Registration {
                    token,
                    already_registered: false,
                });
            }
            // someone registered the same name between the lookup and the insert
            debug!("concurrent registration of {}, retrying", claimed.name);
        }
    }

    /// Records a quarantine and logs it, loudly only the first time.
    pub(crate) async fn quarantine(&self, identity: NodeIdentity, now: OffsetDateTime) {
        let description = identity.to_string();
        if self.add_to_wrong_node_list(identity, now).await {
            warn!(
                "{} failed to prove membership of cluster {}, quarantined",
                description, self.name
            );
        } else {
            debug!("quarantined node {} retried with bad credentials", description);
        }
    }

    pub async fn heartbeat(
        &self,
        claimed: &NodeIdentity,
        token: &str,
    ) -> Result<Vec<NodeIdentity>, HeartbeatError> {
        self.heartbeat_at(claimed, token, OffsetDateTime::now_utc())
            .await
    }

    /// Authenticates a heartbeat and returns the live peers the sender should know about.
    pub async fn heartbeat_at(
        &self,
        claimed: &NodeIdentity,
        token: &str,
        now: OffsetDateTime,
    ) -> Result<Vec<NodeIdentity>, HeartbeatError> {
        match self.auth_remote_node_at(claimed, token, now).await {
            Err(AuthError::NodeNotExist(name)) => return Err(HeartbeatError::NodeDropped(name)),
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }
        Ok(self
            .nodes
            .get_with_filter(|n| n.name() != claimed.name && n.is_valid_at(now))
            .await
            .into_iter()
            .map(|n| n.identity().clone())
            .collect())
    }

    /// Drops stale nodes, except local ones, and stale quarantine entries.
    pub async fn evict_stale_at(&self, now: OffsetDateTime) -> Vec<String> {
        let evicted = self
            .nodes
            .filter(|n| n.is_valid_at(now) || n.is_local())
            .await;
        for name in &evicted {
            info!("evicted stale node {} from cluster {}", name, self.name);
        }
        let forgotten = self.wrong_token_nodes.filter(|n| n.is_valid_at(now)).await;
        if !forgotten.is_empty() {
            debug!("forgot {} quarantined nodes of cluster {}", forgotten.len(), self.name);
        }
        evicted
    }
}

fn check_credentials(
    node: &Node,
    claimed: &NodeIdentity,
    token: &str,
    now: OffsetDateTime,
) -> Result<(), AuthError> {
    if !node.compare(claimed) {
        return Err(AuthError::MetaMismatch(claimed.name.clone()));
    }
    if node.in_token().is_empty() || node.in_token() != token {
        return Err(AuthError::WrongToken(claimed.name.clone()));
    }
    if let Some(last_seen) = node.get_heartbeat_time() {
        if now - last_seen >= HEARTBEAT_TIMEOUT {
            return Err(AuthError::TokenTimeout(claimed.name.clone()));
        }
    }
    Ok(())
}

// runs under the node table's write lock
fn reregister(
    node: &mut Node,
    claimed: &NodeIdentity,
    now: OffsetDateTime,
) -> Result<Registration, RegisterError> {
    if !node.compare(claimed) {
        return Err(RegisterError::NameCollision(claimed.name.clone()));
    }
    if node.registered_local_at(now) {
        node.touch_get_heartbeat(now);
        return Ok(Registration {
            token: node.in_token().to_string(),
            already_registered: true,
        });
    }
    let token = mint_token();
    node.set_in_token(token.clone());
    node.touch_get_heartbeat(now);
    info!("issued a fresh token to known node {}", claimed);
    Ok(Registration {
        token,
        already_registered: false,
    })
}

/// A fresh random per-node token.
pub fn mint_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}
