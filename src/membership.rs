//! The active side of the membership protocol.
//!
//! Each heartbeat cycle contacts every known peer and the center, if any:
//! peers we hold no live token for get a registration, the others a heartbeat.
//! Contacts run as independent tasks, so one unreachable peer never delays or
//! fails the others. Eviction runs on its own timer.

use std::{future::Future, sync::Arc, time::Duration};

use log::{debug, error, info, warn};
use time::OffsetDateTime;
use tokio::{
    select,
    sync::watch,
    time::MissedTickBehavior,
};

use crate::{
    cluster::EndNodeClusterManager,
    error::{ResponseCode, RpcError},
    grpc::client::MembershipClient,
    node::Node,
    node_manager::NodeManager,
};

#[cfg(test)]
mod tests;

#[derive(Clone, Copy, Debug)]
enum Table {
    Peers,
    Center,
}

pub(crate) struct MembershipDriver {
    manager: Arc<EndNodeClusterManager>,
    client: MembershipClient,
}

impl MembershipDriver {
    pub(crate) fn new(manager: Arc<EndNodeClusterManager>, client: MembershipClient) -> Self {
        Self { manager, client }
    }

    fn table(&self, table: Table) -> &NodeManager {
        match table {
            Table::Peers => self.manager.cluster().nodes(),
            Table::Center => self.manager.center(),
        }
    }

    /// Contacts every known peer and the center once, and waits for all contacts to finish.
    pub(crate) async fn heartbeat_cycle(self: &Arc<Self>) {
        let this_name = self.manager.this_node().name.clone();
        let mut targets = Vec::new();
        for table in [Table::Peers, Table::Center] {
            for (name, node) in self.table(table).get_all().await {
                if name != this_name {
                    targets.push((table, node));
                }
            }
        }

        let contacts: Vec<_> = targets
            .into_iter()
            .map(|(table, node)| {
                let driver = Arc::clone(self);
                let name = node.name().to_string();
                (name, tokio::spawn(async move { driver.contact(table, node).await }))
            })
            .collect();
        for (name, contact) in contacts {
            if let Err(e) = contact.await {
                error!("contact task for {} did not complete: {}", name, e);
            }
        }
    }

    async fn contact(&self, table: Table, node: Node) {
        let peer = node.identity();
        let outcome = if node.registered_remote() {
            self.client
                .heartbeat(peer, node.out_token())
                .await
                .map(|peers| (None, peers))
        } else {
            self.client
                .register(peer)
                .await
                .map(|registration| (Some(registration.token), Vec::new()))
        };

        let now = OffsetDateTime::now_utc();
        match outcome {
            Ok((issued, peers)) => {
                self.table(table)
                    .update(&peer.name, |n| {
                        if let Some(token) = issued {
                            n.set_out_token(token);
                        }
                        n.touch_report_heartbeat(now);
                    })
                    .await;
                if !peers.is_empty() {
                    let added = self.manager.merge_peers(peers, now).await;
                    if added > 0 {
                        info!("{} told us about {} new peers", peer, added);
                    }
                }
            }
            Err(e) => {
                log_failure(&node, &e);
                self.table(table)
                    .update(&peer.name, |n| {
                        n.clear_out_token();
                        // static peers keep being retried through any outage
                        if n.is_local() {
                            n.touch_report_heartbeat(now);
                        }
                    })
                    .await;
            }
        }
    }

    /// Drops peers that have been silent for too long.
    pub(crate) async fn eviction_cycle(&self) {
        let evicted = self.manager.evict(OffsetDateTime::now_utc()).await;
        if !evicted.is_empty() {
            debug!("eviction dropped {:?}", evicted);
        }
    }
}

fn log_failure(node: &Node, e: &RpcError) {
    let action = if node.registered_remote() {
        "heartbeat to"
    } else {
        "registration with"
    };
    match e.code().map(ResponseCode::try_from) {
        Some(Ok(ResponseCode::NodeDropped)) => {
            info!("{} dropped us, registering again next cycle", node.identity())
        }
        Some(_) => warn!("{} {} was rejected: {}", action, node.identity(), e),
        None => warn!("{} {} failed: {}", action, node.identity(), e),
    }
}

/// Runs `tick` every `period` until `shutdown` flips to true or its sender is dropped.
pub(crate) async fn periodic<F, Fut>(period: Duration, mut shutdown: watch::Receiver<bool>, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        select! {
            _ = interval.tick() => tick().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Resolves once `shutdown` flips to true or its sender is dropped.
pub(crate) async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}
