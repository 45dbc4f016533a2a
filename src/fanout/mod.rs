//! Dispatching one operation to many end nodes at once.
//!
//! Every target gets its own task. A failing target only ever shows up in
//! [FanOutResult::failed]; the call as a whole fails only when the request
//! itself is unusable.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use log::{debug, error, warn};
use serde::Deserialize;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tonic::Status;

use crate::{
    codec::MessageCodec,
    error::{FanOutError, RpcError},
    grpc::{
        client::{accept, call_sealed},
        protos::NodeAuthInfo,
        NodeTransport,
    },
    node::{Node, NodeIdentity},
};

mod ops;

#[cfg(test)]
mod tests;

pub use ops::*;

/// Upper bound on outbound operation calls in flight, shared by all fan-outs of one client.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// Per-node outcome of a fan-out.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FanOutResult {
    pub succeeded: BTreeMap<String, OperationResponse>,
    pub failed: BTreeMap<String, String>,
    /// Targets we hold no valid outbound token for
    pub skipped: Vec<String>,
}

impl FanOutResult {
    /// `node: X > err: Y|node: Z > err: W`, empty when nothing failed.
    pub fn failure_summary(&self) -> String {
        self.failed
            .iter()
            .map(|(node, err)| format!("node: {} > err: {}", node, err))
            .collect::<Vec<_>>()
            .join("|")
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Sends operations to other end nodes. Cheap to clone; clones share the in-flight limit.
#[derive(Clone)]
pub struct EndNodeClient {
    inner: Arc<Inner>,
}

struct Inner {
    this_node: NodeIdentity,
    transport: Arc<dyn NodeTransport>,
    limiter: Semaphore,
    rpc_timeout: Duration,
}

impl EndNodeClient {
    pub fn new(
        this_node: NodeIdentity,
        transport: Arc<dyn NodeTransport>,
        max_in_flight: usize,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                this_node,
                transport,
                limiter: Semaphore::new(max_in_flight.max(1)),
                rpc_timeout,
            }),
        }
    }

    /// Free slots in the in-flight limit.
    pub fn available_permits(&self) -> usize {
        self.inner.limiter.available_permits()
    }

    /// Runs `operation` with `payload` on every target we are registered with.
    pub async fn fan_out(
        &self,
        operation: Operation,
        payload: &serde_json::Value,
        targets: &[Node],
    ) -> Result<FanOutResult, FanOutError> {
        match operation {
            Operation::AddUsers => self.dispatch::<AddUsers>(payload, targets).await,
            Operation::DeleteUsers => self.dispatch::<DeleteUsers>(payload, targets).await,
            Operation::GetUsers => self.dispatch::<GetUsers>(payload, targets).await,
            Operation::AddInbound => self.dispatch::<AddInbound>(payload, targets).await,
            Operation::DeleteInbound => self.dispatch::<DeleteInbound>(payload, targets).await,
            Operation::GetStats => self.dispatch::<GetStats>(payload, targets).await,
            Operation::ObtainCert => self.dispatch::<ObtainCert>(payload, targets).await,
            Operation::GetCerts => self.dispatch::<GetCerts>(payload, targets).await,
        }
    }

    /// Like [EndNodeClient::fan_out], with the operation given by name (`add_users`, `get_stats`, ...).
    pub async fn fan_out_by_name(
        &self,
        operation: &str,
        payload: &serde_json::Value,
        targets: &[Node],
    ) -> Result<FanOutResult, FanOutError> {
        self.fan_out(operation.parse()?, payload, targets).await
    }

    async fn dispatch<O: RemoteOperation>(
        &self,
        payload: &serde_json::Value,
        targets: &[Node],
    ) -> Result<FanOutResult, FanOutError> {
        let payload = O::Payload::deserialize(payload).map_err(|source| FanOutError::Payload {
            operation: O::NAME,
            source,
        })?;

        let now = OffsetDateTime::now_utc();
        let mut result = FanOutResult::default();
        let mut calls = Vec::with_capacity(targets.len());
        for target in targets {
            if !target.registered_remote_at(now) {
                debug!("skipping {} for {}, not registered with it", target.identity(), O::NAME);
                result.skipped.push(target.name().to_string());
                continue;
            }
            let inner = Arc::clone(&self.inner);
            let target = target.clone();
            let payload = payload.clone();
            calls.push((
                target.name().to_string(),
                tokio::spawn(async move { inner.call::<O>(&target, payload).await }),
            ));
        }

        for (name, call) in calls {
            match call.await {
                Ok(Ok(response)) => {
                    result.succeeded.insert(name, response);
                }
                Ok(Err(e)) => {
                    warn!("{} failed on node {}: {}", O::NAME, name, e);
                    result.failed.insert(name, e.to_string());
                }
                Err(e) => {
                    error!("{} task for node {} did not complete: {}", O::NAME, name, e);
                    result.failed.insert(name, e.to_string());
                }
            }
        }
        Ok(result)
    }
}

impl Inner {
    async fn call<O: RemoteOperation>(&self, target: &Node, payload: O::Payload) -> Result<OperationResponse, RpcError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| RpcError::Transport(Status::cancelled("fan-out limiter closed")))?;
        let token = target.out_token();
        let request = O::build_request(payload, NodeAuthInfo::new(token, &self.this_node));
        let reply: O::Response = call_sealed(
            self.transport.as_ref(),
            &MessageCodec::node(token),
            &self.this_node,
            target.identity(),
            O::METHOD,
            &request,
            self.rpc_timeout,
        )
        .await?;
        Ok(O::into_result(accept(reply)?))
    }
}
