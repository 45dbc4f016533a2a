use std::{sync::Arc, time::Duration};

use super::{
    protos::{self, NodeAuthInfo},
    NodeTransport, RpcMethod, StatusResponse,
};
use crate::{
    cluster::Registration,
    codec::MessageCodec,
    error::{ResponseCode, RpcError},
    node::NodeIdentity,
};

/// Seals `request`, sends it to `target` and opens the reply, all within `rpc_timeout`.
pub(crate) async fn call_sealed<Req, Resp>(
    transport: &dyn NodeTransport,
    codec: &MessageCodec,
    sender: &NodeIdentity,
    target: &NodeIdentity,
    method: RpcMethod,
    request: &Req,
    rpc_timeout: Duration,
) -> Result<Resp, RpcError>
where
    Req: prost::Message,
    Resp: prost::Message + Default,
{
    let sealed = codec.seal(&sender.cluster_name, &sender.name, request)?;
    let reply = tokio::time::timeout(rpc_timeout, transport.unary(target, method, sealed))
        .await
        .map_err(|_| RpcError::Timeout(rpc_timeout))??;
    Ok(codec.open(&reply)?)
}

/// Rejects replies carrying a non-zero code.
pub(crate) fn accept<R: StatusResponse>(reply: R) -> Result<R, RpcError> {
    match reply.code() {
        0 => Ok(reply),
        _ => Err(rejected(&reply)),
    }
}

fn rejected<R: StatusResponse>(reply: &R) -> RpcError {
    RpcError::Rejected {
        code: reply.code(),
        msg: format!("{}: {}", ResponseCode::describe(reply.code()), reply.msg()),
    }
}

/// The outbound half of the membership protocol: registering with peers and
/// heartbeating them. Every payload is keyed by the cluster token.
pub(crate) struct MembershipClient {
    transport: Arc<dyn NodeTransport>,
    this_node: NodeIdentity,
    cluster_token: String,
    codec: MessageCodec,
    rpc_timeout: Duration,
}

impl MembershipClient {
    pub(crate) fn new(
        transport: Arc<dyn NodeTransport>,
        this_node: NodeIdentity,
        cluster_token: String,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            codec: MessageCodec::cluster(&cluster_token),
            transport,
            this_node,
            cluster_token,
            rpc_timeout,
        }
    }

    /// Registers with `peer`. An "already registered" answer counts as success.
    pub(crate) async fn register(&self, peer: &NodeIdentity) -> Result<Registration, RpcError> {
        let request = protos::RegisterRequest {
            auth: Some(NodeAuthInfo::new(&self.cluster_token, &self.this_node)),
        };
        let reply: protos::RegisterResponse = self.call(peer, RpcMethod::RegisterNode, &request).await?;
        match ResponseCode::try_from(reply.code) {
            Ok(ResponseCode::Ok) => Ok(Registration {
                token: reply.token,
                already_registered: false,
            }),
            Ok(ResponseCode::AlreadyRegistered) => Ok(Registration {
                token: reply.token,
                already_registered: true,
            }),
            _ => Err(rejected(&reply)),
        }
    }

    /// Proves our liveness to `peer` with the token it issued us, and returns the peers it knows.
    pub(crate) async fn heartbeat(
        &self,
        peer: &NodeIdentity,
        out_token: &str,
    ) -> Result<Vec<NodeIdentity>, RpcError> {
        let request = protos::HeartbeatRequest {
            auth: Some(NodeAuthInfo::new(out_token, &self.this_node)),
        };
        let reply: protos::HeartbeatResponse = self.call(peer, RpcMethod::Heartbeat, &request).await?;
        Ok(accept(reply)?
            .known_peers
            .into_iter()
            .filter_map(|p| NodeIdentity::try_from(p).ok())
            .collect())
    }

    async fn call<Req, Resp>(
        &self,
        peer: &NodeIdentity,
        method: RpcMethod,
        request: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: prost::Message,
        Resp: prost::Message + Default,
    {
        call_sealed(
            self.transport.as_ref(),
            &self.codec,
            &self.this_node,
            peer,
            method,
            request,
            self.rpc_timeout,
        )
        .await
    }
}
