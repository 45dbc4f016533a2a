use std::{fmt, sync::Arc};

use log::debug;
use tonic::{async_trait, Code, Status};

use super::{
    protos::{
        membership_service_client::MembershipServiceClient,
        operation_service_client::OperationServiceClient, SealedMessage,
    },
    TonicChannelFactory,
};
use crate::node::NodeIdentity;

/// Every unary RPC a node can be asked to serve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    RegisterNode,
    Heartbeat,
    AddUsers,
    DeleteUsers,
    GetUsers,
    AddInbound,
    DeleteInbound,
    GetStats,
    ObtainCert,
    GetCerts,
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Carries one sealed request to a peer and brings back its sealed reply.
///
/// This is the seam between the membership and fan-out logic and the network.
/// [GrpcTransport] is the production implementation.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn unary(
        &self,
        target: &NodeIdentity,
        method: RpcMethod,
        request: SealedMessage,
    ) -> Result<SealedMessage, Status>;
}

/// Sends requests over Tonic channels obtained from a [TonicChannelFactory].
pub struct GrpcTransport {
    channels: Arc<dyn TonicChannelFactory + Send + Sync>,
}

impl GrpcTransport {
    pub fn new(channels: Arc<dyn TonicChannelFactory + Send + Sync>) -> Self {
        Self { channels }
    }
}

#[async_trait]
impl NodeTransport for GrpcTransport {
    async fn unary(
        &self,
        target: &NodeIdentity,
        method: RpcMethod,
        request: SealedMessage,
    ) -> Result<SealedMessage, Status> {
        let url = target
            .endpoint_url()
            .map_err(|e| Status::invalid_argument(format!("bad address {}: {}", target.address(), e)))?;
        let channel = self
            .channels
            .channel_for_url(url.clone())
            .await
            .map_err(|e| Status::unavailable(format!("failed to connect to {}: {}", target.address(), e)))?;

        let result = match method {
            RpcMethod::RegisterNode => MembershipServiceClient::new(channel).register_node(request).await,
            RpcMethod::Heartbeat => MembershipServiceClient::new(channel).heartbeat(request).await,
            RpcMethod::AddUsers => OperationServiceClient::new(channel).add_users(request).await,
            RpcMethod::DeleteUsers => OperationServiceClient::new(channel).delete_users(request).await,
            RpcMethod::GetUsers => OperationServiceClient::new(channel).get_users(request).await,
            RpcMethod::AddInbound => OperationServiceClient::new(channel).add_inbound(request).await,
            RpcMethod::DeleteInbound => OperationServiceClient::new(channel).delete_inbound(request).await,
            RpcMethod::GetStats => OperationServiceClient::new(channel).get_stats(request).await,
            RpcMethod::ObtainCert => OperationServiceClient::new(channel).obtain_cert(request).await,
            RpcMethod::GetCerts => OperationServiceClient::new(channel).get_certs(request).await,
        };

        match result {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => {
                if matches!(status.code(), Code::Unavailable | Code::Unknown | Code::DeadlineExceeded) {
                    debug!("{} to {} failed at transport level, re-dialing next time", method, target);
                    self.channels.invalidate(&url).await;
                }
                Err(status)
            }
        }
    }
}
