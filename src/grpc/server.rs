use std::{future::Future, sync::Arc};

use log::{debug, warn};
use time::OffsetDateTime;
use tonic::{async_trait, Request, Response, Status};

use super::{
    dtos_conversions::{AuthenticatedRequest, StatusResponse},
    protos::{self, SealedMessage},
    MembershipServiceServer, OperationServiceServer,
};
use crate::{
    cluster::{CenterClusterManager, Cluster, EndNodeClusterManager},
    codec::MessageCodec,
    engine::{CertManager, Inbound, ProxyEngine},
    error::{AuthError, EngineError, ResponseCode},
    node::{Node, NodeIdentity},
    CenterNode, EndNode,
};

/// Whatever answers membership RPCs: an end node serving its own cluster, or a
/// center serving many.
#[async_trait]
pub trait MembershipBackend: Send + Sync + 'static {
    /// Registrants may not use this name.
    fn server_name(&self) -> &str;

    /// The cluster a sealed request addressed to `cluster_name` is keyed for.
    async fn cluster(&self, cluster_name: &str) -> Option<Arc<Cluster>>;
}

#[async_trait]
impl MembershipBackend for EndNodeClusterManager {
    fn server_name(&self) -> &str {
        &self.this_node().name
    }

    // an end node only knows its own cluster token; a sender from elsewhere fails to decrypt
    async fn cluster(&self, _cluster_name: &str) -> Option<Arc<Cluster>> {
        Some(Arc::clone(self.cluster()))
    }
}

#[async_trait]
impl MembershipBackend for CenterClusterManager {
    fn server_name(&self) -> &str {
        self.name()
    }

    async fn cluster(&self, cluster_name: &str) -> Option<Arc<Cluster>> {
        CenterClusterManager::cluster(self, cluster_name).await
    }
}

impl EndNode {
    /// Returns the Tonic service answering registration and heartbeats.
    /// [EndNode::serve] already mounts it; use this to host it on your own
    /// [Server](tonic::transport::Server) instead.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use tonic::transport::Server;
    /// use proxyfleet::*;
    ///
    /// let node = EndNode::builder(NodeIdentity::new("edge-1", "10.0.0.1", 50051, "prod"), "secret")
    ///     .build()
    ///     .await?;
    /// Server::builder()
    ///     .add_service(node.membership_grpc_service())
    ///     .add_service(node.operation_grpc_service())
    ///     .serve("0.0.0.0:50051".parse()?)
    ///     .await?;
    /// ```
    pub fn membership_grpc_service(
        &self,
    ) -> MembershipServiceServer<MembershipGrpcServer<EndNodeClusterManager>> {
        MembershipServiceServer::new(MembershipGrpcServer::new(Arc::clone(&self.manager)))
    }

    /// Returns the Tonic service answering operations dispatched by peers.
    pub fn operation_grpc_service(&self) -> OperationServiceServer<OperationGrpcServer> {
        OperationServiceServer::new(OperationGrpcServer::new(
            Arc::clone(&self.manager),
            Arc::clone(&self.engine),
            Arc::clone(&self.certs),
        ))
    }
}

impl CenterNode {
    pub fn membership_grpc_service(
        &self,
    ) -> MembershipServiceServer<MembershipGrpcServer<CenterClusterManager>> {
        MembershipServiceServer::new(MembershipGrpcServer::new(Arc::clone(&self.manager)))
    }
}

/// Serves registration and heartbeats. Payloads are keyed by the cluster token.
pub struct MembershipGrpcServer<B> {
    backend: Arc<B>,
}

impl<B: MembershipBackend> MembershipGrpcServer<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    async fn cluster_for(&self, sealed: &SealedMessage) -> Result<Arc<Cluster>, Status> {
        self.backend
            .cluster(&sealed.cluster_name)
            .await
            .ok_or_else(|| Status::not_found(format!("unknown cluster {}", sealed.cluster_name)))
    }

    async fn handle_register(&self, cluster: &Cluster, request: protos::RegisterRequest) -> protos::RegisterResponse {
        let (claimed, token) = match claimed_identity(&request) {
            Ok(claim) => claim,
            Err((code, msg)) => return protos::RegisterResponse::failure(code, msg),
        };
        match cluster
            .register_node(&claimed, &token, self.backend.server_name())
            .await
        {
            Ok(registration) => protos::RegisterResponse {
                code: registration.code().into(),
                msg: String::new(),
                token: registration.token,
            },
            Err(e) => {
                debug!("rejected registration of {}: {}", claimed, e);
                protos::RegisterResponse::failure(e.code(), e.to_string())
            }
        }
    }

    async fn handle_heartbeat(&self, cluster: &Cluster, request: protos::HeartbeatRequest) -> protos::HeartbeatResponse {
        let (claimed, token) = match claimed_identity(&request) {
            Ok(claim) => claim,
            Err((code, msg)) => return protos::HeartbeatResponse::failure(code, msg),
        };
        match cluster.heartbeat(&claimed, &token).await {
            Ok(peers) => protos::HeartbeatResponse {
                known_peers: peers.iter().map(Into::into).collect(),
                ..Default::default()
            },
            Err(e) => {
                debug!("rejected heartbeat from {}: {}", claimed, e);
                protos::HeartbeatResponse::failure(e.code(), e.to_string())
            }
        }
    }
}

#[async_trait]
impl<B: MembershipBackend> protos::membership_service_server::MembershipService for MembershipGrpcServer<B> {
    async fn register_node(
        &self,
        request: Request<SealedMessage>,
    ) -> Result<Response<SealedMessage>, Status> {
        let sealed = request.into_inner();
        let cluster = self.cluster_for(&sealed).await?;
        let codec = MessageCodec::cluster(cluster.token());
        let request = match codec.open::<protos::RegisterRequest>(&sealed) {
            Ok(request) => request,
            Err(e) => {
                let claimed = NodeIdentity::new(sealed.sender.clone(), "", 0, sealed.cluster_name.clone());
                cluster.quarantine(claimed, OffsetDateTime::now_utc()).await;
                return Err(Status::unauthenticated(format!(
                    "cannot open registration from {}: {}",
                    sealed.sender, e
                )));
            }
        };
        let reply = self.handle_register(&cluster, request).await;
        seal_reply(&codec, &cluster, self.backend.server_name(), &reply)
    }

    async fn heartbeat(
        &self,
        request: Request<SealedMessage>,
    ) -> Result<Response<SealedMessage>, Status> {
        let sealed = request.into_inner();
        let cluster = self.cluster_for(&sealed).await?;
        let codec = MessageCodec::cluster(cluster.token());
        let request = codec.open::<protos::HeartbeatRequest>(&sealed).map_err(|e| {
            Status::unauthenticated(format!("cannot open heartbeat from {}: {}", sealed.sender, e))
        })?;
        let reply = self.handle_heartbeat(&cluster, request).await;
        seal_reply(&codec, &cluster, self.backend.server_name(), &reply)
    }
}

/// Serves operations dispatched by other end nodes.
/// Payloads are keyed by the token this node issued to the sender.
pub struct OperationGrpcServer {
    manager: Arc<EndNodeClusterManager>,
    engine: Arc<dyn ProxyEngine>,
    certs: Arc<dyn CertManager>,
}

impl OperationGrpcServer {
    pub fn new(
        manager: Arc<EndNodeClusterManager>,
        engine: Arc<dyn ProxyEngine>,
        certs: Arc<dyn CertManager>,
    ) -> Self {
        Self {
            manager,
            engine,
            certs,
        }
    }

    /// Opens the request, authenticates the sender, runs `handler` and seals its reply.
    async fn operate<Req, Resp, F, Fut>(
        &self,
        request: Request<SealedMessage>,
        handler: F,
    ) -> Result<Response<SealedMessage>, Status>
    where
        Req: prost::Message + Default + AuthenticatedRequest,
        Resp: prost::Message + StatusResponse,
        F: FnOnce(Req) -> Fut,
        Fut: Future<Output = Result<Resp, EngineError>>,
    {
        let sealed = request.into_inner();
        let cluster = self.manager.cluster();
        let issued = cluster
            .nodes()
            .get(&sealed.sender)
            .await
            .map(|n| n.in_token().to_string())
            .filter(|token| !token.is_empty())
            .ok_or_else(|| Status::unauthenticated(format!("no token issued to {}", sealed.sender)))?;
        let codec = MessageCodec::node(&issued);
        let request: Req = codec.open(&sealed).map_err(|e| {
            Status::unauthenticated(format!("cannot open request from {}: {}", sealed.sender, e))
        })?;

        let reply = match self.authenticate(&sealed.sender, &request).await {
            Err(e) => {
                debug!("refused operation from {}: {}", sealed.sender, e);
                Resp::failure(e.code(), e.to_string())
            }
            Ok(_) => match handler(request).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("operation requested by {} failed: {}", sealed.sender, e);
                    Resp::failure(ResponseCode::OperationFailed, e.to_string())
                }
            },
        };
        seal_reply(&codec, cluster, &self.manager.this_node().name, &reply)
    }

    async fn authenticate<R: AuthenticatedRequest>(&self, sender: &str, request: &R) -> Result<Node, AuthError> {
        let auth = request.auth().ok_or(AuthError::MissingAuthInfo)?;
        let claimed = auth.node.clone().ok_or(AuthError::MissingAuthInfo)?;
        let claimed = NodeIdentity::try_from(claimed).map_err(|_| AuthError::MetaMismatch(sender.to_string()))?;
        if claimed.name != sender {
            return Err(AuthError::MetaMismatch(sender.to_string()));
        }
        self.manager
            .cluster()
            .auth_remote_node(&claimed, &auth.token)
            .await
    }
}

#[async_trait]
impl protos::operation_service_server::OperationService for OperationGrpcServer {
    async fn add_users(
        &self,
        request: Request<SealedMessage>,
    ) -> Result<Response<SealedMessage>, Status> {
        let engine = Arc::clone(&self.engine);
        self.operate(request, |req: protos::AddUsersRequest| async move {
            engine
                .add_users(req.users.into_iter().map(Into::into).collect())
                .await?;
            Ok::<_, EngineError>(protos::CommonResponse::ok())
        })
        .await
    }

    async fn delete_users(
        &self,
        request: Request<SealedMessage>,
    ) -> Result<Response<SealedMessage>, Status> {
        let engine = Arc::clone(&self.engine);
        self.operate(request, |req: protos::DeleteUsersRequest| async move {
            engine.remove_users(&req.inbound_tag, &req.emails).await?;
            Ok::<_, EngineError>(protos::CommonResponse::ok())
        })
        .await
    }

    async fn get_users(
        &self,
        request: Request<SealedMessage>,
    ) -> Result<Response<SealedMessage>, Status> {
        let engine = Arc::clone(&self.engine);
        self.operate(request, |req: protos::GetUsersRequest| async move {
            let users = engine.get_users(&req.inbound_tag).await?;
            Ok::<_, EngineError>(protos::GetUsersResponse {
                users: users.into_iter().map(Into::into).collect(),
                ..Default::default()
            })
        })
        .await
    }

    async fn add_inbound(
        &self,
        request: Request<SealedMessage>,
    ) -> Result<Response<SealedMessage>, Status> {
        let engine = Arc::clone(&self.engine);
        self.operate(request, |req: protos::AddInboundRequest| async move {
            let inbound = req
                .inbound
                .ok_or_else(|| EngineError::Failed("request carries no inbound".to_string()))?;
            engine
                .add_inbound(Inbound::try_from(inbound).map_err(EngineError::Failed)?)
                .await?;
            Ok::<_, EngineError>(protos::CommonResponse::ok())
        })
        .await
    }

    async fn delete_inbound(
        &self,
        request: Request<SealedMessage>,
    ) -> Result<Response<SealedMessage>, Status> {
        let engine = Arc::clone(&self.engine);
        self.operate(request, |req: protos::DeleteInboundRequest| async move {
            engine.delete_inbound(&req.tag).await?;
            Ok::<_, EngineError>(protos::CommonResponse::ok())
        })
        .await
    }

    async fn get_stats(
        &self,
        request: Request<SealedMessage>,
    ) -> Result<Response<SealedMessage>, Status> {
        let engine = Arc::clone(&self.engine);
        self.operate(request, |req: protos::GetStatsRequest| async move {
            let stats = engine.query_stats(&req.pattern, req.reset).await?;
            Ok::<_, EngineError>(protos::GetStatsResponse {
                stats: stats.into_iter().map(Into::into).collect(),
                ..Default::default()
            })
        })
        .await
    }

    async fn obtain_cert(
        &self,
        request: Request<SealedMessage>,
    ) -> Result<Response<SealedMessage>, Status> {
        let certs = Arc::clone(&self.certs);
        self.operate(request, |req: protos::ObtainCertRequest| async move {
            certs.obtain_new_cert(&req.domain).await?;
            Ok::<_, EngineError>(protos::CommonResponse::ok())
        })
        .await
    }

    async fn get_certs(
        &self,
        request: Request<SealedMessage>,
    ) -> Result<Response<SealedMessage>, Status> {
        let certs = Arc::clone(&self.certs);
        self.operate(request, |req: protos::GetCertsRequest| async move {
            let found = if req.domain.is_empty() {
                certs.get_all_cert().await?
            } else {
                certs.get_cert(&req.domain).await?.into_iter().collect()
            };
            Ok::<_, EngineError>(protos::GetCertsResponse {
                certs: found.into_iter().map(Into::into).collect(),
                ..Default::default()
            })
        })
        .await
    }
}

/// Pulls the claimed identity and presented token out of a membership request.
fn claimed_identity<R: AuthenticatedRequest>(request: &R) -> Result<(NodeIdentity, String), (ResponseCode, String)> {
    let missing = || (ResponseCode::AuthFailed, AuthError::MissingAuthInfo.to_string());
    let auth = request.auth().ok_or_else(missing)?;
    let node = auth.node.clone().ok_or_else(missing)?;
    let identity = NodeIdentity::try_from(node).map_err(|e| (e.code(), e.to_string()))?;
    Ok((identity, auth.token.clone()))
}

fn seal_reply<M: prost::Message>(
    codec: &MessageCodec,
    cluster: &Cluster,
    server_name: &str,
    reply: &M,
) -> Result<Response<SealedMessage>, Status> {
    codec
        .seal(cluster.name(), server_name, reply)
        .map(Response::new)
        .map_err(|e| Status::internal(format!("failed to seal reply: {}", e)))
}
