use std::{future::Future, sync::Arc};

use log::error;
use tokio::{
    net::TcpListener,
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use crate::{cluster::CenterClusterManager, membership::shutdown_signal, CenterNodeBuilder};

/// A running center node: answers registration and heartbeats for every
/// cluster it serves and evicts their silent members. It never calls out.
pub struct CenterNode {
    pub(crate) manager: Arc<CenterClusterManager>,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CenterNode {
    pub fn builder(name: impl Into<String>) -> CenterNodeBuilder {
        CenterNodeBuilder::new(name)
    }

    pub fn cluster_manager(&self) -> &Arc<CenterClusterManager> {
        &self.manager
    }

    /// Serves the membership service on `listener` until [CenterNode::shutdown] is called.
    pub fn serve(
        &self,
        listener: TcpListener,
    ) -> impl Future<Output = Result<(), tonic::transport::Error>> + Send + 'static {
        Server::builder()
            .add_service(self.membership_grpc_service())
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                shutdown_signal(self.shutdown.subscribe()),
            )
    }

    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.background_tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                error!("background task of center {} did not complete: {}", self.manager.name(), e);
            }
        }
    }
}
