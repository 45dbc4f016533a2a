pub mod protos {
    tonic::include_proto!("proxyfleet");
}

pub(crate) mod channel_factory;
pub(crate) mod client;
pub(crate) mod dtos_conversions;
pub(crate) mod server;
pub(crate) mod transport;

pub use channel_factory::*;
pub use dtos_conversions::{AuthenticatedRequest, StatusResponse};
pub use protos::membership_service_server::MembershipServiceServer;
pub use protos::operation_service_server::OperationServiceServer;
pub use server::*;
pub use transport::*;
