use std::{fmt, str::FromStr};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    engine::{Cert, Inbound, Stat, User},
    error::FanOutError,
    grpc::{protos, RpcMethod, StatusResponse},
};

/// One remote operation: how its JSON payload becomes a typed request, and how
/// the typed reply becomes an [OperationResponse].
pub trait RemoteOperation: 'static {
    const NAME: &'static str;
    const METHOD: RpcMethod;

    type Payload: DeserializeOwned + Clone + Send + 'static;
    type Request: prost::Message;
    type Response: prost::Message + Default + StatusResponse;

    fn build_request(payload: Self::Payload, auth: protos::NodeAuthInfo) -> Self::Request;

    fn into_result(response: Self::Response) -> OperationResponse;
}

/// What a peer sent back for one successful operation.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum OperationResponse {
    Done,
    Users(Vec<User>),
    Stats(Vec<Stat>),
    Certs(Vec<Cert>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddUsersPayload {
    pub users: Vec<User>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteUsersPayload {
    pub inbound_tag: String,
    pub emails: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetUsersPayload {
    pub inbound_tag: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddInboundPayload {
    pub inbound: Inbound,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteInboundPayload {
    pub tag: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetStatsPayload {
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub reset: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObtainCertPayload {
    pub domain: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetCertsPayload {
    /// Empty for all certificates
    #[serde(default)]
    pub domain: String,
}

pub struct AddUsers;
pub struct DeleteUsers;
pub struct GetUsers;
pub struct AddInbound;
pub struct DeleteInbound;
pub struct GetStats;
pub struct ObtainCert;
pub struct GetCerts;

impl RemoteOperation for AddUsers {
    const NAME: &'static str = "add_users";
    const METHOD: RpcMethod = RpcMethod::AddUsers;
    type Payload = AddUsersPayload;
    type Request = protos::AddUsersRequest;
    type Response = protos::CommonResponse;

    fn build_request(payload: Self::Payload, auth: protos::NodeAuthInfo) -> Self::Request {
        protos::AddUsersRequest {
            auth: Some(auth),
            users: payload.users.into_iter().map(Into::into).collect(),
        }
    }

    fn into_result(_response: Self::Response) -> OperationResponse {
        OperationResponse::Done
    }
}

impl RemoteOperation for DeleteUsers {
    const NAME: &'static str = "delete_users";
    const METHOD: RpcMethod = RpcMethod::DeleteUsers;
    type Payload = DeleteUsersPayload;
    type Request = protos::DeleteUsersRequest;
    type Response = protos::CommonResponse;

    fn build_request(payload: Self::Payload, auth: protos::NodeAuthInfo) -> Self::Request {
        protos::DeleteUsersRequest {
            auth: Some(auth),
            inbound_tag: payload.inbound_tag,
            emails: payload.emails,
        }
    }

    fn into_result(_response: Self::Response) -> OperationResponse {
        OperationResponse::Done
    }
}

impl RemoteOperation for GetUsers {
    const NAME: &'static str = "get_users";
    const METHOD: RpcMethod = RpcMethod::GetUsers;
    type Payload = GetUsersPayload;
    type Request = protos::GetUsersRequest;
    type Response = protos::GetUsersResponse;

    fn build_request(payload: Self::Payload, auth: protos::NodeAuthInfo) -> Self::Request {
        protos::GetUsersRequest {
            auth: Some(auth),
            inbound_tag: payload.inbound_tag,
        }
    }

    fn into_result(response: Self::Response) -> OperationResponse {
        OperationResponse::Users(response.users.into_iter().map(Into::into).collect())
    }
}

impl RemoteOperation for AddInbound {
    const NAME: &'static str = "add_inbound";
    const METHOD: RpcMethod = RpcMethod::AddInbound;
    type Payload = AddInboundPayload;
    type Request = protos::AddInboundRequest;
    type Response = protos::CommonResponse;

    fn build_request(payload: Self::Payload, auth: protos::NodeAuthInfo) -> Self::Request {
        protos::AddInboundRequest {
            auth: Some(auth),
            inbound: Some(payload.inbound.into()),
        }
    }

    fn into_result(_response: Self::Response) -> OperationResponse {
        OperationResponse::Done
    }
}

impl RemoteOperation for DeleteInbound {
    const NAME: &'static str = "delete_inbound";
    const METHOD: RpcMethod = RpcMethod::DeleteInbound;
    type Payload = DeleteInboundPayload;
    type Request = protos::DeleteInboundRequest;
    type Response = protos::CommonResponse;

    fn build_request(payload: Self::Payload, auth: protos::NodeAuthInfo) -> Self::Request {
        protos::DeleteInboundRequest {
            auth: Some(auth),
            tag: payload.tag,
        }
    }

    fn into_result(_response: Self::Response) -> OperationResponse {
        OperationResponse::Done
    }
}

impl RemoteOperation for GetStats {
    const NAME: &'static str = "get_stats";
    const METHOD: RpcMethod = RpcMethod::GetStats;
    type Payload = GetStatsPayload;
    type Request = protos::GetStatsRequest;
    type Response = protos::GetStatsResponse;

    fn build_request(payload: Self::Payload, auth: protos::NodeAuthInfo) -> Self::Request {
        protos::GetStatsRequest {
            auth: Some(auth),
            pattern: payload.pattern,
            reset: payload.reset,
        }
    }

    fn into_result(response: Self::Response) -> OperationResponse {
        OperationResponse::Stats(response.stats.into_iter().map(Into::into).collect())
    }
}

impl RemoteOperation for ObtainCert {
    const NAME: &'static str = "obtain_cert";
    const METHOD: RpcMethod = RpcMethod::ObtainCert;
    type Payload = ObtainCertPayload;
    type Request = protos::ObtainCertRequest;
    type Response = protos::CommonResponse;

    fn build_request(payload: Self::Payload, auth: protos::NodeAuthInfo) -> Self::Request {
        protos::ObtainCertRequest {
            auth: Some(auth),
            domain: payload.domain,
        }
    }

    fn into_result(_response: Self::Response) -> OperationResponse {
        OperationResponse::Done
    }
}

impl RemoteOperation for GetCerts {
    const NAME: &'static str = "get_certs";
    const METHOD: RpcMethod = RpcMethod::GetCerts;
    type Payload = GetCertsPayload;
    type Request = protos::GetCertsRequest;
    type Response = protos::GetCertsResponse;

    fn build_request(payload: Self::Payload, auth: protos::NodeAuthInfo) -> Self::Request {
        protos::GetCertsRequest {
            auth: Some(auth),
            domain: payload.domain,
        }
    }

    fn into_result(response: Self::Response) -> OperationResponse {
        OperationResponse::Certs(response.certs.into_iter().map(Into::into).collect())
    }
}

/// Every operation an end node can fan out to its peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    AddUsers,
    DeleteUsers,
    GetUsers,
    AddInbound,
    DeleteInbound,
    GetStats,
    ObtainCert,
    GetCerts,
}

impl Operation {
    pub const ALL: [Operation; 8] = [
        Operation::AddUsers,
        Operation::DeleteUsers,
        Operation::GetUsers,
        Operation::AddInbound,
        Operation::DeleteInbound,
        Operation::GetStats,
        Operation::ObtainCert,
        Operation::GetCerts,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Operation::AddUsers => AddUsers::NAME,
            Operation::DeleteUsers => DeleteUsers::NAME,
            Operation::GetUsers => GetUsers::NAME,
            Operation::AddInbound => AddInbound::NAME,
            Operation::DeleteInbound => DeleteInbound::NAME,
            Operation::GetStats => GetStats::NAME,
            Operation::ObtainCert => ObtainCert::NAME,
            Operation::GetCerts => GetCerts::NAME,
        }
    }
}

impl FromStr for Operation {
    type Err = FanOutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.name() == s)
            .ok_or_else(|| FanOutError::UnknownOperation(s.to_string()))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
