use super::protos;
use crate::{
    engine::{Cert, Inbound, Stat, User},
    error::{RegisterError, ResponseCode},
    node::NodeIdentity,
};

impl From<&NodeIdentity> for protos::NodeIdentity {
    fn from(value: &NodeIdentity) -> Self {
        Self {
            host: value.host.clone(),
            port: value.port as u32,
            cluster_name: value.cluster_name.clone(),
            name: value.name.clone(),
        }
    }
}

impl TryFrom<protos::NodeIdentity> for NodeIdentity {
    type Error = RegisterError;

    fn try_from(value: protos::NodeIdentity) -> Result<Self, Self::Error> {
        match u16::try_from(value.port) {
            Ok(port) if port != 0 && !value.host.is_empty() => Ok(NodeIdentity {
                host: value.host,
                port,
                cluster_name: value.cluster_name,
                name: value.name,
            }),
            _ => Err(RegisterError::InvalidAddress {
                host: value.host,
                port: value.port,
            }),
        }
    }
}

impl From<User> for protos::User {
    fn from(value: User) -> Self {
        Self {
            email: value.email,
            protocol: value.protocol,
            inbound_tag: value.inbound_tag,
            account_json: value.account.to_string(),
        }
    }
}

impl From<protos::User> for User {
    fn from(value: protos::User) -> Self {
        Self {
            email: value.email,
            protocol: value.protocol,
            inbound_tag: value.inbound_tag,
            account: parse_json(&value.account_json),
        }
    }
}

impl From<Inbound> for protos::Inbound {
    fn from(value: Inbound) -> Self {
        Self {
            tag: value.tag,
            protocol: value.protocol,
            port: value.port as u32,
            settings_json: value.settings.to_string(),
        }
    }
}

impl TryFrom<protos::Inbound> for Inbound {
    type Error = String;

    fn try_from(value: protos::Inbound) -> Result<Self, Self::Error> {
        let port = u16::try_from(value.port)
            .map_err(|_| format!("inbound {} has invalid port {}", value.tag, value.port))?;
        Ok(Self {
            tag: value.tag,
            protocol: value.protocol,
            port,
            settings: parse_json(&value.settings_json),
        })
    }
}

impl From<Stat> for protos::Stat {
    fn from(value: Stat) -> Self {
        Self {
            name: value.name,
            value: value.value,
        }
    }
}

impl From<protos::Stat> for Stat {
    fn from(value: protos::Stat) -> Self {
        Self {
            name: value.name,
            value: value.value,
        }
    }
}

impl From<Cert> for protos::Cert {
    fn from(value: Cert) -> Self {
        Self {
            domain: value.domain,
            not_before: value.not_before,
            not_after: value.not_after,
        }
    }
}

impl From<protos::Cert> for Cert {
    fn from(value: protos::Cert) -> Self {
        Self {
            domain: value.domain,
            not_before: value.not_before,
            not_after: value.not_after,
        }
    }
}

// engine-specific blobs travel as JSON text; keep anything unparsable as a raw string
fn parse_json(raw: &str) -> serde_json::Value {
    if raw.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

/// Requests that carry the caller's [NodeAuthInfo](protos::NodeAuthInfo) envelope.
pub trait AuthenticatedRequest {
    fn auth(&self) -> Option<&protos::NodeAuthInfo>;
}

/// Responses that carry an application-level status code and message.
pub trait StatusResponse: Sized {
    fn code(&self) -> i32;

    fn msg(&self) -> &str;

    fn failure(code: ResponseCode, msg: String) -> Self;
}

macro_rules! authenticated_requests {
    ($($request:ty),* $(,)?) => {
        $(impl AuthenticatedRequest for $request {
            fn auth(&self) -> Option<&protos::NodeAuthInfo> {
                self.auth.as_ref()
            }
        })*
    };
}

macro_rules! status_responses {
    ($($response:ty),* $(,)?) => {
        $(impl StatusResponse for $response {
            fn code(&self) -> i32 {
                self.code
            }

            fn msg(&self) -> &str {
                &self.msg
            }

            fn failure(code: ResponseCode, msg: String) -> Self {
                Self {
                    code: code.into(),
                    msg,
                    ..Default::default()
                }
            }
        })*
    };
}

authenticated_requests!(
    protos::RegisterRequest,
    protos::HeartbeatRequest,
    protos::AddUsersRequest,
    protos::DeleteUsersRequest,
    protos::GetUsersRequest,
    protos::AddInboundRequest,
    protos::DeleteInboundRequest,
    protos::GetStatsRequest,
    protos::ObtainCertRequest,
    protos::GetCertsRequest,
);

status_responses!(
    protos::RegisterResponse,
    protos::HeartbeatResponse,
    protos::CommonResponse,
    protos::GetUsersResponse,
    protos::GetStatsResponse,
    protos::GetCertsResponse,
);

impl protos::NodeAuthInfo {
    pub(crate) fn new(token: &str, node: &NodeIdentity) -> Self {
        Self {
            token: token.to_string(),
            node: Some(node.into()),
        }
    }
}

impl protos::CommonResponse {
    pub(crate) fn ok() -> Self {
        Self {
            code: ResponseCode::Ok.into(),
            msg: String::new(),
        }
    }
}
