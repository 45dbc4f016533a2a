use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Application-level status carried in the `code` field of every response.
///
/// A non-zero code is a failure reported by the remote node, distinct from a
/// transport error. [ResponseCode::AlreadyRegistered] is the one non-zero code
/// that registrants treat as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum ResponseCode {
    Ok = 0,
    InvalidAddress = 100,
    WrongCluster = 101,
    AlreadyRegistered = 102,
    SameNameAsServer = 103,
    NodeDropped = 104,
    NameCollision = 105,
    AuthFailed = 400,
    OperationFailed = 500,
}

impl ResponseCode {
    /// Human-readable name for an arbitrary wire code, used in logs.
    pub fn describe(code: i32) -> String {
        match ResponseCode::try_from(code) {
            Ok(known) => format!("{:?}({})", known, code),
            Err(_) => format!("Unknown({})", code),
        }
    }
}

/// Failures of the authentication step applied to every RPC but registration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("node {0} not exist")]
    NodeNotExist(String),
    #[error("node {0} has the same name but different meta info")]
    MetaMismatch(String),
    #[error("wrong token for node {0}")]
    WrongToken(String),
    #[error("invalid token for node {0}, token timeout")]
    TokenTimeout(String),
    #[error("request carries no node auth info")]
    MissingAuthInfo,
}

impl AuthError {
    pub fn code(&self) -> ResponseCode {
        ResponseCode::AuthFailed
    }
}

/// Rejections of a registration attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegisterError {
    #[error("invalid node address {host}:{port}")]
    InvalidAddress { host: String, port: u32 },
    #[error("wrong name or token for cluster {0}")]
    WrongCluster(String),
    #[error("node name {0} is the same as the server's own name")]
    SameNameAsServer(String),
    #[error("node {0} already exists with a different identity")]
    NameCollision(String),
}

impl RegisterError {
    pub fn code(&self) -> ResponseCode {
        match self {
            RegisterError::InvalidAddress { .. } => ResponseCode::InvalidAddress,
            RegisterError::WrongCluster(_) => ResponseCode::WrongCluster,
            RegisterError::SameNameAsServer(_) => ResponseCode::SameNameAsServer,
            RegisterError::NameCollision(_) => ResponseCode::NameCollision,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeartbeatError {
    #[error("node {0} has been dropped")]
    NodeDropped(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl HeartbeatError {
    pub fn code(&self) -> ResponseCode {
        match self {
            HeartbeatError::NodeDropped(_) => ResponseCode::NodeDropped,
            HeartbeatError::Auth(e) => e.code(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("cipher setup failed: {0}")]
    Cipher(String),
    #[error("sealed payload is too short")]
    Truncated,
    #[error("sealed payload failed integrity check")]
    Integrity,
    #[error("invalid block padding")]
    Padding,
    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read or write config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("missing config key {0}")]
    MissingKey(String),
    #[error("config key {key} has an unexpected type: {reason}")]
    InvalidType { key: String, reason: String },
    #[error("invalid static node {name}: {reason}")]
    InvalidStaticNode { name: String, reason: String },
    #[error("invalid node identity: {0}")]
    InvalidIdentity(String),
    #[error("invalid membership intervals: {0}")]
    InvalidIntervals(String),
}

/// Failure of one outbound call to one peer.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(#[from] tonic::Status),
    #[error("no reply within {0:?}")]
    Timeout(std::time::Duration),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("{msg}")]
    Rejected { code: i32, msg: String },
}

impl RpcError {
    /// The application-level code of a rejection, if the peer answered at all.
    pub fn code(&self) -> Option<i32> {
        match self {
            RpcError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Request-level fan-out failures. Per-node failures never surface here.
#[derive(Debug, Error)]
pub enum FanOutError {
    #[error("failed to decode {operation} payload: {source}")]
    Payload {
        operation: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown operation {0}")]
    UnknownOperation(String),
}

/// Errors reported by the proxy-engine and certificate collaborators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("{0} is not configured on this node")]
    NotConfigured(&'static str),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{0}")]
    Failed(String),
}
