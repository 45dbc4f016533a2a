//! Interfaces to the proxy engine and the certificate manager.
//!
//! The membership core only calls these to carry out an operation that another
//! node dispatched to us; their internals are someone else's business.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tonic::async_trait;

use crate::error::EngineError;

/// How long certificates issued by [MemoryEngine] stay valid.
const CERT_LIFETIME_SECS: i64 = 90 * 24 * 3600;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub email: String,
    pub protocol: String,
    pub inbound_tag: String,
    /// Protocol-specific account settings, opaque to this crate.
    #[serde(default)]
    pub account: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    pub tag: String,
    pub protocol: String,
    pub port: u16,
    #[serde(default)]
    pub settings: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub name: String,
    pub value: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cert {
    pub domain: String,
    /// Unix timestamps, in seconds
    pub not_before: i64,
    pub not_after: i64,
}

#[async_trait]
pub trait ProxyEngine: Send + Sync {
    async fn add_users(&self, users: Vec<User>) -> Result<(), EngineError>;

    async fn remove_users(&self, inbound_tag: &str, emails: &[String]) -> Result<(), EngineError>;

    async fn get_users(&self, inbound_tag: &str) -> Result<Vec<User>, EngineError>;

    async fn add_inbound(&self, inbound: Inbound) -> Result<(), EngineError>;

    async fn delete_inbound(&self, tag: &str) -> Result<(), EngineError>;

    /// Returns the counters whose name contains `pattern`, zeroing them if `reset` is set.
    async fn query_stats(&self, pattern: &str, reset: bool) -> Result<Vec<Stat>, EngineError>;
}

#[async_trait]
pub trait CertManager: Send + Sync {
    async fn obtain_new_cert(&self, domain: &str) -> Result<Cert, EngineError>;

    async fn get_cert(&self, domain: &str) -> Result<Option<Cert>, EngineError>;

    async fn get_all_cert(&self) -> Result<Vec<Cert>, EngineError>;
}

/// Stand-in used when a node was built without an engine or certificate manager.
pub struct Unconfigured;

#[async_trait]
impl ProxyEngine for Unconfigured {
    async fn add_users(&self, _users: Vec<User>) -> Result<(), EngineError> {
        Err(EngineError::NotConfigured("proxy engine"))
    }

    async fn remove_users(&self, _inbound_tag: &str, _emails: &[String]) -> Result<(), EngineError> {
        Err(EngineError::NotConfigured("proxy engine"))
    }

    async fn get_users(&self, _inbound_tag: &str) -> Result<Vec<User>, EngineError> {
        Err(EngineError::NotConfigured("proxy engine"))
    }

    async fn add_inbound(&self, _inbound: Inbound) -> Result<(), EngineError> {
        Err(EngineError::NotConfigured("proxy engine"))
    }

    async fn delete_inbound(&self, _tag: &str) -> Result<(), EngineError> {
        Err(EngineError::NotConfigured("proxy engine"))
    }

    async fn query_stats(&self, _pattern: &str, _reset: bool) -> Result<Vec<Stat>, EngineError> {
        Err(EngineError::NotConfigured("proxy engine"))
    }
}

#[async_trait]
impl CertManager for Unconfigured {
    async fn obtain_new_cert(&self, _domain: &str) -> Result<Cert, EngineError> {
        Err(EngineError::NotConfigured("certificate manager"))
    }

    async fn get_cert(&self, _domain: &str) -> Result<Option<Cert>, EngineError> {
        Err(EngineError::NotConfigured("certificate manager"))
    }

    async fn get_all_cert(&self) -> Result<Vec<Cert>, EngineError> {
        Err(EngineError::NotConfigured("certificate manager"))
    }
}

/// An in-process engine and certificate manager. Backs local demo clusters and tests.
#[derive(Default)]
pub struct MemoryEngine {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    inbounds: HashMap<String, Inbound>,
    // inbound tag -> email -> user
    users: HashMap<String, BTreeMap<String, User>>,
    stats: BTreeMap<String, i64>,
    certs: BTreeMap<String, Cert>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `delta` to the named traffic counter.
    pub async fn record_traffic(&self, name: &str, delta: i64) {
        *self.state.lock().await.stats.entry(name.to_string()).or_insert(0) += delta;
    }

    pub async fn user_count(&self) -> usize {
        self.state.lock().await.users.values().map(BTreeMap::len).sum()
    }
}

#[async_trait]
impl ProxyEngine for MemoryEngine {
    async fn add_users(&self, users: Vec<User>) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        for user in &users {
            if !state.inbounds.contains_key(&user.inbound_tag) {
                return Err(EngineError::NotFound(format!("inbound {}", user.inbound_tag)));
            }
            let existing = state.users.get(&user.inbound_tag);
            if existing.map_or(false, |u| u.contains_key(&user.email)) {
                return Err(EngineError::AlreadyExists(format!("user {}", user.email)));
            }
        }
        for user in users {
            state
                .users
                .entry(user.inbound_tag.clone())
                .or_default()
                .insert(user.email.clone(), user);
        }
        Ok(())
    }

    async fn remove_users(&self, inbound_tag: &str, emails: &[String]) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        let users = state
            .users
            .get_mut(inbound_tag)
            .ok_or_else(|| EngineError::NotFound(format!("inbound {}", inbound_tag)))?;
        for email in emails {
            users.remove(email);
        }
        Ok(())
    }

    async fn get_users(&self, inbound_tag: &str) -> Result<Vec<User>, EngineError> {
        let state = self.state.lock().await;
        if !state.inbounds.contains_key(inbound_tag) {
            return Err(EngineError::NotFound(format!("inbound {}", inbound_tag)));
        }
        Ok(state
            .users
            .get(inbound_tag)
            .map(|users| users.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_inbound(&self, inbound: Inbound) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if state.inbounds.contains_key(&inbound.tag) {
            return Err(EngineError::AlreadyExists(format!("inbound {}", inbound.tag)));
        }
        if state.inbounds.values().any(|i| i.port == inbound.port) {
            return Err(EngineError::Failed(format!("port {} is already in use", inbound.port)));
        }
        state.inbounds.insert(inbound.tag.clone(), inbound);
        Ok(())
    }

    async fn delete_inbound(&self, tag: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        state
            .inbounds
            .remove(tag)
            .ok_or_else(|| EngineError::NotFound(format!("inbound {}", tag)))?;
        state.users.remove(tag);
        Ok(())
    }

    async fn query_stats(&self, pattern: &str, reset: bool) -> Result<Vec<Stat>, EngineError> {
        let mut state = self.state.lock().await;
        let mut stats = Vec::new();
        for (name, value) in state.stats.iter_mut().filter(|(name, _)| name.contains(pattern)) {
            stats.push(Stat {
                name: name.clone(),
                value: *value,
            });
            if reset {
                *value = 0;
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl CertManager for MemoryEngine {
    async fn obtain_new_cert(&self, domain: &str) -> Result<Cert, EngineError> {
        if domain.is_empty() {
            return Err(EngineError::Failed("empty domain".to_string()));
        }
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let cert = Cert {
            domain: domain.to_string(),
            not_before: now,
            not_after: now + CERT_LIFETIME_SECS,
        };
        self.state
            .lock()
            .await
            .certs
            .insert(domain.to_string(), cert.clone());
        Ok(cert)
    }

    async fn get_cert(&self, domain: &str) -> Result<Option<Cert>, EngineError> {
        Ok(self.state.lock().await.certs.get(domain).cloned())
    }

    async fn get_all_cert(&self) -> Result<Vec<Cert>, EngineError> {
        Ok(self.state.lock().await.certs.values().cloned().collect())
    }
}
