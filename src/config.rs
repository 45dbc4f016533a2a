//! Local persisted configuration.
//!
//! The membership core reads its identity, cluster credentials and static peers
//! from a key/value [ConfigStore] at startup. At runtime the in-memory node
//! tables are authoritative; the store is only written back when an operator
//! edits the static node list.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::ConfigError;

pub const STATIC_NODES_KEY: &str = "static_nodes";

/// A statically configured peer, as written in the `static_nodes` list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticNode {
    pub name: String,
    pub host: String,
    pub port: u16,
}

/// A cluster the center node serves, as written in the `clusters` list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterCredentials {
    pub name: String,
    pub token: String,
}

/// Key/value access to the local configuration. Keys are dotted paths (`node.name`).
pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> Option<toml::Value>;

    fn set(&self, key: &str, value: toml::Value) -> Result<(), ConfigError>;

    /// Persists pending changes. Stores without a backing file do nothing.
    fn flush(&self) -> Result<(), ConfigError>;

    fn get_string(&self, key: &str) -> Result<String, ConfigError> {
        match self.require(key)? {
            toml::Value::String(s) => Ok(s),
            other => Err(type_mismatch(key, "string", &other)),
        }
    }

    fn get_int(&self, key: &str) -> Result<i64, ConfigError> {
        match self.require(key)? {
            toml::Value::Integer(i) => Ok(i),
            other => Err(type_mismatch(key, "integer", &other)),
        }
    }

    fn get_string_slice(&self, key: &str) -> Result<Vec<String>, ConfigError> {
        match self.require(key)? {
            toml::Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    toml::Value::String(s) => Ok(s),
                    other => Err(type_mismatch(key, "array of strings", &other)),
                })
                .collect(),
            other => Err(type_mismatch(key, "array of strings", &other)),
        }
    }

    fn require(&self, key: &str) -> Result<toml::Value, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
    }
}

/// Typed helpers available on every [ConfigStore], including trait objects.
pub trait ConfigStoreExt {
    fn unmarshal_key<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError>;

    fn set_serialized<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ConfigError>;
}

impl<S: ConfigStore + ?Sized> ConfigStoreExt for S {
    fn unmarshal_key<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        let value = self.require(key)?;
        value.try_into().map_err(|e: toml::de::Error| ConfigError::InvalidType {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn set_serialized<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ConfigError> {
        self.set(key, toml::Value::try_from(value)?)
    }
}

fn type_mismatch(key: &str, expected: &str, found: &toml::Value) -> ConfigError {
    ConfigError::InvalidType {
        key: key.to_string(),
        reason: format!("expected {}, found {}", expected, found.type_str()),
    }
}

/// A [ConfigStore] backed by a TOML document, optionally tied to a file.
pub struct TomlConfigStore {
    path: Option<PathBuf>,
    values: RwLock<toml::Table>,
}

impl TomlConfigStore {
    /// Loads the store from `path`; [ConfigStore::flush] writes back to it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let raw = fs::read_to_string(&path)?;
        Ok(Self {
            values: RwLock::new(raw.parse::<toml::Table>()?),
            path: Some(path),
        })
    }

    /// An in-memory store parsed from a TOML string.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            values: RwLock::new(raw.parse::<toml::Table>()?),
            path: None,
        })
    }
}

impl ConfigStore for TomlConfigStore {
    fn get(&self, key: &str) -> Option<toml::Value> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        let mut segments = key.split('.');
        let mut current = values.get(segments.next()?)?;
        for segment in segments {
            current = current.as_table()?.get(segment)?;
        }
        Some(current.clone())
    }

    fn set(&self, key: &str, value: toml::Value) -> Result<(), ConfigError> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        let segments: Vec<&str> = key.split('.').collect();
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))?;

        let mut table: &mut toml::Table = &mut values;
        for segment in parents {
            let entry = table
                .entry(segment.to_string())
                .or_insert_with(|| toml::Value::Table(toml::Table::new()));
            table = match entry {
                toml::Value::Table(t) => t,
                other => return Err(type_mismatch(key, "table", other)),
            };
        }
        table.insert(last.to_string(), value);
        Ok(())
    }

    fn flush(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let rendered = {
            let values = self.values.read().unwrap_or_else(|e| e.into_inner());
            toml::to_string_pretty(&*values)?
        };
        fs::write(path, rendered)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{ConfigStore, ConfigStoreExt, StaticNode, TomlConfigStore, STATIC_NODES_KEY};
    use crate::error::ConfigError;

    const SAMPLE: &str = r#"
        [node]
        name = "edge-1"
        host = "10.0.0.1"
        port = 50051

        [cluster]
        name = "prod"
        token = "cluster-secret"
        aliases = ["eu", "west"]

        [[static_nodes]]
        name = "edge-2"
        host = "10.0.0.2"
        port = 50051
    "#;

    #[test]
    fn typed_getters() {
        let store = TomlConfigStore::parse(SAMPLE).unwrap();
        assert_eq!(store.get_string("node.name").unwrap(), "edge-1");
        assert_eq!(store.get_int("node.port").unwrap(), 50051);
        assert_eq!(
            store.get_string_slice("cluster.aliases").unwrap(),
            vec!["eu".to_string(), "west".to_string()]
        );
        assert!(matches!(
            store.get_string("node.missing"),
            Err(ConfigError::MissingKey(_))
        ));
        assert!(matches!(
            store.get_int("node.name"),
            Err(ConfigError::InvalidType { .. })
        ));
    }

    #[test]
    fn unmarshal_static_nodes() {
        let store = TomlConfigStore::parse(SAMPLE).unwrap();
        let nodes: Vec<StaticNode> = store.unmarshal_key(STATIC_NODES_KEY).unwrap();
        assert_eq!(
            nodes,
            vec![StaticNode {
                name: "edge-2".to_string(),
                host: "10.0.0.2".to_string(),
                port: 50051,
            }]
        );
    }

    #[test]
    fn set_creates_intermediate_tables() {
        let store = TomlConfigStore::parse("").unwrap();
        store
            .set("membership.heartbeat_interval_secs", toml::Value::Integer(5))
            .unwrap();
        assert_eq!(store.get_int("membership.heartbeat_interval_secs").unwrap(), 5);
        assert!(store
            .set("membership.heartbeat_interval_secs.nested", toml::Value::Integer(1))
            .is_err());
    }

    #[test]
    fn flush_writes_back_to_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let store = TomlConfigStore::open(file.path()).unwrap();
        let nodes = vec![StaticNode {
            name: "edge-3".to_string(),
            host: "10.0.0.3".to_string(),
            port: 50051,
        }];
        store.set_serialized(STATIC_NODES_KEY, &nodes).unwrap();
        store.flush().unwrap();

        let reopened = TomlConfigStore::open(file.path()).unwrap();
        let loaded: Vec<StaticNode> = reopened.unmarshal_key(STATIC_NODES_KEY).unwrap();
        assert_eq!(loaded, nodes);
        assert_eq!(reopened.get_string("cluster.token").unwrap(), "cluster-secret");
    }
}
