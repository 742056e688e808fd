use std::collections::HashMap;

use serde::de::DeserializeOwned;

use crate::error::{MonitorError, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    Network,
    Account,
    Environment,
    Device,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 4] = [
        ConfigKey::Network,
        ConfigKey::Account,
        ConfigKey::Environment,
        ConfigKey::Device,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Account => "account",
            Self::Environment => "environment",
            Self::Device => "device",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            Self::Network => "wifi.json",
            Self::Account => "user.json",
            Self::Environment => "environment.json",
            Self::Device => "device.json",
        }
    }
}

/// Persistence contract for configuration documents.
///
/// Documents are opaque JSON strings. `Ok(None)` is the normal answer on
/// first boot.
pub trait ConfigStore {
    fn read(&self, key: ConfigKey) -> Result<Option<String>, StoreError>;
    fn write(&mut self, key: ConfigKey, document: &str) -> Result<(), StoreError>;
    fn delete(&mut self, key: ConfigKey) -> Result<(), StoreError>;
}

pub fn load_document<T: DeserializeOwned>(
    store: &dyn ConfigStore,
    key: ConfigKey,
) -> Result<T, MonitorError> {
    let raw = store.read(key)?;
    let raw = match raw {
        Some(raw) if !raw.trim().is_empty() => raw,
        _ => return Err(MonitorError::ConfigMissing { key }),
    };

    serde_json::from_str(&raw).map_err(|err| MonitorError::ConfigInvalid {
        key,
        reason: err.to_string(),
    })
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    documents: HashMap<ConfigKey, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: ConfigKey, document: &str) -> Self {
        self.documents.insert(key, document.to_string());
        self
    }
}

impl ConfigStore for MemoryStore {
    fn read(&self, key: ConfigKey) -> Result<Option<String>, StoreError> {
        Ok(self.documents.get(&key).cloned())
    }

    fn write(&mut self, key: ConfigKey, document: &str) -> Result<(), StoreError> {
        self.documents.insert(key, document.to_string());
        Ok(())
    }

    fn delete(&mut self, key: ConfigKey) -> Result<(), StoreError> {
        self.documents.remove(&key);
        Ok(())
    }
}
