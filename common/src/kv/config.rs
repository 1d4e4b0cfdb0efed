//! Backend selection for the KV substrate.

use serde::{Deserialize, Serialize};

use super::settings::KvSettings;

/// Which backend to open, plus its tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum KvConfig {
    /// Volatile in-memory store. Useful for tests and development.
    Memory,
    /// Persistent LSM store backed by fjall.
    Fjall(FjallKvConfig),
}

impl Default for KvConfig {
    fn default() -> Self {
        KvConfig::Fjall(FjallKvConfig::default())
    }
}

/// Configuration for the fjall backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FjallKvConfig {
    /// Directory holding the keyspace.
    pub path: String,

    /// Substrate tuning applied to the keyspace and its families.
    #[serde(default)]
    pub settings: KvSettings,
}

impl Default for FjallKvConfig {
    fn default() -> Self {
        Self {
            path: "data".to_string(),
            settings: KvSettings::default(),
        }
    }
}
