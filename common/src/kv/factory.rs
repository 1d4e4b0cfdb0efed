//! Factory for creating KV instances from configuration.

use std::sync::Arc;

use super::config::KvConfig;
use super::fjall::FjallKv;
use super::memory::MemoryKv;
use super::{Kv, KvResult};

/// Creates a KV instance for the given configuration.
pub fn create_kv(config: &KvConfig) -> KvResult<Arc<dyn Kv>> {
    match config {
        KvConfig::Memory => Ok(Arc::new(MemoryKv::new())),
        KvConfig::Fjall(fjall_config) => {
            let kv = FjallKv::open(&fjall_config.path, &fjall_config.settings)?;
            Ok(Arc::new(kv))
        }
    }
}
