//! Persistence for instances and bindings.
//!
//! Every backend stores one encrypted record per instance or binding and
//! maintains two secondary indices: alias to instance id, and parent alias to
//! the set of child instance ids. Writes go record first, then indices; a
//! failed index update after a successful record write is not rolled back.

pub mod memory;
pub mod record;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{StorageBackend, StorageConfig};
use crate::crypto::{Codec, CryptoError};
use crate::domain::{Binding, Instance};
use crate::service::Catalog;

pub use memory::MemoryStore;
pub use record::RecordCodec;
pub use self::redis::RedisStore;

/// Errors returned by a [`Store`]
#[derive(Debug, Error)]
pub enum StoreError {
    /// Wrong key or corrupt ciphertext
    #[error("failed to decrypt record: {0}")]
    Decryption(#[from] CryptoError),

    /// Decrypted bytes are not a valid record
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Record refers to a service or plan missing from the catalog
    #[error("record integrity error: {0}")]
    Integrity(String),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Persistence contract shared by all backends
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or replace an instance and update its indices
    async fn write_instance(&self, instance: &Instance) -> Result<(), StoreError>;

    async fn get_instance(&self, instance_id: &str) -> Result<Option<Instance>, StoreError>;

    async fn get_instance_by_alias(&self, alias: &str) -> Result<Option<Instance>, StoreError>;

    /// Remove an instance and reverse its index effects.
    /// Returns `false` if there was nothing to delete.
    async fn delete_instance(&self, instance_id: &str) -> Result<bool, StoreError>;

    /// Number of instances whose parent alias is `alias`
    async fn get_instance_child_count_by_alias(&self, alias: &str) -> Result<i64, StoreError>;

    async fn write_binding(&self, binding: &Binding) -> Result<(), StoreError>;

    async fn get_binding(&self, binding_id: &str) -> Result<Option<Binding>, StoreError>;

    async fn delete_binding(&self, binding_id: &str) -> Result<bool, StoreError>;

    /// Verify the backend is reachable
    async fn test_connection(&self) -> Result<(), StoreError>;
}

/// Build the configured store backend
pub async fn open_store(
    config: &StorageConfig,
    codec: Arc<dyn Codec>,
    catalog: Arc<Catalog>,
) -> Result<Arc<dyn Store>, StoreError> {
    let records = RecordCodec::new(codec, catalog);
    match config.backend {
        StorageBackend::Memory => {
            tracing::info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new(records)))
        }
        StorageBackend::Redis => {
            tracing::info!(
                host = %config.redis.host,
                port = config.redis.port,
                db = config.redis.db,
                prefix = %config.redis.prefix,
                "Using redis store"
            );
            Ok(Arc::new(RedisStore::connect(&config.redis, records).await?))
        }
    }
}
