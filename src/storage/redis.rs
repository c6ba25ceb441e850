//! Redis-backed store.
//!
//! Key layout, every key under the configured prefix:
//!
//! - `{prefix}:instances:{id}` encrypted instance record
//! - `{prefix}:instances` set of instance record keys
//! - `{prefix}:bindings:{id}` encrypted binding record
//! - `{prefix}:bindings` set of binding record keys
//! - `{prefix}:aliases:{alias}` instance id holding the alias
//! - `{prefix}:children:{alias}` set of child instance ids
//!
//! Child sets get their own root so no alias can spell another alias's
//! child set key.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use url::Url;

use super::{RecordCodec, Store, StoreError};
use crate::config::RedisConfig;
use crate::domain::{Binding, Instance};

/// Builds namespaced keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn instances(&self) -> String {
        format!("{}:instances", self.prefix)
    }

    pub fn instance(&self, instance_id: &str) -> String {
        format!("{}:instances:{}", self.prefix, instance_id)
    }

    pub fn bindings(&self) -> String {
        format!("{}:bindings", self.prefix)
    }

    pub fn binding(&self, binding_id: &str) -> String {
        format!("{}:bindings:{}", self.prefix, binding_id)
    }

    pub fn alias(&self, alias: &str) -> String {
        format!("{}:aliases:{}", self.prefix, alias)
    }

    pub fn children(&self, parent_alias: &str) -> String {
        format!("{}:children:{}", self.prefix, parent_alias)
    }
}

/// Build a connection URL from discrete settings
pub fn connection_url(config: &RedisConfig) -> Result<Url, StoreError> {
    let scheme = if config.enable_tls { "rediss" } else { "redis" };
    let mut url = Url::parse(&format!(
        "{}://{}:{}/{}",
        scheme, config.host, config.port, config.db
    ))
    .map_err(|e| StoreError::Backend(format!("invalid redis address: {}", e)))?;

    if !config.password.is_empty() {
        url.set_password(Some(&config.password))
            .map_err(|_| StoreError::Backend("cannot set redis password".to_string()))?;
    }
    Ok(url)
}

/// Store persisting encrypted records in redis
pub struct RedisStore {
    records: RecordCodec,
    keys: KeySpace,
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(config: &RedisConfig, records: RecordCodec) -> Result<Self, StoreError> {
        let url = connection_url(config)?;
        Self::connect_url(url.as_str(), &config.prefix, records).await
    }

    pub async fn connect_url(
        url: &str,
        prefix: &str,
        records: RecordCodec,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            records,
            keys: KeySpace::new(prefix),
            conn,
        })
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// The encrypted bytes stored for an instance
    pub async fn raw_instance(&self, instance_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(self.keys.instance(instance_id)).await?)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn write_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        let raw = self.records.encode_instance(instance)?;
        let key = self.keys.instance(&instance.instance_id);
        let mut conn = self.conn.clone();

        let _: () = conn.set(&key, raw).await?;

        let mut pipe = redis::pipe();
        pipe.sadd(self.keys.instances(), &key).ignore();
        if let Some(alias) = &instance.alias {
            pipe.set(self.keys.alias(alias), &instance.instance_id)
                .ignore();
        }
        if let Some(parent) = &instance.parent_alias {
            pipe.sadd(self.keys.children(parent), &instance.instance_id)
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<Instance>, StoreError> {
        match self.raw_instance(instance_id).await? {
            Some(raw) => self.records.decode_instance(&raw).map(Some),
            None => Ok(None),
        }
    }

    async fn get_instance_by_alias(&self, alias: &str) -> Result<Option<Instance>, StoreError> {
        let mut conn = self.conn.clone();
        let instance_id: Option<String> = conn.get(self.keys.alias(alias)).await?;
        match instance_id {
            Some(id) => self.get_instance(&id).await,
            None => Ok(None),
        }
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<bool, StoreError> {
        let raw = match self.raw_instance(instance_id).await? {
            Some(raw) => raw,
            None => return Ok(false),
        };
        let header = self.records.decode_instance_header(&raw)?;
        let key = self.keys.instance(instance_id);
        let mut conn = self.conn.clone();

        let _: () = conn.del(&key).await?;

        let mut pipe = redis::pipe();
        pipe.srem(self.keys.instances(), &key).ignore();
        if let Some(alias) = &header.alias {
            let holder: Option<String> = conn.get(self.keys.alias(alias)).await?;
            if holder.as_deref() == Some(instance_id) {
                pipe.del(self.keys.alias(alias)).ignore();
            }
        }
        if let Some(parent) = &header.parent_alias {
            pipe.srem(self.keys.children(parent), instance_id).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(true)
    }

    async fn get_instance_child_count_by_alias(&self, alias: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(self.keys.children(alias)).await?)
    }

    async fn write_binding(&self, binding: &Binding) -> Result<(), StoreError> {
        let raw = self.records.encode_binding(binding)?;
        let key = self.keys.binding(&binding.binding_id);
        let mut conn = self.conn.clone();

        let _: () = conn.set(&key, raw).await?;
        let _: () = conn.sadd(self.keys.bindings(), &key).await?;
        Ok(())
    }

    async fn get_binding(&self, binding_id: &str) -> Result<Option<Binding>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> = conn.get(self.keys.binding(binding_id)).await?;
        let raw = match raw {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let header = self.records.decode_binding_header(&raw)?;
        let instance = self.get_instance(&header.instance_id).await?;
        self.records.decode_binding(&raw, instance.as_ref()).map(Some)
    }

    async fn delete_binding(&self, binding_id: &str) -> Result<bool, StoreError> {
        let key = self.keys.binding(binding_id);
        let mut conn = self.conn.clone();

        let removed: i64 = conn.del(&key).await?;
        if removed == 0 {
            return Ok(false);
        }
        let _: () = conn.srem(self.keys.bindings(), &key).await?;
        Ok(true)
    }

    async fn test_connection(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        tracing::debug!(reply = %pong, "Redis connection ok");
        Ok(())
    }
}
