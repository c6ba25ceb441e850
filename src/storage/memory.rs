//! In-memory store, used for development and tests.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::{RecordCodec, Store, StoreError};
use crate::domain::{Binding, Instance};

/// Store keeping encrypted records in process memory
pub struct MemoryStore {
    records: RecordCodec,
    instances: RwLock<HashMap<String, Vec<u8>>>,
    aliases: RwLock<HashMap<String, String>>,
    bindings: RwLock<HashMap<String, Vec<u8>>>,
    /// Parent alias to child instance ids
    children: Mutex<HashMap<String, HashSet<String>>>,
}

impl MemoryStore {
    pub fn new(records: RecordCodec) -> Self {
        Self {
            records,
            instances: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
            bindings: RwLock::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// The encrypted bytes stored for an instance
    pub fn raw_instance(&self, instance_id: &str) -> Option<Vec<u8>> {
        self.instances.read().get(instance_id).cloned()
    }

    /// The encrypted bytes stored for a binding
    pub fn raw_binding(&self, binding_id: &str) -> Option<Vec<u8>> {
        self.bindings.read().get(binding_id).cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn write_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        let raw = self.records.encode_instance(instance)?;
        self.instances
            .write()
            .insert(instance.instance_id.clone(), raw);

        if let Some(alias) = &instance.alias {
            self.aliases
                .write()
                .insert(alias.clone(), instance.instance_id.clone());
        }
        if let Some(parent) = &instance.parent_alias {
            self.children
                .lock()
                .entry(parent.clone())
                .or_default()
                .insert(instance.instance_id.clone());
        }
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<Instance>, StoreError> {
        let raw = match self.instances.read().get(instance_id) {
            Some(raw) => raw.clone(),
            None => return Ok(None),
        };
        self.records.decode_instance(&raw).map(Some)
    }

    async fn get_instance_by_alias(&self, alias: &str) -> Result<Option<Instance>, StoreError> {
        let instance_id = match self.aliases.read().get(alias) {
            Some(id) => id.clone(),
            None => return Ok(None),
        };
        self.get_instance(&instance_id).await
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<bool, StoreError> {
        let raw = match self.instances.read().get(instance_id) {
            Some(raw) => raw.clone(),
            None => return Ok(false),
        };
        let header = self.records.decode_instance_header(&raw)?;

        self.instances.write().remove(instance_id);

        if let Some(alias) = &header.alias {
            let mut aliases = self.aliases.write();
            if aliases.get(alias).map(String::as_str) == Some(instance_id) {
                aliases.remove(alias);
            }
        }
        if let Some(parent) = &header.parent_alias {
            let mut children = self.children.lock();
            if let Some(set) = children.get_mut(parent) {
                set.remove(instance_id);
                if set.is_empty() {
                    children.remove(parent);
                }
            }
        }
        Ok(true)
    }

    async fn get_instance_child_count_by_alias(&self, alias: &str) -> Result<i64, StoreError> {
        let children = self.children.lock();
        Ok(children.get(alias).map_or(0, |set| set.len() as i64))
    }

    async fn write_binding(&self, binding: &Binding) -> Result<(), StoreError> {
        let raw = self.records.encode_binding(binding)?;
        self.bindings
            .write()
            .insert(binding.binding_id.clone(), raw);
        Ok(())
    }

    async fn get_binding(&self, binding_id: &str) -> Result<Option<Binding>, StoreError> {
        let raw = match self.bindings.read().get(binding_id) {
            Some(raw) => raw.clone(),
            None => return Ok(None),
        };
        let header = self.records.decode_binding_header(&raw)?;
        let instance = self.get_instance(&header.instance_id).await?;
        self.records.decode_binding(&raw, instance.as_ref()).map(Some)
    }

    async fn delete_binding(&self, binding_id: &str) -> Result<bool, StoreError> {
        Ok(self.bindings.write().remove(binding_id).is_some())
    }

    async fn test_connection(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
