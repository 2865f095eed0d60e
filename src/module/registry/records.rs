//! Client-side module records
//!
//! One [`ModuleRecord`] per key for the lifetime of the process. Only the
//! coordinator touches the registry, and only while holding the key's lock
//! for the phase it mutates (load lock for `code`, mount lock for
//! `instance`/`api`).

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::module::traits::{ModuleApi, ModuleCode, ModuleInstance, ModuleKey, ModuleState};

/// Everything known about one module on this client
#[derive(Default)]
pub struct ModuleRecord {
    /// Executable code, once fetched
    code: Option<ModuleCode>,
    /// Activated instance; `None` for mounted modules without client code
    instance: Option<Box<dyn ModuleInstance>>,
    /// Capability object, once mounted
    api: Option<Arc<ModuleApi>>,
}

impl ModuleRecord {
    pub fn state(&self) -> ModuleState {
        if self.api.is_some() {
            ModuleState::Mounted
        } else if self.code.is_some() {
            ModuleState::Loaded
        } else {
            ModuleState::Unloaded
        }
    }
}

/// Registry of module records keyed by module identity
#[derive(Default)]
pub struct ModuleRegistry {
    records: Mutex<HashMap<ModuleKey, ModuleRecord>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn code(&self, key: &ModuleKey) -> Option<ModuleCode> {
        let records = self.records.lock().await;
        records.get(key).and_then(|r| r.code.clone())
    }

    pub async fn has_code(&self, key: &ModuleKey) -> bool {
        let records = self.records.lock().await;
        records.get(key).map_or(false, |r| r.code.is_some())
    }

    pub async fn set_code(&self, key: &ModuleKey, code: ModuleCode) {
        let mut records = self.records.lock().await;
        records.entry(key.clone()).or_default().code = Some(code);
    }

    /// Put `code` back if a release dropped it after the load phase
    pub async fn restore_code(&self, key: &ModuleKey, code: ModuleCode) {
        let mut records = self.records.lock().await;
        records.entry(key.clone()).or_default().code.get_or_insert(code);
    }

    pub async fn take_code(&self, key: &ModuleKey) -> Option<ModuleCode> {
        let mut records = self.records.lock().await;
        records.get_mut(key).and_then(|r| r.code.take())
    }

    pub async fn api(&self, key: &ModuleKey) -> Option<Arc<ModuleApi>> {
        let records = self.records.lock().await;
        records.get(key).and_then(|r| r.api.clone())
    }

    /// Record a completed mount
    pub async fn set_mounted(
        &self,
        key: &ModuleKey,
        instance: Option<Box<dyn ModuleInstance>>,
        api: Arc<ModuleApi>,
    ) {
        let mut records = self.records.lock().await;
        let record = records.entry(key.clone()).or_default();
        record.instance = instance;
        record.api = Some(api);
    }

    /// Detach instance and capability object; the record itself stays
    pub async fn take_mounted(
        &self,
        key: &ModuleKey,
    ) -> (Option<Box<dyn ModuleInstance>>, Option<Arc<ModuleApi>>) {
        let mut records = self.records.lock().await;
        match records.get_mut(key) {
            Some(record) => (record.instance.take(), record.api.take()),
            None => (None, None),
        }
    }

    pub async fn state(&self, key: &ModuleKey) -> ModuleState {
        let records = self.records.lock().await;
        records
            .get(key)
            .map(ModuleRecord::state)
            .unwrap_or(ModuleState::Unloaded)
    }

    /// Key owning `api`, if that capability object is still the mounted one
    pub async fn key_of(&self, api: &Arc<ModuleApi>) -> Option<ModuleKey> {
        let records = self.records.lock().await;
        let current = records.get(api.key())?.api.as_ref()?;
        Arc::ptr_eq(current, api).then(|| api.key().clone())
    }

    /// Keys currently in the mounted state
    pub async fn mounted_keys(&self) -> Vec<ModuleKey> {
        let records = self.records.lock().await;
        let mut keys: Vec<ModuleKey> = records
            .iter()
            .filter(|(_, r)| r.api.is_some())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}
