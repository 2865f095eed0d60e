//! In-process module catalog

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

use crate::module::traits::{CodeLoader, ModuleCode, ModuleError, ModuleKey, ModuleKind};

/// Code loader backed by factories registered at startup
#[derive(Default)]
pub struct ModuleCatalog {
    entries: RwLock<HashMap<(ModuleKind, ModuleKey), ModuleCode>>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `code` loadable as `key`; replaces any earlier registration
    pub fn register(&self, kind: ModuleKind, key: impl Into<ModuleKey>, code: ModuleCode) {
        let key = key.into();
        debug!(%kind, module = %key, "Registering module code");
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((kind, key), code);
    }

    /// Forget `key`; later loads fail with `NotFound`
    pub fn unregister(&self, kind: ModuleKind, key: &ModuleKey) -> Option<ModuleCode> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(kind, key.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CodeLoader for ModuleCatalog {
    async fn load(&self, kind: ModuleKind, key: &ModuleKey) -> Result<ModuleCode, ModuleError> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind, key.clone()))
            .cloned()
            .ok_or_else(|| ModuleError::NotFound(format!("no {} code for {}", kind, key)))
    }

    fn has_code(&self, kind: ModuleKind, key: &ModuleKey) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&(kind, key.clone()))
    }
}
