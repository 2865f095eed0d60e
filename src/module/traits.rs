//! Module system traits and interfaces
//!
//! Defines the identity types shared by the server pipeline and the client
//! coordinator, the error taxonomy, and the traits loaded module code
//! implements.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::module::coordinator::HostHandle;

/// Module kind. Each kind owns a separate install area and artifact directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    /// Foundational capability
    Engine,
    /// Functionality built atop engines
    Plugin,
}

impl ModuleKind {
    /// Singular wire field name (`engine` / `plugin`)
    pub fn field(self) -> &'static str {
        match self {
            ModuleKind::Engine => "engine",
            ModuleKind::Plugin => "plugin",
        }
    }

    /// Plural name, used for wire argument lists and as the directory name
    pub fn collection(self) -> &'static str {
        match self {
            ModuleKind::Engine => "engines",
            ModuleKind::Plugin => "plugins",
        }
    }

    /// Capitalized plural, the suffix of method names (`requestPlugins`)
    pub(crate) fn method_suffix(self) -> &'static str {
        match self {
            ModuleKind::Engine => "Engines",
            ModuleKind::Plugin => "Plugins",
        }
    }

    /// Capitalized singular, the suffix of command names (`addPlugin`)
    pub(crate) fn command_suffix(self) -> &'static str {
        match self {
            ModuleKind::Engine => "Engine",
            ModuleKind::Plugin => "Plugin",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field())
    }
}

impl std::str::FromStr for ModuleKind {
    type Err = ModuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "engine" | "engines" => Ok(ModuleKind::Engine),
            "plugin" | "plugins" => Ok(ModuleKind::Plugin),
            other => Err(ModuleError::Validation(format!(
                "unknown module kind: {}",
                other
            ))),
        }
    }
}

/// Module identity: a bare registry name or an absolute reference to
/// locally-authored module content (leading `/`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleKey(String);

impl ModuleKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this key refers to local module content rather than a registry name
    pub fn is_local_path(&self) -> bool {
        self.0.starts_with('/')
    }

    /// File-system safe artifact name; `/` maps to `_`
    pub fn artifact_name(&self) -> String {
        self.0.replace('/', "_")
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ModuleKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Client-side lifecycle state of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleState {
    /// No code and no instance
    Unloaded,
    /// Code fetched, not yet activated
    Loaded,
    /// Activated; capability object available
    Mounted,
}

/// Module system errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModuleError {
    /// Malformed module reference or descriptor; never causes a side effect
    #[error("invalid module spec: {0}")]
    Validation(String),

    /// External package manager or bundler exited unsuccessfully
    #[error("{tool} exited with {}", exit_code(.code))]
    Tool { tool: String, code: Option<i32> },

    /// Request round-trip failed or the connection dropped mid-request
    #[error("network error: {0}")]
    Network(String),

    /// A module's own instantiate/mount/unmount hook failed
    #[error("module activation failed: {0}")]
    Activation(String),

    /// Error string reported by the server in a response
    #[error("server error: {0}")]
    Remote(String),

    #[error("module not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

fn exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

impl From<std::io::Error> for ModuleError {
    fn from(e: std::io::Error) -> Self {
        ModuleError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ModuleError {
    fn from(e: serde_json::Error) -> Self {
        ModuleError::Serialization(e.to_string())
    }
}

/// Capability object produced by a module's activation hook
pub type Capability = Arc<dyn Any + Send + Sync>;

/// A mounted module's capability object tagged with its owning key.
///
/// Handed out as `Arc<ModuleApi>`; every caller that requests the same
/// mounted module receives the same allocation.
pub struct ModuleApi {
    key: ModuleKey,
    value: Option<Capability>,
}

impl ModuleApi {
    pub(crate) fn new(key: ModuleKey, value: Option<Capability>) -> Self {
        Self { key, value }
    }

    /// Key of the module that exposed this capability
    pub fn key(&self) -> &ModuleKey {
        &self.key
    }

    /// True when activation returned nothing
    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    /// Typed access to the capability object
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.value.clone().and_then(|v| v.downcast::<T>().ok())
    }
}

impl fmt::Debug for ModuleApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleApi")
            .field("key", &self.key)
            .field("empty", &self.is_empty())
            .finish()
    }
}

/// Context handed to module code at instantiation
#[derive(Clone)]
pub struct ModuleContext {
    pub key: ModuleKey,
    pub kind: ModuleKind,
    /// Access to the coordinator that is mounting this module
    pub host: HostHandle,
}

/// A live module instance.
///
/// `mount` may return a capability object; `None` is normalized to an empty
/// one. Modules without a teardown hook keep the default `unmount`.
#[async_trait]
pub trait ModuleInstance: Send {
    async fn mount(&mut self) -> Result<Option<Capability>, ModuleError>;

    async fn unmount(&mut self) -> Result<(), ModuleError> {
        Ok(())
    }
}

/// Executable module code: creates instances
#[async_trait]
pub trait ModuleFactory: Send + Sync {
    async fn instantiate(
        &self,
        context: ModuleContext,
    ) -> Result<Box<dyn ModuleInstance>, ModuleError>;
}

#[async_trait]
impl<F> ModuleFactory for F
where
    F: Fn(ModuleContext) -> Box<dyn ModuleInstance> + Send + Sync,
{
    async fn instantiate(
        &self,
        context: ModuleContext,
    ) -> Result<Box<dyn ModuleInstance>, ModuleError> {
        Ok(self(context))
    }
}

/// Fetched module code, shared between the registry and in-flight mounts
pub type ModuleCode = Arc<dyn ModuleFactory>;

/// Makes fetched module code available to the coordinator.
///
/// Implementations decide how an artifact becomes executable in the client
/// process; errors surface as load failures.
#[async_trait]
pub trait CodeLoader: Send + Sync {
    async fn load(&self, kind: ModuleKind, key: &ModuleKey) -> Result<ModuleCode, ModuleError>;

    /// Offline resolution: whether client code exists for `key`
    fn has_code(&self, _kind: ModuleKind, _key: &ModuleKey) -> bool {
        true
    }
}
