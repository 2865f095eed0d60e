//! Module descriptors and references
//!
//! A [`ModuleRef`] is what a requester names: a registry name, an absolute
//! path to local module content, or an inline declaration. It is parsed and
//! validated once at the boundary; everything downstream works on the typed
//! variant.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::module::traits::{ModuleError, ModuleKey};
use crate::module::validation::{DescriptorValidator, DESCRIPTOR_FILE};

const DEFAULT_VERSION: &str = "0.0.1";
const DEFAULT_CLIENT_ENTRY: &str = "client.js";
const DEFAULT_SERVER_ENTRY: &str = "server.js";

/// Resolved module declaration (the `package.json` of an installed module)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(rename = "client", default = "default_client_entry")]
    pub client_entry: String,
    #[serde(rename = "server", default = "default_server_entry")]
    pub server_entry: String,
    /// Inline file contents keyed by relative path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<BTreeMap<String, String>>,
}

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

fn default_client_entry() -> String {
    DEFAULT_CLIENT_ENTRY.to_string()
}

fn default_server_entry() -> String {
    DEFAULT_SERVER_ENTRY.to_string()
}

impl ModuleDescriptor {
    /// Parse an inline declaration, rejecting anything that is not the
    /// flat string-valued shape.
    pub fn from_declaration(value: &Value) -> Result<Self, ModuleError> {
        DescriptorValidator::new()
            .validate_declaration(value)
            .into_result()?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Parse a descriptor read back from an installed package.
    ///
    /// Published packages carry arbitrary extra metadata, so only `name` is
    /// required; the client entry falls back to `main`, then `index.js`, and
    /// non-string dependency entries are skipped.
    pub fn from_package_json(value: &Value) -> Result<Self, ModuleError> {
        let object = value
            .as_object()
            .ok_or_else(|| ModuleError::Validation("package descriptor is not an object".into()))?;

        let name = object
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ModuleError::Validation("package descriptor has no name".into()))?
            .to_string();

        let text = |field: &str| object.get(field).and_then(Value::as_str).map(str::to_string);

        let dependencies = object
            .get("dependencies")
            .and_then(Value::as_object)
            .map(|deps| {
                deps.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            name,
            version: text("version").unwrap_or_else(default_version),
            dependencies,
            client_entry: text("client")
                .or_else(|| text("main"))
                .unwrap_or_else(|| "index.js".to_string()),
            server_entry: text("server").unwrap_or_else(default_server_entry),
            files: None,
        })
    }

    /// Read `package.json` from a module directory
    pub async fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self, ModuleError> {
        let path = dir.as_ref().join(DESCRIPTOR_FILE);
        let contents = tokio::fs::read_to_string(&path).await.map_err(|e| {
            ModuleError::NotFound(format!("Failed to read descriptor {:?}: {}", path, e))
        })?;
        let value: Value = serde_json::from_str(&contents)?;
        Self::from_package_json(&value)
    }

    /// The synthesized descriptor file contents (inline files excluded)
    pub fn to_package_json(&self) -> Value {
        json!({
            "name": self.name,
            "version": self.version,
            "dependencies": self.dependencies,
            "client": self.client_entry,
            "server": self.server_entry,
        })
    }

    /// Whether the module ships client code at all
    pub fn has_client(&self) -> bool {
        !self.client_entry.is_empty()
    }

    /// Absolute path of the client entry inside an install location
    pub fn client_entry_path(&self, install_dir: &Path) -> PathBuf {
        install_dir.join(&self.client_entry)
    }
}

/// A module reference as accepted from a requester
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleRef {
    /// Name resolved against the shared package registry
    Named(String),
    /// Absolute reference to locally-authored module content
    LocalPath(String),
    /// Module declared inline
    Inline(ModuleDescriptor),
}

impl ModuleRef {
    /// Parse and validate a reference taken off the wire
    pub fn from_value(value: &Value) -> Result<Self, ModuleError> {
        match value {
            Value::String(s) => Self::from_key_str(s),
            Value::Object(_) => Ok(ModuleRef::Inline(ModuleDescriptor::from_declaration(value)?)),
            _ => Err(ModuleError::Validation("invalid module format".to_string())),
        }
    }

    fn from_key_str(s: &str) -> Result<Self, ModuleError> {
        let validator = DescriptorValidator::new();
        if s.starts_with('/') {
            validator
                .validate_local_path(s)
                .map_err(ModuleError::Validation)?;
            Ok(ModuleRef::LocalPath(s.to_string()))
        } else {
            validator.validate_name(s).map_err(ModuleError::Validation)?;
            Ok(ModuleRef::Named(s.to_string()))
        }
    }

    /// Identity of the module on the client side
    pub fn key(&self) -> ModuleKey {
        match self {
            ModuleRef::Named(name) => ModuleKey::new(name.clone()),
            ModuleRef::LocalPath(path) => ModuleKey::new(path.clone()),
            ModuleRef::Inline(descriptor) => ModuleKey::new(descriptor.name.clone()),
        }
    }

    /// Name the artifact is stored under
    pub fn artifact_name(&self) -> String {
        self.key().artifact_name()
    }

    /// Wire representation
    pub fn to_value(&self) -> Value {
        match self {
            ModuleRef::Named(name) => Value::String(name.clone()),
            ModuleRef::LocalPath(path) => Value::String(path.clone()),
            ModuleRef::Inline(descriptor) => {
                serde_json::to_value(descriptor).unwrap_or(Value::Null)
            }
        }
    }
}

impl TryFrom<&ModuleKey> for ModuleRef {
    type Error = ModuleError;

    fn try_from(key: &ModuleKey) -> Result<Self, Self::Error> {
        Self::from_key_str(key.as_str())
    }
}

impl FromStr for ModuleRef {
    type Err = ModuleError;

    /// A name, an absolute path, or an inline JSON declaration
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.starts_with('{') {
            let value: Value = serde_json::from_str(trimmed)?;
            Self::from_value(&value)
        } else {
            Self::from_key_str(trimmed)
        }
    }
}
