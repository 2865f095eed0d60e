//! Module reference and descriptor validation
//!
//! Shape checks run before any side effect: a rejected reference never
//! creates an install directory or an artifact file.

use serde_json::{Map, Value};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::module::traits::ModuleError;

/// File name of the descriptor written into every install location
pub const DESCRIPTOR_FILE: &str = "package.json";

/// Validation result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    /// Declaration is valid
    Valid,
    /// Declaration is invalid with specific errors
    Invalid(Vec<String>),
}

impl ValidationResult {
    /// Collapse into a `ModuleError::Validation` carrying every problem found
    pub fn into_result(self) -> Result<(), ModuleError> {
        match self {
            ValidationResult::Valid => Ok(()),
            ValidationResult::Invalid(errors) => Err(ModuleError::Validation(errors.join("; "))),
        }
    }
}

/// Validator for module names, local paths and inline declarations
pub struct DescriptorValidator {
    /// Longest accepted module name
    max_name_len: usize,
    /// Largest number of inline files
    max_files: usize,
}

impl DescriptorValidator {
    pub fn new() -> Self {
        Self {
            max_name_len: 214,
            max_files: 256,
        }
    }

    /// Validate an inline module declaration object
    pub fn validate_declaration(&self, value: &Value) -> ValidationResult {
        let Some(object) = value.as_object() else {
            return ValidationResult::Invalid(vec!["invalid module format".to_string()]);
        };

        let mut errors = Vec::new();

        match object.get("name") {
            Some(Value::String(name)) => {
                if let Err(e) = self.validate_name(name) {
                    errors.push(e);
                }
            }
            Some(_) => errors.push("name must be a string".to_string()),
            None => errors.push("name is required".to_string()),
        }

        for field in ["version", "client", "server"] {
            if let Some(v) = object.get(field) {
                if !v.is_string() {
                    errors.push(format!("{} must be a string", field));
                }
            }
        }

        if let Some(dependencies) = object.get("dependencies") {
            errors.extend(self.validate_string_map("dependencies", dependencies));
        }

        if let Some(files) = object.get("files") {
            let map_errors = self.validate_string_map("files", files);
            if map_errors.is_empty() {
                errors.extend(self.validate_files(files.as_object()));
            } else {
                errors.extend(map_errors);
            }
        }

        if errors.is_empty() {
            debug!("Module declaration validated");
            ValidationResult::Valid
        } else {
            warn!("Module declaration rejected: {:?}", errors);
            ValidationResult::Invalid(errors)
        }
    }

    /// Validate a registry module name (optionally `@scope/name`)
    pub fn validate_name(&self, name: &str) -> Result<(), String> {
        if name.is_empty() {
            return Err("module name cannot be empty".to_string());
        }
        if name.len() > self.max_name_len {
            return Err(format!(
                "module name longer than {} characters",
                self.max_name_len
            ));
        }
        if name.starts_with('.') || name.starts_with('_') || name.starts_with('/') {
            return Err(format!("invalid module name: {}", name));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | '/' | '~'))
        {
            return Err(format!("invalid characters in module name: {}", name));
        }

        let segments: Vec<&str> = name.split('/').collect();
        let scoped = segments.len() == 2 && segments[0].starts_with('@');
        if segments.len() > 1 && !scoped {
            return Err(format!("invalid module name: {}", name));
        }
        if segments.iter().any(|s| s.is_empty() || *s == "." || *s == "..") {
            return Err(format!("invalid module name: {}", name));
        }

        Ok(())
    }

    /// Validate an absolute reference to local module content
    pub fn validate_local_path(&self, path: &str) -> Result<(), String> {
        if !path.starts_with('/') {
            return Err(format!("local module path must be absolute: {}", path));
        }
        if path.contains('\0') {
            return Err("local module path contains NUL".to_string());
        }
        if Path::new(path)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(format!("local module path escapes its root: {}", path));
        }
        if path.trim_matches('/').is_empty() {
            return Err("local module path cannot be the root".to_string());
        }
        Ok(())
    }

    /// A flat mapping of string keys to string values
    fn validate_string_map(&self, field: &str, value: &Value) -> Vec<String> {
        match value {
            Value::Object(map) => map
                .iter()
                .filter(|(_, v)| !v.is_string())
                .map(|(k, _)| format!("{}.{} must be a string", field, k))
                .collect(),
            _ => vec![format!("{} must be a mapping of strings", field)],
        }
    }

    /// Inline file names must stay inside the install location
    fn validate_files(&self, files: Option<&Map<String, Value>>) -> Vec<String> {
        let Some(files) = files else {
            return Vec::new();
        };

        let mut errors = Vec::new();
        if files.len() > self.max_files {
            errors.push(format!("more than {} inline files", self.max_files));
        }
        for name in files.keys() {
            let path = Path::new(name);
            let escapes = path.components().any(|c| {
                matches!(
                    c,
                    Component::ParentDir | Component::RootDir | Component::Prefix(_)
                )
            });
            let normalized: PathBuf = path
                .components()
                .filter(|c| !matches!(c, Component::CurDir))
                .collect();
            if escapes || normalized.as_os_str().is_empty() {
                errors.push(format!("invalid inline file path: {:?}", name));
            } else if normalized == Path::new(DESCRIPTOR_FILE) {
                errors.push(format!("inline files cannot replace {}", DESCRIPTOR_FILE));
            }
        }
        errors
    }
}

impl Default for DescriptorValidator {
    fn default() -> Self {
        Self::new()
    }
}
