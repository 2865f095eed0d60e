//! Module validation framework
//!
//! Shape validation for module references and inline declarations.

pub mod descriptor_validator;

pub use descriptor_validator::{DescriptorValidator, ValidationResult, DESCRIPTOR_FILE};
