//! Module registry
//!
//! Descriptor parsing for the server pipeline and the per-key records the
//! client coordinator keeps.

pub mod descriptor;
pub mod records;

pub use descriptor::{ModuleDescriptor, ModuleRef};
pub use records::{ModuleRecord, ModuleRegistry};
