//! modhost - dynamic module lifecycle manager
//!
//! Loads, builds and activates engines and plugins at runtime on a
//! coordinating server and any number of connected clients.
//!
//! ## Design Principles
//!
//! 1. **Idempotent materialization**: an existing artifact is the cache; a
//!    module is only fetched, installed and bundled when it is missing.
//! 2. **Serialized side effects**: external package-manager and bundler
//!    runs never overlap.
//! 3. **Per-key lifecycle locks**: at most one load and one mount per module
//!    is in flight, whoever asks (explicit requests or hot reload).

pub mod config;
pub mod module;
pub mod utils;

pub use config::{ClientConfig, HostConfig, LoggingConfig, ServerConfig};
pub use module::{
    LifecycleCoordinator, ModuleError, ModuleKey, ModuleKind, ModuleServer, ModuleStore,
};
