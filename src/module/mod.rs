//! Module system for modhost
//!
//! Fetches, builds, loads and activates independently versioned modules
//! (engines and plugins) at runtime, without restarting the host.
//!
//! ## Architecture
//!
//! - **Server pipeline**: `ModuleStore` materializes a module reference into
//!   a servable artifact; every external tool invocation goes through one
//!   FIFO `BuildQueue`, and an existing artifact short-circuits the pipeline.
//! - **Client lifecycle**: `LifecycleCoordinator` drives each key through
//!   load and mount under per-key `KeyedMutex` locks, so concurrent requests
//!   and hot reload notifications for the same key never double-load or
//!   double-mount.
//! - **Protocol**: `Transport` correlates requests with responses over a
//!   persistent connection and fails every waiting caller on disconnect.

pub mod build;
pub mod coordinator;
pub mod ipc;
pub mod loader;
pub mod registry;
pub mod store;
pub mod sync;
pub mod traits;
pub mod validation;

pub use build::{BuildQueue, Bundler, CommandBundler, CommandPackageManager, PackageManager};
pub use coordinator::{HostHandle, LifecycleCoordinator, LifecycleEvent, RequestOptions};
pub use ipc::{ModuleClient, ModuleServer, Transport};
pub use loader::ModuleCatalog;
pub use registry::{ModuleDescriptor, ModuleRef, ModuleRegistry};
pub use store::{Artifact, ModuleStore};
pub use sync::KeyedMutex;
pub use traits::{
    Capability, CodeLoader, ModuleApi, ModuleCode, ModuleContext, ModuleError, ModuleFactory,
    ModuleInstance, ModuleKey, ModuleKind, ModuleState,
};
