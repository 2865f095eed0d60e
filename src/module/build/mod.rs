//! Build pipeline plumbing
//!
//! The global build queue and the external tools it serializes.

pub mod queue;
pub mod tools;

pub use queue::BuildQueue;
pub use tools::{Bundler, CommandBundler, CommandPackageManager, PackageManager};
