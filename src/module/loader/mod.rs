//! Module code loading
//!
//! The coordinator never fetches code itself; it asks a
//! [`CodeLoader`](crate::module::traits::CodeLoader). `ModuleCatalog` is the
//! in-process implementation: module code is registered up front, keyed the
//! same way artifacts are served.

pub mod catalog;

pub use catalog::ModuleCatalog;
