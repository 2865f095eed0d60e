//! Synchronization primitives for the module lifecycle
//!
//! Per-key FIFO locks used by the coordinator's load and mount phases.

pub mod keyed_mutex;

pub use keyed_mutex::{KeyedMutex, LockTicket};
