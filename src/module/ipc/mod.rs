//! Module protocol layer
//!
//! Newline-delimited JSON over TCP between the module server and lifecycle
//! clients: request/response correlation by id plus server-pushed hot reload
//! notifications.

pub mod client;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::ModuleClient;
pub use protocol::{Notification, Operation, ResponseMessage, ServerRequest};
pub use server::{AddedModule, ModuleServer};
pub use transport::{ListenerId, MessageResult, Transport};
