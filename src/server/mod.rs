//! Server module
//!
//! The accept loop, per-connection buffered I/O, and the request handler.

mod connection;
mod handler;
mod listener;

pub use connection::{Connection, ConnectionId};
pub use handler::{Handler, HandlerDependencies};
pub use listener::Server;
