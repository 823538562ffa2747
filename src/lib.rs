#![deny(missing_debug_implementations, rust_2018_idioms, unused_imports)]

//! shardpool is a multithreaded TCP connection acceptor with a sharded worker-pool dispatcher.
//!
//! One thread accepts connections and hands each off to the least-loaded member of a fixed-size
//! worker pool; each worker runs its own readiness-poll loop over the connections it owns. See
//! [`Acceptor`] for the entry point.

use std::sync::Arc;

pub mod acceptor;
pub mod client;
pub mod config;
pub mod error;
pub mod packet;
pub mod queue;
pub mod worker;

pub use acceptor::{Acceptor, ShutdownHandle};
pub use client::Client;
pub use config::AcceptorConfig;
pub use error::{AcceptorError, ConfigError, HandlerError, HandlerResult};
pub use packet::Packet;

/// A request handler invoked once per frame read from a client, on that client's owning worker
/// thread.
///
/// Returning `Err` closes the connection the handler was invoked for; it has no effect on any
/// other connection or on the worker thread itself.
pub type Handler = Arc<dyn Fn(&Client, &Packet<'_>) -> HandlerResult + Send + Sync>;
