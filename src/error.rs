//! Error types for the acceptor/worker pool.

use std::io;

/// Errors that can occur while constructing or running an [`Acceptor`](crate::acceptor::Acceptor).
///
/// These are the only errors that cross a thread boundary as a `Result` — everything that happens
/// once the acceptor and worker loops are running is logged and handled locally (see
/// [`crate::worker`] and [`crate::acceptor`]).
#[derive(Debug, thiserror::Error)]
pub enum AcceptorError {
    /// The listen socket could not be created, bound, or set to listen.
    #[error("failed to bind listen socket on {addr}: {source}")]
    Bind {
        /// Address the acceptor attempted to bind.
        addr: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The acceptor's or a worker's readiness set (`mio::Poll`) could not be created or the
    /// listen socket could not be registered on it.
    #[error("failed to create or register a readiness set: {0}")]
    Readiness(#[source] io::Error),

    /// The supplied [`AcceptorConfig`](crate::config::AcceptorConfig) failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Validation failures for [`AcceptorConfig`](crate::config::AcceptorConfig).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `worker_count` was zero; at least one worker is required to process connections.
    #[error("worker_count must be at least 1")]
    ZeroWorkers,

    /// `handoff_queue_capacity` was zero; a zero-capacity queue could never hand off a connection.
    #[error("handoff_queue_capacity must be at least 1")]
    ZeroQueueCapacity,

    /// `recv_buffer_size` was zero.
    #[error("recv_buffer_size must be at least 1")]
    ZeroRecvBuffer,

    /// `max_events_per_wait` was zero.
    #[error("max_events_per_wait must be at least 1")]
    ZeroMaxEvents,

    /// The bind IP string could not be parsed as an IPv4 address.
    #[error("bind_ip {0:?} is not a valid IPv4 address")]
    InvalidBindIp(String),
}

/// The result type returned by the injected request handler.
///
/// A handler returning `Err` closes the connection it was invoked for; it never affects any
/// other connection or the worker thread itself.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Error returned by the injected request handler to signal that the connection driving it
/// should be closed.
#[derive(Debug, thiserror::Error)]
#[error("request handler failed: {reason}")]
pub struct HandlerError {
    reason: String,
}

impl HandlerError {
    /// Builds a [`HandlerError`] carrying a human-readable reason, which is included in the
    /// worker's log line when the connection is closed.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
