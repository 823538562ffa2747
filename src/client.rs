//! Client: the per-connection handle shared between the acceptor and its owning worker.

use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use mio::net::TcpStream;
use mio::Token;

use crate::worker::WorkerHandle;

/// Sentinel stored in [`Client::token`] before the client has been registered on any worker's
/// readiness set.
const UNREGISTERED: usize = usize::MAX;

/// A single accepted TCP connection, shared between the acceptor (via its master connection
/// list) and exactly one worker (via that worker's client list), for the lifetime of the
/// connection.
///
/// `socket` is wrapped in a [`Mutex`] purely to make `Client` safe to hold behind an `Arc` shared
/// across threads — in practice only the owning worker thread ever touches it once the acceptor
/// has handed the client off, so the lock is never contended (the same reasoning the teacher
/// applies to its own `Session::stream`).
#[derive(Debug)]
pub struct Client {
    socket: Mutex<TcpStream>,
    remote_addr: SocketAddr,
    client_id: u64,
    owning_pool: Mutex<Option<Weak<WorkerHandle>>>,
    request_count: AtomicU64,
    ref_count: AtomicI64,
    token: AtomicUsize,
}

impl Client {
    /// Creates a new client wrapping `socket`, identified by `client_id`. `ref_count` starts at
    /// zero; the acceptor and the chosen worker each take a reference as they register the
    /// client into their respective lists.
    pub(crate) fn new(socket: TcpStream, remote_addr: SocketAddr, client_id: u64) -> Self {
        Self {
            socket: Mutex::new(socket),
            remote_addr,
            client_id,
            owning_pool: Mutex::new(None),
            request_count: AtomicU64::new(0),
            ref_count: AtomicI64::new(0),
            token: AtomicUsize::new(UNREGISTERED),
        }
    }

    /// The address of the connected peer, captured at accept time.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The monotonically increasing identifier assigned by the acceptor.
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Number of frames successfully read and handed to the request handler so far.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub(crate) fn increment_request_count(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    /// The current logical reference count. Tracked independently of `Arc`'s own strong count so
    /// the ownership invariants in the design spec stay directly observable and testable.
    pub fn ref_count(&self) -> i64 {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Takes a logical reference (called whenever a collection starts holding this client).
    pub(crate) fn acquire_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Releases a logical reference (called whenever a collection stops holding this client).
    /// Never drives the counter below zero.
    pub(crate) fn release_ref(&self) {
        let prev = self.ref_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev >= 1, "ref_count underflow on client {}", self.client_id);
    }

    /// The worker currently holding this client, if any and if it has not since been dropped.
    pub fn owning_pool(&self) -> Option<Arc<WorkerHandle>> {
        self.owning_pool
            .lock()
            .expect("owning_pool mutex poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Sets the (weak, non-owning) back-reference to the worker that now holds this client.
    pub(crate) fn set_owning_pool(&self, worker: &Arc<WorkerHandle>) {
        *self.owning_pool.lock().expect("owning_pool mutex poisoned") = Some(Arc::downgrade(worker));
    }

    /// The `mio::Token` this client is currently registered under, if any.
    pub(crate) fn token(&self) -> Option<Token> {
        match self.token.load(Ordering::SeqCst) {
            UNREGISTERED => None,
            raw => Some(Token(raw)),
        }
    }

    pub(crate) fn set_token(&self, token: Option<Token>) {
        self.token.store(
            token.map(|t| t.0).unwrap_or(UNREGISTERED),
            Ordering::SeqCst,
        );
    }

    /// Runs `f` with exclusive access to the underlying socket. Used for registration, reads, and
    /// writes, all of which require `&mut TcpStream`.
    pub(crate) fn with_socket<R>(&self, f: impl FnOnce(&mut TcpStream) -> R) -> R {
        let mut guard = self.socket.lock().expect("client socket mutex poisoned");
        f(&mut guard)
    }

    /// Shuts down both halves of the socket. Used when a connection is closed, and when a
    /// handoff-queue enqueue fails for a client that was never registered with any worker.
    pub(crate) fn shutdown_socket(&self) {
        let _ = self.with_socket(|s| s.shutdown(Shutdown::Both));
    }
}
