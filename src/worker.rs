//! Worker (`ConnectionPool`): owns a subset of accepted connections and their readiness loop.
//!
//! Split into a shared [`WorkerHandle`] — the slice of state the acceptor and a [`Client`]'s
//! `owning_pool` back-reference touch — and a [`Worker`], which owns the thread-exclusive
//! readiness set and client list and is moved by value into its own thread.

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};
use slab::Slab;

use crate::client::Client;
use crate::config::AcceptorConfig;
use crate::error::AcceptorError;
use crate::packet::Packet;
use crate::queue::HandoffQueue;
use crate::Handler;

/// The part of a worker's state shared with the acceptor thread and with every `Client` it
/// currently owns (via a weak back-reference). Cheap to read (`size`, `running`) and the only
/// piece of a worker the acceptor ever touches.
#[derive(Debug)]
pub struct WorkerHandle {
    id: usize,
    name: String,
    running: AtomicBool,
    size: AtomicUsize,
    queue: HandoffQueue,
}

impl WorkerHandle {
    pub(crate) fn new(id: usize, name: impl Into<String>, queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            running: AtomicBool::new(true),
            size: AtomicUsize::new(0),
            queue: HandoffQueue::new(queue_capacity),
        })
    }

    /// This worker's id, assigned at spawn time (its index in the acceptor's worker vector).
    pub fn id(&self) -> usize {
        self.id
    }

    /// Diagnostic name, used only in log lines.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of clients currently registered on this worker. Read with `Relaxed` ordering: the
    /// acceptor's least-loaded selection tolerates a stale value, per the design spec.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Whether the worker's loop is still expected to run.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Hands `client` off to this worker, to be picked up on its next `check_new_connections`.
    ///
    /// Takes a logical reference, records this worker as the client's (weak) owner, and counts
    /// the client against `size` before attempting the enqueue — so a burst of dispatches made
    /// before any of them has reached the worker's own readiness loop still spreads across the
    /// pool, rather than racing the least-loaded selection against `check_new_connections`. On a
    /// full queue, the enqueue is non-blocking and fails instead: the speculative reference and
    /// size are both rolled back and the raw socket is closed, so the client is never left in a
    /// state where `ref_count` or `size` claims a holder that does not exist.
    pub fn add_new_connection(self: &Arc<Self>, client: Arc<Client>) {
        client.acquire_ref();
        client.set_owning_pool(self);
        self.size.fetch_add(1, Ordering::SeqCst);

        if let Err(client) = self.queue.try_enqueue(client) {
            tracing::error!(worker_id = self.id, worker = %self.name, client_id = client.client_id(), "handoff queue full, dropping connection");
            self.size.fetch_sub(1, Ordering::SeqCst);
            client.release_ref();
            client.shutdown_socket();
        }
    }
}

/// A worker thread's exclusive state: its readiness set, its client list, and the injected
/// request handler. Constructed by the acceptor and moved into the thread it drives.
pub struct Worker {
    handle: Arc<WorkerHandle>,
    poll: Poll,
    clients: Slab<Arc<Client>>,
    handler: Handler,
    recv_buffer_size: usize,
    max_events_per_wait: usize,
    wait_timeout: Duration,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("handle", &self.handle)
            .field("clients", &self.clients.len())
            .field("recv_buffer_size", &self.recv_buffer_size)
            .field("max_events_per_wait", &self.max_events_per_wait)
            .field("wait_timeout", &self.wait_timeout)
            .finish()
    }
}

impl Worker {
    pub(crate) fn new(
        handle: Arc<WorkerHandle>,
        handler: Handler,
        config: &AcceptorConfig,
    ) -> Result<Self, AcceptorError> {
        let poll = Poll::new().map_err(AcceptorError::Readiness)?;

        Ok(Self {
            handle,
            poll,
            clients: Slab::new(),
            handler,
            recv_buffer_size: config.recv_buffer_size,
            max_events_per_wait: config.max_events_per_wait,
            wait_timeout: Duration::from_millis(config.worker_wait_timeout_ms),
        })
    }

    /// Number of clients in this worker's list right now. Always equal to `handle.size()` at
    /// every quiescent point, per the design spec's invariant.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether this worker currently holds no clients.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn register_client(&mut self, client: Arc<Client>) -> std::io::Result<()> {
        let entry = self.clients.vacant_entry();
        let token = Token(entry.key());
        client.with_socket(|s| self.poll.registry().register(s, token, Interest::READABLE))?;
        client.set_token(Some(token));
        entry.insert(client);
        Ok(())
    }

    /// Drains the handoff queue, registering every pending client on this worker's readiness
    /// set. A registration failure closes that one client; it never aborts the drain.
    fn check_new_connections(&mut self) {
        while let Some(client) = self.handle.queue.try_dequeue() {
            let client_id = client.client_id();
            if let Err(e) = self.register_client(client.clone()) {
                tracing::error!(worker_id = self.handle.id, client_id, error = %e, "failed to register new connection");
                client.shutdown_socket();
                client.release_ref();
                self.handle.size.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
            tracing::info!(worker_id = self.handle.id, client_id, "registered new connection");
        }
    }

    /// Removes `client` from this worker's list (if present), deregisters its socket, closes it,
    /// and releases the reference held for list membership. Idempotent: calling this a second
    /// time for a client already removed is a no-op that returns `0`.
    pub fn close_connection(&mut self, client: &Arc<Client>) -> u32 {
        let Some(token) = client.token() else {
            return 0;
        };
        if !self
            .clients
            .get(token.0)
            .is_some_and(|held| Arc::ptr_eq(held, client))
        {
            return 0;
        }

        let removed = self.clients.remove(token.0);
        let _ = removed.with_socket(|s| self.poll.registry().deregister(s));
        removed.shutdown_socket();
        removed.set_token(None);
        removed.release_ref();
        self.handle.size.fetch_sub(1, Ordering::SeqCst);
        tracing::info!(worker_id = self.handle.id, client_id = removed.client_id(), "closed connection");
        1
    }

    /// Adds `client` to this worker's list without touching its socket or readiness set — a
    /// migration primitive. No policy in this crate drives migration; the hook exists so a
    /// future policy can move a client between workers without re-registering its socket.
    pub fn add_to_list(&mut self, client: Arc<Client>) {
        let entry = self.clients.vacant_entry();
        let token = Token(entry.key());
        client.set_token(Some(token));
        client.acquire_ref();
        entry.insert(client);
        self.handle.size.fetch_add(1, Ordering::SeqCst);
    }

    /// Removes `client` from this worker's list without touching its socket or readiness set —
    /// the counterpart migration primitive to [`Worker::add_to_list`].
    pub fn remove_from_list(&mut self, client: &Arc<Client>) {
        let Some(token) = client.token() else {
            return;
        };
        if !self
            .clients
            .get(token.0)
            .is_some_and(|held| Arc::ptr_eq(held, client))
        {
            return;
        }
        self.clients.remove(token.0);
        client.set_token(None);
        client.release_ref();
        self.handle.size.fetch_sub(1, Ordering::SeqCst);
    }

    /// Clears `running`, closes every still-registered client, and releases the readiness set.
    /// Returns the number of clients closed.
    ///
    /// Drains the handoff queue first, so a client that was handed off but never reached a
    /// `readiness_wait` cycle before shutdown still gets registered (and then closed) here,
    /// rather than being left holding a reference no one will ever release.
    pub fn shutdown(&mut self) -> usize {
        self.handle.stop();
        self.check_new_connections();
        let tokens: Vec<Token> = self.clients.iter().map(|(key, _)| Token(key)).collect();
        let mut closed = 0usize;
        for token in tokens {
            if let Some(client) = self.clients.get(token.0).cloned() {
                closed += self.close_connection(&client) as usize;
            }
        }
        tracing::info!(worker_id = self.handle.id, name = %self.handle.name, closed, "worker shutdown complete");
        closed
    }

    /// The worker's main loop. Runs until `handle.running()` observes `false`, then tears itself
    /// down and returns the number of clients closed at shutdown — the value a caller typically
    /// retrieves via `JoinHandle::join` after clearing the worker's `running` flag.
    pub fn serve_forever(mut self) -> usize {
        tracing::info!(worker_id = self.handle.id, name = %self.handle.name, "worker starting");

        let mut recv_buffer = vec![0u8; self.recv_buffer_size];
        let mut events = Events::with_capacity(self.max_events_per_wait);

        loop {
            // No per-tick update() hook: the source's subclass extension point has no behavior
            // to carry over here, so it's omitted rather than modeled as a no-op callback.
            self.check_new_connections();

            match self.poll.poll(&mut events, Some(self.wait_timeout)) {
                Ok(()) => self.drive_ready_events(&events, &mut recv_buffer),
                Err(e) => {
                    tracing::warn!(worker_id = self.handle.id, error = %e, "readiness_wait failed");
                }
            }

            if !self.handle.running() {
                break;
            }
        }

        self.shutdown()
    }

    fn drive_ready_events(&mut self, events: &Events, recv_buffer: &mut [u8]) {
        'events: for event in events.iter() {
            let Some(client) = self.clients.get(event.token().0).cloned() else {
                continue;
            };

            if event.is_error() || event.is_read_closed() || event.is_write_closed() {
                self.close_connection(&client);
                continue;
            }

            if !event.is_readable() {
                continue;
            }

            match client.with_socket(|s| s.read(recv_buffer)) {
                Ok(0) => {
                    self.close_connection(&client);
                }
                Ok(n) if n >= recv_buffer.len() => {
                    tracing::error!(worker_id = self.handle.id, client_id = client.client_id(), n, "oversized frame, closing connection");
                    self.close_connection(&client);
                    break 'events;
                }
                Ok(n) => {
                    client.increment_request_count();
                    let packet = Packet::new(&recv_buffer[..n]);
                    if let Err(e) = (self.handler)(&client, &packet) {
                        tracing::warn!(worker_id = self.handle.id, client_id = client.client_id(), error = %e, "handler failed, closing connection");
                        self.close_connection(&client);
                        break 'events;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => {
                    tracing::warn!(worker_id = self.handle.id, client_id = client.client_id(), error = %e, "recv error, closing connection");
                    self.close_connection(&client);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::test_support::test_client;

    fn test_worker() -> Worker {
        let handle = WorkerHandle::new(0, "test", 100);
        let handler: Handler = Arc::new(|_client, _packet| Ok(()));
        Worker::new(handle, handler, &AcceptorConfig::default()).expect("failed to create worker for test")
    }

    #[test]
    fn add_to_list_then_remove_from_list_is_a_no_op() {
        let mut worker = test_worker();
        let client = test_client(1);

        let size_before = worker.handle.size();
        let ref_count_before = client.ref_count();
        let len_before = worker.len();

        worker.add_to_list(client.clone());
        worker.remove_from_list(&client);

        assert_eq!(size_before, worker.handle.size());
        assert_eq!(ref_count_before, client.ref_count());
        assert_eq!(len_before, worker.len());
    }

    #[test]
    fn add_to_list_increments_size_and_ref_count() {
        let mut worker = test_worker();
        let client = test_client(1);

        worker.add_to_list(client.clone());

        assert_eq!(1, worker.len());
        assert_eq!(1, worker.handle.size());
        assert_eq!(1, client.ref_count());
    }

    #[test]
    fn close_connection_is_idempotent() {
        let mut worker = test_worker();
        let client = test_client(1);
        worker.add_to_list(client.clone());

        assert_eq!(1, worker.close_connection(&client));
        assert_eq!(0, worker.close_connection(&client));
    }

    #[test]
    fn handoff_queue_full_rolls_back_the_speculative_reference_and_closes_the_socket() {
        let handle = WorkerHandle::new(0, "test", 1);
        handle.add_new_connection(test_client(1));
        assert_eq!(1, handle.size());

        let rejected = test_client(2);
        handle.add_new_connection(rejected.clone());

        assert_eq!(1, handle.size());
        assert_eq!(0, rejected.ref_count());
    }

    #[test]
    fn shutdown_closes_every_registered_client_and_reports_the_count() {
        let mut worker = test_worker();
        worker.add_to_list(test_client(1));
        worker.add_to_list(test_client(2));
        worker.add_to_list(test_client(3));

        assert_eq!(3, worker.shutdown());
        assert!(!worker.handle.running());
        assert_eq!(0, worker.handle.size());
    }
}
