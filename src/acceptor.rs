//! Acceptor (`TcpConnectionAcceptor`): binds the listen socket, spawns the worker pool, and runs
//! the accept loop on whichever thread calls [`Acceptor::serve_forever`].

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use crate::client::Client;
use crate::config::AcceptorConfig;
use crate::error::AcceptorError;
use crate::worker::{Worker, WorkerHandle};
use crate::Handler;

const LISTEN_TOKEN: Token = Token(0);

/// A cloneable, `Send + Sync` handle that can request shutdown of the worker pool after the
/// owning [`Acceptor`] has been moved by value into the thread running
/// [`Acceptor::serve_forever`].
///
/// Obtained from [`Acceptor::shutdown_handle`] before handing the acceptor to its serving thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    worker_handles: Vec<Arc<WorkerHandle>>,
}

impl ShutdownHandle {
    /// Phase one of shutdown: clears every worker's `running` flag so each notices on its next
    /// `readiness_wait` wakeup and starts closing its connections. Returns immediately; it does
    /// not wait for workers to finish — [`Acceptor::serve_forever`] returns once phase two (each
    /// worker joined, then the acceptor's own connection list swept) has completed.
    pub fn request_shutdown(&self) {
        tracing::info!("shutdown requested");
        for handle in &self.worker_handles {
            handle.stop();
        }
    }
}

/// Binds a listen socket and drives the accept loop, dispatching each accepted connection to the
/// least-loaded worker in a fixed-size pool.
///
/// Constructed with [`Acceptor::new`], driven with [`Acceptor::serve_forever`] (typically on its
/// own thread). Call [`Acceptor::shutdown_handle`] beforehand to retain a way to stop it.
#[derive(Debug)]
pub struct Acceptor {
    listener: TcpListener,
    poll: Poll,
    worker_handles: Vec<Arc<WorkerHandle>>,
    worker_threads: Vec<JoinHandle<usize>>,
    /// Every client ever accepted, held for the connection's full lifetime — the acceptor's
    /// share of `Client::ref_count`, released only by the terminal sweep in `serve_forever`.
    connections: Vec<Arc<Client>>,
    next_client_id: AtomicU64,
    accept_rate: i64,
    wait_timeout: Duration,
    max_events_per_wait: usize,
}

impl Acceptor {
    /// Binds `config.bind_ip:config.port`, spawns `config.worker_count` worker threads, and
    /// returns an acceptor ready to run. The listen socket and every worker's readiness set are
    /// created up front; nothing here runs on a thread of its own yet.
    pub fn new(config: AcceptorConfig, handler: Handler) -> Result<Self, AcceptorError> {
        config.validate()?;

        let addr = SocketAddr::from((config.bind_ip, config.port));
        let mut listener = TcpListener::bind(addr).map_err(|source| AcceptorError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        let poll = Poll::new().map_err(AcceptorError::Readiness)?;
        poll.registry()
            .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)
            .map_err(AcceptorError::Readiness)?;

        let mut worker_handles = Vec::with_capacity(config.worker_count);
        let mut worker_threads = Vec::with_capacity(config.worker_count);

        for id in 0..config.worker_count {
            let handle = WorkerHandle::new(id, format!("worker-{id}"), config.handoff_queue_capacity);
            let worker = Worker::new(handle.clone(), handler.clone(), &config)?;
            worker_handles.push(handle);
            worker_threads.push(
                thread::Builder::new()
                    .name(format!("worker-{id}"))
                    .spawn(move || worker.serve_forever())
                    .expect("failed to spawn worker thread"),
            );
        }

        tracing::info!(addr = %addr, workers = config.worker_count, "acceptor listening");

        Ok(Self {
            listener,
            poll,
            worker_handles,
            worker_threads,
            connections: Vec::new(),
            next_client_id: AtomicU64::new(1),
            accept_rate: config.accept_rate,
            wait_timeout: Duration::from_millis(config.acceptor_wait_timeout_ms),
            max_events_per_wait: config.max_events_per_wait,
        })
    }

    /// Address the listen socket was actually bound to (useful when `config.port == 0`).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The id and current size of every worker in the pool, in spawn order.
    pub fn worker_loads(&self) -> Vec<(usize, usize)> {
        self.worker_handles
            .iter()
            .map(|h| (h.id(), h.size()))
            .collect()
    }

    /// Returns a cloneable handle that can request shutdown of the worker pool after `self` has
    /// been moved into the thread running [`Acceptor::serve_forever`]. Must be called before that
    /// move.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            worker_handles: self.worker_handles.clone(),
        }
    }

    fn least_loaded_worker(&self) -> &Arc<WorkerHandle> {
        self.worker_handles
            .iter()
            .min_by_key(|h| h.size())
            .expect("worker pool is never empty: validated by AcceptorConfig::validate")
    }

    /// Accepts exactly one connection, appends it to the acceptor's own `connections` list
    /// (the acceptor's share of `Client::ref_count`), dispatches it to the least-loaded worker,
    /// and — if `accept_rate > 0` — sleeps off whatever is left of this connection's time
    /// budget. Mirrors the original `handleNewConnection`'s per-accept pacing: sleeping here,
    /// once per accepted connection, rather than once per poll tick, is what keeps the
    /// `accept_rate=1 ⇒ ≥1000ms between accepts` bound exact regardless of how many connections
    /// are already sitting in the listen backlog.
    fn handle_new_connection(&mut self) -> std::io::Result<()> {
        let start = Instant::now();

        let (socket, remote_addr) = self.listener.accept()?;
        socket.set_nodelay(true)?;

        let client_id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        let client = Arc::new(Client::new(socket, remote_addr, client_id));
        client.acquire_ref();
        self.connections.push(client.clone());

        let worker = self.least_loaded_worker();
        tracing::debug!(client_id, remote = %remote_addr, worker_id = worker.id(), "dispatching connection");
        worker.add_new_connection(client);

        if self.accept_rate > 0 {
            let target_ms = 1000 / self.accept_rate;
            let elapsed_ms = start.elapsed().as_millis() as i64;
            let sleep_ms = (target_ms - elapsed_ms).max(0);
            if sleep_ms > 0 {
                thread::sleep(Duration::from_millis(sleep_ms as u64));
            }
        }

        Ok(())
    }

    /// Drains every connection currently sitting in the listen backlog, pacing each accept per
    /// `handle_new_connection`'s own sleep. Called once per readable event on the listen token;
    /// looping to `WouldBlock` here (rather than accepting once per event) is required because
    /// `mio`'s readiness notifications are edge-triggered — a listener only reports readable
    /// again once its backlog transitions from empty to non-empty, so a single accept per event
    /// would strand any backlog left behind by the per-accept sleep.
    fn drain_ready_accepts(&mut self) {
        loop {
            match self.handle_new_connection() {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    /// Runs the accept loop until every worker's `running` flag has been cleared by a
    /// [`ShutdownHandle`]. On exit, joins every worker thread (phase two of shutdown) and sweeps
    /// the acceptor's own connection list.
    pub fn serve_forever(mut self) {
        let mut events = Events::with_capacity(self.max_events_per_wait);

        loop {
            // No per-tick update() hook: the source's subclass extension point has no behavior
            // to carry over here, so it's omitted rather than modeled as a no-op callback.
            match self.poll.poll(&mut events, Some(self.wait_timeout)) {
                Ok(()) => {
                    if events.iter().any(|e| e.token() == LISTEN_TOKEN) {
                        self.drain_ready_accepts();
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => tracing::warn!(error = %e, "readiness_wait failed"),
            }

            if !self.worker_handles.iter().any(|h| h.running()) {
                break;
            }
        }

        let closed = self.join_workers();
        self.sweep_connections();
        tracing::info!(closed, "acceptor stopped, all workers joined");
    }

    fn join_workers(&mut self) -> usize {
        let mut closed = 0usize;
        for thread in self.worker_threads.drain(..) {
            match thread.join() {
                Ok(n) => closed += n,
                Err(_) => tracing::error!("worker thread panicked"),
            }
        }
        closed
    }

    /// Releases the acceptor's own logical reference on every connection it has ever accepted.
    /// A client whose `ref_count` is still positive after this (meaning some worker never
    /// released its own share) is logged rather than silently leaked — a deliberate departure
    /// from the original implementation, which tolerates exactly this as a leak.
    fn sweep_connections(&mut self) {
        for client in self.connections.drain(..) {
            client.release_ref();
            if client.ref_count() > 0 {
                tracing::warn!(
                    client_id = client.client_id(),
                    ref_count = client.ref_count(),
                    "client outlived acceptor shutdown with references still held"
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    fn echo_handler() -> Handler {
        Arc::new(|client, packet| {
            let bytes = packet.bytes().to_vec();
            client
                .with_socket(|s| std::io::Write::write_all(s, &bytes))
                .map_err(|e| crate::error::HandlerError::new(e.to_string()))
        })
    }

    fn test_config(worker_count: usize) -> AcceptorConfig {
        AcceptorConfig {
            worker_count,
            worker_wait_timeout_ms: 20,
            acceptor_wait_timeout_ms: 20,
            ..Default::default()
        }
    }

    #[test]
    fn accepts_a_connection_and_echoes_a_frame() {
        let acceptor = Acceptor::new(test_config(1), echo_handler()).unwrap();
        let addr = acceptor.local_addr().unwrap();
        let shutdown = acceptor.shutdown_handle();
        let thread = thread::spawn(move || acceptor.serve_forever());

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"hello").unwrap();

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(b"hello", &buf);

        drop(stream);
        shutdown.request_shutdown();
        thread.join().unwrap();
    }

    #[test]
    fn distributes_connections_to_the_least_loaded_worker() {
        let acceptor = Acceptor::new(test_config(2), echo_handler()).unwrap();
        let addr = acceptor.local_addr().unwrap();

        // Keep both workers' handles around to inspect after dispatch by holding the acceptor on
        // this thread: open two connections before ever polling so each lands on a different
        // worker under any reasonable least-loaded tie-break.
        let _conn_a = TcpStream::connect(addr).unwrap();
        let _conn_b = TcpStream::connect(addr).unwrap();

        let worker_handles = acceptor.worker_handles.clone();
        thread::spawn(move || acceptor.serve_forever());
        thread::sleep(Duration::from_millis(100));

        let total: usize = worker_handles.iter().map(|h| h.size()).sum();
        assert_eq!(2, total);
        assert!(worker_handles.iter().all(|h| h.size() <= 1));
    }

    #[test]
    fn shutdown_handle_stops_the_pool_and_closes_open_connections() {
        let acceptor = Acceptor::new(test_config(2), echo_handler()).unwrap();
        let addr = acceptor.local_addr().unwrap();
        let worker_handles = acceptor.worker_handles.clone();
        let shutdown = acceptor.shutdown_handle();

        let conn_a = TcpStream::connect(addr).unwrap();
        let conn_b = TcpStream::connect(addr).unwrap();

        let thread = thread::spawn(move || acceptor.serve_forever());
        thread::sleep(Duration::from_millis(50));
        assert_eq!(2, worker_handles.iter().map(|h| h.size()).sum::<usize>());

        // Obtained before `acceptor` was moved into the serving thread — this is the whole point
        // of `ShutdownHandle`: `serve_forever` takes `self` by value, so nothing else could reach
        // a `request_shutdown` defined directly on `Acceptor` after this spawn.
        shutdown.request_shutdown();
        thread.join().unwrap();

        assert!(worker_handles.iter().all(|h| h.size() == 0));
        drop(conn_a);
        drop(conn_b);
    }

    #[test]
    fn connections_list_and_sweep_maintain_ref_count_invariant() {
        let mut acceptor = Acceptor::new(test_config(1), echo_handler()).unwrap();
        let addr = acceptor.local_addr().unwrap();
        let _conn = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(20));

        acceptor.handle_new_connection().unwrap();
        assert_eq!(1, acceptor.connections.len());

        let client = acceptor.connections[0].clone();
        // One reference for acceptor-list membership, one for the worker's client list.
        assert_eq!(2, client.ref_count());

        acceptor.sweep_connections();
        assert_eq!(0, acceptor.connections.len());
        assert_eq!(1, client.ref_count());
    }

    #[test]
    fn a_handler_failure_only_closes_the_connection_that_triggered_it() {
        let handler: Handler = Arc::new(|client, packet| {
            if packet.bytes() == b"boom" {
                return Err(crate::error::HandlerError::new("refused"));
            }
            let bytes = packet.bytes().to_vec();
            client
                .with_socket(|s| std::io::Write::write_all(s, &bytes))
                .map_err(|e| crate::error::HandlerError::new(e.to_string()))
        });

        let acceptor = Acceptor::new(test_config(1), handler).unwrap();
        let addr = acceptor.local_addr().unwrap();
        thread::spawn(move || acceptor.serve_forever());

        let mut bad = TcpStream::connect(addr).unwrap();
        let mut good = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(30));

        bad.write_all(b"boom").unwrap();
        let mut eof_buf = [0u8; 1];
        assert_eq!(0, bad.read(&mut eof_buf).unwrap());

        good.write_all(b"still here").unwrap();
        let mut buf = [0u8; 10];
        good.read_exact(&mut buf).unwrap();
        assert_eq!(b"still here", &buf);
    }

    #[test]
    #[ignore = "timing-sensitive: exercises the real 1-second accept-rate window"]
    fn accept_rate_caps_connections_accepted_within_one_second() {
        let mut config = test_config(1);
        config.accept_rate = 1;
        let acceptor = Acceptor::new(config, echo_handler()).unwrap();
        let addr = acceptor.local_addr().unwrap();
        let worker_handles = acceptor.worker_handles.clone();
        thread::spawn(move || acceptor.serve_forever());

        let _a = TcpStream::connect(addr).unwrap();
        let _b = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(100));

        assert_eq!(1, worker_handles.iter().map(|h| h.size()).sum::<usize>());

        thread::sleep(Duration::from_millis(1100));
        assert_eq!(2, worker_handles.iter().map(|h| h.size()).sum::<usize>());
    }

    #[test]
    #[ignore = "timing-sensitive: drives 10 connections through a real accept_rate=2 cap"]
    fn ten_connections_at_accept_rate_two_land_within_six_seconds() {
        let mut config = test_config(1);
        config.accept_rate = 2;
        let acceptor = Acceptor::new(config, echo_handler()).unwrap();
        let addr = acceptor.local_addr().unwrap();
        let worker_handles = acceptor.worker_handles.clone();
        thread::spawn(move || acceptor.serve_forever());

        let start = Instant::now();
        let _conns: Vec<_> = (0..10).map(|_| TcpStream::connect(addr).unwrap()).collect();

        while worker_handles.iter().map(|h| h.size()).sum::<usize>() < 10 {
            assert!(
                start.elapsed() < Duration::from_secs(6),
                "10 connections at accept_rate=2 should land within 6s"
            );
            thread::sleep(Duration::from_millis(20));
        }
    }
}
