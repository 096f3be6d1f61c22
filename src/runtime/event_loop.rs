//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS; both are edge-triggered under mio,
//! so every readiness notification is drained until `WouldBlock`.
//!
//! Each worker thread owns one `Poll` and one `SO_REUSEPORT` listener; the
//! kernel spreads accepts across them. A connection is registered with the
//! poll of the worker that accepted it and is only ever handled there.

use crate::config::{ConfigError, ServerConfig};
use crate::protocol::HEADER_LEN;
use crate::runtime::connection::{lock, ConnectionRegistry};
use crate::runtime::handler::{check_deadline, handle_ready, HandlerError, HandlerLimits, Status};
use crate::stats::Stats;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Upper bound on a single poll wait.
const TICK: Duration = Duration::from_millis(100);

/// Server startup and runtime errors.
#[derive(Debug)]
pub enum ServerError {
    Config(ConfigError),
    Bind(SocketAddr, io::Error),
    Listen(SocketAddr, io::Error),
    Io(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Config(e) => write!(f, "{e}"),
            ServerError::Bind(addr, e) => write!(f, "Failed to bind {addr}: {e}"),
            ServerError::Listen(addr, e) => write!(f, "Failed to listen on {addr}: {e}"),
            ServerError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Config(e) => Some(e),
            ServerError::Bind(_, e) | ServerError::Listen(_, e) | ServerError::Io(e) => Some(e),
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}

/// Stops a running [`EchoServer`] from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    wakers: Arc<Vec<Arc<Waker>>>,
}

impl ShutdownHandle {
    /// Ask every worker to close its listener and connections and exit.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        for waker in self.wakers.iter() {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "Failed to wake worker");
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Per-worker resources created at bind time.
struct WorkerSetup {
    poll: Poll,
    listener: TcpListener,
}

/// Everything a worker thread needs.
struct Worker {
    id: usize,
    poll: Poll,
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<Stats>,
    limits: HandlerLimits,
    max_events: usize,
    stop: Arc<AtomicBool>,
    /// Armed phase deadlines of this worker's connections.
    deadlines: HashMap<usize, Instant>,
}

/// Length-prefixed echo server.
pub struct EchoServer {
    local_addr: SocketAddr,
    workers: Vec<WorkerSetup>,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<Stats>,
    limits: HandlerLimits,
    max_events: usize,
    shutdown: ShutdownHandle,
}

impl EchoServer {
    /// Bind one listener and poll per worker.
    ///
    /// Port 0 binds an ephemeral port, shared by every worker.
    pub fn bind(config: ServerConfig, stats: Arc<Stats>) -> Result<Self, ServerError> {
        let num_workers = config.worker_count();
        let mut addr = config.listen_addr().map_err(ServerError::Config)?;

        let mut workers = Vec::with_capacity(num_workers);
        let mut wakers = Vec::with_capacity(num_workers);

        for worker_id in 0..num_workers {
            let listener = create_listener_with_reuseport(addr)?;
            if worker_id == 0 {
                addr = listener.local_addr()?;
            }
            let mut listener = TcpListener::from_std(listener);

            let poll = Poll::new()?;
            poll.registry()
                .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
            wakers.push(Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?));

            workers.push(WorkerSetup { poll, listener });
        }

        let registry = Arc::new(ConnectionRegistry::new(
            config.max_connections,
            HEADER_LEN + config.max_payload,
        ));

        info!(
            workers = num_workers,
            addr = %addr,
            max_connections = registry.capacity(),
            max_payload = config.max_payload,
            "Echo server initialized"
        );

        Ok(Self {
            local_addr: addr,
            workers,
            registry,
            stats,
            limits: HandlerLimits {
                max_payload: config.max_payload,
                header_timeout: config.header_timeout,
                payload_timeout: config.payload_timeout,
                drain_trailing: config.drain_trailing,
            },
            max_events: config.max_events,
            shutdown: ShutdownHandle {
                stop: Arc::new(AtomicBool::new(false)),
                wakers: Arc::new(wakers),
            },
        })
    }

    /// Address the listeners are bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Run the worker threads; returns only after shutdown.
    pub fn run(self) -> Result<(), ServerError> {
        let EchoServer {
            local_addr,
            workers,
            registry,
            stats,
            limits,
            max_events,
            shutdown,
        } = self;

        let mut handles = Vec::with_capacity(workers.len());

        for (worker_id, setup) in workers.into_iter().enumerate() {
            let mut worker = Worker {
                id: worker_id,
                poll: setup.poll,
                listener: setup.listener,
                registry: Arc::clone(&registry),
                stats: Arc::clone(&stats),
                limits,
                max_events,
                stop: Arc::clone(&shutdown.stop),
                deadlines: HashMap::new(),
            };

            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || {
                    if let Err(e) = worker.run() {
                        error!(worker = worker_id, error = %e, "Worker failed");
                    }
                    worker.shutdown();
                })?;

            handles.push(handle);
        }

        info!(addr = %local_addr, "Listening for connections");

        // Wait for all workers
        for handle in handles {
            let _ = handle.join();
        }

        // Anything a failed worker left behind
        for conn in registry.drain() {
            let mut conn = lock(&conn);
            conn.stream.take();
            let buffer = std::mem::take(&mut conn.buffer);
            registry.release_buffer(buffer);
        }

        let totals = stats.snapshot();
        info!(
            connections = totals.connections,
            received = totals.received,
            echoed = totals.sent,
            errors = totals.errors,
            "Echo server stopped"
        );
        Ok(())
    }
}

impl Worker {
    fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.max_events);

        info!(worker = self.id, "Worker started");

        while !self.stop.load(Ordering::SeqCst) {
            let timeout = self.next_timeout(Instant::now());
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {}
                    LISTENER_TOKEN => self.accept_connections(),
                    Token(conn_id) => self.handle_connection_event(conn_id, event),
                }
            }

            self.sweep_deadlines(Instant::now());
        }
        Ok(())
    }

    /// Time until the nearest phase deadline, capped at one tick.
    fn next_timeout(&self, now: Instant) -> Option<Duration> {
        let nearest = self
            .deadlines
            .values()
            .min()
            .map_or(TICK, |deadline| deadline.saturating_duration_since(now));
        Some(nearest.min(TICK))
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    let _ = stream.set_nodelay(true);
                    let (conn_id, conn) = match self.registry.register(stream, peer_addr, self.id) {
                        Ok(registered) => registered,
                        Err(e) => {
                            warn!(peer = %peer_addr, error = %e, "Rejecting connection");
                            continue;
                        }
                    };

                    let registered = {
                        let mut guard = lock(&conn);
                        match guard.stream.as_mut() {
                            Some(stream) => self.poll.registry().register(
                                stream,
                                Token(conn_id),
                                Interest::READABLE,
                            ),
                            None => Ok(()),
                        }
                    };
                    if let Err(e) = registered {
                        error!(conn_id, error = %e, "Failed to register connection");
                        self.close_connection(conn_id);
                        continue;
                    }

                    self.stats.record_connection();
                    debug!(
                        worker = self.id,
                        conn_id,
                        peer = %peer_addr,
                        "Accepted connection"
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_connection_event(&mut self, conn_id: usize, event: &mio::event::Event) {
        // Stale event for a connection closed earlier in this batch
        let Ok(conn) = self.registry.lookup(conn_id) else {
            return;
        };

        let result = {
            let mut guard = lock(&conn);
            // The id may have been reused by another worker after a close.
            if guard.worker() != self.id || !guard.is_open() {
                return;
            }
            if event.is_error() {
                let cause = guard
                    .stream
                    .as_ref()
                    .and_then(|s| s.take_error().ok().flatten())
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "socket error"));
                Err(HandlerError::Io(cause))
            } else {
                handle_ready(
                    &mut guard,
                    self.poll.registry(),
                    Token(conn_id),
                    &self.limits,
                    &self.stats,
                )
            }
        };

        match result {
            Ok(Status::Parked {
                deadline: Some(deadline),
            }) => {
                self.deadlines.insert(conn_id, deadline);
            }
            Ok(Status::Parked { deadline: None }) => {
                self.deadlines.remove(&conn_id);
            }
            Ok(Status::Finished) => {
                debug!(conn_id, "Client disconnected");
                self.close_connection(conn_id);
            }
            Err(e) => self.fail_connection(conn_id, e),
        }
    }

    /// Tear down connections whose phase deadline has passed.
    fn sweep_deadlines(&mut self, now: Instant) {
        let expired: Vec<usize> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(conn_id, _)| *conn_id)
            .collect();

        for conn_id in expired {
            self.deadlines.remove(&conn_id);
            let Ok(conn) = self.registry.lookup(conn_id) else {
                continue;
            };

            let verdict = {
                let guard = lock(&conn);
                if guard.worker() != self.id {
                    continue;
                }
                let phase = guard.phase();
                check_deadline(&phase, now).map(|()| phase.deadline())
            };

            match verdict {
                Ok(Some(later)) => {
                    self.deadlines.insert(conn_id, later);
                }
                Ok(None) => {}
                Err(e) => self.fail_connection(conn_id, e),
            }
        }
    }

    fn fail_connection(&mut self, conn_id: usize, e: HandlerError) {
        self.stats.record_error();
        match e {
            HandlerError::Io(ref io_err) => {
                debug!(conn_id, error = %io_err, "Connection error")
            }
            _ => warn!(conn_id, error = %e, "Closing connection"),
        }
        self.close_connection(conn_id);
    }

    /// Single teardown path: unregister, deregister, close, release buffer.
    ///
    /// Safe to call more than once; only the first call does anything.
    fn close_connection(&mut self, conn_id: usize) {
        self.deadlines.remove(&conn_id);
        let Some(conn) = self.registry.unregister(conn_id) else {
            return;
        };
        let buffer = lock(&conn).close(self.poll.registry());
        if let Some(buffer) = buffer {
            self.registry.release_buffer(buffer);
        }
        debug!(conn_id, "Connection closed");
    }

    /// Release the listener and every connection this worker owns.
    fn shutdown(&mut self) {
        let _ = self.poll.registry().deregister(&mut self.listener);
        let owned = self.registry.ids_for_worker(self.id);
        let count = owned.len();
        for conn_id in owned {
            self.close_connection(conn_id);
        }
        info!(worker = self.id, closed = count, "Worker stopped");
    }
}

/// Create a TCP listener with SO_REUSEPORT for kernel load balancing.
fn create_listener_with_reuseport(addr: SocketAddr) -> Result<std::net::TcpListener, ServerError> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .map_err(|e| ServerError::Bind(addr, e))?;
    socket.listen(1024).map_err(|e| ServerError::Listen(addr, e))?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_frame, FrameHeader};
    use std::io::{Read, Write};
    use std::net::TcpStream;

    fn test_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            workers: 2,
            max_payload: 64,
            header_timeout: Duration::from_millis(200),
            ..ServerConfig::default()
        }
    }

    type Running = (
        SocketAddr,
        ShutdownHandle,
        Arc<ConnectionRegistry>,
        Arc<Stats>,
        thread::JoinHandle<()>,
    );

    fn start(config: ServerConfig) -> Running {
        let max_connections = config.max_connections;
        let stats = Arc::new(Stats::new());
        let server = EchoServer::bind(config, Arc::clone(&stats)).unwrap();
        let addr = server.local_addr();
        let handle = server.shutdown_handle();
        let registry = server.registry();
        assert_eq!(registry.capacity(), max_connections);
        let join = thread::spawn(move || server.run().unwrap());
        (addr, handle, registry, stats, join)
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
    }

    /// Read until EOF or error; returns bytes read.
    fn read_to_close(stream: &mut TcpStream) -> usize {
        let mut buf = [0u8; 256];
        let mut total = 0;
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => return total,
                Ok(n) => total += n,
            }
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn test_echo_multiple_messages_on_one_connection() {
        let (addr, handle, _, stats, join) = start(test_config());
        let mut client = connect(addr);

        for id in 0..3u32 {
            let frame = encode_frame(&FrameHeader::new(8, id), &[b'a'; 8]);
            client.write_all(&frame).unwrap();
            let mut echoed = vec![0u8; frame.len()];
            client.read_exact(&mut echoed).unwrap();
            assert_eq!(&echoed[..], &frame[..]);
        }

        handle.shutdown();
        join.join().unwrap();
        let snap = stats.snapshot();
        assert_eq!(snap.received, 3);
        assert_eq!(snap.sent, 3);
        assert_eq!(snap.errors, 0);
    }

    #[test]
    fn test_bad_magic_closes_without_echo() {
        let (addr, handle, _, stats, join) = start(test_config());
        let mut client = connect(addr);

        let mut frame = encode_frame(&FrameHeader::new(4, 0), b"ping").to_vec();
        frame[..4].copy_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        client.write_all(&frame).unwrap();

        assert_eq!(read_to_close(&mut client), 0);
        assert!(wait_for(|| stats.snapshot().errors == 1));

        handle.shutdown();
        join.join().unwrap();
        assert_eq!(stats.snapshot().sent, 0);
    }

    #[test]
    fn test_partial_header_times_out() {
        let (addr, handle, registry, stats, join) = start(test_config());
        let mut client = connect(addr);

        client.write_all(&[0x45, 0x43]).unwrap();
        assert!(wait_for(|| registry.len() == 1));

        // Header timeout is 200ms
        assert_eq!(read_to_close(&mut client), 0);
        assert!(wait_for(|| registry.is_empty()));
        assert_eq!(registry.buffers_in_use(), 0);
        assert_eq!(stats.snapshot().errors, 1);

        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn test_idle_connection_is_not_timed_out() {
        let (addr, handle, registry, stats, join) = start(test_config());
        let _client = connect(addr);

        assert!(wait_for(|| registry.len() == 1));
        thread::sleep(Duration::from_millis(400));
        assert_eq!(registry.len(), 1);
        assert_eq!(stats.snapshot().errors, 0);

        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn test_shutdown_releases_connections() {
        let (addr, handle, registry, stats, join) = start(test_config());
        let clients: Vec<_> = (0..4).map(|_| connect(addr)).collect();

        assert!(wait_for(|| registry.len() == 4));
        assert_eq!(stats.snapshot().connections, 4);

        handle.shutdown();
        join.join().unwrap();

        assert!(handle.is_shutdown());
        assert!(registry.is_empty());
        assert_eq!(registry.buffers_in_use(), 0);
        for mut client in clients {
            assert_eq!(read_to_close(&mut client), 0);
        }
    }

    #[test]
    fn test_large_echo_resumes_after_partial_writes() {
        let size = 8 * 1024 * 1024;
        let config = ServerConfig {
            workers: 1,
            max_connections: 2,
            max_payload: size,
            payload_timeout: Duration::from_secs(5),
            ..test_config()
        };
        let (addr, handle, registry, stats, join) = start(config);
        let mut client = connect(addr);

        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let frame = encode_frame(&FrameHeader::new(size as u32, 5), &payload);

        // The echo exceeds the socket buffers, so the server has to park on
        // WRITABLE until this side reads.
        let mut writer = client.try_clone().unwrap();
        let outgoing = frame.clone();
        let sender = thread::spawn(move || writer.write_all(&outgoing).unwrap());

        let mut echoed = vec![0u8; frame.len()];
        client.read_exact(&mut echoed).unwrap();
        sender.join().unwrap();
        assert!(echoed[..] == frame[..], "echo differs from request");

        handle.shutdown();
        join.join().unwrap();
        let snap = stats.snapshot();
        assert_eq!(snap.received, 1);
        assert_eq!(snap.sent, 1);
        assert_eq!(snap.errors, 0);
        assert_eq!(registry.buffers_in_use(), 0);
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ServerConfig {
            port: holder.local_addr().unwrap().port(),
            ..test_config()
        };
        match EchoServer::bind(config, Arc::new(Stats::new())) {
            Err(ServerError::Bind(_, _)) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("bind should fail while the port is held"),
        }
    }
}
