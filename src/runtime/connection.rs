//! Connection state and the shared connection registry.
//!
//! Each accepted connection owns its socket, a pool-backed frame buffer and
//! the current protocol phase, all behind one `Mutex`. The registry maps
//! slab ids (also used as mio tokens) to those connections.

use crate::protocol::FrameHeader;
use crate::runtime::buffer::BufferPool;
use mio::net::TcpStream;
use mio::Interest;
use slab::Slab;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Where a connection is in its message cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnPhase {
    /// Between frames; nothing buffered and no deadline.
    Idle,
    /// Accumulating the 12-byte header.
    AwaitHeader {
        /// Header bytes read so far.
        filled: usize,
        deadline: Instant,
    },
    /// Header validated; accumulating the payload.
    AwaitPayload {
        header: FrameHeader,
        /// Declared payload length.
        length: usize,
        /// Payload bytes read so far.
        filled: usize,
        deadline: Instant,
    },
    /// Writing header + payload back.
    Echo {
        /// Bytes already written.
        written: usize,
        /// Total bytes to write.
        total: usize,
        deadline: Instant,
    },
    /// Torn down; no further I/O.
    Closed,
}

impl ConnPhase {
    /// Deadline of the current phase, if one is armed.
    pub fn deadline(&self) -> Option<Instant> {
        match *self {
            ConnPhase::AwaitHeader { deadline, .. }
            | ConnPhase::AwaitPayload { deadline, .. }
            | ConnPhase::Echo { deadline, .. } => Some(deadline),
            ConnPhase::Idle | ConnPhase::Closed => None,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ConnPhase::Idle => "idle",
            ConnPhase::AwaitHeader { .. } => "header",
            ConnPhase::AwaitPayload { .. } => "payload",
            ConnPhase::Echo { .. } => "echo",
            ConnPhase::Closed => "closed",
        }
    }
}

/// A single accepted connection.
#[derive(Debug)]
pub struct Connection {
    id: usize,
    peer: SocketAddr,
    /// Worker whose poll this connection is registered with.
    worker: usize,
    /// `None` once closed.
    pub(crate) stream: Option<TcpStream>,
    /// Frame buffer: header slot followed by the payload area.
    pub(crate) buffer: Vec<u8>,
    pub(crate) phase: ConnPhase,
    /// Interest currently registered with the poll.
    pub(crate) interest: Interest,
}

impl Connection {
    fn new(id: usize, stream: TcpStream, peer: SocketAddr, worker: usize, buffer: Vec<u8>) -> Self {
        Self {
            id,
            peer,
            worker,
            stream: Some(stream),
            buffer,
            phase: ConnPhase::Idle,
            interest: Interest::READABLE,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn phase(&self) -> ConnPhase {
        self.phase
    }

    pub fn is_open(&self) -> bool {
        self.phase != ConnPhase::Closed
    }

    /// Deregister and drop the socket, handing back the frame buffer.
    ///
    /// Returns `None` if the connection was already closed.
    pub(crate) fn close(&mut self, poll: &mio::Registry) -> Option<Vec<u8>> {
        if self.phase == ConnPhase::Closed {
            return None;
        }
        self.phase = ConnPhase::Closed;
        if let Some(mut stream) = self.stream.take() {
            let _ = poll.deregister(&mut stream);
        }
        Some(std::mem::take(&mut self.buffer))
    }
}

/// Shared handle to a registered connection.
pub type ConnectionRef = Arc<Mutex<Connection>>;

/// Lock a connection, recovering from a poisoned lock.
///
/// A handler that panicked mid-cycle leaves the phase intact; the next
/// event or deadline sweep tears the connection down.
pub fn lock(conn: &ConnectionRef) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// `max_connections` reached.
    Full,
    /// No frame buffer available.
    PoolExhausted,
    /// Unknown connection id.
    NotFound,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Full => write!(f, "connection limit reached"),
            RegistryError::PoolExhausted => write!(f, "buffer pool exhausted"),
            RegistryError::NotFound => write!(f, "connection not found"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Registry of active connections using slab allocation.
///
/// Thread-safe: the internal guards are held only while the map or pool is
/// mutated, never across socket I/O. Callers clone the `ConnectionRef` out
/// and lock it separately.
pub struct ConnectionRegistry {
    connections: Mutex<Slab<ConnectionRef>>,
    buffers: Mutex<BufferPool>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a registry holding at most `max_connections`, each with a
    /// `buffer_size` byte frame buffer.
    pub fn new(max_connections: usize, buffer_size: usize) -> Self {
        // Keep the up-front allocation modest; the pool grows on demand.
        let preallocate = max_connections.min(256);
        Self {
            connections: Mutex::new(Slab::with_capacity(preallocate)),
            buffers: Mutex::new(BufferPool::new(max_connections, buffer_size, preallocate)),
            max_connections,
        }
    }

    /// Register a new connection, allocating its buffer and lock.
    ///
    /// Returns the id (usable as a mio token) and the shared handle.
    pub fn register(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        worker: usize,
    ) -> Result<(usize, ConnectionRef), RegistryError> {
        let mut connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        if connections.len() >= self.max_connections {
            return Err(RegistryError::Full);
        }

        let buffer = self
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .alloc()
            .ok_or(RegistryError::PoolExhausted)?;

        let entry = connections.vacant_entry();
        let id = entry.key();
        let conn = Arc::new(Mutex::new(Connection::new(id, stream, peer, worker, buffer)));
        entry.insert(Arc::clone(&conn));
        Ok((id, conn))
    }

    /// Look up a connection by id.
    pub fn lookup(&self, id: usize) -> Result<ConnectionRef, RegistryError> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or(RegistryError::NotFound)
    }

    /// Remove a connection from the registry.
    ///
    /// Returns `None` if it was already removed, which makes teardown
    /// idempotent.
    pub fn unregister(&self, id: usize) -> Option<ConnectionRef> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_remove(id)
    }

    /// Return a closed connection's buffer to the pool.
    pub fn release_buffer(&self, buffer: Vec<u8>) {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .free(buffer);
    }

    /// Ids of the connections owned by `worker`.
    pub fn ids_for_worker(&self, worker: usize) -> Vec<usize> {
        let snapshot: Vec<(usize, ConnectionRef)> = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, conn)| (id, Arc::clone(conn)))
            .collect();

        // Connection locks are taken only after the registry guard is gone.
        snapshot
            .into_iter()
            .filter(|(_, conn)| lock(conn).worker() == worker)
            .map(|(id, _)| id)
            .collect()
    }

    /// Remove every connection (used once all workers have stopped).
    pub fn drain(&self) -> Vec<ConnectionRef> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect()
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Buffers currently owned by open connections.
    pub fn buffers_in_use(&self) -> usize {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .outstanding()
    }
}
