//! The connection contract consumed by the streaming core, and node handles.

use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

/// A bidirectional peer transport, as seen by the output side.
///
/// Implementations are shared across streams and own their send lock. A
/// multi-part send (header, chunks, padding) stays contiguous on the wire as
/// long as the caller holds the guard from [`Connection::lock_send`] across
/// all of its [`Connection::send_unlocked`] calls; everything else goes
/// through [`Connection::send`], which takes the lock per call.
pub trait Connection: Send + Sync {
    /// Sends bytes while the caller holds the send lock.
    fn send_unlocked(&self, bytes: &[u8]) -> std::io::Result<()>;

    /// Acquires the send lock, serialising concurrent senders.
    fn lock_send(&self) -> MutexGuard<'_, ()>;

    /// Atomically sends one contiguous byte run.
    fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        let _guard = self.lock_send();
        self.send_unlocked(bytes)
    }

    /// Transport metadata for diagnostics.
    fn description(&self) -> String;
}

/// A peer in the node directory: its id and the connections that reach it.
pub struct Node {
    id: Uuid,
    connection: Arc<dyn Connection>,
    multicast: Option<Arc<dyn Connection>>,
}

impl Node {
    /// Creates a node reachable over a unicast connection only.
    pub fn new(id: Uuid, connection: Arc<dyn Connection>) -> Self {
        Self {
            id,
            connection,
            multicast: None,
        }
    }

    /// Attaches a shared multicast-group connection.
    pub fn with_multicast(mut self, multicast: Arc<dyn Connection>) -> Self {
        self.multicast = Some(multicast);
        self
    }

    /// The node id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The connection to use for this node.
    ///
    /// Returns the multicast connection when one is attached and the caller
    /// asked for it, the unicast connection otherwise.
    pub fn connection(&self, use_multicast: bool) -> Arc<dyn Connection> {
        if use_multicast {
            if let Some(mc) = &self.multicast {
                return Arc::clone(mc);
            }
        }
        Arc::clone(&self.connection)
    }
}

/// Resolves a node group to its recipient connections.
///
/// With `use_multicast`, nodes sharing one multicast-capable connection
/// collapse to a single entry, so a group send hits the wire once.
pub fn gather_connections(nodes: &[Arc<Node>], use_multicast: bool) -> Vec<Arc<dyn Connection>> {
    let mut connections: Vec<Arc<dyn Connection>> = Vec::with_capacity(nodes.len());
    for node in nodes {
        let connection = node.connection(use_multicast);
        if connections.iter().any(|c| Arc::ptr_eq(c, &connection)) {
            continue;
        }
        connections.push(connection);
    }
    connections
}

/// An in-process loopback connection.
///
/// Bytes sent into the pipe accumulate in a log that the owning side drains.
/// Used for intra-process plumbing and as the reference transport in tests.
pub struct PipeConnection {
    name: String,
    log: Mutex<Vec<u8>>,
    send_lock: Mutex<()>,
}

impl PipeConnection {
    /// Creates a named pipe with an empty log.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            log: Mutex::new(Vec::new()),
            send_lock: Mutex::new(()),
        }
    }

    /// Drains and returns everything sent so far.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut self.log.lock().expect("pipe log poisoned"))
    }

    /// A copy of everything sent so far.
    pub fn received(&self) -> Vec<u8> {
        self.log.lock().expect("pipe log poisoned").clone()
    }

    /// Number of bytes sent so far.
    pub fn len(&self) -> usize {
        self.log.lock().expect("pipe log poisoned").len()
    }

    /// Whether nothing was sent yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Connection for PipeConnection {
    fn send_unlocked(&self, bytes: &[u8]) -> std::io::Result<()> {
        self.log
            .lock()
            .expect("pipe log poisoned")
            .extend_from_slice(bytes);
        Ok(())
    }

    fn lock_send(&self) -> MutexGuard<'_, ()> {
        self.send_lock.lock().expect("pipe send lock poisoned")
    }

    fn description(&self) -> String {
        format!("pipe:{}", self.name)
    }
}
