//! Worker node handles.
//!
//! Each remote worker is represented by a [`Node`]: its registrar-assigned
//! status plus the transport the dispatcher talks to it over. Handles are
//! shared between the registrar (which owns the list) and exactly one
//! per-worker state machine, so a node lives behind `Arc<Mutex<..>>`; the
//! lock is held for the duration of a single protocol round-trip, making
//! each exchange atomic with respect to every other operation on that
//! worker.

use std::net::TcpStream;
use std::sync::{Arc, Mutex, MutexGuard};

use corral_core::node::NodeStatus;
use corral_core::protocol::framing::FramedStream;
use corral_core::protocol::{PacketKind, ProtocolResult};

/// Frame-level transport to one worker.
///
/// This is the seam the state machines are tested through: production
/// nodes wrap a [`TcpStream`], tests substitute scripted transports.
pub trait Transport: Send {
    /// Send one frame.
    fn send(&mut self, id: u32, kind: PacketKind, payload: &[u8]) -> ProtocolResult<()>;

    /// Receive one frame.
    fn recv(&mut self) -> ProtocolResult<(corral_core::PacketHeader, Vec<u8>)>;
}

/// Production transport over a TCP stream.
#[derive(Debug)]
pub struct TcpTransport {
    framed: FramedStream<TcpStream>,
}

impl TcpTransport {
    /// Wrap a connected stream.
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        Self {
            framed: FramedStream::new(stream),
        }
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, id: u32, kind: PacketKind, payload: &[u8]) -> ProtocolResult<()> {
        self.framed.send(id, kind, payload)
    }

    fn recv(&mut self) -> ProtocolResult<(corral_core::PacketHeader, Vec<u8>)> {
        self.framed.recv()
    }
}

/// One registered worker: status plus transport.
pub struct Node {
    /// Last known status. `id` and `role` are fixed at registration;
    /// the remaining fields are refreshed by status polls.
    pub status: NodeStatus,
    /// Transport to the worker.
    pub transport: Box<dyn Transport>,
}

impl Node {
    /// Build a node from its registration-time status and transport.
    #[must_use]
    pub fn new(status: NodeStatus, transport: Box<dyn Transport>) -> Self {
        Self { status, transport }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("status", &self.status).finish()
    }
}

/// Shared ownership of a node between the registrar and its machine.
pub type NodeHandle = Arc<Mutex<Node>>;

/// Wrap a node into a shareable handle.
#[must_use]
pub fn new_handle(node: Node) -> NodeHandle {
    Arc::new(Mutex::new(node))
}

/// Acquire a node's lock, recovering the guard if a previous holder
/// panicked; node state is a plain snapshot and stays usable.
pub fn lock(handle: &NodeHandle) -> MutexGuard<'_, Node> {
    handle.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
