//! Node registrar and its acceptor driver.
//!
//! The [`NodeRegistrar`] is the ordered, append-only list of every worker
//! handle the dispatcher knows. It is appended from the driver thread and
//! iterated from the dispatch thread, under a single lock that is only
//! held for list access, never across node I/O: callers snapshot the
//! handles they need and drop to the per-node lock.
//!
//! The [`RegistrarDriver`] runs on its own thread. It accepts a worker
//! connection, reads the role announcement, assigns the next node id,
//! acknowledges it, appends the handle, and invokes the registration
//! callback, which attaches the per-worker state machine. The callback
//! runs on the driver thread concurrently with dispatch polling and must
//! only touch the machine lists it captured.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use corral_core::node::{NodeRole, NodeStatus};
use corral_core::protocol::framing::FramedStream;
use tracing::{debug, info, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::node::{new_handle, Node, NodeHandle, TcpTransport};

/// How long the driver sleeps when no connection is pending.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a registering peer gets to announce its role.
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Ordered, append-only registry of worker handles.
#[derive(Debug, Default)]
pub struct NodeRegistrar {
    nodes: Vec<NodeHandle>,
}

impl NodeRegistrar {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handle. Handles are never removed during a run.
    pub fn push(&mut self, handle: NodeHandle) {
        self.nodes.push(handle);
    }

    /// The registered handles, in registration order.
    #[must_use]
    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    /// Number of registered workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether any worker has registered yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Shared ownership of the registry between the driver and dispatch.
pub type SharedRegistrar = Arc<Mutex<NodeRegistrar>>;

/// Create an empty shared registry.
#[must_use]
pub fn shared_registrar() -> SharedRegistrar {
    Arc::new(Mutex::new(NodeRegistrar::new()))
}

/// Acquire the registry lock, recovering from a poisoned lock.
pub fn lock_registrar(registrar: &SharedRegistrar) -> std::sync::MutexGuard<'_, NodeRegistrar> {
    registrar
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Handle to the running acceptor thread.
pub struct RegistrarDriver {
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    local_port: u16,
}

impl RegistrarDriver {
    /// Bind the master port and launch the acceptor thread.
    ///
    /// `on_register` is invoked on the driver thread for every registered
    /// handle, after it has been appended to the registry.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Bind`] if the port cannot be bound.
    pub fn launch<F>(
        port: u16,
        registrar: SharedRegistrar,
        on_register: F,
    ) -> DispatchResult<Self>
    where
        F: Fn(&NodeHandle) + Send + 'static,
    {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .map_err(|source| DispatchError::Bind { port, source })?;
        let local_port = listener
            .local_addr()
            .map_err(|source| DispatchError::Bind { port, source })?
            .port();
        listener
            .set_nonblocking(true)
            .map_err(|source| DispatchError::Bind { port, source })?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        let thread = std::thread::Builder::new()
            .name("corral-registrar".to_string())
            .spawn(move || accept_loop(&listener, &registrar, &on_register, &thread_shutdown))
            .map_err(|source| DispatchError::Bind { port, source })?;

        info!(port = local_port, "node registrar listening");
        Ok(Self {
            thread: Some(thread),
            shutdown,
            local_port,
        })
    }

    /// Port the driver is actually listening on (relevant when launched
    /// with port 0).
    #[must_use]
    pub const fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Signal the acceptor to stop and wait for the thread to exit.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("registrar thread panicked during shutdown");
            }
        }
    }
}

impl Drop for RegistrarDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop<F>(
    listener: &TcpListener,
    registrar: &SharedRegistrar,
    on_register: &F,
    shutdown: &AtomicBool,
) where
    F: Fn(&NodeHandle),
{
    let mut next_id: u32 = 1;

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                debug!(%addr, "worker connecting");
                match register(stream, next_id) {
                    Ok(handle) => {
                        next_id += 1;
                        lock_registrar(registrar).push(Arc::clone(&handle));
                        on_register(&handle);
                    }
                    Err(e) => warn!(%addr, error = %e, "worker registration failed"),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

/// Complete the registration exchange on a fresh connection.
fn register(stream: TcpStream, id: u32) -> DispatchResult<NodeHandle> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(REGISTRATION_TIMEOUT))?;

    let mut framed = FramedStream::new(stream);
    let (header, _payload) = framed.recv()?;
    let kind = header.packet_kind()?;
    let role = NodeRole::from_registration(kind).ok_or_else(|| {
        DispatchError::InvalidRegistration {
            kind: kind.name().to_string(),
        }
    })?;

    // Acknowledge with the assigned id; the worker uses it in every
    // subsequent header.
    framed.send(id, kind, &[])?;

    let stream = framed.into_inner();
    stream.set_read_timeout(None)?;

    let status = NodeStatus {
        id,
        role,
        ..NodeStatus::default()
    };
    let handle = new_handle(Node::new(status, Box::new(TcpTransport::new(stream))));
    info!(id, role = %role, "worker registered");
    Ok(handle)
}
