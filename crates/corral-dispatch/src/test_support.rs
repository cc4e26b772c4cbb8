//! Scripted transports and node builders shared by the unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use corral_core::node::{NodeRole, NodeStatus};
use corral_core::protocol::{PacketHeader, PacketKind, ProtocolError, ProtocolResult};
use serde::Serialize;

use crate::node::{new_handle, Node, NodeHandle, Transport};

/// Shared record of every frame kind a scripted transport sent.
pub type SentLog = Arc<Mutex<Vec<PacketKind>>>;

/// In-memory transport with canned replies.
///
/// Sends are recorded in a shared log; receives pop the next queued
/// reply. An exhausted reply queue behaves like a peer hang-up, and a
/// kind can be armed to fail the next send, for error-path tests.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: VecDeque<(PacketKind, Vec<u8>)>,
    log: SentLog,
    fail_on_send: Option<PacketKind>,
}

impl ScriptedTransport {
    /// Queue a serialized reply frame.
    pub fn push_reply<T: Serialize>(&mut self, kind: PacketKind, message: &T) {
        let payload = serde_json::to_vec(message).expect("test reply serializes");
        self.replies.push_back((kind, payload));
    }

    /// Queue a status reply with the given counts.
    pub fn push_status_reply(&mut self, status: &NodeStatus) {
        self.push_reply(PacketKind::Status, status);
    }

    /// Fail the next send of the given kind with an I/O error.
    pub fn fail_on_send(&mut self, kind: PacketKind) {
        self.fail_on_send = Some(kind);
    }

    /// Handle onto the log of sent frame kinds.
    pub fn log_handle(&self) -> SentLog {
        Arc::clone(&self.log)
    }
}

impl Transport for ScriptedTransport {
    fn send(&mut self, _id: u32, kind: PacketKind, _payload: &[u8]) -> ProtocolResult<()> {
        if self.fail_on_send == Some(kind) {
            self.fail_on_send = None;
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "scripted send failure",
            )));
        }
        self.log.lock().unwrap().push(kind);
        Ok(())
    }

    fn recv(&mut self) -> ProtocolResult<(PacketHeader, Vec<u8>)> {
        let (kind, payload) = self
            .replies
            .pop_front()
            .ok_or(ProtocolError::ConnectionClosed)?;
        #[allow(clippy::cast_possible_truncation)]
        let header = PacketHeader::new(0, kind, payload.len() as u32);
        Ok((header, payload))
    }
}

/// Build a node handle with the given identity over a scripted transport.
pub fn scripted_node(id: u32, role: NodeRole, transport: ScriptedTransport) -> NodeHandle {
    let status = NodeStatus {
        id,
        role,
        ..NodeStatus::default()
    };
    new_handle(Node::new(status, Box::new(transport)))
}

/// A status report for a worker with the given queue depths.
pub fn status_report(
    role: NodeRole,
    active: bool,
    trace_count: u64,
    test_case_count: u64,
    error_count: u64,
) -> NodeStatus {
    NodeStatus {
        id: 0,
        role,
        active,
        trace_count,
        test_case_count,
        error_count,
    }
}
