//! Worker protocol primitives.
//!
//! One function per protocol round-trip. Every function acquires the
//! worker handle's lock on entry and holds it for the whole exchange, so
//! a request and its response can never interleave with another
//! operation on the same worker. No function takes a second handle; the
//! lock order is always registrar before node, never node before node.

use corral_core::image::{ImageInfo, OsImage};
use corral_core::node::{NodeError, NodeStatus};
use corral_core::options::DispatchOptions;
use corral_core::protocol::{PacketKind, ProtocolError, ProtocolResult};
use corral_core::test_case::TestCase;
use corral_core::trace::Trace;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::node::{lock, Node, NodeHandle};

fn send_message<T: Serialize>(node: &mut Node, kind: PacketKind, message: &T) -> ProtocolResult<()> {
    let payload = serde_json::to_vec(message)?;
    let id = node.status.id;
    node.transport.send(id, kind, &payload)
}

fn send_control(node: &mut Node, kind: PacketKind) -> ProtocolResult<()> {
    let id = node.status.id;
    node.transport.send(id, kind, &[])
}

fn recv_message<T: DeserializeOwned>(node: &mut Node, expected: PacketKind) -> ProtocolResult<T> {
    let (header, payload) = node.transport.recv()?;
    let kind = header.packet_kind()?;
    if kind != expected {
        return Err(ProtocolError::UnexpectedPacket {
            expected: expected.name(),
            actual: kind.name().to_string(),
        });
    }
    Ok(serde_json::from_slice(&payload)?)
}

/// Push the full option tree to a worker.
///
/// # Errors
///
/// Propagates protocol failures.
pub fn transmit_config(handle: &NodeHandle, options: &DispatchOptions) -> ProtocolResult<()> {
    let mut node = lock(handle);
    send_message(&mut node, PacketKind::Config, options)
}

/// Push an image fingerprint to a worker.
///
/// # Errors
///
/// Propagates protocol failures.
pub fn transmit_image_info(handle: &NodeHandle, info: &ImageInfo) -> ProtocolResult<()> {
    let mut node = lock(handle);
    send_message(&mut node, PacketKind::ImageInfo, info)
}

/// Ship a compressed OS image to a worker.
///
/// # Errors
///
/// Propagates protocol failures.
pub fn transmit_image(handle: &NodeHandle, image: &OsImage) -> ProtocolResult<()> {
    let mut node = lock(handle);
    send_message(&mut node, PacketKind::Image, image)
}

/// Tell a configured worker to begin executing.
///
/// # Errors
///
/// Propagates protocol failures.
pub fn transmit_commencement(handle: &NodeHandle) -> ProtocolResult<()> {
    let mut node = lock(handle);
    send_control(&mut node, PacketKind::Commence)
}

/// Request a status report and fold it into the handle.
///
/// The worker's counts and activity flag are taken verbatim; the
/// registrar-assigned `id` and `role` are preserved regardless of what the
/// worker claims.
///
/// # Errors
///
/// Propagates protocol failures.
pub fn poll_status(handle: &NodeHandle) -> ProtocolResult<()> {
    let mut node = lock(handle);
    send_control(&mut node, PacketKind::StatusRequest)?;
    let reported: NodeStatus = recv_message(&mut node, PacketKind::Status)?;

    node.status.active = reported.active;
    node.status.trace_count = reported.trace_count;
    node.status.test_case_count = reported.test_case_count;
    node.status.error_count = reported.error_count;
    Ok(())
}

/// Drain a VM node's buffered traces.
///
/// # Errors
///
/// Propagates protocol failures.
pub fn receive_traces(handle: &NodeHandle) -> ProtocolResult<Vec<Trace>> {
    let mut node = lock(handle);
    send_control(&mut node, PacketKind::TraceRequest)?;
    recv_message(&mut node, PacketKind::Trace)
}

/// Drain an SVM node's generated test cases.
///
/// # Errors
///
/// Propagates protocol failures.
pub fn receive_tests(handle: &NodeHandle) -> ProtocolResult<Vec<TestCase>> {
    let mut node = lock(handle);
    send_control(&mut node, PacketKind::TestCaseRequest)?;
    recv_message(&mut node, PacketKind::TestCase)
}

/// Drain a worker's buffered error reports.
///
/// # Errors
///
/// Propagates protocol failures.
pub fn receive_errors(handle: &NodeHandle) -> ProtocolResult<Vec<NodeError>> {
    let mut node = lock(handle);
    send_control(&mut node, PacketKind::ErrorLogRequest)?;
    recv_message(&mut node, PacketKind::ErrorLog)
}

/// Ask a VM node for its current image fingerprint.
///
/// # Errors
///
/// Propagates protocol failures.
pub fn receive_image_info(handle: &NodeHandle) -> ProtocolResult<ImageInfo> {
    let mut node = lock(handle);
    send_control(&mut node, PacketKind::ImageInfoRequest)?;
    recv_message(&mut node, PacketKind::ImageInfo)
}

/// Refill an SVM node with traces. Empty batches are skipped without I/O.
///
/// # Errors
///
/// Propagates protocol failures.
pub fn transmit_traces(handle: &NodeHandle, traces: &[Trace]) -> ProtocolResult<()> {
    if traces.is_empty() {
        return Ok(());
    }
    let mut node = lock(handle);
    send_message(&mut node, PacketKind::Trace, &traces)
}

/// Refill a VM node with test cases. Empty batches are skipped without I/O.
///
/// # Errors
///
/// Propagates protocol failures.
pub fn transmit_tests(handle: &NodeHandle, tests: &[TestCase]) -> ProtocolResult<()> {
    if tests.is_empty() {
        return Ok(());
    }
    let mut node = lock(handle);
    send_message(&mut node, PacketKind::TestCase, &tests)
}

/// Reset a worker for the next target.
///
/// # Errors
///
/// Propagates protocol failures.
pub fn transmit_reset(handle: &NodeHandle) -> ProtocolResult<()> {
    let mut node = lock(handle);
    send_control(&mut node, PacketKind::Reset)
}

/// Announce the next target program to a worker.
///
/// # Errors
///
/// Propagates protocol failures.
pub fn transmit_next_target(handle: &NodeHandle, target: &str) -> ProtocolResult<()> {
    let mut node = lock(handle);
    send_message(&mut node, PacketKind::NextTarget, &target)
}

#[cfg(test)]
mod tests {
    use corral_core::node::NodeRole;

    use super::*;
    use crate::test_support::{scripted_node, ScriptedTransport};

    #[test]
    fn test_poll_status_preserves_identity() {
        let mut transport = ScriptedTransport::default();
        transport.push_reply(
            PacketKind::Status,
            &NodeStatus {
                id: 999, // worker lies about its id
                role: NodeRole::Svm,
                active: true,
                trace_count: 3,
                test_case_count: 0,
                error_count: 1,
            },
        );
        let handle = scripted_node(5, NodeRole::Vm, transport);

        poll_status(&handle).unwrap();

        let node = lock(&handle);
        assert_eq!(node.status.id, 5);
        assert_eq!(node.status.role, NodeRole::Vm);
        assert!(node.status.active);
        assert_eq!(node.status.trace_count, 3);
        assert_eq!(node.status.error_count, 1);
    }

    #[test]
    fn test_empty_batches_skip_io() {
        let transport = ScriptedTransport::default();
        let log = transport.log_handle();
        let handle = scripted_node(1, NodeRole::Vm, transport);

        transmit_tests(&handle, &[]).unwrap();
        transmit_traces(&handle, &[]).unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_receive_traces_round_trip() {
        let traces = vec![Trace::new("t", vec![1, 2])];
        let mut transport = ScriptedTransport::default();
        transport.push_reply(PacketKind::Trace, &traces);
        let log = transport.log_handle();
        let handle = scripted_node(2, NodeRole::Vm, transport);

        let received = receive_traces(&handle).unwrap();
        assert_eq!(received, traces);
        assert_eq!(*log.lock().unwrap(), vec![PacketKind::TraceRequest]);
    }

    #[test]
    fn test_unexpected_reply_kind_is_an_error() {
        let mut transport = ScriptedTransport::default();
        transport.push_reply(PacketKind::Status, &NodeStatus::default());
        let handle = scripted_node(2, NodeRole::Vm, transport);

        let result = receive_traces(&handle);
        assert!(matches!(
            result,
            Err(ProtocolError::UnexpectedPacket { expected: "trace", .. })
        ));
    }
}
