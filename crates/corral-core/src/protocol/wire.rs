//! Typed message helpers over the framed stream.
//!
//! These pair a [`PacketKind`] with a JSON document payload. Reads verify
//! the response kind before touching the payload, so a desynchronized
//! exchange surfaces as [`ProtocolError::UnexpectedPacket`] instead of a
//! confusing decode failure.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::error::{ProtocolError, ProtocolResult};
use super::framing::FramedStream;
use super::PacketKind;

/// Send a control frame with no payload.
///
/// # Errors
///
/// Propagates framing and I/O errors.
pub fn write_control<S: std::io::Write>(
    stream: &mut FramedStream<S>,
    id: u32,
    kind: PacketKind,
) -> ProtocolResult<()> {
    stream.send(id, kind, &[])
}

/// Serialize `message` and send it under the given kind.
///
/// # Errors
///
/// Propagates serialization, framing, and I/O errors.
pub fn write_message<S: std::io::Write, T: Serialize>(
    stream: &mut FramedStream<S>,
    id: u32,
    kind: PacketKind,
    message: &T,
) -> ProtocolResult<()> {
    let payload = serde_json::to_vec(message)?;
    stream.send(id, kind, &payload)
}

/// Receive one frame and decode its payload, verifying the kind.
///
/// # Errors
///
/// Returns [`ProtocolError::UnexpectedPacket`] if the received frame does
/// not carry `expected`, and propagates framing, I/O, and decode errors.
pub fn read_message<S: std::io::Read, T: DeserializeOwned>(
    stream: &mut FramedStream<S>,
    expected: PacketKind,
) -> ProtocolResult<T> {
    let (header, payload) = stream.recv()?;
    let kind = header.packet_kind()?;
    if kind != expected {
        return Err(ProtocolError::UnexpectedPacket {
            expected: expected.name(),
            actual: kind.name().to_string(),
        });
    }
    Ok(serde_json::from_slice(&payload)?)
}

/// Receive one frame that must carry no payload, verifying the kind.
///
/// # Errors
///
/// Same failure modes as [`read_message`].
pub fn read_control<S: std::io::Read>(
    stream: &mut FramedStream<S>,
    expected: PacketKind,
) -> ProtocolResult<()> {
    let (header, _payload) = stream.recv()?;
    let kind = header.packet_kind()?;
    if kind != expected {
        return Err(ProtocolError::UnexpectedPacket {
            expected: expected.name(),
            actual: kind.name().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::node::NodeStatus;
    use crate::options::DispatchOptions;

    #[test]
    fn test_message_roundtrip_preserves_status() {
        let status = NodeStatus {
            trace_count: 3,
            test_case_count: 9,
            error_count: 1,
            active: true,
            ..NodeStatus::default()
        };

        let mut tx = FramedStream::new(Cursor::new(Vec::new()));
        write_message(&mut tx, 4, PacketKind::Status, &status).unwrap();
        let mut rx = FramedStream::new(Cursor::new(tx.into_inner().into_inner()));

        let decoded: NodeStatus = read_message(&mut rx, PacketKind::Status).unwrap();
        assert_eq!(decoded, status);
    }

    #[test]
    fn test_config_roundtrip_preserves_options() {
        let mut options = DispatchOptions::default();
        options.mode.distributed = true;
        options.test.items = vec!["coreutils/cat".into(), "coreutils/ls".into()];
        options.test.interval.trace = 5000;

        let mut tx = FramedStream::new(Cursor::new(Vec::new()));
        write_message(&mut tx, 0, PacketKind::Config, &options).unwrap();
        let mut rx = FramedStream::new(Cursor::new(tx.into_inner().into_inner()));

        let decoded: DispatchOptions = read_message(&mut rx, PacketKind::Config).unwrap();
        assert_eq!(decoded, options);
    }

    #[test]
    fn test_unexpected_kind_is_rejected() {
        let mut tx = FramedStream::new(Cursor::new(Vec::new()));
        write_control(&mut tx, 1, PacketKind::Commence).unwrap();
        let mut rx = FramedStream::new(Cursor::new(tx.into_inner().into_inner()));

        let result: ProtocolResult<NodeStatus> = read_message(&mut rx, PacketKind::Status);
        assert!(matches!(
            result,
            Err(ProtocolError::UnexpectedPacket {
                expected: "status",
                ..
            })
        ));
    }
}
