//! Cluster wire protocol.
//!
//! Every exchange between the dispatcher and a worker node is a single
//! frame: a fixed 12-byte header followed by `size` bytes of payload.
//!
//! ```text
//! +-----------+-----------+-----------+------------------+
//! | id (4 BE) | kind (4)  | size (4)  | payload          |
//! +-----------+-----------+-----------+------------------+
//! ```
//!
//! The protocol stack is organized in layers:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Domain payloads (JSON)           │  wire::{read,write}_message
//! ├─────────────────────────────────────────┤
//! │        Framing (header + size cap)      │  framing::FramedStream
//! ├─────────────────────────────────────────┤
//! │        Byte stream (TCP)                │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The dispatcher initiates every exchange except the initial registration,
//! in which a freshly connected worker announces its role with a
//! [`PacketKind::RequestVmNode`] or [`PacketKind::RequestSvmNode`] frame.
//!
//! # Invariants
//!
//! - Frame payloads never exceed [`error::MAX_FRAME_SIZE`]; the size field
//!   is validated before any allocation.
//! - `PacketHeader` encoding is deterministic: decoding the 12 encoded
//!   bytes yields the original header.

pub mod error;
pub mod framing;
pub mod wire;

use serde::{Deserialize, Serialize};

pub use error::{ProtocolError, ProtocolResult, MAX_FRAME_SIZE};
pub use framing::FramedStream;

use self::error::unknown_kind;

/// Fixed-size frame header preceding every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    /// Node id the frame concerns. Zero before registration completes.
    pub id: u32,
    /// Discriminant of [`PacketKind`].
    pub kind: u32,
    /// Payload length in bytes.
    pub size: u32,
}

/// Encoded length of a [`PacketHeader`] on the wire.
pub const HEADER_LEN: usize = 12;

impl PacketHeader {
    /// Build a header for the given node and message kind.
    #[must_use]
    pub const fn new(id: u32, kind: PacketKind, size: u32) -> Self {
        Self {
            id,
            kind: kind as u32,
            size,
        }
    }

    /// Encode into the 12-byte big-endian wire representation.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.id.to_be_bytes());
        buf[4..8].copy_from_slice(&self.kind.to_be_bytes());
        buf[8..12].copy_from_slice(&self.size.to_be_bytes());
        buf
    }

    /// Decode from the 12-byte big-endian wire representation.
    #[must_use]
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            id: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            kind: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            size: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }

    /// Interpret the `kind` field.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownPacketKind`] for discriminants no
    /// [`PacketKind`] maps to.
    pub fn packet_kind(&self) -> ProtocolResult<PacketKind> {
        PacketKind::try_from(self.kind)
    }
}

/// Every message type exchanged on a cluster connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketKind {
    /// A connecting worker announces itself as a VM node.
    RequestVmNode = 1,
    /// A connecting worker announces itself as an SVM node.
    RequestSvmNode = 2,
    /// Dispatcher pushes the full option tree.
    Config = 3,
    /// Image fingerprint, either direction.
    ImageInfo = 4,
    /// Dispatcher asks a VM node for its current image fingerprint.
    ImageInfoRequest = 5,
    /// Compressed OS image payload.
    Image = 6,
    /// Dispatcher tells a configured node to begin executing.
    Commence = 7,
    /// Dispatcher asks for a status report.
    StatusRequest = 8,
    /// Worker status report.
    Status = 9,
    /// Dispatcher asks a VM node to hand over buffered traces.
    TraceRequest = 10,
    /// A batch of traces, either direction.
    Trace = 11,
    /// Dispatcher asks an SVM node to hand over generated test cases.
    TestCaseRequest = 12,
    /// A batch of test cases, either direction.
    TestCase = 13,
    /// Dispatcher asks for the worker's buffered error reports.
    ErrorLogRequest = 14,
    /// Worker error reports.
    ErrorLog = 15,
    /// Dispatcher resets a worker for the next target.
    Reset = 16,
    /// Dispatcher names the next target program.
    NextTarget = 17,
}

impl PacketKind {
    /// Stable lowercase name, used in logs and error messages.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RequestVmNode => "request_vm_node",
            Self::RequestSvmNode => "request_svm_node",
            Self::Config => "config",
            Self::ImageInfo => "image_info",
            Self::ImageInfoRequest => "image_info_request",
            Self::Image => "image",
            Self::Commence => "commence",
            Self::StatusRequest => "status_request",
            Self::Status => "status",
            Self::TraceRequest => "trace_request",
            Self::Trace => "trace",
            Self::TestCaseRequest => "test_case_request",
            Self::TestCase => "test_case",
            Self::ErrorLogRequest => "error_log_request",
            Self::ErrorLog => "error_log",
            Self::Reset => "reset",
            Self::NextTarget => "next_target",
        }
    }
}

impl TryFrom<u32> for PacketKind {
    type Error = ProtocolError;

    fn try_from(value: u32) -> ProtocolResult<Self> {
        Ok(match value {
            1 => Self::RequestVmNode,
            2 => Self::RequestSvmNode,
            3 => Self::Config,
            4 => Self::ImageInfo,
            5 => Self::ImageInfoRequest,
            6 => Self::Image,
            7 => Self::Commence,
            8 => Self::StatusRequest,
            9 => Self::Status,
            10 => Self::TraceRequest,
            11 => Self::Trace,
            12 => Self::TestCaseRequest,
            13 => Self::TestCase,
            14 => Self::ErrorLogRequest,
            15 => Self::ErrorLog,
            16 => Self::Reset,
            17 => Self::NextTarget,
            other => return Err(unknown_kind(other)),
        })
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
