//! Node identity, roles, and self-reported state.

use serde::{Deserialize, Serialize};

use crate::protocol::PacketKind;

/// Opaque node identifier, assigned by the dispatcher at registration and
/// never changed afterwards.
pub type NodeId = u32;

/// The two worker roles of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Executes the target under instrumentation and produces traces.
    Vm,
    /// Replays traces symbolically and produces test cases.
    Svm,
}

impl NodeRole {
    /// Short display label used in the status table and log paths.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Vm => "vm",
            Self::Svm => "svm",
        }
    }

    /// Map a registration packet kind to the role it announces.
    #[must_use]
    pub const fn from_registration(kind: PacketKind) -> Option<Self> {
        match kind {
            PacketKind::RequestVmNode => Some(Self::Vm),
            PacketKind::RequestSvmNode => Some(Self::Svm),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A worker's self-reported state, refreshed on every status poll.
///
/// The counts are queue depths on the worker side and are **not**
/// monotonic: a worker draining its queues makes them shrink between
/// polls, so every transmit loop re-reads the latest report instead of
/// assuming growth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeStatus {
    /// Dispatcher-assigned identity.
    pub id: NodeId,
    /// Role announced at registration.
    pub role: NodeRole,
    /// Whether the worker is currently executing or replaying.
    pub active: bool,
    /// Traces buffered on the worker, waiting for the dispatcher.
    pub trace_count: u64,
    /// Test cases buffered on the worker.
    pub test_case_count: u64,
    /// Error reports buffered on the worker.
    pub error_count: u64,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self {
            id: 0,
            role: NodeRole::Vm,
            active: false,
            trace_count: 0,
            test_case_count: 0,
            error_count: 0,
        }
    }
}

/// An error report produced on a worker and drained by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeError {
    /// Worker-rendered description of what went wrong.
    pub log: String,
}

impl NodeError {
    /// Build an error report from anything printable.
    #[must_use]
    pub fn new(log: impl Into<String>) -> Self {
        Self { log: log.into() }
    }
}
