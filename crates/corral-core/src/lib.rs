//! Shared building blocks for the corral concolic-testing cluster.
//!
//! The dispatcher and the worker nodes agree on everything in this crate:
//! the framed wire protocol, the serialized domain payloads (traces, test
//! cases, image fingerprints, node status and error reports), the dispatcher
//! option tree, and the trace/test pools the dispatcher balances work with.
//!
//! # Crate layout
//!
//! - [`protocol`]: packet kinds, the fixed 12-byte header, the blocking
//!   framed stream, and typed message helpers.
//! - [`node`]: node identity, roles, self-reported status, error reports.
//! - [`trace`], [`test_case`], [`image`]: the payloads exchanged over the
//!   wire and persisted under the run directory.
//! - [`options`]: the dispatcher configuration tree, loadable from TOML.
//! - [`pool`]: strategy-backed trace and test-case pools.
//! - [`sink`]: thread-safe append-only file sinks for run-local logs.

pub mod image;
pub mod node;
pub mod options;
pub mod pool;
pub mod protocol;
pub mod sink;
pub mod test_case;
pub mod trace;

pub use image::{ImageInfo, OsImage};
pub use node::{NodeError, NodeRole, NodeStatus};
pub use options::DispatchOptions;
pub use pool::{TestPool, TracePool};
pub use protocol::{PacketHeader, PacketKind};
pub use test_case::TestCase;
pub use trace::Trace;
