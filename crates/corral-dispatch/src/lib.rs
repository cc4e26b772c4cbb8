//! corral-dispatch — the central dispatcher of a corral cluster.
//!
//! The dispatcher coordinates a fleet of worker nodes of two roles: VM
//! nodes execute an instrumented target and produce execution traces, SVM
//! nodes replay those traces symbolically and produce concrete test
//! cases. Work flows in a loop: traces from VM nodes land in the trace
//! pool and refill SVM nodes; test cases from SVM nodes land in the test
//! pool and refill VM nodes.
//!
//! # Architecture
//!
//! Two long-lived threads:
//!
//! - The **dispatch driver** calls [`dispatch::Dispatch::run`] in a loop.
//!   Each tick advances the top-level dispatch machine once, which in turn
//!   advances every per-worker machine by exactly one transition.
//! - The **registrar driver** ([`registrar::RegistrarDriver`]) accepts
//!   worker connections on the master port, registers a handle, and hands
//!   it to a callback that attaches a fresh per-worker machine.
//!
//! All worker I/O is blocking and happens under the worker handle's lock,
//! one protocol round-trip at a time. The registrar lock is only held to
//! iterate the node list, never across node I/O.

pub mod dispatch;
pub mod error;
pub mod fsm;
pub mod layout;
pub mod node;
pub mod proto;
pub mod registrar;
pub mod report;

#[cfg(test)]
pub(crate) mod test_support;

pub use dispatch::Dispatch;
pub use error::DispatchError;
