//! SVM-node state machine.
//!
//! Mirror of the VM machine with the flow direction swapped: the SVM
//! worker consumes traces and emits test cases.
//!
//! ```text
//! Start ──start──▶ TxConfig ──config──▶ Commence ──poll──▶ RxStatus
//! RxStatus ──poll──▶ StatusRxed ──poll──▶ TxTrace
//! TxTrace ──trace──▶ TraceTxed ──poll──▶ RxTest
//! RxTest ──poll──▶ TestRxed | ErrorRxed | RxStatus
//! TestRxed ──test──▶ RxStatus | ErrorRxed
//! ErrorRxed ──poll──▶ RxStatus
//! ```
//!
//! SVM nodes never handle images or guest data; configuration goes
//! straight to commencement. As with the VM machine, a failing exchange
//! parks the machine in `Error`.

use std::collections::VecDeque;

use corral_core::node::{NodeError, NodeStatus};
use corral_core::options::DispatchOptions;
use corral_core::test_case::TestCase;
use corral_core::trace::Trace;

use crate::error::DispatchResult;
use crate::node::{lock, NodeHandle};
use crate::proto;

/// States of the SVM-node machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvmState {
    /// Waiting for the start event.
    Start,
    /// Ready to transmit the option tree.
    TxConfig,
    /// Ready to order commencement.
    Commence,
    /// Ready to poll for status.
    RxStatus,
    /// Status received.
    StatusRxed,
    /// Ready to receive a trace refill.
    TxTrace,
    /// Refill transmitted, status refreshed.
    TraceTxed,
    /// Ready to drain test cases, if the worker has any.
    RxTest,
    /// Test cases drained into the machine's buffer.
    TestRxed,
    /// Error reports drained into the machine's buffer.
    ErrorRxed,
    /// A protocol exchange failed; the machine is parked.
    Error,
}

impl SvmState {
    /// State name for logs and error messages.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start => "Start",
            Self::TxConfig => "TxConfig",
            Self::Commence => "Commence",
            Self::RxStatus => "RxStatus",
            Self::StatusRxed => "StatusRxed",
            Self::TxTrace => "TxTrace",
            Self::TraceTxed => "TraceTxed",
            Self::RxTest => "RxTest",
            Self::TestRxed => "TestRxed",
            Self::ErrorRxed => "ErrorRxed",
            Self::Error => "Error",
        }
    }
}

/// Capability flag the dispatch supervisor reads to choose an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvmFlag {
    /// Deliver `config`.
    TxConfig,
    /// A status report is fresh.
    StatusRxed,
    /// Deliver `trace` with a refill batch.
    TxTrace,
    /// Buffered test cases are ready to be pooled; deliver `test`.
    TestRxed,
    /// Buffered error reports are ready to be drained; deliver `poll`.
    ErrorRxed,
    /// The machine is parked; deliver nothing.
    Error,
}

/// Events delivered by the dispatch supervisor.
#[derive(Debug)]
pub enum SvmEvent<'a> {
    /// Attach the machine to its worker.
    Start {
        /// The worker handle.
        node: NodeHandle,
    },
    /// Carry the option tree to transmit.
    Config {
        /// Options to push to the worker.
        options: &'a DispatchOptions,
    },
    /// Advance the steady loop.
    Poll,
    /// Carry a trace refill (possibly empty).
    Trace {
        /// The refill batch.
        traces: Vec<Trace>,
    },
    /// Acknowledge that buffered test cases were pooled.
    Test,
}

/// State machine for one SVM worker.
pub struct SvmNodeFsm {
    state: SvmState,
    node: Option<NodeHandle>,
    tests: Vec<TestCase>,
    errors: VecDeque<NodeError>,
}

impl SvmNodeFsm {
    /// Create a machine waiting for its start event.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: SvmState::Start,
            node: None,
            tests: Vec::new(),
            errors: VecDeque::new(),
        }
    }

    /// Deliver the start event. Pure initialization, cannot fail.
    pub fn start(&mut self, node: NodeHandle) {
        let started = self.step(SvmEvent::Start { node });
        debug_assert!(started.is_ok(), "start event performs no i/o");
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SvmState {
        self.state
    }

    /// Capability flag of the current state, if it carries one.
    #[must_use]
    pub const fn flag(&self) -> Option<SvmFlag> {
        match self.state {
            SvmState::TxConfig => Some(SvmFlag::TxConfig),
            SvmState::StatusRxed => Some(SvmFlag::StatusRxed),
            SvmState::TxTrace => Some(SvmFlag::TxTrace),
            SvmState::TestRxed => Some(SvmFlag::TestRxed),
            SvmState::ErrorRxed => Some(SvmFlag::ErrorRxed),
            SvmState::Error => Some(SvmFlag::Error),
            SvmState::Start
            | SvmState::Commence
            | SvmState::RxStatus
            | SvmState::TraceTxed
            | SvmState::RxTest => None,
        }
    }

    /// Whether the machine is parked in its error state.
    #[must_use]
    pub const fn is_errored(&self) -> bool {
        matches!(self.state, SvmState::Error)
    }

    /// The worker handle this machine drives.
    ///
    /// # Panics
    ///
    /// Panics if the machine has not been started.
    #[must_use]
    pub fn node(&self) -> &NodeHandle {
        self.node.as_ref().expect("machine not started")
    }

    /// Snapshot of the worker's last reported status.
    #[must_use]
    pub fn node_status(&self) -> NodeStatus {
        lock(self.node()).status.clone()
    }

    /// Move the buffered test cases out of the machine.
    pub fn take_tests(&mut self) -> Vec<TestCase> {
        std::mem::take(&mut self.tests)
    }

    /// Whether error reports remain buffered.
    #[must_use]
    pub fn has_buffered_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Pop the oldest buffered error report.
    pub fn pop_error(&mut self) -> Option<NodeError> {
        self.errors.pop_front()
    }

    /// Deliver one event, performing at most one transition.
    ///
    /// # Errors
    ///
    /// A failing guard or action parks the machine in [`SvmState::Error`]
    /// and surfaces the cause; the caller logs it and stops delivering
    /// events to this machine.
    pub fn step(&mut self, event: SvmEvent<'_>) -> DispatchResult<()> {
        match self.transition(event) {
            Ok(Some(next)) => {
                self.state = next;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.state = SvmState::Error;
                Err(e)
            }
        }
    }

    fn transition(&mut self, event: SvmEvent<'_>) -> DispatchResult<Option<SvmState>> {
        use SvmState as S;

        Ok(match (self.state, event) {
            (S::Start, SvmEvent::Start { node }) => {
                self.node = Some(node);
                Some(S::TxConfig)
            }

            (S::TxConfig, SvmEvent::Config { options }) => {
                proto::transmit_config(self.node(), options)?;
                Some(S::Commence)
            }

            (S::Commence, SvmEvent::Poll) => {
                proto::transmit_commencement(self.node())?;
                Some(S::RxStatus)
            }

            (S::RxStatus, SvmEvent::Poll) => {
                proto::poll_status(self.node())?;
                Some(S::StatusRxed)
            }

            (S::StatusRxed, SvmEvent::Poll) => Some(S::TxTrace),

            (S::TxTrace, SvmEvent::Trace { traces }) => {
                proto::transmit_traces(self.node(), &traces)?;
                proto::poll_status(self.node())?;
                Some(S::TraceTxed)
            }

            (S::TraceTxed, SvmEvent::Poll) => Some(S::RxTest),

            (S::RxTest, SvmEvent::Poll) => {
                if self.has_tests() {
                    self.tests = proto::receive_tests(self.node())?;
                    Some(S::TestRxed)
                } else if self.has_error() {
                    self.errors = proto::receive_errors(self.node())?.into();
                    Some(S::ErrorRxed)
                } else {
                    Some(S::RxStatus)
                }
            }

            (S::TestRxed, SvmEvent::Test) => {
                if self.has_error() {
                    self.errors = proto::receive_errors(self.node())?.into();
                    Some(S::ErrorRxed)
                } else {
                    Some(S::RxStatus)
                }
            }

            (S::ErrorRxed, SvmEvent::Poll) => Some(S::RxStatus),

            _ => None,
        })
    }

    fn has_tests(&self) -> bool {
        lock(self.node()).status.test_case_count > 0
    }

    fn has_error(&self) -> bool {
        lock(self.node()).status.error_count > 0
    }
}

impl Default for SvmNodeFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SvmNodeFsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SvmNodeFsm")
            .field("state", &self.state.name())
            .field("tests", &self.tests.len())
            .field("errors", &self.errors.len())
            .finish()
    }
}
