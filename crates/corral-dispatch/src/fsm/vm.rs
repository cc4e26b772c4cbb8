//! VM-node state machine.
//!
//! Lifecycle of one VM worker, from configuration through the steady
//! status/trace/test loop:
//!
//! ```text
//! Start ──start──▶ TxConfig ──config──▶ ValidateImage | RxGuestData | Commence
//! ValidateImage ──image──▶ UpdateImage | RxGuestData | Commence
//! UpdateImage ──image──▶ RxGuestData | Commence
//! RxGuestData ──poll──▶ GuestDataRxed ──poll──▶ Commence
//! Commence ──poll──▶ RxStatus ──poll──▶ StatusRxed ──poll──▶ RxTrace
//! RxTrace ──poll──▶ TraceRxed | TxTest
//! TraceRxed ──trace──▶ TxTest ──test──▶ TestTxed ──poll──▶ RxStatus | ErrorRxed
//! ErrorRxed ──poll──▶ RxStatus
//! ```
//!
//! Configuration branches on two registration-time facts: whether the run
//! is distributed with image updating enabled (validate, then re-image on
//! mismatch) and whether this is the fleet's first worker (receive guest
//! data before commencing). Registered workers are never "first" today;
//! the guest-data leg stays reachable in principle.
//!
//! Any failing guard or action moves the machine to `Error`, where it
//! ignores further events until the supervisor discards it on reset.

use std::collections::VecDeque;
use std::path::Path;

use corral_core::image::{ImageInfo, OsImage};
use corral_core::node::{NodeError, NodeStatus};
use corral_core::options::DispatchOptions;
use corral_core::test_case::TestCase;
use corral_core::trace::Trace;

use crate::error::DispatchResult;
use crate::node::{lock, NodeHandle};
use crate::proto;

/// States of the VM-node machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Waiting for the start event.
    Start,
    /// Ready to transmit the option tree.
    TxConfig,
    /// Ready to compare the worker's image fingerprint.
    ValidateImage,
    /// Ready to ship a fresh image.
    UpdateImage,
    /// Waiting to receive guest runtime data.
    RxGuestData,
    /// Guest data received.
    GuestDataRxed,
    /// Ready to order commencement.
    Commence,
    /// Ready to poll for status.
    RxStatus,
    /// Status received.
    StatusRxed,
    /// Ready to drain traces, if the worker has any.
    RxTrace,
    /// Traces drained into the machine's buffer.
    TraceRxed,
    /// Ready to receive a test-case refill.
    TxTest,
    /// Refill transmitted, status refreshed.
    TestTxed,
    /// Error reports drained into the machine's buffer.
    ErrorRxed,
    /// A protocol exchange failed; the machine is parked.
    Error,
}

impl VmState {
    /// State name for logs and error messages.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start => "Start",
            Self::TxConfig => "TxConfig",
            Self::ValidateImage => "ValidateImage",
            Self::UpdateImage => "UpdateImage",
            Self::RxGuestData => "RxGuestData",
            Self::GuestDataRxed => "GuestDataRxed",
            Self::Commence => "Commence",
            Self::RxStatus => "RxStatus",
            Self::StatusRxed => "StatusRxed",
            Self::RxTrace => "RxTrace",
            Self::TraceRxed => "TraceRxed",
            Self::TxTest => "TxTest",
            Self::TestTxed => "TestTxed",
            Self::ErrorRxed => "ErrorRxed",
            Self::Error => "Error",
        }
    }
}

/// Capability flag the dispatch supervisor reads to choose an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmFlag {
    /// Deliver `config`.
    TxConfig,
    /// Deliver `image`.
    Image,
    /// Guest data has been received.
    GuestDataRxed,
    /// A status report is fresh.
    StatusRxed,
    /// Buffered traces are ready to be pooled; deliver `trace`.
    TraceRxed,
    /// Deliver `test` with a refill batch.
    TxTest,
    /// Buffered error reports are ready to be drained; deliver `poll`.
    ErrorRxed,
    /// The machine is parked; deliver nothing.
    Error,
}

/// Events delivered by the dispatch supervisor.
#[derive(Debug)]
pub enum VmEvent<'a> {
    /// Attach the machine to its worker.
    Start {
        /// The worker handle.
        node: NodeHandle,
        /// Whether this worker is the fleet's first.
        first: bool,
        /// Whether image validation/provisioning is enabled.
        update_image: bool,
        /// Whether the run is distributed.
        distributed: bool,
    },
    /// Carry the option tree to transmit.
    Config {
        /// Options to push to the worker.
        options: &'a DispatchOptions,
    },
    /// Carry the configured image path for validation or provisioning.
    Image {
        /// Image path on the dispatcher host.
        path: &'a Path,
    },
    /// Advance the steady loop.
    Poll,
    /// Acknowledge that buffered traces were pooled.
    Trace,
    /// Carry a test-case refill (possibly empty).
    Test {
        /// The refill batch.
        tests: Vec<TestCase>,
    },
}

impl VmEvent<'_> {
    const fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Config { .. } => "config",
            Self::Image { .. } => "image",
            Self::Poll => "poll",
            Self::Trace => "trace",
            Self::Test { .. } => "test",
        }
    }
}

/// State machine for one VM worker.
pub struct VmNodeFsm {
    state: VmState,
    node: Option<NodeHandle>,
    first: bool,
    update_image: bool,
    distributed: bool,
    traces: Vec<Trace>,
    errors: VecDeque<NodeError>,
    image_info: Option<ImageInfo>,
}

impl VmNodeFsm {
    /// Create a machine waiting for its start event.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: VmState::Start,
            node: None,
            first: false,
            update_image: false,
            distributed: false,
            traces: Vec::new(),
            errors: VecDeque::new(),
            image_info: None,
        }
    }

    /// Deliver the start event. Pure initialization, cannot fail.
    pub fn start(&mut self, node: NodeHandle, first: bool, update_image: bool, distributed: bool) {
        let started = self.step(VmEvent::Start {
            node,
            first,
            update_image,
            distributed,
        });
        debug_assert!(started.is_ok(), "start event performs no i/o");
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> VmState {
        self.state
    }

    /// Capability flag of the current state, if it carries one.
    #[must_use]
    pub const fn flag(&self) -> Option<VmFlag> {
        match self.state {
            VmState::TxConfig => Some(VmFlag::TxConfig),
            VmState::ValidateImage | VmState::UpdateImage => Some(VmFlag::Image),
            VmState::GuestDataRxed => Some(VmFlag::GuestDataRxed),
            VmState::StatusRxed => Some(VmFlag::StatusRxed),
            VmState::TraceRxed => Some(VmFlag::TraceRxed),
            VmState::TxTest => Some(VmFlag::TxTest),
            VmState::ErrorRxed => Some(VmFlag::ErrorRxed),
            VmState::Error => Some(VmFlag::Error),
            VmState::Start
            | VmState::RxGuestData
            | VmState::Commence
            | VmState::RxStatus
            | VmState::RxTrace
            | VmState::TestTxed => None,
        }
    }

    /// Whether the machine is parked in its error state.
    #[must_use]
    pub const fn is_errored(&self) -> bool {
        matches!(self.state, VmState::Error)
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

    /// Move the buffered traces out of the machine.
    pub fn take_traces(&mut self) -> Vec<Trace> {
        std::mem::take(&mut self.traces)
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
    /// A failing guard or action parks the machine in [`VmState::Error`]
    /// and surfaces the cause; the caller logs it and stops delivering
    /// events to this machine.
    pub fn step(&mut self, event: VmEvent<'_>) -> DispatchResult<()> {
        let event_name = event.name();
        match self.transition(event) {
            Ok(Some(next)) => {
                tracing::trace!(from = self.state.name(), to = next.name(), event = event_name, "vm transition");
                self.state = next;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.state = VmState::Error;
                Err(e)
            }
        }
    }

    fn transition(&mut self, event: VmEvent<'_>) -> DispatchResult<Option<VmState>> {
        use VmState as S;

        Ok(match (self.state, event) {
            (
                S::Start,
                VmEvent::Start {
                    node,
                    first,
                    update_image,
                    distributed,
                },
            ) => {
                self.node = Some(node);
                self.first = first;
                self.update_image = update_image;
                self.distributed = distributed;
                Some(S::TxConfig)
            }

            (S::TxConfig, VmEvent::Config { options }) => {
                if self.distributed && self.update_image {
                    proto::transmit_config(self.node(), options)?;
                    Some(S::ValidateImage)
                } else if !self.update_image {
                    proto::transmit_config(self.node(), options)?;
                    Some(if self.first { S::RxGuestData } else { S::Commence })
                } else {
                    // update_image outside distributed mode: no row matches.
                    None
                }
            }

            (S::ValidateImage, VmEvent::Image { path }) => {
                if self.image_valid(path)? {
                    Some(if self.first { S::RxGuestData } else { S::Commence })
                } else {
                    Some(S::UpdateImage)
                }
            }

            (S::UpdateImage, VmEvent::Image { path }) => {
                let info = ImageInfo::from_file(path)?;
                proto::transmit_image_info(self.node(), &info)?;
                let image = OsImage::from_image_file(path)?;
                proto::transmit_image(self.node(), &image)?;
                Some(if self.first { S::RxGuestData } else { S::Commence })
            }

            (S::RxGuestData, VmEvent::Poll) => {
                self.receive_guest_data();
                Some(S::GuestDataRxed)
            }

            (S::GuestDataRxed, VmEvent::Poll) => Some(S::Commence),

            (S::Commence, VmEvent::Poll) => {
                proto::transmit_commencement(self.node())?;
                Some(S::RxStatus)
            }

            (S::RxStatus, VmEvent::Poll) => {
                proto::poll_status(self.node())?;
                Some(S::StatusRxed)
            }

            (S::StatusRxed, VmEvent::Poll) => Some(S::RxTrace),

            (S::RxTrace, VmEvent::Poll) => {
                if self.has_trace() {
                    self.traces = proto::receive_traces(self.node())?;
                    Some(S::TraceRxed)
                } else {
                    Some(S::TxTest)
                }
            }

            (S::TraceRxed, VmEvent::Trace) => Some(S::TxTest),

            (S::TxTest, VmEvent::Test { tests }) => {
                proto::transmit_tests(self.node(), &tests)?;
                proto::poll_status(self.node())?;
                Some(S::TestTxed)
            }

            (S::TestTxed, VmEvent::Poll) => {
                if self.has_error() {
                    self.errors = proto::receive_errors(self.node())?.into();
                    Some(S::ErrorRxed)
                } else {
                    Some(S::RxStatus)
                }
            }

            (S::ErrorRxed, VmEvent::Poll) => Some(S::RxStatus),

            // Unmatched (state, event) pairs consume the event without a
            // transition; Error in particular ignores everything.
            _ => None,
        })
    }

    /// Request the worker's image fingerprint once, cache it, and compare
    /// against the configured image. An empty fingerprint (no image on
    /// the worker) never validates.
    fn image_valid(&mut self, path: &Path) -> DispatchResult<bool> {
        if self.image_info.is_none() {
            self.image_info = Some(proto::receive_image_info(self.node())?);
        }
        let reported = self.image_info.as_ref().expect("fingerprint cached above");
        if reported.is_empty() {
            return Ok(false);
        }
        let configured = ImageInfo::from_file(path)?;
        Ok(configured == *reported)
    }

    /// Guest runtime data carries nothing the dispatcher consumes today;
    /// the exchange is a placeholder kept for protocol symmetry.
    fn receive_guest_data(&mut self) {}

    fn has_trace(&self) -> bool {
        lock(self.node()).status.trace_count > 0
    }

    fn has_error(&self) -> bool {
        lock(self.node()).status.error_count > 0
    }
}

impl Default for VmNodeFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VmNodeFsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmNodeFsm")
            .field("state", &self.state.name())
            .field("traces", &self.traces.len())
            .field("errors", &self.errors.len())
            .finish()
    }
}
