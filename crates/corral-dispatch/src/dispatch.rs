//! The top-level dispatch machine.
//!
//! One [`Dispatch`] supervises the whole cluster. Its machine cycles
//!
//! ```text
//! Start ──start──▶ SpecCheck ──poll──▶ NextTarget | Dispatch | Terminate
//! NextTarget ──poll──▶ Dispatch          (finish, clean, reset, assign)
//! Dispatch ──poll──▶ SpecCheck           (the per-tick dispatch pass)
//! Terminate ──poll──▶ Terminated         (finish, join the registrar)
//! ```
//!
//! `SpecCheck` decides between rotating to the next target (distributed
//! mode only), dispatching another tick, and terminating. A target
//! expires when the cluster converges — every queue empty, every worker
//! inactive — or when a trace, test-case, or wall-clock threshold is
//! reached.
//!
//! The dispatch pass visits every worker machine once per tick, chooses
//! an event from its capability flag, and moves work between the
//! machines and the pools: harvested traces are persisted and pooled,
//! pooled traces refill SVM nodes, pooled test cases refill VM nodes,
//! and worker error reports are drained into the run's log tree.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use corral_core::node::{NodeError, NodeRole};
use corral_core::options::DispatchOptions;
use corral_core::pool::{TestPool, TracePool};
use corral_core::sink::FileSink;
use corral_core::test_case::TestCase;
use corral_core::trace::Trace;
use tracing::{info, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::fsm::svm::{SvmEvent, SvmFlag, SvmNodeFsm};
use crate::fsm::vm::{VmEvent, VmFlag, VmNodeFsm};
use crate::fsm::{lock_fsms, register_node_fsm, shared_fsm_list, SvmFsmList, VmFsmList};
use crate::layout::{RunLayout, LOG_SVM_DIR_NAME, LOG_VM_DIR_NAME};
use crate::node::{lock, NodeHandle};
use crate::proto;
use crate::registrar::{lock_registrar, shared_registrar, RegistrarDriver, SharedRegistrar};
use crate::report::{NodeColumn, ProfileWriter, StatusSnapshot};

/// States of the dispatch machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Waiting for the start event.
    Start,
    /// Deciding between rotation, dispatch, and termination.
    SpecCheck,
    /// Rotating to the next target.
    NextTarget,
    /// Running the per-tick dispatch pass.
    Dispatch,
    /// Winding the run down.
    Terminate,
    /// Terminal state; the driver loop stops polling.
    Terminated,
}

impl DispatchState {
    /// State name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start => "Start",
            Self::SpecCheck => "SpecCheck",
            Self::NextTarget => "NextTarget",
            Self::Dispatch => "Dispatch",
            Self::Terminate => "Terminate",
            Self::Terminated => "Terminated",
        }
    }
}

/// The dispatch machine and everything it supervises.
pub(crate) struct DispatchFsm {
    pub(crate) options: DispatchOptions,
    pub(crate) registrar: SharedRegistrar,
    driver: Option<RegistrarDriver>,
    layout: RunLayout,
    pub(crate) trace_pool: TracePool,
    pub(crate) test_pool: TestPool,
    pub(crate) vm_fsms: VmFsmList,
    pub(crate) svm_fsms: SvmFsmList,
    exception_log: FileSink,
    node_error_log: FileSink,
    profile: ProfileWriter,
    master_port: u16,
    start_time: Instant,
    pub(crate) first: bool,
    target_queue: VecDeque<String>,
    pub(crate) target: String,
    state: DispatchState,
    /// Render the status table to the terminal each tick. Off in tests.
    echo_status: bool,
}

impl DispatchFsm {
    pub(crate) fn new(master_port: u16, options: DispatchOptions) -> DispatchResult<Self> {
        let layout = RunLayout::new(&options.dispatch_root);
        let trace_pool = TracePool::new(&options.trace.strategy)?;
        let test_pool = TestPool::new(layout.root());
        let exception_log = FileSink::new(layout.exception_log_path());
        let node_error_log = FileSink::new(layout.node_error_log_path());
        let profile = ProfileWriter::new(layout.profile_dir(), options.profile.interval);

        Ok(Self {
            options,
            registrar: shared_registrar(),
            driver: None,
            layout,
            trace_pool,
            test_pool,
            vm_fsms: shared_fsm_list(),
            svm_fsms: shared_fsm_list(),
            exception_log,
            node_error_log,
            profile,
            master_port,
            start_time: Instant::now(),
            first: true,
            target_queue: VecDeque::new(),
            target: String::new(),
            state: DispatchState::Start,
            echo_status: false,
        })
    }

    /// Deliver the start event: seed the target queue, launch the
    /// registrar driver, and (dev mode only) materialize the run tree.
    pub(crate) fn start(&mut self) -> DispatchResult<()> {
        debug_assert_eq!(self.state, DispatchState::Start);

        self.target_queue = self.options.test.items.iter().cloned().collect();

        let options = self.options.clone();
        let vm_fsms = Arc::clone(&self.vm_fsms);
        let svm_fsms = Arc::clone(&self.svm_fsms);
        let driver = RegistrarDriver::launch(
            self.master_port,
            Arc::clone(&self.registrar),
            move |handle| register_node_fsm(handle, &options, &vm_fsms, &svm_fsms),
        )?;
        self.driver = Some(driver);

        if !self.options.mode.distributed {
            self.layout.materialize()?;
        }

        self.state = DispatchState::SpecCheck;
        Ok(())
    }

    pub(crate) const fn state(&self) -> DispatchState {
        self.state
    }

    pub(crate) const fn is_terminated(&self) -> bool {
        matches!(self.state, DispatchState::Terminated)
    }

    pub(crate) fn local_port(&self) -> u16 {
        self.driver
            .as_ref()
            .map_or(self.master_port, RegistrarDriver::local_port)
    }

    pub(crate) fn run_root(&self) -> std::path::PathBuf {
        self.layout.root().to_path_buf()
    }

    pub(crate) fn set_echo_status(&mut self, echo: bool) {
        self.echo_status = echo;
    }

    /// Advance the machine by one poll.
    pub(crate) fn poll(&mut self) -> DispatchResult<()> {
        match self.state {
            DispatchState::Start | DispatchState::Terminated => Ok(()),

            DispatchState::SpecCheck => {
                let dev_mode = !self.options.mode.distributed;
                let expired = self.is_target_expired();
                let have_next = !self.target_queue.is_empty();

                if !dev_mode && (self.first || (expired && have_next)) {
                    self.state = DispatchState::NextTarget;
                } else if dev_mode || (!self.first && !expired) {
                    self.state = DispatchState::Dispatch;
                } else if expired && !have_next {
                    self.action_next_target_clean()?;
                    self.state = DispatchState::Terminate;
                }
                Ok(())
            }

            DispatchState::NextTarget => {
                self.action_finish()?;
                self.action_next_target_clean()?;
                self.action_reset()?;
                self.action_assign_next_target();
                self.state = DispatchState::Dispatch;
                Ok(())
            }

            DispatchState::Dispatch => {
                self.action_dispatch()?;
                self.state = DispatchState::SpecCheck;
                Ok(())
            }

            DispatchState::Terminate => {
                self.action_finish()?;
                self.action_terminate();
                self.state = DispatchState::Terminated;
                info!("dispatch terminated");
                Ok(())
            }
        }
    }

    // +------------------------------------------------------------------+
    // + Guards                                                           +
    // +------------------------------------------------------------------+

    pub(crate) fn elapsed_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn are_node_queues_empty(&self) -> bool {
        let registrar = lock_registrar(&self.registrar);
        registrar.nodes().iter().all(|handle| {
            let node = lock(handle);
            node.status.test_case_count == 0 && node.status.trace_count == 0
        })
    }

    fn are_all_queues_empty(&self) -> bool {
        self.are_node_queues_empty()
            && self.test_pool.count_next() == 0
            && self.trace_pool.count_next() == 0
    }

    fn are_nodes_inactive(&self) -> bool {
        let registrar = lock_registrar(&self.registrar);
        registrar
            .nodes()
            .iter()
            .all(|handle| !lock(handle).status.active)
    }

    /// Convergence: nothing queued anywhere and no worker executing.
    pub(crate) fn is_converged(&self) -> bool {
        self.are_all_queues_empty() && self.are_nodes_inactive()
    }

    fn is_target_expired(&self) -> bool {
        self.is_converged()
            || self.trace_pool.count_all_unique() >= self.options.test.interval.trace
            || self.test_pool.count_all() >= self.options.test.interval.tc
            || self.elapsed_secs() >= self.options.test.interval.time
    }

    // +------------------------------------------------------------------+
    // + Actions                                                          +
    // +------------------------------------------------------------------+

    /// Write the end-of-target status snapshot, but only for a run tree
    /// that already exists: the first pass through `NextTarget` has
    /// nothing to summarize.
    fn action_finish(&self) -> DispatchResult<()> {
        if !self.layout.log_dir_exists() {
            return Ok(());
        }
        let path = self.layout.finish_path();
        let mut file = std::fs::File::create(&path)
            .map_err(|source| DispatchError::FileWrite { path: path.clone(), source })?;
        self.snapshot()
            .render(&mut file)
            .map_err(|source| DispatchError::FileWrite { path, source })
    }

    fn action_next_target_clean(&self) -> DispatchResult<()> {
        self.layout.clean_trace_dir()
    }

    /// Rebuild the run for the next target: re-root the tree, fresh
    /// pools, fresh logs and profile, empty machine lists, reset clock,
    /// and a `reset` order plus a fresh machine for every known worker.
    fn action_reset(&mut self) -> DispatchResult<()> {
        if self.options.mode.distributed {
            if let Some(next) = self.target_queue.front() {
                self.layout.retarget(next);
            }
        }
        self.layout.materialize()?;

        self.test_pool = TestPool::new(self.layout.root());
        self.trace_pool = TracePool::new(&self.options.trace.strategy)?;
        self.exception_log = FileSink::new(self.layout.exception_log_path());
        self.node_error_log = FileSink::new(self.layout.node_error_log_path());
        self.profile = ProfileWriter::new(self.layout.profile_dir(), self.options.profile.interval);

        lock_fsms(&self.vm_fsms).clear();
        lock_fsms(&self.svm_fsms).clear();
        self.start_time = Instant::now();

        let nodes: Vec<NodeHandle> = lock_registrar(&self.registrar).nodes().to_vec();
        for handle in nodes {
            if let Err(e) = proto::transmit_reset(&handle) {
                self.log_exception(&format!("reset order failed: {e}"));
            }
            register_node_fsm(&handle, &self.options, &self.vm_fsms, &self.svm_fsms);
        }
        Ok(())
    }

    /// Pop the next target once and announce it to every VM requester.
    fn action_assign_next_target(&mut self) {
        let Some(target) = self.target_queue.pop_front() else {
            return;
        };
        info!(target = %target, "assigning next target");
        self.target = target;

        let nodes: Vec<NodeHandle> = lock_registrar(&self.registrar).nodes().to_vec();
        for handle in nodes {
            let role = lock(&handle).status.role;
            if role != NodeRole::Vm {
                continue;
            }
            if let Err(e) = proto::transmit_next_target(&handle, &self.target) {
                self.log_exception(&format!("next-target order failed: {e}"));
            }
        }
    }

    /// The per-tick dispatch pass.
    fn action_dispatch(&mut self) -> DispatchResult<()> {
        self.dispatch_vm_machines()?;
        self.dispatch_svm_machines()?;
        self.first = false;

        let snapshot = self.snapshot();
        if self.echo_status {
            // Redraw in place: clear, home, table.
            let mut out = std::io::stdout().lock();
            let _ = write!(out, "\x1b[2J\x1b[H");
            let _ = snapshot.render(&mut out);
        }
        self.profile.maybe_write(&snapshot)
    }

    fn dispatch_vm_machines(&mut self) -> DispatchResult<()> {
        let list = Arc::clone(&self.vm_fsms);
        let mut machines = lock_fsms(&list);

        for fsm in machines.iter_mut() {
            match fsm.flag() {
                Some(VmFlag::Error) => {}

                Some(VmFlag::TraceRxed) => {
                    let traces = fsm.take_traces();
                    self.pool_traces(&traces)?;
                    self.deliver_vm(fsm, VmEvent::Trace);
                }

                Some(VmFlag::TxTest) => {
                    let pending = fsm.node_status().test_case_count;
                    let tests = self.refill_tests(pending);
                    self.deliver_vm(fsm, VmEvent::Test { tests });
                }

                Some(VmFlag::ErrorRxed) => {
                    self.drain_vm_errors(fsm)?;
                    self.deliver_vm(fsm, VmEvent::Poll);
                }

                Some(VmFlag::TxConfig) => {
                    let options = self.options.clone();
                    self.deliver_vm(fsm, VmEvent::Config { options: &options });
                }

                Some(VmFlag::Image) => {
                    let path = self.options.vm.image.path.clone();
                    self.deliver_vm(fsm, VmEvent::Image { path: &path });
                }

                _ => self.deliver_vm(fsm, VmEvent::Poll),
            }
        }
        Ok(())
    }

    fn dispatch_svm_machines(&mut self) -> DispatchResult<()> {
        let list = Arc::clone(&self.svm_fsms);
        let mut machines = lock_fsms(&list);

        for fsm in machines.iter_mut() {
            match fsm.flag() {
                Some(SvmFlag::Error) => {}

                Some(SvmFlag::TestRxed) => {
                    let tests = fsm.take_tests();
                    self.test_pool.insert(&tests)?;
                    self.deliver_svm(fsm, SvmEvent::Test);
                }

                Some(SvmFlag::TxTrace) => {
                    let pending = fsm.node_status().trace_count;
                    let traces = self.refill_traces(pending);
                    self.deliver_svm(fsm, SvmEvent::Trace { traces });
                }

                Some(SvmFlag::ErrorRxed) => {
                    self.drain_svm_errors(fsm)?;
                    self.deliver_svm(fsm, SvmEvent::Poll);
                }

                Some(SvmFlag::TxConfig) => {
                    let options = self.options.clone();
                    self.deliver_svm(fsm, SvmEvent::Config { options: &options });
                }

                _ => self.deliver_svm(fsm, SvmEvent::Poll),
            }
        }
        Ok(())
    }

    fn deliver_vm(&self, fsm: &mut VmNodeFsm, event: VmEvent<'_>) {
        if let Err(e) = fsm.step(event) {
            self.log_machine_failure(NodeRole::Vm, &e);
        }
    }

    fn deliver_svm(&self, fsm: &mut SvmNodeFsm, event: SvmEvent<'_>) {
        if let Err(e) = fsm.step(event) {
            self.log_machine_failure(NodeRole::Svm, &e);
        }
    }

    fn log_machine_failure(&self, role: NodeRole, e: &DispatchError) {
        warn!(role = %role, error = %e, "worker machine parked");
        self.log_exception(&format!("{role} machine parked: {e}"));
    }

    fn log_exception(&self, text: &str) {
        if let Err(io) = self.exception_log.append(text) {
            warn!(error = %io, "exception log write failed");
        }
    }

    /// Persist harvested traces under `trace/` and offer them to the pool.
    fn pool_traces(&mut self, traces: &[Trace]) -> DispatchResult<()> {
        let dir = self.layout.trace_dir();
        for trace in traces {
            let path = dir.join(trace.file_name());
            trace.to_file(&path)?;
            self.trace_pool.insert(&path)?;
        }
        Ok(())
    }

    /// Pull test cases until the worker would hold `test_multiplier`
    /// pending cases, or the pool runs dry.
    fn refill_tests(&mut self, pending: u64) -> Vec<TestCase> {
        let cap = self.options.vm.test_multiplier;
        let mut tests = Vec::new();
        let mut count = pending;
        while count < cap {
            let Some(test) = self.test_pool.next() else {
                break;
            };
            tests.push(test);
            count += 1;
        }
        tests
    }

    /// Pull traces until the worker would hold `trace_multiplier` pending
    /// traces, or the pool runs dry. A trace that fails to load (the
    /// pooled file can vanish under us) is logged and skipped; the refill
    /// continues with whatever loaded.
    fn refill_traces(&mut self, pending: u64) -> Vec<Trace> {
        let cap = self.options.vm.trace_multiplier;
        let mut traces = Vec::new();
        let mut count = pending;
        while count < cap {
            let Some(path) = self.trace_pool.next() else {
                break;
            };
            match Trace::from_file(&path) {
                Ok(trace) => {
                    traces.push(trace);
                    count += 1;
                }
                Err(e) => {
                    self.log_exception(&format!("trace refill lookup failed: {e}"));
                }
            }
        }
        traces
    }

    fn drain_vm_errors(&mut self, fsm: &mut VmNodeFsm) -> DispatchResult<()> {
        while let Some(err) = fsm.pop_error() {
            self.write_node_error(&err, LOG_VM_DIR_NAME)?;
        }
        Ok(())
    }

    fn drain_svm_errors(&mut self, fsm: &mut SvmNodeFsm) -> DispatchResult<()> {
        while let Some(err) = fsm.pop_error() {
            self.write_node_error(&err, LOG_SVM_DIR_NAME)?;
        }
        Ok(())
    }

    /// One numbered file per report under `log/<role>/`, plus a
    /// target-tagged entry in the node-error log.
    fn write_node_error(&self, err: &NodeError, subdir: &str) -> DispatchResult<()> {
        let dir = self.layout.log_dir().join(subdir);
        std::fs::create_dir_all(&dir)
            .map_err(|source| DispatchError::DirCreate { path: dir.clone(), source })?;

        let path = self.layout.next_error_path(subdir);
        std::fs::write(&path, &err.log)
            .map_err(|source| DispatchError::FileWrite { path: path.clone(), source })?;

        self.node_error_log
            .append(&format!("Target: {}\n{}", self.target, err.log))
            .map_err(|source| DispatchError::FileWrite {
                path: self.node_error_log.path(),
                source,
            })
    }

    fn action_terminate(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            driver.shutdown();
        }
    }

    pub(crate) fn snapshot(&self) -> StatusSnapshot {
        let nodes = {
            let registrar = lock_registrar(&self.registrar);
            registrar
                .nodes()
                .iter()
                .map(|handle| {
                    let node = lock(handle);
                    NodeColumn {
                        role: node.status.role,
                        test_case_count: node.status.test_case_count,
                        trace_count: node.status.trace_count,
                    }
                })
                .collect()
        };
        StatusSnapshot {
            elapsed_secs: self.elapsed_secs(),
            tests_left: self.test_pool.count_next(),
            tests_total: self.test_pool.count_all(),
            traces_left: self.trace_pool.count_next(),
            traces_total: self.trace_pool.count_all_unique(),
            nodes,
        }
    }
}

impl Drop for DispatchFsm {
    fn drop(&mut self) {
        self.action_terminate();
    }
}

/// Public handle to a running dispatcher.
///
/// Construction binds the master port, launches the registrar driver, and
/// starts the machine. The driver loop then calls [`Dispatch::run`] until
/// [`Dispatch::is_terminated`].
pub struct Dispatch {
    fsm: DispatchFsm,
}

impl Dispatch {
    /// Bind the master port and start the dispatch machine.
    ///
    /// # Errors
    ///
    /// Fails if the port cannot be bound, the option tree names an
    /// unknown pool strategy, or (dev mode) the run tree cannot be
    /// created.
    pub fn new(master_port: u16, options: DispatchOptions) -> DispatchResult<Self> {
        let mut fsm = DispatchFsm::new(master_port, options)?;
        fsm.set_echo_status(true);
        fsm.start()?;
        Ok(Self { fsm })
    }

    /// One tick. Does nothing until at least one worker has registered.
    ///
    /// # Errors
    ///
    /// Surfaces run-fatal failures (filesystem, pool persistence); these
    /// abort the run. Per-worker protocol failures are handled inside the
    /// tick and only park the affected worker.
    pub fn run(&mut self) -> DispatchResult<()> {
        if !self.has_nodes() {
            return Ok(());
        }
        self.fsm.poll()
    }

    /// Whether any worker has registered yet.
    #[must_use]
    pub fn has_nodes(&self) -> bool {
        !lock_registrar(&self.fsm.registrar).is_empty()
    }

    /// Whether the machine reached its terminal state.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.fsm.is_terminated()
    }

    /// Port the registrar driver is listening on.
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.fsm.local_port()
    }

    /// Current run root on disk.
    #[must_use]
    pub fn run_root(&self) -> std::path::PathBuf {
        self.fsm.run_root()
    }

    /// Render the current status table to `w`.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub fn render_status<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        self.fsm.snapshot().render(w)
    }
}

#[cfg(test)]
mod tests {
    use corral_core::node::NodeStatus;
    use corral_core::protocol::PacketKind;
    use uuid::Uuid;

    use super::*;
    use crate::test_support::{scripted_node, status_report, ScriptedTransport};

    fn distributed_options(root: &std::path::Path, items: &[&str]) -> DispatchOptions {
        let mut options = DispatchOptions::default();
        options.mode.distributed = true;
        options.test.items = items.iter().map(ToString::to_string).collect();
        options.dispatch_root = root.to_path_buf();
        options
    }

    fn started_fsm(options: DispatchOptions) -> DispatchFsm {
        let mut fsm = DispatchFsm::new(0, options).unwrap();
        fsm.start().unwrap();
        fsm
    }

    /// Register a scripted worker the way the driver callback would.
    fn attach_node(fsm: &DispatchFsm, id: u32, role: NodeRole, transport: ScriptedTransport) -> NodeHandle {
        let handle = scripted_node(id, role, transport);
        lock_registrar(&fsm.registrar).push(Arc::clone(&handle));
        register_node_fsm(&handle, &fsm.options, &fsm.vm_fsms, &fsm.svm_fsms);
        handle
    }

    #[test]
    fn test_empty_queue_and_expired_target_terminates_in_two_polls() {
        let root = tempfile::tempdir().unwrap();
        let mut fsm = started_fsm(distributed_options(root.path(), &[]));
        // Past the first tick, with nothing registered and empty pools the
        // cluster is trivially converged, so the target is expired.
        fsm.first = false;

        fsm.poll().unwrap();
        assert_eq!(fsm.state(), DispatchState::Terminate);
        fsm.poll().unwrap();
        assert_eq!(fsm.state(), DispatchState::Terminated);

        // Terminated is terminal.
        fsm.poll().unwrap();
        assert_eq!(fsm.state(), DispatchState::Terminated);
    }

    #[test]
    fn test_dev_mode_never_rotates_or_terminates() {
        let root = tempfile::tempdir().unwrap();
        let mut options = DispatchOptions::default();
        options.dispatch_root = root.path().to_path_buf();
        let mut fsm = started_fsm(options);

        // Converged and expired on every check, yet dev mode keeps
        // bouncing between SpecCheck and Dispatch.
        for _ in 0..6 {
            fsm.poll().unwrap();
            assert!(matches!(
                fsm.state(),
                DispatchState::SpecCheck | DispatchState::Dispatch
            ));
        }
    }

    #[test]
    fn test_first_poll_in_distributed_mode_rotates_to_first_target() {
        let root = tempfile::tempdir().unwrap();
        let mut fsm = started_fsm(distributed_options(root.path(), &["t1", "t2"]));

        let transport = ScriptedTransport::default();
        let log = transport.log_handle();
        attach_node(&fsm, 1, NodeRole::Vm, transport);

        fsm.poll().unwrap(); // SpecCheck -> NextTarget (first)
        assert_eq!(fsm.state(), DispatchState::NextTarget);
        fsm.poll().unwrap(); // NextTarget -> Dispatch
        assert_eq!(fsm.state(), DispatchState::Dispatch);

        assert_eq!(fsm.target, "t1");
        assert!(fsm.run_root().ends_with("t1"));
        assert!(fsm.run_root().join("trace").is_dir());

        // The node got a reset order and a next-target announcement.
        let sent = log.lock().unwrap().clone();
        assert_eq!(sent, vec![PacketKind::Reset, PacketKind::NextTarget]);
    }

    #[test]
    fn test_trace_threshold_rotates_to_second_target() {
        let root = tempfile::tempdir().unwrap();
        let mut options = distributed_options(root.path(), &["t1", "t2"]);
        options.test.interval.trace = 3;
        let mut fsm = started_fsm(options);

        // A visibly active worker keeps convergence at bay.
        let mut transport = ScriptedTransport::default();
        for _ in 0..8 {
            transport.push_status_reply(&status_report(NodeRole::Vm, true, 0, 0, 0));
        }
        attach_node(&fsm, 1, NodeRole::Vm, transport);

        fsm.poll().unwrap(); // first rotation, to t1
        fsm.poll().unwrap();
        let t1_root = fsm.run_root();

        // Feed the trace pool up to the threshold.
        let trace_dir = fsm.layout.trace_dir();
        for _ in 0..3 {
            let path = trace_dir.join(Uuid::new_v4().to_string());
            std::fs::write(&path, b"{}").unwrap();
            fsm.trace_pool.insert(&path).unwrap();
        }

        fsm.poll().unwrap(); // Dispatch pass
        fsm.poll().unwrap(); // SpecCheck: threshold reached -> NextTarget
        assert_eq!(fsm.state(), DispatchState::NextTarget);
        fsm.poll().unwrap(); // rotate

        assert_eq!(fsm.target, "t2");
        assert!(fsm.run_root().ends_with("t2"));
        // The expensive traces of the finished target are gone; the new
        // target starts with a fresh tree and empty pools.
        assert!(!t1_root.join("trace").exists());
        assert!(fsm.run_root().join("trace").is_dir());
        assert_eq!(fsm.trace_pool.count_all_unique(), 0);
        assert_eq!(fsm.test_pool.count_all(), 0);
        // The finish snapshot was written for the finished target.
        assert!(t1_root.join("log").join("finish").is_file());
    }

    #[test]
    fn test_convergence_terminates_and_writes_finish() {
        let root = tempfile::tempdir().unwrap();
        let mut fsm = started_fsm(distributed_options(root.path(), &["t1"]));

        let mut transport = ScriptedTransport::default();
        // One status poll: the worker reports itself inactive and empty.
        transport.push_status_reply(&status_report(NodeRole::Vm, false, 0, 0, 0));
        attach_node(&fsm, 1, NodeRole::Vm, transport);

        fsm.poll().unwrap(); // SpecCheck -> NextTarget (first)
        fsm.poll().unwrap(); // rotate to t1, Dispatch next
        fsm.poll().unwrap(); // Dispatch: config
        fsm.poll().unwrap(); // SpecCheck: node still active -> Dispatch
        fsm.poll().unwrap(); // Dispatch: commence
        fsm.poll().unwrap(); // SpecCheck -> Dispatch
        fsm.poll().unwrap(); // Dispatch: status poll, node now inactive

        // Converged, no next target: two polls to terminal.
        fsm.poll().unwrap();
        assert_eq!(fsm.state(), DispatchState::Terminate);
        fsm.poll().unwrap();
        assert_eq!(fsm.state(), DispatchState::Terminated);

        assert!(fsm.run_root().join("log").join("finish").is_file());
    }

    #[test]
    fn test_error_reports_are_drained_to_numbered_files() {
        let root = tempfile::tempdir().unwrap();
        let mut fsm = started_fsm(distributed_options(root.path(), &["t1"]));

        let mut transport = ScriptedTransport::default();
        transport.push_status_reply(&status_report(NodeRole::Vm, true, 0, 0, 0));
        // Status refresh after the test refill reports three errors.
        transport.push_status_reply(&status_report(NodeRole::Vm, true, 0, 0, 3));
        transport.push_reply(
            PacketKind::ErrorLog,
            &vec![
                NodeError::new("oops one"),
                NodeError::new("oops two"),
                NodeError::new("oops three"),
            ],
        );
        attach_node(&fsm, 1, NodeRole::Vm, transport);

        // first rotation + machine walk: config, commence, status, trace
        // check, test refill, error drain.
        for _ in 0..24 {
            fsm.poll().unwrap();
            if fsm.state() == DispatchState::Terminated {
                break;
            }
        }

        let vm_log = fsm.run_root().join("log").join("vm");
        assert_eq!(std::fs::read_to_string(vm_log.join("1")).unwrap(), "oops one");
        assert_eq!(std::fs::read_to_string(vm_log.join("2")).unwrap(), "oops two");
        assert_eq!(
            std::fs::read_to_string(vm_log.join("3")).unwrap(),
            "oops three"
        );

        let node_errors =
            std::fs::read_to_string(fsm.run_root().join("log").join("node-error.log")).unwrap();
        assert_eq!(node_errors.matches("Target: t1").count(), 3);
        assert!(node_errors.contains("oops two"));
    }

    #[test]
    fn test_vm_traces_flow_into_the_pool_and_svm_refills() {
        let root = tempfile::tempdir().unwrap();
        let mut options = distributed_options(root.path(), &["t1"]);
        options.vm.trace_multiplier = 2;
        let mut fsm = started_fsm(options);

        let traces = vec![Trace::new("t1", vec![1]), Trace::new("t1", vec![2])];

        let mut vm_transport = ScriptedTransport::default();
        vm_transport.push_status_reply(&status_report(NodeRole::Vm, true, 2, 0, 0));
        vm_transport.push_reply(PacketKind::Trace, &traces);
        attach_node(&fsm, 1, NodeRole::Vm, vm_transport);

        let mut svm_transport = ScriptedTransport::default();
        for _ in 0..5 {
            svm_transport.push_status_reply(&status_report(NodeRole::Svm, true, 0, 0, 0));
        }
        let svm_log = svm_transport.log_handle();
        attach_node(&fsm, 2, NodeRole::Svm, svm_transport);

        // Walk both machines until the VM's traces have been pooled and
        // the SVM has been refilled.
        for _ in 0..30 {
            fsm.poll().unwrap();
            if fsm.trace_pool.count_all_unique() == 2
                && svm_log.lock().unwrap().contains(&PacketKind::Trace)
            {
                break;
            }
        }

        assert_eq!(fsm.trace_pool.count_all_unique(), 2);
        // Both trace files were persisted under the run's trace dir.
        let entries = std::fs::read_dir(fsm.layout.trace_dir()).unwrap().count();
        assert_eq!(entries, 2);
        // The SVM received one refill transmission.
        let sent = svm_log.lock().unwrap().clone();
        assert_eq!(
            sent.iter().filter(|k| **k == PacketKind::Trace).count(),
            1
        );
    }

    #[test]
    fn test_vanished_trace_is_logged_and_refill_continues() {
        let root = tempfile::tempdir().unwrap();
        let mut options = distributed_options(root.path(), &["t1"]);
        options.vm.trace_multiplier = 2;
        let mut fsm = started_fsm(options);

        fsm.poll().unwrap(); // rotate to t1
        fsm.poll().unwrap();

        // Two pooled traces; one file vanishes before the refill.
        let good = Trace::new("t1", vec![5]);
        let good_path = fsm.layout.trace_dir().join(good.file_name());
        good.to_file(&good_path).unwrap();
        fsm.trace_pool.insert(&good_path).unwrap();

        let vanished = fsm.layout.trace_dir().join(Uuid::new_v4().to_string());
        std::fs::write(&vanished, b"{}").unwrap();
        fsm.trace_pool.insert(&vanished).unwrap();
        std::fs::remove_file(&vanished).unwrap();

        let refill = fsm.refill_traces(0);
        assert_eq!(refill.len(), 1);
        assert_eq!(refill[0], good);

        let exceptions =
            std::fs::read_to_string(fsm.layout.exception_log_path()).unwrap();
        assert!(exceptions.contains("trace refill lookup failed"));
    }

    #[test]
    fn test_test_refill_tops_up_to_the_multiplier() {
        let root = tempfile::tempdir().unwrap();
        let mut options = distributed_options(root.path(), &["t1"]);
        options.vm.test_multiplier = 4;
        let mut fsm = started_fsm(options);
        fsm.poll().unwrap();
        fsm.poll().unwrap();

        fsm.test_pool
            .insert(&[
                TestCase::new(vec![1]),
                TestCase::new(vec![2]),
                TestCase::new(vec![3]),
            ])
            .unwrap();

        // Worker already holds two pending cases; the cap is four.
        let refill = fsm.refill_tests(2);
        assert_eq!(refill.len(), 2);
        assert_eq!(fsm.test_pool.count_next(), 1);

        // An empty pool yields an empty refill.
        let refill = fsm.refill_tests(4);
        assert!(refill.is_empty());
    }

    #[test]
    fn test_parked_machine_is_skipped_by_the_pass() {
        let root = tempfile::tempdir().unwrap();
        let mut fsm = started_fsm(distributed_options(root.path(), &["t1"]));

        let mut transport = ScriptedTransport::default();
        transport.fail_on_send(PacketKind::Config);
        let log = transport.log_handle();
        attach_node(&fsm, 1, NodeRole::Vm, transport);

        fsm.poll().unwrap(); // rotation
        fsm.poll().unwrap();
        fsm.poll().unwrap(); // dispatch: config fails, machine parks

        assert!(lock_fsms(&fsm.vm_fsms)[0].is_errored());
        let exceptions = std::fs::read_to_string(fsm.layout.exception_log_path()).unwrap();
        assert!(exceptions.contains("machine parked"));

        // Further passes leave the parked machine alone.
        let sent_before = log.lock().unwrap().len();
        fsm.poll().unwrap();
        fsm.poll().unwrap();
        assert_eq!(log.lock().unwrap().len(), sent_before);
    }

    #[test]
    fn test_status_snapshot_reflects_pools_and_nodes() {
        let root = tempfile::tempdir().unwrap();
        let mut fsm = started_fsm(distributed_options(root.path(), &["t1"]));
        let handle = attach_node(&fsm, 1, NodeRole::Vm, ScriptedTransport::default());
        {
            let mut node = lock(&handle);
            node.status = NodeStatus {
                test_case_count: 5,
                trace_count: 2,
                ..node.status.clone()
            };
        }
        fsm.poll().unwrap();
        fsm.poll().unwrap();
        fsm.test_pool.insert(&[TestCase::new(vec![1])]).unwrap();

        let snapshot = fsm.snapshot();
        assert_eq!(snapshot.tests_left, 1);
        assert_eq!(snapshot.tests_total, 1);
        assert_eq!(snapshot.nodes.len(), 1);
        assert_eq!(snapshot.nodes[0].test_case_count, 5);
        assert_eq!(snapshot.nodes[0].trace_count, 2);

        let mut rendered = Vec::new();
        snapshot.render(&mut rendered).unwrap();
        assert!(String::from_utf8(rendered).unwrap().contains("5/2"));
    }
}
