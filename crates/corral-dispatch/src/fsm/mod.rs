//! Per-worker state machines.
//!
//! Each registered worker is driven by exactly one machine: [`vm::VmNodeFsm`]
//! for VM nodes, [`svm::SvmNodeFsm`] for SVM nodes. A machine is a tagged
//! state plus its context (node handle, buffered work, cached fingerprint);
//! guards and actions are methods on the context, and one delivered event
//! performs at most one transition.
//!
//! Each state exposes a **capability flag**. The dispatch supervisor never
//! inspects worker machines beyond their flag: it picks the event to
//! deliver from the flag alone, which keeps the per-worker protocol logic
//! entirely inside the machine.
//!
//! A failing action or guard moves the machine to its `Error` state; the
//! supervisor logs the failure and stops delivering events to that
//! machine, leaving the rest of the fleet running.

pub mod svm;
pub mod vm;

use std::sync::{Arc, Mutex, MutexGuard};

use corral_core::node::NodeRole;
use corral_core::options::DispatchOptions;
use tracing::debug;

use crate::node::{lock, NodeHandle};

/// Shared list of VM machines, appended by the registrar callback and
/// iterated by the dispatch thread.
pub type VmFsmList = Arc<Mutex<Vec<vm::VmNodeFsm>>>;

/// Shared list of SVM machines.
pub type SvmFsmList = Arc<Mutex<Vec<svm::SvmNodeFsm>>>;

/// Create an empty shared machine list.
#[must_use]
pub fn shared_fsm_list<T>() -> Arc<Mutex<Vec<T>>> {
    Arc::new(Mutex::new(Vec::new()))
}

/// Acquire a machine-list lock, recovering from a poisoned lock.
pub fn lock_fsms<T>(list: &Arc<Mutex<Vec<T>>>) -> MutexGuard<'_, Vec<T>> {
    list.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Attach a fresh machine to a registered worker handle.
///
/// Marks the worker active and starts the machine matching its role.
/// Newly attached VM machines never count as "first": the guest-data leg
/// of the VM machine stays reachable in principle but is not taken for
/// registered workers.
pub fn register_node_fsm(
    handle: &NodeHandle,
    options: &DispatchOptions,
    vm_fsms: &VmFsmList,
    svm_fsms: &SvmFsmList,
) {
    let role = {
        let mut node = lock(handle);
        node.status.active = true;
        node.status.role
    };

    match role {
        NodeRole::Vm => {
            let mut fsm = vm::VmNodeFsm::new();
            fsm.start(
                Arc::clone(handle),
                false,
                options.vm.image.update,
                options.mode.distributed,
            );
            lock_fsms(vm_fsms).push(fsm);
        }
        NodeRole::Svm => {
            let mut fsm = svm::SvmNodeFsm::new();
            fsm.start(Arc::clone(handle));
            lock_fsms(svm_fsms).push(fsm);
        }
    }
    debug!(role = %role, "node machine registered");
}
