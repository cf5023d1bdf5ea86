//! VM abstractions.
//!
//! Concrete VM flavors are a closed set dispatched by tagged match,
//! not trait objects: conflict checking is a double dispatch on the
//! flavor pair, which a match expresses directly.

pub mod args;
pub mod config;
pub mod kvm;
pub mod state;

use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use crate::bridge::{Bridge, CcConnector};
use crate::error::Result;
use crate::vnc::VncHandler;

pub use config::{BaseConfig, KvmConfig, NicConfig, QemuOverride, VmConfig};
pub use kvm::KvmVm;
pub use state::VmState;

/// Collaborators and host-wide settings a VM needs while launching and
/// running. Cloned into each instance so background threads never
/// reach back into the host table.
#[derive(Clone)]
pub struct VmContext {
    /// Creates/destroys taps for NICs.
    pub bridge: Arc<dyn Bridge>,
    /// Optional command-and-control layer dialed after QMP comes up.
    pub cc: Option<Arc<dyn CcConnector>>,
    /// Receives decoded VNC client messages.
    pub vnc_handler: VncHandler,
    /// Base directory for migration image filenames.
    pub io_base: PathBuf,
    /// Hugepages mount passed to QEMU when configured.
    pub hugepages: Option<PathBuf>,
    /// CPU set launched QEMU processes are pinned to.
    pub affinity: Option<Vec<usize>>,
    /// Name of a VM that refuses to stop (operator humor hook).
    pub unstoppable: Option<String>,
    /// Acknowledges operator-initiated kills with the VM id.
    pub kill_ack: mpsc::Sender<u32>,
}

/// A VM of any flavor.
///
/// The container flavor lives in an external collaborator; only KVM is
/// concrete here, but the dispatch stays a tagged match so conflict
/// rules remain a flavor-pair table.
#[derive(Clone)]
pub enum Vm {
    /// A QEMU/KVM-backed VM.
    Kvm(Arc<KvmVm>),
}

impl Vm {
    /// Unique-per-host instance id.
    pub fn id(&self) -> u32 {
        match self {
            Vm::Kvm(vm) => vm.id(),
        }
    }

    /// Operator-assigned name.
    pub fn name(&self) -> &str {
        match self {
            Vm::Kvm(vm) => vm.name(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> VmState {
        match self {
            Vm::Kvm(vm) => vm.state(),
        }
    }

    /// Check whether two VMs can coexist on this host.
    pub fn conflicts(&self, other: &Vm) -> Result<()> {
        match (self, other) {
            (Vm::Kvm(a), Vm::Kvm(b)) => a.conflicts_kvm(b),
        }
    }

    /// Release host resources (taps, instance directory).
    pub fn flush(&self) -> Result<()> {
        match self {
            Vm::Kvm(vm) => vm.flush(),
        }
    }
}
