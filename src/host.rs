//! Host-level VM bookkeeping.
//!
//! One [`Host`] value owns everything that would otherwise be
//! process-global: the VM table, the id allocator, the kill-ack
//! channel, and the settings every launch consults. Tests build fresh
//! hosts; nothing here is a static.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc, OnceLock};

use parking_lot::Mutex;

use crate::bridge::{Bridge, CcConnector};
use crate::error::{Error, Result};
use crate::vm::{KvmVm, Vm, VmConfig, VmContext, VmState};
use crate::vnc::VncHandler;

/// Process-wide settings, fixed at host construction.
#[derive(Clone)]
pub struct HostSettings {
    /// This host's name, used in VM display strings.
    pub hostname: String,
    /// Directory instance directories are created under.
    pub base_dir: PathBuf,
    /// Base directory for migration image filenames.
    pub io_base: PathBuf,
    /// Hugepages mount forwarded to QEMU when set.
    pub hugepages: Option<PathBuf>,
    /// CPU set QEMU processes are pinned to.
    pub affinity: Option<Vec<usize>>,
    /// Name of the VM that refuses to stop; disabled by default.
    pub unstoppable: Option<String>,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            base_dir: PathBuf::from("/tmp/corral"),
            io_base: PathBuf::from("/tmp/corral/files"),
            hugepages: None,
            affinity: None,
            unstoppable: None,
        }
    }
}

/// The VM table and its collaborators.
pub struct Host {
    settings: HostSettings,
    bridge: Arc<dyn Bridge>,
    cc: Option<Arc<dyn CcConnector>>,
    vnc_handler: VncHandler,
    vms: Mutex<HashMap<u32, Vm>>,
    next_id: AtomicU32,
    kill_ack_tx: mpsc::Sender<u32>,
    kill_ack_rx: Mutex<mpsc::Receiver<u32>>,
}

impl Host {
    /// Create a host with the given settings and bridge collaborator.
    pub fn new(settings: HostSettings, bridge: Arc<dyn Bridge>) -> Self {
        let (kill_ack_tx, kill_ack_rx) = mpsc::channel();
        Self {
            settings,
            bridge,
            cc: None,
            vnc_handler: Arc::new(|ns, msg| {
                tracing::debug!(vm = %ns, message = ?msg, "vnc client message");
            }),
            vms: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(0),
            kill_ack_tx,
            kill_ack_rx: Mutex::new(kill_ack_rx),
        }
    }

    /// Attach a command-and-control connector.
    pub fn with_cc(mut self, cc: Arc<dyn CcConnector>) -> Self {
        self.cc = Some(cc);
        self
    }

    /// Replace the VNC event handler.
    pub fn with_vnc_handler(mut self, handler: VncHandler) -> Self {
        self.vnc_handler = handler;
        self
    }

    /// Settings the host was built with.
    pub fn settings(&self) -> &HostSettings {
        &self.settings
    }

    /// Create a KVM VM and register it in the table.
    ///
    /// Ids are allocated monotonically and never reused for the life
    /// of the host. The new VM is checked for conflicts against every
    /// registered VM before it is admitted.
    pub fn new_kvm(
        &self,
        name: impl Into<String>,
        namespace: impl Into<String>,
        config: &VmConfig,
    ) -> Result<Arc<KvmVm>> {
        let name = name.into();
        let namespace = namespace.into();

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let instance_dir = self.settings.base_dir.join(id.to_string());

        let ctx = VmContext {
            bridge: Arc::clone(&self.bridge),
            cc: self.cc.clone(),
            vnc_handler: Arc::clone(&self.vnc_handler),
            io_base: self.settings.io_base.clone(),
            hugepages: self.settings.hugepages.clone(),
            affinity: self.settings.affinity.clone(),
            unstoppable: self.settings.unstoppable.clone(),
            kill_ack: self.kill_ack_tx.clone(),
        };

        let vm = KvmVm::new(id, name, namespace, config, instance_dir, ctx)?;
        let entry = Vm::Kvm(Arc::clone(&vm));

        let mut vms = self.vms.lock();
        for existing in vms.values() {
            entry.conflicts(existing)?;
        }
        vms.insert(id, entry);

        Ok(vm)
    }

    /// Look up a VM by id.
    pub fn get(&self, id: u32) -> Option<Vm> {
        self.vms.lock().get(&id).cloned()
    }

    /// Look up a VM by name within a namespace.
    pub fn find(&self, namespace: &str, name: &str) -> Option<Vm> {
        self.vms
            .lock()
            .values()
            .find(|vm| match vm {
                Vm::Kvm(k) => k.namespace() == namespace && k.name() == name,
            })
            .cloned()
    }

    /// All registered VMs, in id order.
    pub fn list(&self) -> Vec<Vm> {
        let vms = self.vms.lock();
        let mut out: Vec<Vm> = vms.values().cloned().collect();
        out.sort_by_key(Vm::id);
        out
    }

    /// Flush every VM that has quit or errored, releasing its taps and
    /// instance directory and dropping it from the table.
    pub fn flush(&self) -> Result<()> {
        let mut vms = self.vms.lock();

        let done: Vec<u32> = vms
            .iter()
            .filter(|(_, vm)| vm.state().intersects(VmState::QUIT | VmState::ERROR))
            .map(|(id, _)| *id)
            .collect();

        for id in done {
            if let Some(vm) = vms.remove(&id) {
                vm.flush()?;
            }
        }

        Ok(())
    }

    /// Block until a killed VM acknowledges teardown, returning its id.
    pub fn kill_ack(&self) -> Result<u32> {
        self.kill_ack_rx
            .lock()
            .recv()
            .map_err(|_| Error::launch("kill ack channel closed".to_string()))
    }
}

/// QEMU network drivers available on this host, parsed from
/// `kvm -device help` exactly once. The first caller pays the exec;
/// everyone else reads the cache.
static NETWORK_DRIVERS: OnceLock<Vec<String>> = OnceLock::new();

/// True if `driver` is a NIC driver this host's QEMU understands.
pub fn is_network_driver(driver: &str) -> bool {
    let drivers = NETWORK_DRIVERS.get_or_init(|| {
        let output = match Command::new("kvm").args(["-device", "help"]).output() {
            Ok(out) => out,
            Err(e) => {
                tracing::error!(error = %e, "unable to determine kvm network drivers");
                return Vec::new();
            }
        };

        let text = String::from_utf8_lossy(&output.stdout);
        parse_network_drivers(&text)
    });

    drivers.iter().any(|d| d == driver)
}

/// Pull the driver names out of the "Network devices:" section of
/// `kvm -device help`.
fn parse_network_drivers(help: &str) -> Vec<String> {
    let mut drivers = Vec::new();
    let mut in_section = false;

    for line in help.lines() {
        if !in_section {
            in_section = line.contains("Network devices:");
        } else if line.trim().is_empty() {
            break;
        } else if let Some(name) = line.split_whitespace().nth(1) {
            drivers.push(name.trim_matches(|c| c == '"' || c == ',').to_string());
        }
    }

    tracing::debug!(drivers = ?drivers, "detected network drivers");
    drivers
}
