//! Declarative VM configuration.
//!
//! A configuration is assembled before launch and snapshotted into the
//! instance when it starts; `Clone` performs the deep copy (every
//! sequence owns its elements), so cloned configs never alias.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default virtual CPU model.
pub const DEFAULT_CPU: &str = "host";

/// VLAN value marking a NIC whose tap is detached from any bridge.
pub const DISCONNECTED_VLAN: i32 = -1;

/// One virtual NIC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicConfig {
    /// Host bridge the tap attaches to.
    pub bridge: String,
    /// VLAN tag, or [`DISCONNECTED_VLAN`].
    pub vlan: i32,
    /// Guest-visible MAC address.
    pub mac: String,
    /// QEMU NIC driver (e.g. `e1000`, `virtio-net-pci`).
    pub driver: String,
    /// Host tap device name; empty until the bridge creates it.
    pub tap: String,
}

/// One qemu-argument override: a substring match applied to the joined
/// argument string, replaced everywhere it occurs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QemuOverride {
    /// Substring to find.
    pub matches: String,
    /// Replacement text.
    pub replacement: String,
}

/// Configuration shared by every VM flavor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseConfig {
    /// Guest memory in MiB.
    pub memory: u64,
    /// Number of vCPUs, at least 1.
    pub vcpus: u64,
    /// Textual UUID handed to QEMU verbatim.
    pub uuid: String,
    /// Run all disks in snapshot (copy-on-write, discard-on-exit) mode.
    pub snapshot: bool,
    /// Virtual NICs, in PCI attach order.
    pub networks: Vec<NicConfig>,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            memory: 2048,
            vcpus: 1,
            uuid: String::new(),
            snapshot: true,
            networks: Vec::new(),
        }
    }
}

/// KVM-specific configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct KvmConfig {
    /// QEMU binary to invoke; `None` resolves `kvm` from PATH.
    pub qemu_path: Option<PathBuf>,
    /// Kernel image to boot instead of a disk.
    pub kernel: Option<PathBuf>,
    /// Initrd passed alongside the kernel.
    pub initrd: Option<PathBuf>,
    /// Cdrom image; when set it becomes the one-shot boot device.
    pub cdrom: Option<PathBuf>,
    /// Migration image to resume from.
    pub migrate_from: Option<PathBuf>,
    /// Virtual CPU model; empty means [`DEFAULT_CPU`] is not forced.
    pub cpu: String,
    /// Number of ISA serial ports, each backed by `serial<i>` sockets.
    pub serial_ports: u64,
    /// Number of extra virtio-serial ports beyond the control port.
    pub virtio_ports: u64,
    /// Kernel command line tokens.
    pub append: Vec<String>,
    /// Disk images, in attach order.
    pub disks: Vec<PathBuf>,
    /// Extra raw QEMU arguments appended verbatim.
    pub qemu_append: Vec<String>,
    /// Ordered rewrite rules applied to the final argument string.
    pub qemu_overrides: Vec<QemuOverride>,
}

/// Full configuration for one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VmConfig {
    /// Flavor-independent settings.
    pub base: BaseConfig,
    /// KVM settings.
    pub kvm: KvmConfig,
}

impl VmConfig {
    /// Reject configurations that cannot launch.
    ///
    /// Surfaced to the caller before any process is spawned; never
    /// fatal to the host.
    pub fn validate(&self) -> Result<()> {
        if self.base.vcpus == 0 {
            return Err(Error::config("vcpus must be at least 1"));
        }

        if !self.kvm.append.is_empty() && self.kvm.kernel.is_none() {
            return Err(Error::config("append requires a kernel"));
        }

        Ok(())
    }
}

impl fmt::Display for BaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Current VM configuration:")?;
        writeln!(f, "Memory:    {}", self.memory)?;
        writeln!(f, "VCPUs:     {}", self.vcpus)?;
        writeln!(f, "UUID:      {}", self.uuid)?;
        writeln!(f, "Snapshot:  {}", self.snapshot)?;
        writeln!(f, "Networks:  {}", self.networks.len())?;
        for nic in &self.networks {
            writeln!(
                f,
                "  {} vlan {} mac {} driver {} tap {}",
                nic.bridge, nic.vlan, nic.mac, nic.driver, nic.tap
            )?;
        }
        Ok(())
    }
}

impl fmt::Display for KvmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn opt(p: &Option<PathBuf>) -> String {
            p.as_ref().map(|p| p.display().to_string()).unwrap_or_default()
        }

        writeln!(f, "Current KVM configuration:")?;
        writeln!(f, "Migrate Path:       {}", opt(&self.migrate_from))?;
        writeln!(
            f,
            "Disk Paths:         {}",
            self.disks
                .iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(" ")
        )?;
        writeln!(f, "CDROM Path:         {}", opt(&self.cdrom))?;
        writeln!(f, "Kernel Path:        {}", opt(&self.kernel))?;
        writeln!(f, "Initrd Path:        {}", opt(&self.initrd))?;
        writeln!(f, "Kernel Append:      {}", self.append.join(" "))?;
        writeln!(f, "QEMU Path:          {}", opt(&self.qemu_path))?;
        writeln!(f, "QEMU Append:        {}", self.qemu_append.join(" "))?;
        writeln!(f, "Serial Ports:       {}", self.serial_ports)?;
        writeln!(f, "Virtio-Serial Ports: {}", self.virtio_ports)?;
        Ok(())
    }
}

impl fmt::Display for VmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.base, self.kvm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_is_deep() {
        let mut a = VmConfig::default();
        a.kvm.disks.push(PathBuf::from("/a.qcow2"));
        a.base.networks.push(NicConfig {
            bridge: "br0".into(),
            vlan: 100,
            mac: "00:11:22:33:44:55".into(),
            driver: "e1000".into(),
            tap: String::new(),
        });

        let mut b = a.clone();
        b.kvm.disks.push(PathBuf::from("/b.qcow2"));
        b.base.networks[0].tap = "tap0".into();

        assert_eq!(a.kvm.disks.len(), 1);
        assert_eq!(a.base.networks[0].tap, "");
    }

    #[test]
    fn append_without_kernel_rejected() {
        let mut cfg = VmConfig::default();
        cfg.kvm.append.push("console=ttyS0".into());
        assert!(cfg.validate().is_err());

        cfg.kvm.kernel = Some(PathBuf::from("/boot/vmlinuz"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_vcpus_rejected() {
        let mut cfg = VmConfig::default();
        cfg.base.vcpus = 0;
        assert!(cfg.validate().is_err());
    }
}
