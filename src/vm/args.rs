//! QEMU argument assembly.
//!
//! Token order is contractual: QEMU is sensitive to it, and the
//! override preview exposes the joined string to operators, so the
//! builder must be deterministic. Devices land on a chain of
//! `pci-bridge` buses with 31 usable addresses each (address 0 is
//! reserved); [`PciAllocator`] rotates to a fresh bridge whenever an
//! address would reach [`DEV_PER_BUS`].

use std::fmt::Write as _;
use std::path::Path;

use crate::util::{fields_quote_escape, unescape_join};
use crate::vm::config::VmConfig;

/// Device addresses per PCI bridge; address 0 is reserved, so 31 usable.
pub const DEV_PER_BUS: u32 = 32;

/// Ports per virtio-serial device (0 and 32 are reserved).
pub const DEV_PER_VIRTIO: u64 = 30;

/// Tracks the current bridge and next free address while devices are
/// appended.
struct PciAllocator {
    bus: u32,
    addr: u32,
}

impl PciAllocator {
    fn new() -> Self {
        Self { bus: 0, addr: 1 }
    }

    /// Emit a fresh `pci-bridge` and point the allocator at it.
    fn new_bus(&mut self, args: &mut Vec<String>) {
        self.bus += 1;
        self.addr = 1;
        args.push("-device".to_string());
        args.push(format!("pci-bridge,id=pci.{0},chassis_nr={0}", self.bus));
    }

    /// Claim the current address, rotating to a new bridge when full.
    fn advance(&mut self, args: &mut Vec<String>) {
        self.addr += 1;
        if self.addr == DEV_PER_BUS {
            self.new_bus(args);
        }
    }
}

/// Build the full QEMU argument vector for a configuration.
///
/// `id` is the host-unique instance id and `dir` the instance
/// directory that holds every UNIX socket and the pidfile.
pub fn qemu_args(config: &VmConfig, id: u32, dir: &Path) -> Vec<String> {
    let path = |name: &str| dir.join(name).display().to_string();

    let mut args: Vec<String> = Vec::with_capacity(64);
    let mut push = |s: String| args.push(s);

    push("-enable-kvm".into());
    push("-name".into());
    push(id.to_string());
    push("-m".into());
    push(config.base.memory.to_string());
    push("-nographic".into());
    push("-balloon".into());
    push("none".into());
    push("-vnc".into());
    push(format!("unix:{}", path("vnc")));
    push("-smp".into());
    push(config.base.vcpus.to_string());
    push("-qmp".into());
    push(format!("unix:{},server", path("qmp")));
    push("-vga".into());
    push("std".into());
    push("-rtc".into());
    push("clock=vm,base=utc".into());
    push("-device".into());
    push("virtio-serial".into());
    // USB 1.1 controller, creates bus usb-bus.0
    push("-usb".into());
    // USB 2.0 controller, creates bus ehci.0
    push("-device".into());
    push("usb-ehci,id=ehci".into());
    // absolute pointer coordinates for the VNC shim
    push("-device".into());
    push("usb-tablet,bus=usb-bus.0".into());

    for i in 0..config.kvm.serial_ports {
        push("-chardev".into());
        push(format!(
            "socket,id=charserial{0},path={1}{0},server,nowait",
            i,
            path("serial")
        ));
        push("-device".into());
        push(format!("isa-serial,chardev=charserial{0},id=serial{0}", i));
    }

    push("-pidfile".into());
    push(path("qemu.pid"));
    push("-k".into());
    push("en-us".into());

    if !config.kvm.cpu.is_empty() {
        push("-cpu".into());
        push(config.kvm.cpu.clone());
    }

    push("-net".into());
    push("none".into());
    push("-S".into());

    if let Some(migrate) = &config.kvm.migrate_from {
        push("-incoming".into());
        push(format!("exec:cat {}", migrate.display()));
    }

    for disk in &config.kvm.disks {
        push("-drive".into());
        push(format!("file={},media=disk", disk.display()));
    }

    if config.base.snapshot {
        push("-snapshot".into());
    }

    if let Some(kernel) = &config.kvm.kernel {
        push("-kernel".into());
        push(kernel.display().to_string());
    }
    if let Some(initrd) = &config.kvm.initrd {
        push("-initrd".into());
        push(initrd.display().to_string());
    }
    if !config.kvm.append.is_empty() {
        push("-append".into());
        push(unescape_join(&config.kvm.append));
    }

    if let Some(cdrom) = &config.kvm.cdrom {
        push("-drive".into());
        push(format!("file={},media=cdrom", cdrom.display()));
        push("-boot".into());
        push("once=d".into());
    } else {
        // an empty tray, so media can be inserted later
        push("-drive".into());
        push("media=cdrom".into());
    }

    let mut pci = PciAllocator::new();
    pci.new_bus(&mut args);

    for nic in &config.base.networks {
        args.push("-netdev".into());
        args.push(format!("tap,id={0},script=no,ifname={0}", nic.tap));
        args.push("-device".into());
        args.push(format!(
            "driver={},netdev={},mac={},bus=pci.{},addr=0x{:x}",
            nic.driver, nic.tap, nic.mac, pci.bus, pci.addr
        ));
        pci.advance(&mut args);
    }

    // The command-and-control virtio port is unconditional: every VM
    // gets virtio-serial0 with "cc" on port 1.
    args.push("-device".into());
    args.push(format!(
        "virtio-serial-pci,id=virtio-serial0,bus=pci.{},addr=0x{:x}",
        pci.bus, pci.addr
    ));
    args.push("-chardev".into());
    args.push(format!(
        "socket,id=charvserialCC,path={},server,nowait",
        path("cc")
    ));
    args.push("-device".into());
    args.push(
        "virtserialport,nr=1,bus=virtio-serial0.0,chardev=charvserialCC,id=charvserialCC,name=cc"
            .into(),
    );
    pci.advance(&mut args);

    let mut virtio_slot = 0u64;
    for i in 0..config.kvm.virtio_ports {
        let nr = i % DEV_PER_VIRTIO + 1;

        // Port 1 means the previous virtio-serial device is full (or
        // this is the first port): attach a new one.
        if nr == 1 {
            virtio_slot += 1;
            args.push("-device".into());
            args.push(format!(
                "virtio-serial-pci,id=virtio-serial{},bus=pci.{},addr=0x{:x}",
                virtio_slot, pci.bus, pci.addr
            ));
            pci.advance(&mut args);
        }

        args.push("-chardev".into());
        args.push(format!(
            "socket,id=charvserial{0},path={1}{0},server,nowait",
            i,
            path("virtio-serial")
        ));
        args.push("-device".into());
        args.push(format!(
            "virtserialport,nr={nr},bus=virtio-serial{virtio_slot}.0,\
             chardev=charvserial{i},id=charvserial{i},name=virtio-serial{i}"
        ));
    }

    args
}

/// Append the host-level and per-config trailing arguments: hugepages
/// hook, raw `qemu_append` tokens, and the final `-uuid`.
pub fn finish_args(args: &mut Vec<String>, config: &VmConfig, hugepages: Option<&Path>) {
    if let Some(mount) = hugepages {
        args.push("-mem-info".into());
        args.push(mount.display().to_string());
    }

    args.extend(config.kvm.qemu_append.iter().cloned());

    args.push("-uuid".into());
    args.push(config.base.uuid.clone());
}

/// Build the complete launch argument vector, overrides not yet applied.
pub fn build(config: &VmConfig, id: u32, dir: &Path, hugepages: Option<&Path>) -> Vec<String> {
    let mut args = qemu_args(config, id, dir);
    finish_args(&mut args, config, hugepages);
    args
}

/// Apply the configured override rewrites to an argument vector.
///
/// The vector is joined (quote-preserving), each override replaces all
/// occurrences of its match, and the result is re-tokenized.
pub fn apply_overrides(config: &VmConfig, args: &[String]) -> Vec<String> {
    let mut joined = unescape_join(args);
    for ov in &config.kvm.qemu_overrides {
        joined = joined.replace(&ov.matches, &ov.replacement);
    }
    fields_quote_escape('"', &joined)
}

/// Render the override table plus the argument string before and after
/// rewriting, without launching anything.
pub fn override_preview(config: &VmConfig) -> String {
    let mut out = String::new();
    out.push_str("id match replacement\n");
    for (i, ov) in config.kvm.qemu_overrides.iter().enumerate() {
        let _ = writeln!(out, "{} \"{}\" \"{}\"", i, ov.matches, ov.replacement);
    }

    // id and path don't matter, this never launches
    let args = build(config, 0, Path::new(""), None);
    let _ = write!(
        out,
        "\nBefore overrides:\n{}\n\nAfter overrides:\n{}\n",
        unescape_join(&args),
        unescape_join(&apply_overrides(config, &args))
    );

    out
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::vm::config::{NicConfig, QemuOverride};

    fn minimal_config() -> VmConfig {
        let mut cfg = VmConfig::default();
        cfg.base.memory = 512;
        cfg.base.vcpus = 1;
        cfg.base.uuid = "00000000-0000-0000-0000-000000000001".into();
        cfg.base.snapshot = true;
        cfg
    }

    fn nic(n: usize) -> NicConfig {
        NicConfig {
            bridge: "mega_bridge".into(),
            vlan: 100,
            mac: format!("00:00:00:00:00:{:02x}", n),
            driver: "e1000".into(),
            tap: format!("tap{}", n),
        }
    }

    #[test]
    fn minimal_launch_vector() {
        let cfg = minimal_config();
        let args = build(&cfg, 0, Path::new("/x"), None);

        let head: Vec<&str> = args.iter().map(String::as_str).take(14).collect();
        assert_eq!(
            head,
            [
                "-enable-kvm",
                "-name",
                "0",
                "-m",
                "512",
                "-nographic",
                "-balloon",
                "none",
                "-vnc",
                "unix:/x/vnc",
                "-smp",
                "1",
                "-qmp",
                "unix:/x/qmp,server",
            ]
        );

        // -uuid is last and appears exactly once
        assert_eq!(args[args.len() - 2], "-uuid");
        assert_eq!(args[args.len() - 1], "00000000-0000-0000-0000-000000000001");
        assert_eq!(args.iter().filter(|a| *a == "-uuid").count(), 1);

        // exactly one bridge, pci.1
        let bridges: Vec<&String> = args.iter().filter(|a| a.starts_with("pci-bridge")).collect();
        assert_eq!(bridges.len(), 1);
        assert!(bridges[0].contains("id=pci.1"));

        // exactly one cc port, nr=1 on virtio-serial0
        let cc: Vec<&String> = args.iter().filter(|a| a.ends_with("name=cc")).collect();
        assert_eq!(cc.len(), 1);
        assert!(cc[0].contains("nr=1"));
        assert!(cc[0].contains("bus=virtio-serial0.0"));

        // exactly one pidfile, inside the instance dir
        let pidfile = args.iter().position(|a| a == "-pidfile").unwrap();
        assert_eq!(args[pidfile + 1], "/x/qemu.pid");
        assert_eq!(args.iter().filter(|a| *a == "-pidfile").count(), 1);

        assert!(args.contains(&"-snapshot".to_string()));
        assert!(args.contains(&"media=cdrom".to_string()));
        assert!(!args.contains(&"once=d".to_string()));
    }

    #[test]
    fn thirty_three_nics_rotate_to_second_bus() {
        let mut cfg = minimal_config();
        cfg.base.networks = (0..33).map(nic).collect();

        let args = build(&cfg, 0, Path::new("/x"), None);

        let bridges: Vec<&String> = args.iter().filter(|a| a.starts_with("pci-bridge")).collect();
        assert_eq!(bridges.len(), 2);
        assert!(bridges[0].contains("id=pci.1"));
        assert!(bridges[1].contains("id=pci.2"));

        // NICs 0..=30 fill pci.1 at 0x1..=0x1f; the rotation happens
        // when the address would reach 32, so the next NIC opens pci.2.
        let rotated = args
            .iter()
            .find(|a| a.contains("mac=00:00:00:00:00:1f"))
            .unwrap();
        assert!(rotated.contains("bus=pci.2,addr=0x1"), "{}", rotated);
        let last = args
            .iter()
            .find(|a| a.contains("mac=00:00:00:00:00:20"))
            .unwrap();
        assert!(last.contains("bus=pci.2,addr=0x2"), "{}", last);

        // no bus ever exceeds 31 device addresses
        for arg in &args {
            if let Some(idx) = arg.find("addr=0x") {
                let addr = u32::from_str_radix(&arg[idx + 7..], 16).unwrap();
                assert!(addr < DEV_PER_BUS, "{}", arg);
            }
        }
    }

    #[test]
    fn cdrom_sets_boot_once() {
        let mut cfg = minimal_config();
        cfg.kvm.cdrom = Some(PathBuf::from("/iso/boot.iso"));

        let args = build(&cfg, 0, Path::new("/x"), None);
        assert!(args.contains(&"file=/iso/boot.iso,media=cdrom".to_string()));
        assert!(args.contains(&"once=d".to_string()));
        assert_eq!(
            args.iter().filter(|a| a.contains("media=cdrom")).count(),
            1
        );
    }

    #[test]
    fn no_snapshot_no_flag() {
        let mut cfg = minimal_config();
        cfg.base.snapshot = false;
        let args = build(&cfg, 0, Path::new("/x"), None);
        assert!(!args.contains(&"-snapshot".to_string()));
    }

    #[test]
    fn virtio_ports_chain_devices() {
        let mut cfg = minimal_config();
        cfg.kvm.virtio_ports = 31; // 30 on the first extra device, 1 on the next

        let args = build(&cfg, 0, Path::new("/x"), None);
        assert!(args.iter().any(|a| a.contains("id=virtio-serial1,")));
        assert!(args.iter().any(|a| a.contains("id=virtio-serial2,")));
        // port 31 wraps back to nr=1 on the new device
        assert!(args
            .iter()
            .any(|a| a.contains("nr=1,bus=virtio-serial2.0")));
    }

    #[test]
    fn override_rewrites_once_and_retokenizes() {
        let mut cfg = minimal_config();
        cfg.kvm.qemu_overrides.push(QemuOverride {
            matches: "-enable-kvm".into(),
            replacement: "-enable-kvm,kernel-irqchip=on".into(),
        });

        let args = build(&cfg, 0, Path::new("/x"), None);
        let rewritten = apply_overrides(&cfg, &args);

        assert_eq!(rewritten.len(), args.len());
        assert_eq!(rewritten[0], "-enable-kvm,kernel-irqchip=on");
        assert_eq!(&rewritten[1..], &args[1..]);

        let preview = override_preview(&cfg);
        assert_eq!(preview.matches("kernel-irqchip=on").count(), 2); // table + after
    }

    #[test]
    fn append_tokens_survive_override_round_trip() {
        let mut cfg = minimal_config();
        cfg.kvm.kernel = Some(PathBuf::from("/boot/vmlinuz"));
        cfg.kvm.append = vec!["root=/dev/vda".into(), "quiet".into()];
        cfg.kvm.migrate_from = Some(PathBuf::from("/imgs/save.img"));

        let args = build(&cfg, 0, Path::new("/x"), None);
        // -incoming value carries an embedded space and must survive
        let rewritten = apply_overrides(&cfg, &args);
        assert!(rewritten.contains(&"exec:cat /imgs/save.img".to_string()));
        assert_eq!(rewritten, args);
    }

    #[test]
    fn serial_ports_emit_chardev_device_pairs() {
        let mut cfg = minimal_config();
        cfg.kvm.serial_ports = 2;
        let args = build(&cfg, 3, Path::new("/x"), None);
        assert!(args
            .contains(&"socket,id=charserial0,path=/x/serial0,server,nowait".to_string()));
        assert!(args.contains(&"isa-serial,chardev=charserial1,id=serial1".to_string()));
    }

    #[test]
    fn hugepages_and_raw_append_precede_uuid() {
        let mut cfg = minimal_config();
        cfg.kvm.qemu_append = vec!["-serial".into(), "tcp:localhost:4001".into()];
        let args = build(&cfg, 0, Path::new("/x"), Some(Path::new("/mnt/huge")));

        let mem = args.iter().position(|a| a == "-mem-info").unwrap();
        assert_eq!(args[mem + 1], "/mnt/huge");
        let serial = args.iter().position(|a| a == "-serial").unwrap();
        let uuid = args.iter().position(|a| a == "-uuid").unwrap();
        assert!(mem < serial && serial < uuid);
    }
}
