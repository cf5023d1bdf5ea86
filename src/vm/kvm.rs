//! KVM VM supervisor.
//!
//! Owns one QEMU process per instance and everything attached to it:
//! the instance directory, the QMP control channel, the VNC shim, and
//! the hotplug table. Every mutating operation serializes on the
//! per-instance lock; the background threads spawned at launch (stderr
//! drain, process wait, kill arbiter, QMP event logger) only take the
//! lock at state-transition time, never across blocking I/O on the
//! child process itself.

use std::collections::BTreeMap;
use std::io::Read;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{mpsc, Arc};

use parking_lot::Mutex;
use serde_json::Value;

use crate::bridge;
use crate::error::{Error, Result};
use crate::process;
use crate::qmp;
use crate::util::ppm_to_png;
use crate::vm::args;
use crate::vm::config::{VmConfig, DISCONNECTED_VLAN};
use crate::vm::state::VmState;
use crate::vm::VmContext;
use crate::vnc;

/// The cdrom device id QEMU assigns to the builder's cdrom drive.
const CDROM_DEVICE: &str = "ide0-cd1";

/// One hot-added USB drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hotplug {
    /// Backing image path.
    pub disk: PathBuf,
    /// USB version the device was attached with ("1.1" or "2.0").
    pub version: String,
}

/// Mutable instance state, guarded by the per-instance lock.
struct Inner {
    state: VmState,
    config: VmConfig,
    pid: Option<i32>,
    qmp: Option<Arc<qmp::Client>>,
    shim: Option<vnc::Shim>,
    vnc_port: u16,
    hotplug: BTreeMap<u32, Hotplug>,
    kill_tx: Option<mpsc::Sender<()>>,
    kill_rx: Option<mpsc::Receiver<()>>,
}

/// A KVM-backed VM instance.
pub struct KvmVm {
    id: u32,
    name: String,
    namespace: String,
    instance_dir: PathBuf,
    ctx: VmContext,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for KvmVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvmVm")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KvmVm {
    /// Create a new instance in the `BUILDING` state.
    ///
    /// The configuration is validated and snapshotted (deep copy), so
    /// later edits to the caller's copy never leak in.
    pub fn new(
        id: u32,
        name: impl Into<String>,
        namespace: impl Into<String>,
        config: &VmConfig,
        instance_dir: PathBuf,
        ctx: VmContext,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let (kill_tx, kill_rx) = mpsc::channel();

        Ok(Arc::new(Self {
            id,
            name: name.into(),
            namespace: namespace.into(),
            instance_dir,
            ctx,
            inner: Mutex::new(Inner {
                state: VmState::BUILDING,
                config: config.clone(),
                pid: None,
                qmp: None,
                shim: None,
                vnc_port: 0,
                hotplug: BTreeMap::new(),
                kill_tx: Some(kill_tx),
                kill_rx: Some(kill_rx),
            }),
        }))
    }

    /// Instance id, unique per host and never reused.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Operator-assigned name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace the VM belongs to.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Directory holding the instance's sockets and metadata files.
    pub fn instance_dir(&self) -> &Path {
        &self.instance_dir
    }

    /// Current lifecycle state.
    pub fn state(&self) -> VmState {
        self.inner.lock().state
    }

    /// TCP port of the VNC shim, 0 before launch.
    pub fn vnc_port(&self) -> u16 {
        self.inner.lock().vnc_port
    }

    /// Deep copy of the instance's configuration snapshot.
    pub fn config(&self) -> VmConfig {
        self.inner.lock().config.clone()
    }

    fn path(&self, name: &str) -> PathBuf {
        self.instance_dir.join(name)
    }

    /// Launch QEMU. Legal from `BUILDING` (first launch) or from
    /// `QUIT`/`ERROR` (relaunch).
    pub fn launch(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.inner.lock();

        if !inner.state.can_launch() {
            return Err(Error::invalid_state(
                self.id,
                "BUILDING|QUIT|ERROR",
                inner.state.to_string(),
            ));
        }

        self.launch_locked(&mut inner)
    }

    /// Resume the guest. A no-op when already running; relaunches
    /// first when the VM has quit or errored.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.inner.lock();

        if inner.state.intersects(VmState::RUNNING) {
            return Ok(());
        }

        if inner.state.intersects(VmState::QUIT | VmState::ERROR) {
            tracing::info!(vm = self.id, "relaunching");

            // Fresh kill channel: the previous one was consumed when
            // the old process went away.
            let (kill_tx, kill_rx) = mpsc::channel();
            inner.kill_tx = Some(kill_tx);
            inner.kill_rx = Some(kill_rx);

            self.launch_locked(&mut inner)?;
        }

        tracing::info!(vm = self.id, "starting");
        let q = require_qmp(&inner)?;
        if let Err(e) = q.start() {
            tracing::error!(vm = self.id, error = %e, "start failed");
            set_error(&mut inner, self.id);
            return Err(e);
        }

        inner.state = VmState::RUNNING;
        Ok(())
    }

    /// Pause the guest. Requires `RUNNING`.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        if self.ctx.unstoppable.as_deref() == Some(self.name.as_str()) {
            return Err(Error::launch(format!("{} is unstoppable", self.name)));
        }

        if inner.state != VmState::RUNNING {
            return Err(Error::NotRunning(self.id));
        }

        tracing::info!(vm = self.id, "stopping");
        let q = require_qmp(&inner)?;
        if let Err(e) = q.stop() {
            tracing::error!(vm = self.id, error = %e, "stop failed");
            set_error(&mut inner, self.id);
            return Err(e);
        }

        inner.state = VmState::PAUSED;
        Ok(())
    }

    /// Request an operator kill. Delivery is a single send; the kill
    /// arbiter races it against natural exit, so duplicates and
    /// already-exited VMs are harmless.
    pub fn kill(&self) -> Result<()> {
        let inner = self.inner.lock();
        match &inner.kill_tx {
            Some(tx) => {
                // A send after exit finds the receiver gone; that's the
                // natural-exit branch having won the race.
                let _ = tx.send(());
                Ok(())
            }
            None => Err(Error::NotRunning(self.id)),
        }
    }

    /// The low-level launch path. Caller holds the lock.
    fn launch_locked(self: &Arc<Self>, inner: &mut Inner) -> Result<()> {
        tracing::info!(vm = self.id, "launching");

        // First launch creates the instance directory; it survives
        // until flush.
        if inner.state == VmState::BUILDING {
            if let Err(e) = create_instance_dir(&self.instance_dir) {
                set_error(inner, self.id);
                return Err(e);
            }
        }
        inner.state = VmState::BUILDING;

        if let Err(e) = self.write_metadata(inner) {
            set_error(inner, self.id);
            return Err(e);
        }

        // Create any taps that don't exist yet.
        for nic in &mut inner.config.base.networks {
            if !nic.tap.is_empty() {
                continue;
            }
            match self.ctx.bridge.create_tap(&nic.mac, nic.vlan) {
                Ok(tap) => nic.tap = tap,
                Err(e) => {
                    tracing::error!(vm = self.id, error = %e, "create tap failed");
                    set_error(inner, self.id);
                    return Err(e);
                }
            }
        }

        if !inner.config.base.networks.is_empty() {
            if let Err(e) = self.write_taps(inner) {
                set_error(inner, self.id);
                return Err(e);
            }
        }

        let argv = args::build(
            &inner.config,
            self.id,
            &self.instance_dir,
            self.ctx.hugepages.as_deref(),
        );
        let argv = args::apply_overrides(&inner.config, &argv);
        tracing::debug!(vm = self.id, args = ?argv, "final qemu args");

        let qemu = inner
            .config
            .kvm
            .qemu_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("kvm"));

        let mut child = match Command::new(&qemu)
            .args(&argv)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let err = Error::launch(format!("start qemu {}: {}", qemu.display(), e));
                tracing::error!(vm = self.id, error = %err, "spawn failed");
                set_error(inner, self.id);
                return Err(err);
            }
        };

        let pid = child.id() as i32;
        inner.pid = Some(pid);
        tracing::debug!(vm = self.id, pid, "qemu spawned");

        if let Some(cpus) = &self.ctx.affinity {
            if let Err(e) = process::set_affinity(pid, cpus) {
                tracing::warn!(vm = self.id, error = %e, "affinity not applied");
            }
        }

        // Drain stdout and capture stderr for exit diagnostics.
        let stderr_buf = Arc::new(Mutex::new(String::new()));
        spawn_output_drain(&mut child, Arc::clone(&stderr_buf));

        // Wait thread: owns the child, transitions state when it exits.
        let (wait_tx, wait_rx) = mpsc::channel::<()>();
        {
            let vm = Arc::clone(self);
            let stderr_buf = Arc::clone(&stderr_buf);
            std::thread::spawn(move || {
                vm.reap(child, stderr_buf);
                drop(wait_tx);
            });
        }

        // Kill arbiter: operator kill vs natural exit.
        let kill_rx = match inner.kill_rx.take() {
            Some(rx) => rx,
            None => {
                // Relaunch without start(): make a fresh channel pair.
                let (tx, rx) = mpsc::channel();
                inner.kill_tx = Some(tx);
                rx
            }
        };
        {
            let id = self.id;
            let kill_ack = self.ctx.kill_ack.clone();
            std::thread::spawn(move || {
                if kill_rx.recv().is_ok() {
                    tracing::info!(vm = id, "killing");
                    process::kill(pid);
                    // Receive fails once the wait thread drops its end,
                    // meaning the process is truly gone.
                    let _ = wait_rx.recv();
                    let _ = kill_ack.send(id);
                }
            });
        }

        // Control channel. A failure here orphans the process, so kill
        // it before reporting.
        let q = match qmp::Client::connect(&self.path("qmp")) {
            Ok(q) => q,
            Err(e) => {
                process::kill(pid);
                tracing::error!(vm = self.id, error = %e, "qmp connect failed");
                set_error(inner, self.id);
                return Err(e);
            }
        };

        if let Some(events) = q.take_events() {
            spawn_qmp_logger(self.id, events);
        }
        inner.qmp = Some(q);

        let handler = Arc::clone(&self.ctx.vnc_handler);
        let ns = format!("{}:{}", self.namespace, self.name);
        match vnc::Shim::start(ns, self.path("vnc"), handler) {
            Ok(shim) => {
                inner.vnc_port = shim.port();
                inner.shim = Some(shim);
            }
            Err(e) => {
                process::kill(pid);
                tracing::error!(vm = self.id, error = %e, "vnc shim failed");
                set_error(inner, self.id);
                return Err(e);
            }
        }

        if let Some(cc) = &self.ctx.cc {
            if let Err(e) = cc.dial_serial(&self.path("cc")) {
                tracing::warn!(vm = self.id, error = %e, "unable to connect cc");
            }
        }

        Ok(())
    }

    /// Block on the child and classify its exit. Runs on the wait
    /// thread; takes the instance lock only after `wait` returns.
    fn reap(&self, mut child: Child, stderr_buf: Arc<Mutex<String>>) {
        let status = child.wait();

        let mut inner = self.inner.lock();

        let expected = match &status {
            // An operator kill shows up as SIGKILL and is expected.
            Ok(st) => st.success() || st.signal() == Some(libc::SIGKILL),
            Err(_) => false,
        };

        if !expected {
            let detail = match status {
                Ok(st) => st.to_string(),
                Err(e) => e.to_string(),
            };
            let stderr = stderr_buf.lock();
            tracing::error!(vm = self.id, exit = %detail, stderr = %*stderr, "qemu died");
            set_error(&mut inner, self.id);
        } else if inner.state != VmState::ERROR {
            tracing::info!(vm = self.id, "exited");
            inner.state = VmState::QUIT;
        }

        if let Some(shim) = inner.shim.take() {
            shim.close();
        }

        // Dropping the sender lets a parked kill arbiter exit.
        inner.kill_tx = None;
    }

    /// Release taps and the instance directory. Leaked taps are
    /// logged, never fatal.
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.lock();

        for nic in &inner.config.base.networks {
            if nic.tap.is_empty() {
                continue;
            }

            // Disconnected taps have no bridge to ask.
            let res = if nic.vlan == DISCONNECTED_VLAN {
                bridge::destroy_tap_raw(&nic.tap)
            } else {
                self.ctx.bridge.destroy_tap(&nic.tap)
            };

            if let Err(e) = res {
                tracing::error!(vm = self.id, tap = %nic.tap, error = %e, "leaked tap");
            }
        }

        if let Err(e) = std::fs::remove_dir_all(&self.instance_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }

        Ok(())
    }

    // ========================================================================
    // Hotplug
    // ========================================================================

    /// Attach a USB storage device backed by `disk`.
    ///
    /// `version` selects the bus: "1.1" (the default when empty) uses
    /// `usb-bus.0`, "2.0" uses `ehci.0`. Returns the hotplug id.
    pub fn hotplug(&self, disk: &Path, version: &str) -> Result<u32> {
        let (version, bus) = match version {
            "" | "1.1" => ("1.1", "usb-bus.0"),
            "2.0" => ("2.0", "ehci.0"),
            other => return Err(Error::config(format!("invalid usb version: `{}`", other))),
        };

        let mut inner = self.inner.lock();

        let id = inner.hotplug.keys().max().map_or(0, |m| m + 1);
        let hid = format!("hotplug{}", id);
        tracing::debug!(vm = self.id, hid = %hid, "hotplug add");

        let q = require_qmp(&inner)?;
        let r = q.drive_add(&hid, &disk.display().to_string())?;
        tracing::debug!(vm = self.id, response = %r, "hotplug drive_add");

        let r = q.usb_device_add(&hid, bus)?;
        tracing::debug!(vm = self.id, response = %r, "hotplug device_add");

        inner.hotplug.insert(
            id,
            Hotplug {
                disk: disk.to_path_buf(),
                version: version.to_string(),
            },
        );

        Ok(id)
    }

    /// Detach one hot-added device by id.
    pub fn hotplug_remove(&self, id: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        self.hotplug_remove_locked(&mut inner, id)
    }

    /// Detach every hot-added device. Fails when the table is empty.
    pub fn hotplug_remove_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        if inner.hotplug.is_empty() {
            return Err(Error::hotplug("no hotplug devices to remove".to_string()));
        }

        let ids: Vec<u32> = inner.hotplug.keys().copied().collect();
        for id in ids {
            self.hotplug_remove_locked(&mut inner, id)?;
        }

        Ok(())
    }

    fn hotplug_remove_locked(&self, inner: &mut Inner, id: u32) -> Result<()> {
        if !inner.hotplug.contains_key(&id) {
            return Err(Error::hotplug(format!("no such hotplug device: {}", id)));
        }

        let hid = format!("hotplug{}", id);
        let q = require_qmp(inner)?;

        let r = q.usb_device_del(&hid)?;
        tracing::debug!(vm = self.id, response = %r, "hotplug device_del");

        let r = q.drive_del(&hid)?;
        tracing::debug!(vm = self.id, response = %r, "hotplug drive_del");

        inner.hotplug.remove(&id);
        Ok(())
    }

    /// Deep-copied snapshot of the hotplug table.
    pub fn hotplug_info(&self) -> BTreeMap<u32, Hotplug> {
        self.inner.lock().hotplug.clone()
    }

    // ========================================================================
    // Removable media
    // ========================================================================

    /// Insert (or swap) the cdrom medium.
    pub fn change_cd(&self, disk: &Path) -> Result<()> {
        let mut inner = self.inner.lock();

        if inner.config.kvm.cdrom.is_some() {
            self.eject_locked(&mut inner)?;
        }

        let q = require_qmp(&inner)?;
        q.blockdev_change(CDROM_DEVICE, &disk.display().to_string())?;
        inner.config.kvm.cdrom = Some(disk.to_path_buf());

        Ok(())
    }

    /// Eject the cdrom medium. Fails when none is inserted.
    pub fn eject_cd(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        if inner.config.kvm.cdrom.is_none() {
            return Err(Error::NoCdrom);
        }

        self.eject_locked(&mut inner)
    }

    fn eject_locked(&self, inner: &mut Inner) -> Result<()> {
        let q = require_qmp(inner)?;
        q.blockdev_eject(CDROM_DEVICE)?;
        inner.config.kvm.cdrom = None;
        Ok(())
    }

    // ========================================================================
    // Migration / inspection
    // ========================================================================

    /// Migrate VM state to `filename`, resolved under the IO base
    /// directory (absolute paths pass through).
    pub fn migrate(&self, filename: &Path) -> Result<()> {
        let path = if filename.is_absolute() {
            filename.to_path_buf()
        } else {
            self.ctx.io_base.join(filename)
        };

        let q = {
            let inner = self.inner.lock();
            require_qmp(&inner)?
        };
        q.migrate_disk(&path)
    }

    /// Migration progress as `(status, completed in [0, 1])`.
    pub fn query_migrate(&self) -> Result<(String, f64)> {
        let q = {
            let inner = self.inner.lock();
            require_qmp(&inner)?
        };
        let r = q.query_migrate()?;

        parse_migrate_status(&r)
    }

    /// Screenshot the console as a PNG scaled to `size` pixels wide
    /// (0 keeps the native resolution). Requires `RUNNING`.
    pub fn screenshot(&self, size: u32) -> Result<Vec<u8>> {
        let q = {
            let inner = self.inner.lock();
            if !inner.state.intersects(VmState::RUNNING) {
                return Err(Error::NotRunning(self.id));
            }
            require_qmp(&inner)?
        };

        // QMP can only dump to a file, so bounce through a temp path.
        let tmp = tempfile::Builder::new()
            .prefix("corral_screenshot_")
            .tempfile()
            .map_err(|e| Error::Screenshot(e.to_string()))?;

        q.screendump(tmp.path())?;
        let ppm = std::fs::read(tmp.path())?;

        ppm_to_png(&ppm, size)
    }

    /// QMP passthrough for operators.
    pub fn qmp_raw(&self, input: &str) -> Result<Value> {
        let q = {
            let inner = self.inner.lock();
            require_qmp(&inner)?
        };
        q.raw(input)
    }

    /// Usage counters for the QEMU process.
    pub fn proc_stats(&self) -> Result<process::ProcStats> {
        let pid = self
            .inner
            .lock()
            .pid
            .ok_or(Error::NotRunning(self.id))?;
        process::read_proc_stats(pid)
    }

    /// Field accessor for table-style listings.
    pub fn info(&self, field: &str) -> Result<String> {
        let inner = self.inner.lock();
        let value = match field {
            "id" => self.id.to_string(),
            "name" => self.name.clone(),
            "namespace" => self.namespace.clone(),
            "state" => inner.state.to_string(),
            "pid" => inner.pid.map(|p| p.to_string()).unwrap_or_default(),
            "vnc_port" => inner.vnc_port.to_string(),
            "memory" => inner.config.base.memory.to_string(),
            "vcpus" => inner.config.base.vcpus.to_string(),
            "uuid" => inner.config.base.uuid.clone(),
            "snapshot" => inner.config.base.snapshot.to_string(),
            "disks" => inner
                .config
                .kvm
                .disks
                .iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(","),
            "cdrom" => inner
                .config
                .kvm
                .cdrom
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            other => return Err(Error::config(format!("unknown info field: {}", other))),
        };
        Ok(value)
    }

    // ========================================================================
    // Conflicts
    // ========================================================================

    /// Two KVM VMs conflict when they share a disk and at least one is
    /// not in snapshot mode, or when the base rules (name within a
    /// namespace, duplicate MACs) clash.
    pub fn conflicts_kvm(&self, other: &KvmVm) -> Result<()> {
        if std::ptr::eq(self, other) {
            return Ok(());
        }

        // Lock ordering: lower id first, so concurrent cross checks
        // can't deadlock.
        let (first, second) = if self.id < other.id {
            (self, other)
        } else {
            (other, self)
        };
        let a = first.inner.lock();
        let b = second.inner.lock();

        for d in &a.config.kvm.disks {
            for d2 in &b.config.kvm.disks {
                if d == d2 && (!a.config.base.snapshot || !b.config.base.snapshot) {
                    return Err(Error::conflict(
                        other.name.clone(),
                        format!("disk {}", d.display()),
                    ));
                }
            }
        }

        if self.namespace == other.namespace && self.name == other.name {
            return Err(Error::conflict(other.name.clone(), "name".to_string()));
        }

        for nic in &a.config.base.networks {
            for nic2 in &b.config.base.networks {
                if !nic.mac.is_empty() && nic.mac == nic2.mac {
                    return Err(Error::conflict(
                        other.name.clone(),
                        format!("mac {}", nic.mac),
                    ));
                }
            }
        }

        Ok(())
    }

    // ========================================================================
    // Metadata files
    // ========================================================================

    fn write_metadata(&self, inner: &Inner) -> Result<()> {
        std::fs::write(self.path("config"), inner.config.to_string())?;
        std::fs::write(self.path("name"), &self.name)?;
        Ok(())
    }

    fn write_taps(&self, inner: &Inner) -> Result<()> {
        let taps: Vec<&str> = inner
            .config
            .base
            .networks
            .iter()
            .map(|n| n.tap.as_str())
            .collect();
        std::fs::write(self.path("taps"), taps.join("\n"))?;
        Ok(())
    }
}

/// Mark a VM errored. The flag is sticky until a successful relaunch.
fn set_error(inner: &mut Inner, id: u32) {
    tracing::error!(vm = id, "entering error state");
    inner.state = VmState::ERROR;
}

fn require_qmp(inner: &Inner) -> Result<Arc<qmp::Client>> {
    inner
        .qmp
        .clone()
        .ok_or_else(|| Error::qmp("not connected".to_string()))
}

fn create_instance_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|e| Error::launch(format!("create instance dir {}: {}", dir.display(), e)))
}

/// Start draining stdout (discarded) and stderr (kept for the exit
/// log) so the child never blocks on a full pipe.
fn spawn_output_drain(child: &mut Child, stderr_buf: Arc<Mutex<String>>) {
    if let Some(mut stdout) = child.stdout.take() {
        std::thread::spawn(move || {
            let mut sink = Vec::new();
            let _ = stdout.read_to_end(&mut sink);
        });
    }

    if let Some(mut stderr) = child.stderr.take() {
        std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf);
            *stderr_buf.lock() = buf;
        });
    }
}

/// Log asynchronous QMP messages (device trays, vnc connects,
/// shutdowns) keyed by VM id.
fn spawn_qmp_logger(id: u32, events: mpsc::Receiver<Value>) {
    std::thread::spawn(move || {
        while let Ok(msg) = events.recv() {
            tracing::info!(vm = id, message = %msg, "asynchronous qmp message");
        }
    });
}

/// Decode a `query-migrate` return object.
fn parse_migrate_status(r: &Value) -> Result<(String, f64)> {
    let status = r
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Migrate(format!("could not decode status: {}", r)))?
        .to_string();

    let completed = match status.as_str() {
        "completed" => 1.0,
        "failed" => 0.0,
        "active" => {
            let ram = r
                .get("ram")
                .and_then(Value::as_object)
                .ok_or_else(|| Error::Migrate(format!("could not decode ram segment: {}", r)))?;

            let total = ram.get("total").and_then(Value::as_f64).unwrap_or(0.0);
            let transferred = ram
                .get("transferred")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);

            if total == 0.0 {
                return Err(Error::Migrate("zero total ram".to_string()));
            }

            transferred / total
        }
        _ => 0.0,
    };

    Ok((status, completed))
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixListener;

    use serde_json::json;

    use super::*;
    use crate::bridge::testing::FakeBridge;
    use crate::vm::config::NicConfig;

    fn test_ctx(bridge: Arc<FakeBridge>) -> (VmContext, mpsc::Receiver<u32>) {
        let (kill_ack, kill_ack_rx) = mpsc::channel();
        let ctx = VmContext {
            bridge,
            cc: None,
            vnc_handler: Arc::new(|_, _| {}),
            io_base: PathBuf::from("/tmp"),
            hugepages: None,
            affinity: None,
            unstoppable: None,
            kill_ack,
        };
        (ctx, kill_ack_rx)
    }

    fn test_vm(dir: &Path) -> (Arc<KvmVm>, Arc<FakeBridge>) {
        let bridge = Arc::new(FakeBridge::default());
        let (ctx, _rx) = test_ctx(Arc::clone(&bridge));
        let mut config = VmConfig::default();
        config.base.uuid = "00000000-0000-0000-0000-000000000001".into();
        let vm = KvmVm::new(0, "vm0", "test", &config, dir.to_path_buf(), ctx).unwrap();
        (vm, bridge)
    }

    /// Wire a scripted QMP peer into the instance so control-plane
    /// operations can run without QEMU.
    fn attach_fake_qmp(vm: &KvmVm, dir: &Path) -> std::thread::JoinHandle<Vec<serde_json::Value>> {
        let sock = dir.join("qmp");
        let listener = UnixListener::bind(&sock).unwrap();
        let server = crate::qmp::testing::serve_ok(listener);

        let client = qmp::Client::connect(&sock).unwrap();
        let mut inner = vm.inner.lock();
        inner.qmp = Some(client);
        inner.state = VmState::RUNNING;
        server
    }

    fn drop_qmp(vm: &KvmVm) {
        let mut inner = vm.inner.lock();
        inner.qmp = None;
    }

    #[test]
    fn stop_requires_running() {
        let dir = tempfile::tempdir().unwrap();
        let (vm, _) = test_vm(dir.path());
        match vm.stop() {
            Err(Error::NotRunning(0)) => {}
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(vm.state(), VmState::BUILDING);
    }

    #[test]
    fn hotplug_version_validation() {
        let dir = tempfile::tempdir().unwrap();
        let (vm, _) = test_vm(dir.path());
        assert!(matches!(
            vm.hotplug(Path::new("/a.img"), "3.0"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn hotplug_eject_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let (vm, _) = test_vm(dir.path());
        let server = attach_fake_qmp(&vm, dir.path());

        assert_eq!(vm.hotplug(Path::new("/a.img"), "1.1").unwrap(), 0);
        assert_eq!(vm.hotplug(Path::new("/b.img"), "2.0").unwrap(), 1);

        let table = vm.hotplug_info();
        assert_eq!(table.len(), 2);
        assert_eq!(table[&0].version, "1.1");
        assert_eq!(table[&1].version, "2.0");

        vm.hotplug_remove_all().unwrap();
        assert!(vm.hotplug_info().is_empty());

        // Second removal fails: nothing left.
        assert!(matches!(vm.hotplug_remove_all(), Err(Error::Hotplug(_))));

        drop_qmp(&vm);
        let commands = server.join().unwrap();

        let hmp: Vec<String> = commands
            .iter()
            .filter_map(|c| {
                c.get("arguments")
                    .and_then(|a| a.get("command-line"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect();

        // drive_add for both ids, on the right buses.
        assert!(hmp[0].starts_with("drive_add dummy file=/a.img"));
        assert!(hmp[1].contains("device_add usb-storage,id=hotplug0,drive=hotplug0,bus=usb-bus.0"));
        assert!(hmp[2].starts_with("drive_add dummy file=/b.img"));
        assert!(hmp[3].contains("bus=ehci.0"));

        // Removal pairs device_del (QMP) with drive_del (HMP) per id.
        let device_dels: Vec<&Value> = commands
            .iter()
            .filter(|c| c["execute"] == "device_del")
            .collect();
        assert_eq!(device_dels.len(), 2);
        let drive_dels: Vec<&String> = hmp.iter().filter(|l| l.starts_with("drive_del")).collect();
        assert_eq!(drive_dels.len(), 2);
    }

    #[test]
    fn hotplug_id_is_one_plus_max() {
        let dir = tempfile::tempdir().unwrap();
        let (vm, _) = test_vm(dir.path());
        let server = attach_fake_qmp(&vm, dir.path());

        assert_eq!(vm.hotplug(Path::new("/a.img"), "").unwrap(), 0);
        assert_eq!(vm.hotplug(Path::new("/b.img"), "").unwrap(), 1);
        vm.hotplug_remove(0).unwrap();
        // Max existing id is 1, so the next is 2, not 0.
        assert_eq!(vm.hotplug(Path::new("/c.img"), "").unwrap(), 2);

        drop_qmp(&vm);
        drop(server);
    }

    #[test]
    fn cd_change_and_eject() {
        let dir = tempfile::tempdir().unwrap();
        let (vm, _) = test_vm(dir.path());
        let server = attach_fake_qmp(&vm, dir.path());

        // Nothing inserted yet.
        assert!(matches!(vm.eject_cd(), Err(Error::NoCdrom)));

        vm.change_cd(Path::new("/iso/a.iso")).unwrap();
        assert_eq!(vm.config().kvm.cdrom, Some(PathBuf::from("/iso/a.iso")));

        // Swapping ejects the old medium first.
        vm.change_cd(Path::new("/iso/b.iso")).unwrap();

        vm.eject_cd().unwrap();
        assert_eq!(vm.config().kvm.cdrom, None);

        drop_qmp(&vm);
        let commands = server.join().unwrap();
        let execs: Vec<&str> = commands
            .iter()
            .filter_map(|c| c["execute"].as_str())
            .collect();
        assert_eq!(
            execs,
            [
                "qmp_capabilities",
                "blockdev-change-medium",
                "blockdev-open-tray",
                "blockdev-remove-medium",
                "blockdev-change-medium",
                "blockdev-open-tray",
                "blockdev-remove-medium",
            ]
        );
    }

    #[test]
    fn migrate_status_parsing() {
        let (s, c) = parse_migrate_status(&json!({"status": "completed"})).unwrap();
        assert_eq!((s.as_str(), c), ("completed", 1.0));

        let (s, c) = parse_migrate_status(&json!({"status": "failed"})).unwrap();
        assert_eq!((s.as_str(), c), ("failed", 0.0));

        let (s, c) = parse_migrate_status(&json!({
            "status": "active",
            "ram": {"total": 1000.0, "transferred": 250.0}
        }))
        .unwrap();
        assert_eq!(s, "active");
        assert!((c - 0.25).abs() < f64::EPSILON);

        assert!(parse_migrate_status(&json!({"nope": 1})).is_err());
        assert!(parse_migrate_status(&json!({
            "status": "active",
            "ram": {"total": 0.0, "transferred": 0.0}
        }))
        .is_err());
    }

    #[test]
    fn conflict_rules() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(FakeBridge::default());
        let (ctx, _rx) = test_ctx(Arc::clone(&bridge));

        let mut shared = VmConfig::default();
        shared.kvm.disks.push(PathBuf::from("/shared.qcow2"));
        shared.base.snapshot = true;

        let a = KvmVm::new(0, "a", "ns", &shared, dir.path().join("0"), ctx.clone()).unwrap();
        let b = KvmVm::new(1, "b", "ns", &shared, dir.path().join("1"), ctx.clone()).unwrap();

        // Both snapshot: sharing a disk is fine.
        a.conflicts_kvm(&b).unwrap();

        // One non-snapshot: conflict.
        let mut owned = shared.clone();
        owned.base.snapshot = false;
        let c = KvmVm::new(2, "c", "ns", &owned, dir.path().join("2"), ctx.clone()).unwrap();
        assert!(a.conflicts_kvm(&c).is_err());

        // Same name in the same namespace: conflict even without disks.
        let d = KvmVm::new(3, "a", "ns", &VmConfig::default(), dir.path().join("3"), ctx).unwrap();
        assert!(a.conflicts_kvm(&d).is_err());
    }

    #[test]
    fn flush_destroys_taps_and_dir() {
        let dir = tempfile::tempdir().unwrap();
        let instance = dir.path().join("0");
        std::fs::create_dir_all(&instance).unwrap();

        let bridge = Arc::new(FakeBridge::default());
        let (ctx, _rx) = test_ctx(Arc::clone(&bridge));

        let mut config = VmConfig::default();
        config.base.networks.push(NicConfig {
            bridge: "br0".into(),
            vlan: 100,
            mac: "aa:bb:cc:dd:ee:ff".into(),
            driver: "e1000".into(),
            tap: "tap7".into(),
        });
        config.base.networks.push(NicConfig {
            bridge: String::new(),
            vlan: DISCONNECTED_VLAN,
            mac: "aa:bb:cc:dd:ee:00".into(),
            driver: "e1000".into(),
            tap: "tap8".into(),
        });

        let vm = KvmVm::new(0, "vm0", "test", &config, instance.clone(), ctx).unwrap();
        vm.flush().unwrap();

        // Bridged tap went through the bridge; the disconnected one
        // went to the raw teardown (which fails silently here).
        assert_eq!(bridge.destroyed.lock().unwrap().as_slice(), ["tap7"]);
        assert!(!instance.exists());
    }

    #[test]
    fn unstoppable_name_is_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(FakeBridge::default());
        let (mut ctx, _rx) = test_ctx(bridge);
        ctx.unstoppable = Some("atlas".into());

        let vm = KvmVm::new(
            0,
            "atlas",
            "ns",
            &VmConfig::default(),
            dir.path().join("0"),
            ctx,
        )
        .unwrap();
        let err = vm.stop().unwrap_err();
        assert!(err.to_string().contains("unstoppable"));
    }

    #[test]
    fn screenshot_requires_running() {
        let dir = tempfile::tempdir().unwrap();
        let (vm, _) = test_vm(dir.path());
        assert!(matches!(vm.screenshot(100), Err(Error::NotRunning(0))));
    }

    #[test]
    fn tap_failure_leaves_error_state() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(FakeBridge {
            fail_create: true,
            ..FakeBridge::default()
        });
        let (ctx, _rx) = test_ctx(Arc::clone(&bridge));

        let mut config = VmConfig::default();
        config.base.networks.push(NicConfig {
            bridge: "br0".into(),
            vlan: 100,
            mac: "00:11:22:33:44:55".into(),
            driver: "e1000".into(),
            tap: String::new(),
        });

        let vm = KvmVm::new(0, "vm0", "test", &config, dir.path().join("0"), ctx).unwrap();
        assert!(vm.launch().is_err());

        // ERROR is sticky, but a relaunch may be attempted from it.
        assert_eq!(vm.state(), VmState::ERROR);
        assert!(vm.state().can_launch());

        // The instance directory was created before the failure and
        // stays until flush.
        assert!(dir.path().join("0").join("config").exists());
    }
}
