//! QMP (QEMU Machine Protocol) client.
//!
//! The protocol is line-delimited JSON over a UNIX socket: QEMU sends
//! a greeting, the client negotiates capabilities, and from then on
//! command replies (tagged with the id the client sent) interleave
//! with asynchronous events. A reader thread demultiplexes the stream:
//! replies are routed to the waiter registered under their id, and
//! everything else lands on the event channel.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::{Error, Result};

/// Attempts made to reach the QMP socket after spawning QEMU.
pub const QMP_CONNECT_RETRY: u32 = 50;

/// Delay between connect attempts, in milliseconds.
pub const QMP_CONNECT_DELAY_MS: u64 = 100;

/// Reply waiters, keyed by command id. The reader thread clears the
/// map when the connection dies, which wakes every waiter with an
/// error.
type PendingMap = Arc<Mutex<HashMap<u64, mpsc::Sender<Value>>>>;

/// A connected QMP client.
pub struct Client {
    path: PathBuf,
    writer: Mutex<UnixStream>,
    pending: PendingMap,
    event_tx: mpsc::Sender<Value>,
    events: Mutex<Option<mpsc::Receiver<Value>>>,
    next_id: AtomicU64,
    /// One redial is allowed per failed command; see [`Client::execute`].
    redialing: Mutex<()>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("qmp::Client")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Shut the socket down (not just this fd) so the reader thread
        // unblocks and exits instead of leaking.
        let _ = self.writer.lock().shutdown(std::net::Shutdown::Both);
    }
}

impl Client {
    /// Dial the QMP socket with bounded retry, then negotiate
    /// capabilities and start the reader thread.
    pub fn connect(path: &Path) -> Result<Arc<Self>> {
        let mut last_err = None;

        for _ in 0..QMP_CONNECT_RETRY {
            match Self::dial(path) {
                Ok(client) => return Ok(client),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "qmp dial failed, redialing");
                    last_err = Some(e);
                    std::thread::sleep(Duration::from_millis(QMP_CONNECT_DELAY_MS));
                }
            }
        }

        Err(Error::qmp(format!(
            "connect to {} failed after {} attempts: {}",
            path.display(),
            QMP_CONNECT_RETRY,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// One dial attempt: connect, consume the greeting, negotiate
    /// capabilities, spawn the reader.
    fn dial(path: &Path) -> Result<Arc<Self>> {
        let stream = UnixStream::connect(path).map_err(|e| Error::qmp(e.to_string()))?;
        let mut reader = BufReader::new(stream.try_clone().map_err(|e| Error::qmp(e.to_string()))?);

        Self::handshake(&stream, &mut reader)?;

        let (event_tx, event_rx) = mpsc::channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let client = Arc::new(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(stream),
            pending: Arc::clone(&pending),
            event_tx: event_tx.clone(),
            events: Mutex::new(Some(event_rx)),
            next_id: AtomicU64::new(1),
            redialing: Mutex::new(()),
        });

        spawn_reader(reader, pending, event_tx);

        Ok(client)
    }

    /// Consume the `QMP` greeting and send `qmp_capabilities`.
    fn handshake(stream: &UnixStream, reader: &mut BufReader<UnixStream>) -> Result<()> {
        let greeting = read_message(reader)?;
        if greeting.get("QMP").is_none() {
            return Err(Error::qmp(format!("unexpected greeting: {}", greeting)));
        }

        let mut w = stream;
        write_message(&mut w, &json!({"execute": "qmp_capabilities"}))?;

        // Skip any event that slips in before the capabilities ack.
        loop {
            let msg = read_message(reader)?;
            if msg.get("return").is_some() {
                return Ok(());
            }
            if let Some(err) = msg.get("error") {
                return Err(Error::QmpResponse(err.to_string()));
            }
        }
    }

    /// Take the asynchronous-event receiver. The first caller owns it;
    /// later calls return `None`.
    pub fn take_events(&self) -> Option<mpsc::Receiver<Value>> {
        self.events.lock().take()
    }

    /// Issue a command and wait for its reply.
    ///
    /// On a dead transport the client redials once and retries the
    /// command once; a second failure surfaces.
    pub fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        match self.execute_once(command, arguments.clone()) {
            Err(Error::Qmp(first)) => {
                tracing::info!(path = %self.path.display(), error = %first, "qmp transport lost, redialing once");
                self.redial()?;
                self.execute_once(command, arguments)
            }
            other => other,
        }
    }

    fn execute_once(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut msg = json!({"execute": command, "id": id});
        if let Some(args) = arguments {
            msg["arguments"] = args;
        }

        self.send_and_wait(id, &msg)
    }

    fn send_and_wait(&self, id: u64, msg: &Value) -> Result<Value> {
        let (tx, rx) = mpsc::channel();
        self.pending.lock().insert(id, tx);

        let write_res = {
            let writer = self.writer.lock();
            write_message(&mut &*writer, msg)
        };
        if let Err(e) = write_res {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        let reply = rx
            .recv()
            .map_err(|_| Error::qmp("connection closed while awaiting reply".to_string()))?;

        if let Some(err) = reply.get("error") {
            return Err(Error::QmpResponse(err.to_string()));
        }

        Ok(reply.get("return").cloned().unwrap_or(Value::Null))
    }

    /// Replace the dead connection with a fresh one. Pending waiters of
    /// the old connection have already been cleared by its reader.
    fn redial(&self) -> Result<()> {
        let _guard = self.redialing.lock();

        let stream = UnixStream::connect(&self.path).map_err(|e| Error::qmp(e.to_string()))?;
        let mut reader =
            BufReader::new(stream.try_clone().map_err(|e| Error::qmp(e.to_string()))?);

        Self::handshake(&stream, &mut reader)?;

        *self.writer.lock() = stream;
        spawn_reader(reader, Arc::clone(&self.pending), self.event_tx.clone());

        Ok(())
    }

    // ========================================================================
    // Typed wrappers
    // ========================================================================

    /// Resume guest execution (`cont`).
    pub fn start(&self) -> Result<()> {
        self.execute("cont", None).map(|_| ())
    }

    /// Pause guest execution (`stop`).
    pub fn stop(&self) -> Result<()> {
        self.execute("stop", None).map(|_| ())
    }

    /// Hot-add a drive backed by `file` under the monitor id `id`.
    pub fn drive_add(&self, id: &str, file: &str) -> Result<Value> {
        self.human_monitor(&format!("drive_add dummy file={},if=none,id={}", file, id))
    }

    /// Attach a USB storage device for a previously added drive.
    pub fn usb_device_add(&self, id: &str, bus: &str) -> Result<Value> {
        self.human_monitor(&format!(
            "device_add usb-storage,id={0},drive={0},bus={1}",
            id, bus
        ))
    }

    /// Detach a hot-added USB device.
    pub fn usb_device_del(&self, id: &str) -> Result<Value> {
        self.execute("device_del", Some(json!({"id": id})))
    }

    /// Drop a hot-added drive.
    pub fn drive_del(&self, id: &str) -> Result<Value> {
        self.human_monitor(&format!("drive_del {}", id))
    }

    /// Swap the medium in a removable device.
    pub fn blockdev_change(&self, device: &str, file: &str) -> Result<()> {
        self.execute(
            "blockdev-change-medium",
            Some(json!({"device": device, "filename": file})),
        )
        .map(|_| ())
    }

    /// Open the tray and remove the medium from a removable device.
    pub fn blockdev_eject(&self, device: &str) -> Result<()> {
        self.execute("blockdev-open-tray", Some(json!({"device": device})))?;
        self.execute("blockdev-remove-medium", Some(json!({"device": device})))
            .map(|_| ())
    }

    /// Dump the console framebuffer to a PPM file on the host.
    pub fn screendump(&self, path: &Path) -> Result<()> {
        self.execute(
            "screendump",
            Some(json!({"filename": path.display().to_string()})),
        )
        .map(|_| ())
    }

    /// Migrate VM state to a file on the host.
    pub fn migrate_disk(&self, path: &Path) -> Result<()> {
        self.execute(
            "migrate",
            Some(json!({"uri": format!("exec:cat > {}", path.display())})),
        )
        .map(|_| ())
    }

    /// Query migration progress; returns the raw status object.
    pub fn query_migrate(&self) -> Result<Value> {
        self.execute("query-migrate", None)
    }

    /// Send a raw QMP payload. The input must be a JSON object with an
    /// `execute` key; an id is injected so the reply can be routed.
    pub fn raw(&self, input: &str) -> Result<Value> {
        let mut msg: Value =
            serde_json::from_str(input).map_err(|e| Error::qmp(format!("raw input: {}", e)))?;
        if msg.get("execute").is_none() {
            return Err(Error::qmp("raw input missing execute key".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        msg["id"] = json!(id);
        self.send_and_wait(id, &msg)
    }

    /// Tunnel a legacy monitor command through `human-monitor-command`.
    fn human_monitor(&self, command_line: &str) -> Result<Value> {
        self.execute(
            "human-monitor-command",
            Some(json!({"command-line": command_line})),
        )
    }
}

/// Spawn the demultiplexer for one connection. Exits when the socket
/// closes, clearing the pending map so waiters fail fast.
fn spawn_reader(
    mut reader: BufReader<UnixStream>,
    pending: PendingMap,
    event_tx: mpsc::Sender<Value>,
) {
    std::thread::spawn(move || {
        loop {
            let msg = match read_message(&mut reader) {
                Ok(msg) => msg,
                Err(_) => break,
            };

            let reply_id = msg
                .get("id")
                .and_then(Value::as_u64)
                .filter(|_| msg.get("return").is_some() || msg.get("error").is_some());

            match reply_id {
                Some(id) => {
                    if let Some(waiter) = pending.lock().remove(&id) {
                        let _ = waiter.send(msg);
                    }
                }
                None => {
                    // Asynchronous event (or an unsolicited reply):
                    // forward to whoever is logging events. A missing
                    // listener is fine, keep draining the socket.
                    let _ = event_tx.send(msg);
                }
            }
        }

        // Connection is gone: wake every waiter by dropping its sender.
        pending.lock().clear();
    });
}

fn read_message(reader: &mut BufReader<UnixStream>) -> Result<Value> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .map_err(|e| Error::qmp(e.to_string()))?;
    if n == 0 {
        return Err(Error::qmp("connection closed".to_string()));
    }
    serde_json::from_str(&line).map_err(|e| Error::qmp(format!("bad json: {}", e)))
}

fn write_message(writer: &mut impl Write, msg: &Value) -> Result<()> {
    let mut line = msg.to_string();
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .map_err(|e| Error::qmp(e.to_string()))
}
