//! VNC shim.
//!
//! Each KVM VM exposes VNC on a UNIX socket inside its instance
//! directory. The shim binds an ephemeral TCP port and bridges remote
//! clients to that socket, teeing the client-to-server byte stream
//! through an RFB decoder so keyboard/pointer events can be routed to
//! namespace-level observers (recorders, playback, activity tracking).

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Observer for decoded client-to-server messages, keyed by
/// `"<namespace>:<name>"`.
pub type VncHandler = Arc<dyn Fn(&str, &ClientMessage) + Send + Sync>;

/// A decoded RFB 3.8 client-to-server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Message type 0.
    SetPixelFormat {
        /// The 16-byte pixel format block, undecoded.
        format: [u8; 16],
    },
    /// Message type 2.
    SetEncodings {
        /// Requested encodings, most preferred first.
        encodings: Vec<i32>,
    },
    /// Message type 3.
    FramebufferUpdateRequest {
        /// Incremental update flag.
        incremental: bool,
        /// Requested rectangle.
        x: u16,
        /// Requested rectangle.
        y: u16,
        /// Requested rectangle.
        width: u16,
        /// Requested rectangle.
        height: u16,
    },
    /// Message type 4.
    KeyEvent {
        /// True on press, false on release.
        down: bool,
        /// X11 keysym.
        key: u32,
    },
    /// Message type 5.
    PointerEvent {
        /// Button bitmask.
        button_mask: u8,
        /// Pointer position.
        x: u16,
        /// Pointer position.
        y: u16,
    },
    /// Message type 6.
    CutText {
        /// Clipboard contents (latin-1 mapped to char).
        text: String,
    },
}

/// Decoder failures, split so callers can tell "stream over" from
/// "unknown message" from transient errors.
#[derive(Debug)]
pub enum DecodeError {
    /// The stream ended or the forwarding half closed.
    Closed,
    /// An unrecognized client-to-server message type.
    Unknown(u8),
    /// Any other IO failure.
    Io(std::io::Error),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Closed => write!(f, "vnc stream closed"),
            DecodeError::Unknown(t) => write!(f, "unknown client-to-server message: {}", t),
            DecodeError::Io(e) => write!(f, "vnc read failed: {}", e),
        }
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset => DecodeError::Closed,
            _ => DecodeError::Io(e),
        }
    }
}

/// Read one client-to-server message from the stream.
pub fn read_client_message(r: &mut impl Read) -> std::result::Result<ClientMessage, DecodeError> {
    let kind = read_u8(r)?;
    match kind {
        0 => {
            let mut pad = [0u8; 3];
            r.read_exact(&mut pad)?;
            let mut format = [0u8; 16];
            r.read_exact(&mut format)?;
            Ok(ClientMessage::SetPixelFormat { format })
        }
        2 => {
            let mut pad = [0u8; 1];
            r.read_exact(&mut pad)?;
            let count = read_u16(r)?;
            let mut encodings = Vec::with_capacity(count as usize);
            for _ in 0..count {
                encodings.push(read_u32(r)? as i32);
            }
            Ok(ClientMessage::SetEncodings { encodings })
        }
        3 => Ok(ClientMessage::FramebufferUpdateRequest {
            incremental: read_u8(r)? != 0,
            x: read_u16(r)?,
            y: read_u16(r)?,
            width: read_u16(r)?,
            height: read_u16(r)?,
        }),
        4 => {
            let down = read_u8(r)? != 0;
            let mut pad = [0u8; 2];
            r.read_exact(&mut pad)?;
            Ok(ClientMessage::KeyEvent {
                down,
                key: read_u32(r)?,
            })
        }
        5 => Ok(ClientMessage::PointerEvent {
            button_mask: read_u8(r)?,
            x: read_u16(r)?,
            y: read_u16(r)?,
        }),
        6 => {
            let mut pad = [0u8; 3];
            r.read_exact(&mut pad)?;
            let len = read_u32(r)?;
            let mut buf = vec![0u8; len as usize];
            r.read_exact(&mut buf)?;
            Ok(ClientMessage::CutText {
                text: buf.into_iter().map(|b| b as char).collect(),
            })
        }
        other => Err(DecodeError::Unknown(other)),
    }
}

fn read_u8(r: &mut impl Read) -> std::io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u16(r: &mut impl Read) -> std::io::Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_be_bytes(b))
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

/// A reader that mirrors everything it reads into a writer, so the
/// decoder can watch the client stream while it is forwarded to the VM.
struct TeeReader<R, W> {
    reader: R,
    writer: W,
}

impl<R: Read, W: Write> Read for TeeReader<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.reader.read(buf)?;
        if n > 0 {
            self.writer.write_all(&buf[..n])?;
        }
        Ok(n)
    }
}

/// Handle to a running shim listener.
pub struct Shim {
    listener: Arc<TcpListener>,
    port: u16,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for Shim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("vnc::Shim").field("port", &self.port).finish()
    }
}

impl Shim {
    /// Bind an ephemeral TCP port and start accepting clients for the
    /// VM whose VNC UNIX socket lives at `vnc_path`.
    ///
    /// `ns` is the routing key (`namespace:name`) attached to decoded
    /// events.
    pub fn start(ns: String, vnc_path: PathBuf, handler: VncHandler) -> Result<Self> {
        let listener =
            Arc::new(TcpListener::bind(("0.0.0.0", 0)).map_err(|e| Error::vnc(e.to_string()))?);
        let port = listener
            .local_addr()
            .map_err(|e| Error::vnc(e.to_string()))?
            .port();

        let closed = Arc::new(AtomicBool::new(false));
        let shim = Self {
            listener: Arc::clone(&listener),
            port,
            closed: Arc::clone(&closed),
        };

        std::thread::spawn(move || loop {
            let remote = match listener.accept() {
                Ok((remote, addr)) => {
                    tracing::info!(peer = %addr, vm = %ns, "vnc shim connect");
                    remote
                }
                Err(e) => {
                    // Closing the listener is the expected shutdown
                    // path and stays silent.
                    if !closed.load(Ordering::SeqCst) {
                        tracing::error!(error = %e, "vnc shim accept failed");
                    }
                    return;
                }
            };

            let ns = ns.clone();
            let vnc_path = vnc_path.clone();
            let handler = Arc::clone(&handler);
            std::thread::spawn(move || serve_client(remote, &ns, &vnc_path, handler));
        });

        Ok(shim)
    }

    /// The kernel-assigned TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting clients. Established sessions run until either
    /// side hangs up.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        unsafe {
            libc::shutdown(self.listener.as_raw_fd(), libc::SHUT_RDWR);
        }
    }
}

/// Bridge one remote client to the VM's VNC socket.
fn serve_client(remote: TcpStream, ns: &str, vnc_path: &std::path::Path, handler: VncHandler) {
    let local = match UnixStream::connect(vnc_path) {
        Ok(local) => local,
        Err(e) => {
            tracing::error!(path = %vnc_path.display(), error = %e, "unable to dial vm vnc");
            return;
        }
    };

    // Server-to-client direction is an opaque copy.
    let (Ok(mut local_rd), Ok(mut remote_wr)) = (local.try_clone(), remote.try_clone()) else {
        return;
    };
    std::thread::spawn(move || {
        let _ = std::io::copy(&mut local_rd, &mut remote_wr);
        let _ = remote_wr.shutdown(std::net::Shutdown::Write);
    });

    // Client-to-server direction is forwarded through the decoder tee.
    let mut tee = TeeReader {
        reader: remote,
        writer: local,
    };

    loop {
        match read_client_message(&mut tee) {
            Ok(msg) => handler(ns, &msg),
            Err(DecodeError::Closed) => {
                tracing::info!(vm = %ns, "vnc shim quit");
                break;
            }
            Err(DecodeError::Unknown(_)) => continue,
            Err(DecodeError::Io(e)) => {
                tracing::warn!(error = %e, "vnc decode failed");
                continue;
            }
        }
    }
}
