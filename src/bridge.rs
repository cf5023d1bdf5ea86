//! External collaborator seams for host networking and the
//! command-and-control channel.
//!
//! Bridge management (openvswitch, VLAN trunking, mirror ports) lives
//! outside this crate; the supervisor only needs taps created before
//! launch and destroyed at flush.

use std::path::Path;
use std::process::Command;

use crate::error::{Error, Result};

/// Creates and destroys host taps on behalf of VM NICs.
pub trait Bridge: Send + Sync {
    /// Create a tap for the given MAC on the given VLAN, returning the
    /// host interface name.
    fn create_tap(&self, mac: &str, vlan: i32) -> Result<String>;

    /// Destroy a tap previously returned by [`Bridge::create_tap`].
    fn destroy_tap(&self, tap: &str) -> Result<()>;
}

/// Attaches the command-and-control layer to a VM's `cc` virtio port.
pub trait CcConnector: Send + Sync {
    /// Dial the UNIX socket backing the VM's `cc` port.
    fn dial_serial(&self, path: &Path) -> Result<()>;
}

/// Tear down a tap that is not attached to any bridge (its NIC was
/// marked disconnected), so there is no bridge to ask.
pub fn destroy_tap_raw(tap: &str) -> Result<()> {
    let output = Command::new("ip")
        .args(["tuntap", "del", "mode", "tap", "name", tap])
        .output()
        .map_err(|e| Error::bridge("destroy tap", e.to_string()))?;

    if !output.status.success() {
        return Err(Error::bridge(
            "destroy tap",
            format!(
                "ip tuntap del {}: {}",
                tap,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }

    Ok(())
}
