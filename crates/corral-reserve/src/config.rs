//! Cluster configuration.
//!
//! Read once per invocation from the JSON file named by `--config`.
//! Field names match the deployed config files, which predate this
//! tool's casing conventions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The cluster- and site-wide configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the TFTP server; reservation state lives under it.
    #[serde(rename = "TFTPRoot")]
    pub tftp_root: PathBuf,

    /// Node name prefix, e.g. `kn` for nodes named kn01, kn02, ...
    #[serde(rename = "Prefix")]
    pub prefix: String,

    /// First node number in the cluster (usually 1).
    #[serde(rename = "Start")]
    pub start: usize,

    /// Last node number in the cluster, inclusive.
    #[serde(rename = "End")]
    pub end: usize,

    /// Zero-padding width of the numeric part of node names.
    #[serde(rename = "Padlen")]
    pub padlen: usize,

    /// Rack width, for the `show` map.
    #[serde(rename = "Rackwidth")]
    pub rackwidth: usize,

    /// Rack height, for the `show` map.
    #[serde(rename = "Rackheight")]
    pub rackheight: usize,

    /// printf-style command to power one node on, e.g. `powerman on %s`.
    #[serde(rename = "PowerOnCommand")]
    pub power_on_command: String,

    /// printf-style command to power one node off.
    #[serde(rename = "PowerOffCommand")]
    pub power_off_command: String,

    /// Manage nodes through Cobbler instead of raw pxelinux files.
    #[serde(rename = "UseCobbler")]
    pub use_cobbler: bool,

    /// Cobbler profile for nodes outside any reservation.
    #[serde(rename = "CobblerDefaultProfile")]
    pub cobbler_default_profile: String,

    /// Power nodes off and on when their reservation activates.
    #[serde(rename = "AutoReboot")]
    pub auto_reboot: bool,

    /// Lowest VLAN tag handed to reservations.
    pub vlan_min: i32,

    /// Highest VLAN tag handed to reservations.
    pub vlan_max: i32,

    /// Hostname to switch-port mapping for VLAN isolation.
    pub node_map: HashMap<String, String>,

    /// Switch driver selector; empty disables VLAN isolation.
    #[serde(rename = "Network")]
    pub network: String,

    /// Switch login.
    #[serde(rename = "NetworkUser")]
    pub network_user: String,

    /// Switch password.
    #[serde(rename = "NetworkPassword")]
    pub network_password: String,

    /// Switch API endpoint.
    pub network_url: String,

    /// DNS server consulted for node lookups, when the system resolver
    /// is not authoritative for the cluster domain.
    #[serde(rename = "DNSServer")]
    pub dns_server: String,

    /// Extra log sink, appended to.
    #[serde(rename = "LogFile")]
    pub log_file: String,

    /// Max nodes a non-root user may reserve; 0 means unlimited.
    #[serde(rename = "NodeLimit")]
    pub node_limit: usize,

    /// Max reservation minutes for a non-root user; 0 means unlimited.
    #[serde(rename = "TimeLimit")]
    pub time_limit: i64,

    /// Mail domain for owner addresses in notification digests.
    #[serde(rename = "Domain")]
    pub domain: String,
}

impl Config {
    /// Read and validate the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.start > self.end {
            return Err(Error::Config(format!(
                "node range inverted: Start {} > End {}",
                self.start, self.end
            )));
        }
        if self.tftp_root.as_os_str().is_empty() {
            return Err(Error::Config("TFTPRoot is required".to_string()));
        }
        Ok(())
    }

    /// Number of nodes in the cluster.
    pub fn node_count(&self) -> usize {
        self.end - self.start + 1
    }

    /// The node name for a zero-based node index.
    pub fn node_name(&self, index: usize) -> String {
        format!(
            "{}{:0width$}",
            self.prefix,
            self.start + index,
            width = self.padlen
        )
    }

    /// All node names, in index order.
    pub fn node_names(&self) -> Vec<String> {
        (0..self.node_count()).map(|i| self.node_name(i)).collect()
    }

    /// Map a node name back to its zero-based index.
    pub fn node_index(&self, name: &str) -> Result<usize> {
        let digits = name
            .strip_prefix(&self.prefix)
            .ok_or_else(|| Error::usage(format!("not a cluster node: {}", name)))?;
        let n: usize = digits
            .parse()
            .map_err(|_| Error::usage(format!("not a cluster node: {}", name)))?;
        if n < self.start || n > self.end {
            return Err(Error::usage(format!("node out of range: {}", name)));
        }
        Ok(n - self.start)
    }

    /// Directory holding the reservation and schedule state files.
    pub fn state_dir(&self) -> PathBuf {
        self.tftp_root.join("corral")
    }

    /// Directory holding per-reservation pxelinux configs.
    pub fn pxe_dir(&self) -> PathBuf {
        self.tftp_root.join("pxelinux.cfg").join("corral")
    }
}
