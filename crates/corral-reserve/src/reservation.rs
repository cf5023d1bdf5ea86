//! Reservation records.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::config::Config;

/// One exclusive reservation of cluster nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    /// Nonzero id, unique across the reservation table. Schedule cells
    /// hold this value.
    pub id: u64,

    /// Operator-chosen name, unique across live reservations.
    pub name: String,

    /// Login of the user who created the reservation.
    pub owner: String,

    /// Reserved node names, in cluster index order.
    pub hosts: Vec<String>,

    /// Start of the reservation, UNIX seconds.
    pub start_time: i64,

    /// End of the reservation, UNIX seconds.
    pub end_time: i64,

    /// VLAN the nodes are isolated on.
    pub vlan: i32,

    /// Cobbler profile to boot, when not netbooting a raw kernel.
    pub pxe_profile: Option<String>,

    /// Kernel image staged for PXE boot.
    pub kernel: Option<PathBuf>,

    /// Initrd staged for PXE boot.
    pub initrd: Option<PathBuf>,

    /// Kernel command line.
    pub kernel_args: String,
}

impl Reservation {
    /// The pxelinux config file whose presence marks this reservation
    /// installed.
    pub fn pxe_filename(&self, config: &Config) -> PathBuf {
        config.pxe_dir().join(&self.name)
    }

    /// True once the reservation's start time has passed.
    pub fn active(&self, now: i64) -> bool {
        self.start_time < now && now < self.end_time
    }

    /// Render a UNIX timestamp for operator output.
    pub fn format_time(t: i64) -> String {
        let st = if t >= 0 {
            SystemTime::UNIX_EPOCH + Duration::from_secs(t as u64)
        } else {
            SystemTime::UNIX_EPOCH
        };
        humantime::format_rfc3339_seconds(st).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Reservation {
        Reservation {
            id: 7,
            name: "exp".to_string(),
            owner: "alice".to_string(),
            hosts: vec!["kn01".to_string()],
            start_time: 100,
            end_time: 200,
            vlan: 101,
            pxe_profile: None,
            kernel: Some(PathBuf::from("/boot/vmlinuz")),
            initrd: Some(PathBuf::from("/boot/initrd")),
            kernel_args: "console=ttyS0".to_string(),
        }
    }

    #[test]
    fn active_window() {
        let r = sample();
        assert!(!r.active(50));
        assert!(r.active(150));
        assert!(!r.active(250));
    }

    #[test]
    fn json_round_trip() {
        let r = sample();
        let json = serde_json::to_string(&r).unwrap();
        let back: Reservation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
