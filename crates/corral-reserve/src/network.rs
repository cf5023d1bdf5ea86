//! Switch-driver seam and VLAN bookkeeping.
//!
//! Actual switch wire protocols live in external drivers; this module
//! defines the contract the housekeeper calls and the VLAN pool the
//! allocator draws from. Isolation failures are logged by callers, not
//! fatal: a reservation still boots without its VLAN fence.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::reservation::Reservation;
use crate::store::ReservationMap;

/// Applies VLAN isolation on the cluster switches.
pub trait SwitchDriver {
    /// Put every listed host's port on `vlan`.
    fn network_set(&self, hosts: &[String], vlan: i32) -> Result<()>;

    /// Return the hosts' ports to the default VLAN.
    fn network_clear(&self, hosts: &[String]) -> Result<()>;
}

/// Driver used when the config disables VLAN segmentation.
pub struct NoopSwitch;

impl SwitchDriver for NoopSwitch {
    fn network_set(&self, _hosts: &[String], _vlan: i32) -> Result<()> {
        Ok(())
    }

    fn network_clear(&self, _hosts: &[String]) -> Result<()> {
        Ok(())
    }
}

/// Driver for a switch type no external driver claims; every call
/// fails so the housekeeper logs it.
struct UnsupportedSwitch {
    kind: String,
}

impl SwitchDriver for UnsupportedSwitch {
    fn network_set(&self, _hosts: &[String], _vlan: i32) -> Result<()> {
        Err(Error::Network(format!(
            "no driver for switch type: {}",
            self.kind
        )))
    }

    fn network_clear(&self, _hosts: &[String]) -> Result<()> {
        Err(Error::Network(format!(
            "no driver for switch type: {}",
            self.kind
        )))
    }
}

/// Pick the switch driver the config names; empty disables isolation.
pub fn switch_for(config: &Config) -> Box<dyn SwitchDriver> {
    if config.network.is_empty() {
        Box::new(NoopSwitch)
    } else {
        Box::new(UnsupportedSwitch {
            kind: config.network.clone(),
        })
    }
}

/// First VLAN tag in `[vlan_min, vlan_max]` no live reservation holds.
/// Returns 0 when the pool is unconfigured (isolation off).
pub fn next_vlan(config: &Config, reservations: &ReservationMap) -> Result<i32> {
    if config.vlan_min == 0 && config.vlan_max == 0 {
        return Ok(0);
    }

    let in_use: Vec<i32> = reservations.values().map(|r: &Reservation| r.vlan).collect();

    (config.vlan_min..=config.vlan_max)
        .find(|tag| !in_use.contains(tag))
        .ok_or_else(|| Error::Network("vlan pool exhausted".to_string()))
}
