//! The per-invocation housekeeping pass.
//!
//! Runs after state is locked and loaded, before the subcommand body:
//! expired reservations are deleted, newly active ones are installed
//! (VLAN fence, PXE config, optional power cycle), and the schedule is
//! trimmed to the present. Install and power failures abort the
//! invocation so declared and actual node state cannot diverge;
//! switch failures only log.

use crate::backend::Backend;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::network::SwitchDriver;
use crate::reservation::Reservation;
use crate::schedule::Schedule;
use crate::store::ReservationMap;

/// Delete a reservation by name: clear its VLAN fence, remove its PXE
/// state, zero its schedule cells, and drop the record.
pub fn delete_reservation(
    reservations: &mut ReservationMap,
    schedule: &mut Schedule,
    backend: &dyn Backend,
    switch: &dyn SwitchDriver,
    name: &str,
) -> Result<Reservation> {
    let id = reservations
        .values()
        .find(|r| r.name == name)
        .map(|r| r.id)
        .ok_or_else(|| Error::NotFound(name.to_string()))?;

    let r = reservations.remove(&id).expect("id came from the table");

    if let Err(e) = switch.network_clear(&r.hosts) {
        tracing::error!(reservation = %r.name, error = %e, "network isolation not cleared");
    }

    if let Err(e) = backend.uninstall(&r) {
        tracing::error!(reservation = %r.name, error = %e, "uninstall failed");
    }

    schedule.delete(id);

    tracing::info!(event = "DELETED", reservation = %r.name, owner = %r.owner, "reservation deleted");
    Ok(r)
}

/// The housekeeping pass. `now` is UNIX seconds.
pub fn housekeeping(
    config: &Config,
    reservations: &mut ReservationMap,
    schedule: &mut Schedule,
    backend: &dyn Backend,
    switch: &dyn SwitchDriver,
    now: i64,
) -> Result<()> {
    let names: Vec<(String, i64, i64)> = reservations
        .values()
        .map(|r| (r.name.clone(), r.start_time, r.end_time))
        .collect();

    for (name, start, end) in names {
        if end < now {
            tracing::info!(event = "EXPIRED", reservation = %name, "reservation expired");
            delete_reservation(reservations, schedule, backend, switch, &name)?;
            continue;
        }

        // Started but not yet installed: the PXE master file is the
        // installed indicator.
        let r = match reservations.values().find(|r| r.name == name) {
            Some(r) => r.clone(),
            None => continue,
        };
        if start < now && !r.pxe_filename(config).exists() {
            tracing::info!(event = "INSTALL", reservation = %name, owner = %r.owner, "reservation activating");

            if let Err(e) = switch.network_set(&r.hosts, r.vlan) {
                tracing::error!(reservation = %name, error = %e, "network isolation not set");
            }

            backend.install(&r)?;

            if config.auto_reboot {
                backend.power(&r.hosts, false)?;
                backend.power(&r.hosts, true)?;
            }
        }
    }

    schedule.trim_before(now);
    Ok(())
}
