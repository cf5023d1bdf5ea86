//! Subcommand implementations.
//!
//! Each command is a clap `Args` struct with a `run` method taking the
//! shared [`CommandContext`]. By the time a command runs, state is
//! locked, loaded, and housekept; the dispatcher writes it back after.

pub mod del;
pub mod extend;
pub mod notify;
pub mod power;
pub mod show;
pub mod sub;

use crate::backend::Backend;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::network::SwitchDriver;
use crate::schedule::{IdSource, Schedule};
use crate::store::ReservationMap;

/// Everything a command body needs.
pub struct CommandContext<'a> {
    /// The loaded cluster configuration.
    pub config: &'a Config,
    /// The reservation table, mutated in place.
    pub reservations: &'a mut ReservationMap,
    /// The schedule, mutated in place.
    pub schedule: &'a mut Schedule,
    /// Node backend for install/power.
    pub backend: &'a dyn Backend,
    /// Switch driver for VLAN isolation.
    pub switch: &'a dyn SwitchDriver,
    /// Reservation id source.
    pub ids: &'a mut IdSource,
    /// The invoking user.
    pub user: String,
    /// UNIX seconds at invocation.
    pub now: i64,
}

impl CommandContext<'_> {
    /// Root bypasses the NodeLimit/TimeLimit policy and ownership
    /// checks.
    pub fn is_root(&self) -> bool {
        self.user == "root"
    }

    /// Fail unless the invoking user owns the reservation (or is root).
    pub fn check_owner(&self, owner: &str) -> Result<()> {
        if self.is_root() || owner == self.user {
            Ok(())
        } else {
            Err(Error::Denied(format!(
                "reservation belongs to {}",
                owner
            )))
        }
    }
}

/// The invoking user's login name.
pub fn current_user() -> String {
    if let Ok(user) = std::env::var("USER") {
        if !user.is_empty() {
            return user;
        }
    }
    if let Ok(user) = std::env::var("LOGNAME") {
        if !user.is_empty() {
            return user;
        }
    }
    if unsafe { libc::getuid() } == 0 {
        "root".to_string()
    } else {
        "unknown".to_string()
    }
}

/// Parse a duration argument into whole minutes.
///
/// Accepts bare minutes (`90`) or humantime forms (`90m`, `1h 30m`).
pub fn parse_minutes(s: &str) -> std::result::Result<i64, String> {
    if let Ok(minutes) = s.parse::<i64>() {
        if minutes <= 0 {
            return Err("duration must be positive".to_string());
        }
        return Ok(minutes);
    }

    let d = humantime::parse_duration(s).map_err(|e| e.to_string())?;
    let minutes = (d.as_secs() / 60) as i64;
    if minutes == 0 {
        return Err("duration must be at least one minute".to_string());
    }
    Ok(minutes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minutes_parse_both_forms() {
        assert_eq!(parse_minutes("90").unwrap(), 90);
        assert_eq!(parse_minutes("90m").unwrap(), 90);
        assert_eq!(parse_minutes("1h 30m").unwrap(), 90);
        assert!(parse_minutes("0").is_err());
        assert!(parse_minutes("30s").is_err());
        assert!(parse_minutes("soon").is_err());
    }
}
