//! `extend` - lengthen an existing reservation.

use clap::Args;

use crate::commands::{parse_minutes, CommandContext};
use crate::error::{Error, Result};
use crate::reservation::Reservation;

/// Extend a reservation, if its nodes stay free.
#[derive(Args, Debug)]
pub struct ExtendCmd {
    /// Reservation name
    #[arg(short = 'r', long = "reservation", value_name = "NAME")]
    pub name: String,

    /// Additional time (bare minutes or e.g. "2h")
    #[arg(short = 't', long = "time", default_value = "60", value_parser = parse_minutes, value_name = "DURATION")]
    pub minutes: i64,
}

impl ExtendCmd {
    pub fn run(self, ctx: &mut CommandContext) -> Result<()> {
        let r = ctx
            .reservations
            .values()
            .find(|r| r.name == self.name)
            .cloned()
            .ok_or_else(|| Error::NotFound(self.name.clone()))?;

        ctx.check_owner(&r.owner)?;

        if !ctx.is_root() && ctx.config.time_limit > 0 {
            let total = (r.end_time - r.start_time) / 60 + self.minutes;
            if total > ctx.config.time_limit {
                return Err(Error::Denied(format!(
                    "{} total minutes exceeds the {}-minute limit",
                    total, ctx.config.time_limit
                )));
            }
        }

        let indices = r
            .hosts
            .iter()
            .map(|h| ctx.config.node_index(h))
            .collect::<Result<Vec<usize>>>()?;

        let new_end = ctx.schedule.extend_reservation(
            &r,
            &indices,
            ctx.config.node_count(),
            self.minutes,
        )?;

        if let Some(rec) = ctx.reservations.get_mut(&r.id) {
            rec.end_time = new_end;
        }

        println!(
            "reservation {} now ends at {}",
            r.name,
            Reservation::format_time(new_end)
        );
        tracing::info!(event = "EXTENDED", reservation = %r.name, end = new_end, "reservation extended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::backend::testing::FakeBackend;
    use crate::config::Config;
    use crate::network::NoopSwitch;
    use crate::schedule::{IdSource, NodeRequest, Schedule};
    use crate::store::ReservationMap;

    fn fixture(dir: &std::path::Path) -> (Config, FakeBackend, ReservationMap, Schedule) {
        let config = Config {
            tftp_root: dir.to_path_buf(),
            prefix: "kn".to_string(),
            start: 1,
            end: 2,
            padlen: 2,
            ..Config::default()
        };
        let backend = FakeBackend {
            config: config.clone(),
            ..FakeBackend::default()
        };

        let mut reservations = ReservationMap::new();
        let mut schedule = Schedule::default();
        let (start, end, _) = schedule
            .reserve(&NodeRequest::Explicit(vec![0]), 2, 60, 0, 1)
            .unwrap();
        reservations.insert(
            1,
            Reservation {
                id: 1,
                name: "exp".to_string(),
                owner: "alice".to_string(),
                hosts: vec!["kn01".to_string()],
                start_time: start,
                end_time: end,
                vlan: 0,
                pxe_profile: None,
                kernel: Some(PathBuf::from("/k")),
                initrd: Some(PathBuf::from("/i")),
                kernel_args: String::new(),
            },
        );

        (config, backend, reservations, schedule)
    }

    #[test]
    fn extend_moves_end_time() {
        let dir = tempfile::tempdir().unwrap();
        let (config, backend, mut reservations, mut schedule) = fixture(dir.path());
        let mut ids = IdSource::Sequential(1);

        let mut ctx = CommandContext {
            config: &config,
            reservations: &mut reservations,
            schedule: &mut schedule,
            backend: &backend,
            switch: &NoopSwitch,
            ids: &mut ids,
            user: "alice".to_string(),
            now: 0,
        };

        ExtendCmd {
            name: "exp".to_string(),
            minutes: 30,
        }
        .run(&mut ctx)
        .unwrap();

        assert_eq!(reservations.get(&1).unwrap().end_time, 3600 + 1800);
    }

    #[test]
    fn blocked_extension_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (config, backend, mut reservations, mut schedule) = fixture(dir.path());

        // A second reservation on the same node starts at t=3600.
        schedule
            .reserve(&NodeRequest::Explicit(vec![0]), 2, 60, 3600, 2)
            .unwrap();

        let mut ids = IdSource::Sequential(2);
        let mut ctx = CommandContext {
            config: &config,
            reservations: &mut reservations,
            schedule: &mut schedule,
            backend: &backend,
            switch: &NoopSwitch,
            ids: &mut ids,
            user: "alice".to_string(),
            now: 0,
        };

        let err = ExtendCmd {
            name: "exp".to_string(),
            minutes: 1,
        }
        .run(&mut ctx)
        .unwrap_err();
        assert!(matches!(err, Error::Schedule(_)));
        assert_eq!(reservations.get(&1).unwrap().end_time, 3600);
    }
}
