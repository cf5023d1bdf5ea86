//! `del` - delete a reservation.

use clap::Args;

use crate::commands::CommandContext;
use crate::error::Result;
use crate::housekeeping::delete_reservation;

/// Delete a reservation, freeing its nodes.
#[derive(Args, Debug)]
pub struct DelCmd {
    /// Reservation name
    pub name: String,
}

impl DelCmd {
    pub fn run(self, ctx: &mut CommandContext) -> Result<()> {
        let owner = ctx
            .reservations
            .values()
            .find(|r| r.name == self.name)
            .map(|r| r.owner.clone());
        if let Some(owner) = &owner {
            ctx.check_owner(owner)?;
        }

        let r = delete_reservation(
            ctx.reservations,
            ctx.schedule,
            ctx.backend,
            ctx.switch,
            &self.name,
        )?;

        println!("deleted reservation {} ({})", r.name, r.hosts.join(","));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::backend::testing::FakeBackend;
    use crate::config::Config;
    use crate::error::Error;
    use crate::network::NoopSwitch;
    use crate::reservation::Reservation;
    use crate::schedule::{IdSource, NodeRequest, Schedule};
    use crate::store::ReservationMap;

    #[test]
    fn only_owner_or_root_may_delete() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            tftp_root: dir.path().to_path_buf(),
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
            .reserve(&NodeRequest::Count(1), 2, 60, 0, 1)
            .unwrap();
        reservations.insert(
            1,
            Reservation {
                id: 1,
                name: "mine".to_string(),
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

        let mut ids = IdSource::Sequential(1);

        {
            let mut ctx = CommandContext {
                config: &config,
                reservations: &mut reservations,
                schedule: &mut schedule,
                backend: &backend,
                switch: &NoopSwitch,
                ids: &mut ids,
                user: "bob".to_string(),
                now: 0,
            };
            let cmd = DelCmd {
                name: "mine".to_string(),
            };
            assert!(matches!(cmd.run(&mut ctx), Err(Error::Denied(_))));
        }

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
        DelCmd {
            name: "mine".to_string(),
        }
        .run(&mut ctx)
        .unwrap();

        assert!(reservations.is_empty());
        assert!(schedule
            .slices()
            .iter()
            .all(|s| s.nodes.iter().all(|&c| c == 0)));
    }
}
