//! `notify` - digest of reservations nearing expiry.
//!
//! Computes the digest and prints it; handing it to a mail gateway is
//! the operator's (or cron's) job.

use clap::Args;

use crate::commands::CommandContext;
use crate::error::Result;
use crate::reservation::Reservation;

/// Print a digest of reservations expiring soon.
#[derive(Args, Debug)]
pub struct NotifyCmd {
    /// Look-ahead window in hours
    #[arg(long, default_value_t = 24, value_name = "HOURS")]
    pub hours: i64,
}

impl NotifyCmd {
    pub fn run(self, ctx: &mut CommandContext) -> Result<()> {
        let digest = render(ctx, self.hours);
        if digest.is_empty() {
            println!("nothing expiring within {} hours", self.hours);
        } else {
            print!("{}", digest);
        }
        Ok(())
    }
}

fn render(ctx: &CommandContext, hours: i64) -> String {
    let horizon = ctx.now + hours * 3600;

    let mut expiring: Vec<&Reservation> = ctx
        .reservations
        .values()
        .filter(|r| r.end_time > ctx.now && r.end_time <= horizon)
        .collect();
    expiring.sort_by_key(|r| r.end_time);

    let mut out = String::new();
    for r in expiring {
        let address = if ctx.config.domain.is_empty() {
            r.owner.clone()
        } else {
            format!("{}@{}", r.owner, ctx.config.domain)
        };
        out.push_str(&format!(
            "{}: reservation {} ends at {}\n",
            address,
            r.name,
            Reservation::format_time(r.end_time)
        ));
        tracing::info!(
            event = "EXPIRING",
            reservation = %r.name,
            owner = %r.owner,
            end = r.end_time,
            "reservation nearing expiry"
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::backend::testing::FakeBackend;
    use crate::config::Config;
    use crate::network::NoopSwitch;
    use crate::schedule::{IdSource, Schedule};
    use crate::store::ReservationMap;

    fn res(id: u64, name: &str, end: i64) -> Reservation {
        Reservation {
            id,
            name: name.to_string(),
            owner: "alice".to_string(),
            hosts: vec![],
            start_time: 0,
            end_time: end,
            vlan: 0,
            pxe_profile: None,
            kernel: Some(PathBuf::from("/k")),
            initrd: Some(PathBuf::from("/i")),
            kernel_args: String::new(),
        }
    }

    #[test]
    fn digest_covers_the_window_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            tftp_root: dir.path().to_path_buf(),
            prefix: "kn".to_string(),
            start: 1,
            end: 2,
            padlen: 2,
            domain: "cluster.example.com".to_string(),
            ..Config::default()
        };
        let backend = FakeBackend {
            config: config.clone(),
            ..FakeBackend::default()
        };

        let mut reservations = ReservationMap::new();
        reservations.insert(1, res(1, "soon", 3600));
        reservations.insert(2, res(2, "later", 200_000));

        let mut schedule = Schedule::default();
        let mut ids = IdSource::Sequential(2);
        let ctx = CommandContext {
            config: &config,
            reservations: &mut reservations,
            schedule: &mut schedule,
            backend: &backend,
            switch: &NoopSwitch,
            ids: &mut ids,
            user: "alice".to_string(),
            now: 0,
        };

        let digest = render(&ctx, 24);
        assert!(digest.contains("alice@cluster.example.com"));
        assert!(digest.contains("soon"));
        assert!(!digest.contains("later"));
    }
}
