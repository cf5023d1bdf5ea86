//! `sub` - submit a new reservation.

use std::path::PathBuf;

use clap::Args;

use crate::commands::{parse_minutes, CommandContext};
use crate::error::{Error, Result};
use crate::network::next_vlan;
use crate::reservation::Reservation;
use crate::schedule::{NodeRequest, SLICE_SECS};

/// Reserve nodes for exclusive use.
#[derive(Args, Debug)]
pub struct SubCmd {
    /// Reservation name
    #[arg(short = 'r', long = "reservation", value_name = "NAME")]
    pub name: String,

    /// Kernel image to netboot
    #[arg(short = 'k', long, value_name = "PATH")]
    pub kernel: Option<PathBuf>,

    /// Initrd to netboot
    #[arg(short = 'i', long, value_name = "PATH")]
    pub initrd: Option<PathBuf>,

    /// Cobbler profile to boot instead of a raw kernel
    #[arg(long, value_name = "PROFILE")]
    pub profile: Option<String>,

    /// Kernel command line
    #[arg(short = 'c', long = "cmdline", default_value = "", value_name = "ARGS")]
    pub cmdline: String,

    /// Number of nodes (any free nodes)
    #[arg(short = 'n', long = "nodes", value_name = "COUNT")]
    pub count: Option<usize>,

    /// Explicit node list, e.g. kn01,kn02
    #[arg(short = 'w', long = "node-list", value_delimiter = ',', value_name = "NODES")]
    pub node_list: Vec<String>,

    /// Reservation length (bare minutes or e.g. "2h")
    #[arg(short = 't', long = "time", default_value = "60", value_parser = parse_minutes, value_name = "DURATION")]
    pub minutes: i64,

    /// Earliest start, as an offset from now (e.g. "30m")
    #[arg(short = 'a', long = "after", value_name = "OFFSET")]
    pub after: Option<String>,

    /// Print the next few feasible start times without reserving
    #[arg(short = 's', long)]
    pub speculative: bool,
}

impl SubCmd {
    pub fn run(self, ctx: &mut CommandContext) -> Result<()> {
        if ctx.reservations.values().any(|r| r.name == self.name) {
            return Err(Error::Exists(self.name));
        }

        let req = self.node_request(ctx)?;
        self.check_policy(ctx, &req)?;

        if self.profile.is_none() && (self.kernel.is_none() || self.initrd.is_none()) {
            return Err(Error::usage(
                "need a kernel and initrd (or --profile)".to_string(),
            ));
        }
        if self.profile.is_some() && !ctx.config.use_cobbler {
            return Err(Error::usage(
                "--profile requires UseCobbler".to_string(),
            ));
        }

        let after = match &self.after {
            Some(offset) => {
                let d = humantime::parse_duration(offset)
                    .map_err(|e| Error::usage(format!("bad --after: {}", e)))?;
                ctx.now + d.as_secs() as i64
            }
            None => ctx.now,
        };

        if self.speculative {
            return self.speculate(ctx, &req, after);
        }

        let id = ctx.ids.next(ctx.reservations);
        let node_count = ctx.config.node_count();
        let (start, end, indices) =
            ctx.schedule
                .reserve(&req, node_count, self.minutes, after, id)?;

        let vlan = next_vlan(ctx.config, ctx.reservations)?;

        let r = Reservation {
            id,
            name: self.name,
            owner: ctx.user.clone(),
            hosts: indices.iter().map(|&i| ctx.config.node_name(i)).collect(),
            start_time: start,
            end_time: end,
            vlan,
            pxe_profile: self.profile,
            kernel: self.kernel,
            initrd: self.initrd,
            kernel_args: self.cmdline,
        };

        println!(
            "reservation {} created: {} from {} to {}",
            r.name,
            r.hosts.join(","),
            Reservation::format_time(r.start_time),
            Reservation::format_time(r.end_time),
        );
        tracing::info!(
            event = "CREATED",
            reservation = %r.name,
            owner = %r.owner,
            hosts = %r.hosts.join(","),
            start = r.start_time,
            end = r.end_time,
            "reservation created"
        );

        ctx.reservations.insert(id, r);
        Ok(())
    }

    fn node_request(&self, ctx: &CommandContext) -> Result<NodeRequest> {
        match (self.count, self.node_list.is_empty()) {
            (Some(_), false) => Err(Error::usage(
                "give either --nodes or --node-list, not both".to_string(),
            )),
            (None, true) => Err(Error::usage(
                "need --nodes or --node-list".to_string(),
            )),
            (Some(n), true) => Ok(NodeRequest::Count(n)),
            (None, false) => {
                let mut indices = self
                    .node_list
                    .iter()
                    .map(|name| ctx.config.node_index(name))
                    .collect::<Result<Vec<usize>>>()?;
                indices.sort_unstable();
                indices.dedup();
                Ok(NodeRequest::Explicit(indices))
            }
        }
    }

    fn check_policy(&self, ctx: &CommandContext, req: &NodeRequest) -> Result<()> {
        if ctx.is_root() {
            return Ok(());
        }

        let wanted = match req {
            NodeRequest::Count(n) => *n,
            NodeRequest::Explicit(indices) => indices.len(),
        };
        let limit = ctx.config.node_limit;
        if limit > 0 && wanted > limit {
            return Err(Error::Denied(format!(
                "{} nodes exceeds the {}-node limit",
                wanted, limit
            )));
        }

        let limit = ctx.config.time_limit;
        if limit > 0 && self.minutes > limit {
            return Err(Error::Denied(format!(
                "{} minutes exceeds the {}-minute limit",
                self.minutes, limit
            )));
        }

        Ok(())
    }

    /// Preview the next few feasible windows without committing.
    fn speculate(&self, ctx: &mut CommandContext, req: &NodeRequest, after: i64) -> Result<()> {
        let node_count = ctx.config.node_count();
        let mut probe_after = after;

        println!("start times available for this reservation:");
        for _ in 0..3 {
            // Probe a scratch copy; the real schedule stays untouched.
            let mut scratch = ctx.schedule.clone();
            let (start, _, _) =
                scratch.reserve(req, node_count, self.minutes, probe_after, u64::MAX)?;
            println!("  {}", Reservation::format_time(start));
            probe_after = start + SLICE_SECS;
        }

        Ok(())
    }
}
