//! `power` - power nodes on, off, or cycle them.

use clap::{Args, ValueEnum};

use crate::commands::CommandContext;
use crate::error::{Error, Result};

/// What to do with the nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PowerAction {
    /// Power on.
    On,
    /// Power off.
    Off,
    /// Power off, then on.
    Cycle,
}

/// Control node power, by reservation or by explicit node list.
#[derive(Args, Debug)]
pub struct PowerCmd {
    /// on, off, or cycle
    #[arg(value_enum)]
    pub action: PowerAction,

    /// Act on every node of this reservation
    #[arg(short = 'r', long = "reservation", value_name = "NAME")]
    pub reservation: Option<String>,

    /// Act on these nodes, e.g. kn01,kn02
    #[arg(short = 'n', long = "nodes", value_delimiter = ',', value_name = "NODES")]
    pub nodes: Vec<String>,

    /// Skip the reservation-ownership safety check
    #[arg(long)]
    pub force: bool,
}

impl PowerCmd {
    pub fn run(self, ctx: &mut CommandContext) -> Result<()> {
        let hosts = self.target_hosts(ctx)?;

        match self.action {
            PowerAction::On => ctx.backend.power(&hosts, true)?,
            PowerAction::Off => ctx.backend.power(&hosts, false)?,
            PowerAction::Cycle => {
                ctx.backend.power(&hosts, false)?;
                ctx.backend.power(&hosts, true)?;
            }
        }

        println!("powered {:?}: {}", self.action, hosts.join(","));
        Ok(())
    }

    fn target_hosts(&self, ctx: &CommandContext) -> Result<Vec<String>> {
        match (&self.reservation, self.nodes.is_empty()) {
            (Some(_), false) => Err(Error::usage(
                "give either --reservation or --nodes, not both".to_string(),
            )),
            (None, true) => Err(Error::usage(
                "need --reservation or --nodes".to_string(),
            )),
            (Some(name), true) => {
                let r = ctx
                    .reservations
                    .values()
                    .find(|r| &r.name == name)
                    .ok_or_else(|| Error::NotFound(name.clone()))?;
                ctx.check_owner(&r.owner)?;
                Ok(r.hosts.clone())
            }
            (None, false) => {
                // Refuse to stomp on someone else's live reservation
                // unless forced (or root).
                for node in &self.nodes {
                    let index = ctx.config.node_index(node)?;
                    let owner_id = ctx.schedule.owner_at(ctx.now, index);
                    if owner_id == 0 || self.force || ctx.is_root() {
                        continue;
                    }
                    if let Some(r) = ctx.reservations.get(&owner_id) {
                        if r.owner != ctx.user {
                            return Err(Error::Denied(format!(
                                "{} is reserved by {} ({})",
                                node, r.owner, r.name
                            )));
                        }
                    }
                }
                Ok(self.nodes.clone())
            }
        }
    }
}
