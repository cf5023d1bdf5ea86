//! `show` - list reservations and the node ownership map.

use std::collections::HashMap;

use clap::Args;

use crate::commands::CommandContext;
use crate::error::Result;
use crate::reservation::Reservation;

/// Show reservations and current node ownership.
#[derive(Args, Debug)]
pub struct ShowCmd {}

impl ShowCmd {
    pub fn run(self, ctx: &mut CommandContext) -> Result<()> {
        print!("{}", render(ctx));
        Ok(())
    }
}

/// Render the whole report; split out so tests can inspect it.
fn render(ctx: &CommandContext) -> String {
    let mut out = String::new();

    let mut rows: Vec<&Reservation> = ctx.reservations.values().collect();
    rows.sort_by_key(|r| (r.start_time, r.name.clone()));

    out.push_str(&format!(
        "{:<16} {:<10} {:<20} {:<20} {:>5}  NODES\n",
        "NAME", "OWNER", "START", "END", "VLAN"
    ));
    for r in &rows {
        out.push_str(&format!(
            "{:<16} {:<10} {:<20} {:<20} {:>5}  {}\n",
            r.name,
            r.owner,
            Reservation::format_time(r.start_time),
            Reservation::format_time(r.end_time),
            r.vlan,
            r.hosts.join(","),
        ));
    }

    // Node map: which reservation owns each node right now.
    let by_id: HashMap<u64, &str> = ctx
        .reservations
        .values()
        .map(|r| (r.id, r.name.as_str()))
        .collect();

    let width = if ctx.config.rackwidth > 0 {
        ctx.config.rackwidth
    } else {
        8
    };

    out.push('\n');
    for i in 0..ctx.config.node_count() {
        let owner = ctx.schedule.owner_at(ctx.now, i);
        let label = by_id.get(&owner).copied().unwrap_or("-");
        out.push_str(&format!("{:<8} {:<16}", ctx.config.node_name(i), label));
        if (i + 1) % width == 0 || i + 1 == ctx.config.node_count() {
            out.push('\n');
        } else {
            out.push_str("  ");
        }
    }

    out
}
