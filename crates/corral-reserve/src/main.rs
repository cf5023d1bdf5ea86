//! corral-reserve CLI entry point.
//!
//! Every invocation follows the same shape: parse the command, load
//! the config, take exclusive locks on both state files, load state,
//! run housekeeping, run the command body, then write state back and
//! release the locks. Exit status is the worst severity seen: 0 ok,
//! 1 command failure, 2 usage error (from clap).

mod backend;
mod commands;
mod config;
mod error;
mod housekeeping;
mod network;
mod reservation;
mod schedule;
mod store;

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::backend::backend_for;
use crate::commands::{current_user, CommandContext};
use crate::config::Config;
use crate::error::Result;
use crate::housekeeping::housekeeping;
use crate::network::switch_for;
use crate::schedule::IdSource;
use crate::store::Store;

/// Reserve and PXE-boot bare-metal cluster nodes
#[derive(Parser, Debug)]
#[command(name = "corral-reserve")]
#[command(about = "Reserve and PXE-boot bare-metal cluster nodes")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = "/etc/corral-reserve.conf", value_name = "PATH")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reserve nodes for exclusive use
    Sub(commands::sub::SubCmd),

    /// Delete a reservation
    Del(commands::del::DelCmd),

    /// Show reservations and node ownership
    Show(commands::show::ShowCmd),

    /// Power nodes on, off, or cycle them
    Power(commands::power::PowerCmd),

    /// Extend an existing reservation
    Extend(commands::extend::ExtendCmd),

    /// Print a digest of reservations expiring soon
    Notify(commands::notify::NotifyCmd),

    /// Print version information
    Version,
}

fn main() {
    let cli = Cli::parse();

    let status = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("Error: {}", e);
            1
        }
    };

    std::process::exit(status);
}

fn run(cli: Cli) -> Result<()> {
    // version doesn't touch config or state.
    if matches!(cli.command, Commands::Version) {
        println!("corral-reserve {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::load(&cli.config)?;
    init_logging(&config);

    // Exclusive advisory locks on both state files for the whole
    // invocation; concurrent invocations queue here.
    let mut store = Store::open(&config.state_dir())?;
    let (mut reservations, mut schedule) = store.load()?;

    let backend = backend_for(&config);
    let switch = switch_for(&config);
    let now = unix_now();

    // Expire and install before the command body sees state.
    housekeeping(
        &config,
        &mut reservations,
        &mut schedule,
        backend.as_ref(),
        switch.as_ref(),
        now,
    )?;

    let mut ids = IdSource::Random;
    let mut ctx = CommandContext {
        config: &config,
        reservations: &mut reservations,
        schedule: &mut schedule,
        backend: backend.as_ref(),
        switch: switch.as_ref(),
        ids: &mut ids,
        user: current_user(),
        now,
    };

    match cli.command {
        Commands::Sub(cmd) => cmd.run(&mut ctx)?,
        Commands::Del(cmd) => cmd.run(&mut ctx)?,
        Commands::Show(cmd) => cmd.run(&mut ctx)?,
        Commands::Power(cmd) => cmd.run(&mut ctx)?,
        Commands::Extend(cmd) => cmd.run(&mut ctx)?,
        Commands::Notify(cmd) => cmd.run(&mut ctx)?,
        Commands::Version => unreachable!("handled above"),
    }

    // Catch schedule/reservation drift before it reaches disk.
    schedule.check_consistency(&reservations, &config)?;

    store.save(&reservations, &schedule)
}

/// Stderr logging plus, when the config names a LogFile, an appended
/// plain-text copy.
fn init_logging(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("corral_reserve=info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    if config.log_file.is_empty() {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return;
    }

    match std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&config.log_file)
    {
        Ok(file) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::sync::Arc::new(file))
                .with_ansi(false)
                .with_target(false);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
        }
        Err(e) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            tracing::warn!(path = %config.log_file, error = %e, "logfile not opened");
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
