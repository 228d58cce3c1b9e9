//! Service unit commands.
//!
//! These write desired state to the store; the daemon's supervisor applies
//! it on its next health check.

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;
use skyway_control_plane::{error::Error, store::UnitKind, supervisor::UnitStatus};
use tabled::Tabled;

use crate::output::{display_duration, display_time, print_info, print_output, print_success};

use super::CommandContext;

/// Service commands.
#[derive(Debug, Args)]
pub struct ServiceCommand {
    #[command(subcommand)]
    command: ServiceSubcommand,
}

#[derive(Debug, Subcommand)]
enum ServiceSubcommand {
    /// Show desired and observed state of units.
    Status(StatusArgs),

    /// Register a new unit.
    Register(RegisterArgs),

    /// Set a unit's desired state to running.
    Start(UnitArg),

    /// Set a unit's desired state to stopped.
    Stop(UnitArg),

    /// Restart a unit on the next health check.
    Restart(UnitArg),
}

#[derive(Debug, Args)]
struct StatusArgs {
    /// Unit name (all units when omitted).
    name: Option<String>,
}

#[derive(Debug, Args)]
struct RegisterArgs {
    name: String,

    /// billing, association-sync or controller.
    #[arg(long)]
    kind: String,

    /// Account managed by a controller unit.
    #[arg(long)]
    account: Option<String>,
}

#[derive(Debug, Args)]
struct UnitArg {
    name: String,
}

impl ServiceCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let units = &ctx.state.units;
        match self.command {
            ServiceSubcommand::Status(args) => {
                let statuses = match args.name {
                    Some(name) => vec![units.status_of(&name)?],
                    None => units.status()?,
                };
                let rows: Vec<UnitRow> = statuses.iter().map(UnitRow::from).collect();
                print_output(&rows, &statuses, ctx.format);
            }
            ServiceSubcommand::Register(args) => {
                let kind = UnitKind::from_parts(&args.kind, args.account.as_deref())
                    .map_err(Error::Validation)?;
                units.register(&args.name, &kind)?;
                print_success(&format!("Registered {} ({kind})", args.name));
            }
            ServiceSubcommand::Start(args) => {
                units.start(&args.name)?;
                print_success(&format!("{} will be started", args.name));
                print_pending_note();
            }
            ServiceSubcommand::Stop(args) => {
                units.stop(&args.name)?;
                print_success(&format!("{} will be stopped", args.name));
                print_pending_note();
            }
            ServiceSubcommand::Restart(args) => {
                units.restart(&args.name)?;
                print_success(&format!("{} will be restarted", args.name));
                print_pending_note();
            }
        }
        Ok(())
    }
}

fn print_pending_note() {
    print_info("The daemon applies the change on its next health check.");
}

fn display_uptime(secs: &Option<i64>) -> String {
    secs.map(display_duration).unwrap_or_else(|| "-".to_string())
}

fn display_restart(ts: &Option<i64>) -> String {
    ts.as_ref().map(display_time).unwrap_or_else(|| "-".to_string())
}

#[derive(Debug, Serialize, Tabled)]
struct UnitRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Desired")]
    desired: String,
    #[tabled(rename = "Observed")]
    observed: String,
    #[tabled(rename = "Uptime", display = "display_uptime")]
    uptime_secs: Option<i64>,
    #[tabled(rename = "Restarts")]
    restart_count: u32,
    #[tabled(rename = "Last Restart", display = "display_restart")]
    last_restart_at: Option<i64>,
}

impl From<&UnitStatus> for UnitRow {
    fn from(s: &UnitStatus) -> Self {
        Self {
            name: s.name.clone(),
            kind: s.kind.clone(),
            desired: s.desired.as_str().to_string(),
            observed: s.observed.as_str().to_string(),
            uptime_secs: s.uptime_secs,
            restart_count: s.restart_count,
            last_restart_at: s.last_restart_at,
        }
    }
}
