//! CLI commands.

mod account;
mod budget;
mod diagnostics;
mod scheduler;
mod service;

use anyhow::Result;
use clap::{Parser, Subcommand};
use skyway_control_plane::{config::Config, state::AppState};
use tracing::debug;

use crate::output::OutputFormat;

/// skyway - manage cloud accounts, budgets and bursting services.
#[derive(Debug, Parser)]
#[command(name = "skyway")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage cloud accounts and their nodes.
    Account(account::AccountCommand),

    /// Manage per-account budgets.
    Budget(budget::BudgetCommand),

    /// Manage supervised services.
    Service(service::ServiceCommand),

    /// Synchronize scheduler associations.
    SchedulerSync(scheduler::SchedulerSyncCommand),

    /// Inspect the state store and live inventory.
    Diagnostics(diagnostics::DiagnosticsCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        if let Commands::Version = self.command {
            println!("skyway {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }

        let config = Config::from_env()?;
        debug!(db_path = %config.db_path.display(), "Opening state store");
        let ctx = CommandContext {
            state: AppState::build(config)?,
            format: self.format,
        };

        match self.command {
            Commands::Account(cmd) => cmd.run(ctx).await,
            Commands::Budget(cmd) => cmd.run(ctx).await,
            Commands::Service(cmd) => cmd.run(ctx).await,
            Commands::SchedulerSync(cmd) => cmd.run(ctx).await,
            Commands::Diagnostics(cmd) => cmd.run(ctx).await,
            Commands::Version => Ok(()),
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub state: AppState,
    pub format: OutputFormat,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[rstest]
    #[case(&["skyway", "account", "list"])]
    #[case(&["skyway", "account", "remove", "rcc-aws", "rcc-aws-c5-001"])]
    #[case(&["skyway", "account", "connect", "rcc-aws", "login"])]
    #[case(&["skyway", "account", "request", "rcc-aws", "c5", "--count", "3"])]
    #[case(&["skyway", "budget", "set", "rcc-aws", "amount=500"])]
    #[case(&["skyway", "budget", "summary", "rcc-aws", "--format", "json"])]
    #[case(&["skyway", "service", "register", "controller-rcc-aws", "--kind", "controller", "--account", "rcc-aws"])]
    #[case(&["skyway", "service", "status"])]
    #[case(&["skyway", "scheduler-sync", "update-conf"])]
    #[case(&["skyway", "diagnostics", "inventory", "--refresh", "--hosts"])]
    fn test_parses(#[case] args: &[&str]) {
        assert!(Cli::try_parse_from(args).is_ok());
    }

    #[rstest]
    #[case(&["skyway", "account", "create", "rcc-aws", "--owner", "pi", "--vendor", "ibm", "--vendor-account-id", "1"])]
    #[case(&["skyway", "budget", "list", "--format", "yaml"])]
    #[case(&["skyway", "account", "request", "rcc-aws"])]
    fn test_rejects(#[case] args: &[&str]) {
        let err = Cli::try_parse_from(args).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
