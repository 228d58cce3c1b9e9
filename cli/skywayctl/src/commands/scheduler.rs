//! Scheduler association commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;
use skyway_control_plane::{association::SyncReport, error::Error};
use tabled::Tabled;

use crate::output::{print_info, print_output, print_warning, OutputFormat};

use super::CommandContext;

/// Scheduler sync commands.
#[derive(Debug, Args)]
pub struct SchedulerSyncCommand {
    #[command(subcommand)]
    command: SchedulerSyncSubcommand,
}

#[derive(Debug, Subcommand)]
enum SchedulerSyncSubcommand {
    /// Converge scheduler associations to account membership.
    UpdateConf,
}

impl SchedulerSyncCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            SchedulerSyncSubcommand::UpdateConf => update_conf(ctx).await,
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct DeltaRow {
    #[tabled(rename = "Account")]
    account: String,
    #[tabled(rename = "Granted")]
    grants: String,
    #[tabled(rename = "Revoked")]
    revocations: String,
}

fn delta_rows(report: &SyncReport) -> Vec<DeltaRow> {
    report
        .applied
        .iter()
        .map(|d| DeltaRow {
            account: d.account.clone(),
            grants: d.grants.join(" "),
            revocations: d.revocations.join(" "),
        })
        .collect()
}

async fn update_conf(ctx: CommandContext) -> Result<()> {
    let report = ctx.state.sync.update().await?;

    if ctx.format == OutputFormat::Table && report.is_empty_delta() {
        print_info("Scheduler associations already match membership.");
    } else {
        print_output(&delta_rows(&report), &report, ctx.format);
    }

    if report.failed_accounts.is_empty() {
        return Ok(());
    }

    if ctx.format == OutputFormat::Table {
        for failed in &report.failed_accounts {
            print_warning(&format!("{}: {}", failed.account, failed.reason));
        }
    }
    let accounts: Vec<&str> = report
        .failed_accounts
        .iter()
        .map(|f| f.account.as_str())
        .collect();
    Err(Error::Connectivity(format!("scheduler update failed for {}", accounts.join(", "))).into())
}

#[cfg(test)]
mod tests {
    use skyway_control_plane::association::AccountDelta;

    use super::*;

    #[test]
    fn test_delta_rows() {
        let report = SyncReport {
            applied: vec![AccountDelta {
                account: "rcc-aws".into(),
                grants: vec!["alice".into(), "bob".into()],
                revocations: vec![],
            }],
            ..SyncReport::default()
        };

        let rows = delta_rows(&report);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].grants, "alice bob");
        assert_eq!(rows[0].revocations, "");
    }
}
