//! Diagnostics commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;
use skyway_control_plane::{
    catalog::NodeTypeSpec,
    controller::{render_hosts, InventoryDrift},
    error::Error,
    store::Vendor,
};
use tabled::Tabled;
use tracing::warn;

use crate::output::{display_money, display_option, print_output, print_single, print_warning, OutputFormat};

use super::{account::NodeRow, CommandContext};

/// Diagnostics commands.
#[derive(Debug, Args)]
pub struct DiagnosticsCommand {
    #[command(subcommand)]
    command: DiagnosticsSubcommand,
}

#[derive(Debug, Subcommand)]
enum DiagnosticsSubcommand {
    /// Check database integrity and table sizes.
    Store,

    /// Show the node map across accounts.
    Inventory(InventoryArgs),

    /// List requestable node types of a vendor.
    NodeTypes(NodeTypesArgs),
}

#[derive(Debug, Args)]
struct InventoryArgs {
    /// Limit to one account.
    #[arg(long)]
    account: Option<String>,

    /// Compare with vendor inventory and report disagreements. Nothing is
    /// changed; the daemon's controller resolves drift.
    #[arg(long)]
    refresh: bool,

    /// Print as /etc/hosts lines.
    #[arg(long)]
    hosts: bool,
}

#[derive(Debug, Args)]
struct NodeTypesArgs {
    #[arg(long)]
    vendor: Vendor,
}

impl DiagnosticsCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            DiagnosticsSubcommand::Store => check_store(ctx),
            DiagnosticsSubcommand::Inventory(args) => inventory(ctx, args).await,
            DiagnosticsSubcommand::NodeTypes(args) => {
                let types = ctx.state.catalog.types(args.vendor);
                let rows: Vec<NodeTypeRow> = types
                    .iter()
                    .map(|(name, spec)| NodeTypeRow::new(name, spec))
                    .collect();
                print_output(&rows, &rows, ctx.format);
                Ok(())
            }
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct TableRow {
    #[tabled(rename = "Table")]
    table: String,
    #[tabled(rename = "Rows")]
    rows: i64,
}

fn check_store(ctx: CommandContext) -> Result<()> {
    let health = ctx.state.store.check().map_err(Error::from)?;

    match ctx.format {
        OutputFormat::Json => print_single(&health),
        OutputFormat::Table => {
            println!("integrity: {}", health.integrity);
            let rows: Vec<TableRow> = health
                .tables
                .iter()
                .map(|(table, rows)| TableRow {
                    table: table.clone(),
                    rows: *rows,
                })
                .collect();
            print_output(&rows, &health, ctx.format);
        }
    }

    if health.is_ok() {
        Ok(())
    } else {
        Err(Error::Internal(format!("integrity check failed: {}", health.integrity)).into())
    }
}

async fn inventory(ctx: CommandContext, args: InventoryArgs) -> Result<()> {
    let accounts = match &args.account {
        Some(name) => vec![ctx.state.accounts.get(name)?.name],
        None => ctx
            .state
            .accounts
            .list()?
            .into_iter()
            .map(|a| a.name)
            .collect(),
    };

    if args.refresh {
        let to_stdout = ctx.format == OutputFormat::Table && !args.hosts;
        for account in &accounts {
            let drift = ctx.state.controller.drift(account).await?;
            for line in drift_lines(&drift) {
                if to_stdout {
                    print_warning(&line);
                } else {
                    warn!(account = %account, "{line}");
                }
            }
        }
    }

    let mut nodes = Vec::new();
    for account in &accounts {
        nodes.extend(ctx.state.controller.list(account)?);
    }

    if args.hosts {
        print!("{}", render_hosts(&nodes));
        return Ok(());
    }

    let rows: Vec<NodeRow> = nodes.iter().map(NodeRow::from).collect();
    print_output(&rows, &nodes, ctx.format);
    Ok(())
}

fn drift_lines(drift: &InventoryDrift) -> Vec<String> {
    let account = &drift.account;
    let mut lines = Vec::new();
    for instance in &drift.vendor_only {
        lines.push(format!(
            "{account}: vendor instance {} ({}) has no node record",
            instance.instance_id, instance.name
        ));
    }
    for hostname in &drift.store_only {
        lines.push(format!("{account}: node {hostname} is missing from vendor inventory"));
    }
    for instance in &drift.duplicates {
        lines.push(format!(
            "{account}: instance {} duplicates node {}",
            instance.instance_id, instance.name
        ));
    }
    lines
}

#[derive(Debug, Serialize, Tabled)]
struct NodeTypeRow {
    #[tabled(rename = "Type")]
    node_type: String,
    #[tabled(rename = "Shape")]
    shape: String,
    #[tabled(rename = "Price/h", display = "display_money")]
    price: f64,
    #[tabled(rename = "Cores")]
    cores: u32,
    #[tabled(rename = "Mem GB")]
    memgb: u32,
    #[tabled(rename = "GPUs", display = "display_option")]
    gpu: Option<u32>,
    #[tabled(rename = "GPU Type", display = "display_option")]
    gpu_type: Option<String>,
}

impl NodeTypeRow {
    fn new(node_type: &str, spec: &NodeTypeSpec) -> Self {
        Self {
            node_type: node_type.to_string(),
            shape: spec.name.clone(),
            price: spec.price,
            cores: spec.cores,
            memgb: spec.memgb,
            gpu: spec.gpu,
            gpu_type: spec.gpu_type.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use skyway_control_plane::vendor::{InstanceState, VendorInstance};

    use super::*;

    #[test]
    fn test_drift_lines() {
        let instance = |id: &str, name: &str| VendorInstance {
            instance_id: id.to_string(),
            name: name.to_string(),
            shape: "c5.xlarge".to_string(),
            ip: None,
            launched_at: 0,
            state: InstanceState::Running,
        };
        let drift = InventoryDrift {
            account: "rcc-aws".to_string(),
            vendor_only: vec![instance("i-9", "rcc-aws-c5-009")],
            store_only: vec!["rcc-aws-c5-002".to_string()],
            duplicates: vec![instance("i-3", "rcc-aws-c5-001")],
        };

        assert_eq!(
            drift_lines(&drift),
            vec![
                "rcc-aws: vendor instance i-9 (rcc-aws-c5-009) has no node record",
                "rcc-aws: node rcc-aws-c5-002 is missing from vendor inventory",
                "rcc-aws: instance i-3 duplicates node rcc-aws-c5-001",
            ]
        );
        assert!(drift_lines(&InventoryDrift::default()).is_empty());
    }
}
