//! Account commands: identity, endpoints, membership and nodes.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;
use skyway_control_plane::{
    accounts::NewAccount,
    controller::RemoveOutcome,
    error::Error,
    state::controller_unit,
    store::{CloudAccount, NodeInstance, UnitKind, Vendor},
    vendor::VendorInstance,
};
use tabled::Tabled;

use crate::output::{
    display_option, display_time, print_info, print_output, print_single, print_success,
    print_warning, OutputFormat,
};

use super::CommandContext;

/// Account commands.
#[derive(Debug, Args)]
pub struct AccountCommand {
    #[command(subcommand)]
    command: AccountSubcommand,
}

#[derive(Debug, Subcommand)]
enum AccountSubcommand {
    /// List cloud accounts.
    List,

    /// Show one account.
    Show(AccountArg),

    /// Create a cloud account.
    Create(CreateArgs),

    /// Allow provisioning and scheduler access for an account.
    Activate(AccountArg),

    /// Stop admitting nodes and revoke scheduler access on next sync.
    Deactivate(AccountArg),

    /// Change the vendor identity of an account without node history.
    SetIdentity(SetIdentityArgs),

    /// Add or replace a named endpoint.
    SetEndpoint(SetEndpointArgs),

    /// Remove a named endpoint.
    RemoveEndpoint(EndpointArgs),

    /// Exclude a vendor instance from management.
    Protect(ProtectArgs),

    /// Add a user to the account's onboarding membership.
    AddMember(MemberArgs),

    /// Remove a user from the account's onboarding membership.
    RemoveMember(MemberArgs),

    /// List member usernames.
    Members(AccountArg),

    /// Check vendor API access and endpoint reachability.
    Test(AccountArg),

    /// Open a control channel to an endpoint or node.
    Connect(ConnectArgs),

    /// List live nodes (or raw vendor inventory with --vendor).
    ListInstances(ListInstancesArgs),

    /// Drain and terminate a node by hostname or instance id.
    Remove(RemoveArgs),

    /// Queue nodes for admission by the controller.
    Request(RequestArgs),

    /// Admit and launch one node now.
    Provision(ProvisionArgs),
}

#[derive(Debug, Args)]
struct AccountArg {
    /// Account name.
    account: String,
}

#[derive(Debug, Args)]
struct CreateArgs {
    /// Account name.
    name: String,

    /// Owner (PI or group).
    #[arg(long)]
    owner: String,

    /// Cloud vendor (aws, gcp or azure).
    #[arg(long)]
    vendor: Vendor,

    /// Vendor-side account or project id.
    #[arg(long)]
    vendor_account_id: String,

    /// Named endpoint as NAME=ADDRESS (repeatable).
    #[arg(long = "endpoint", value_parser = parse_endpoint)]
    endpoints: Vec<(String, String)>,

    /// Vendor instance name to leave alone (repeatable).
    #[arg(long = "protect")]
    protected: Vec<String>,
}

#[derive(Debug, Args)]
struct SetIdentityArgs {
    account: String,
    #[arg(long)]
    vendor: Vendor,
    #[arg(long)]
    vendor_account_id: String,
}

#[derive(Debug, Args)]
struct SetEndpointArgs {
    account: String,
    /// Endpoint name.
    name: String,
    /// Host or host:port.
    address: String,
}

#[derive(Debug, Args)]
struct EndpointArgs {
    account: String,
    name: String,
}

#[derive(Debug, Args)]
struct ProtectArgs {
    account: String,
    /// Vendor instance name.
    instance: String,
}

#[derive(Debug, Args)]
struct MemberArgs {
    account: String,
    username: String,
}

#[derive(Debug, Args)]
struct ConnectArgs {
    account: String,
    /// Endpoint name, hostname or instance id.
    target: String,
}

#[derive(Debug, Args)]
struct ListInstancesArgs {
    account: String,

    /// Ask the vendor instead of reading the node map.
    #[arg(long)]
    vendor: bool,
}

#[derive(Debug, Args)]
struct RemoveArgs {
    account: String,
    /// Hostname or vendor instance id.
    instance: String,
}

#[derive(Debug, Args)]
struct RequestArgs {
    account: String,
    node_type: String,
    #[arg(long, default_value = "1")]
    count: u32,
}

#[derive(Debug, Args)]
struct ProvisionArgs {
    account: String,
    node_type: String,
}

fn parse_endpoint(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, address)) if !name.is_empty() && !address.is_empty() => {
            Ok((name.to_string(), address.to_string()))
        }
        _ => Err(format!("expected NAME=ADDRESS, got '{s}'")),
    }
}

impl AccountCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            AccountSubcommand::List => list_accounts(ctx),
            AccountSubcommand::Show(args) => show_account(ctx, args),
            AccountSubcommand::Create(args) => create_account(ctx, args),
            AccountSubcommand::Activate(args) => set_active(ctx, args, true),
            AccountSubcommand::Deactivate(args) => set_active(ctx, args, false),
            AccountSubcommand::SetIdentity(args) => {
                ctx.state
                    .accounts
                    .update_identity(&args.account, args.vendor, &args.vendor_account_id)?;
                print_success(&format!("Updated identity of account {}", args.account));
                Ok(())
            }
            AccountSubcommand::SetEndpoint(args) => {
                ctx.state
                    .accounts
                    .set_endpoint(&args.account, &args.name, &args.address)?;
                print_success(&format!("Endpoint {} of {} set to {}", args.name, args.account, args.address));
                Ok(())
            }
            AccountSubcommand::RemoveEndpoint(args) => {
                ctx.state.accounts.remove_endpoint(&args.account, &args.name)?;
                print_success(&format!("Endpoint {} removed from {}", args.name, args.account));
                Ok(())
            }
            AccountSubcommand::Protect(args) => {
                ctx.state.accounts.protect(&args.account, &args.instance)?;
                print_success(&format!("Instance {} of {} is protected", args.instance, args.account));
                Ok(())
            }
            AccountSubcommand::AddMember(args) => {
                ctx.state.accounts.add_member(&args.account, &args.username)?;
                print_success(&format!("Added {} to {}", args.username, args.account));
                print_info("Run `skyway scheduler-sync update-conf` to apply scheduler associations.");
                Ok(())
            }
            AccountSubcommand::RemoveMember(args) => {
                ctx.state.accounts.remove_member(&args.account, &args.username)?;
                print_success(&format!("Removed {} from {}", args.username, args.account));
                Ok(())
            }
            AccountSubcommand::Members(args) => {
                let members = ctx.state.accounts.members(&args.account)?;
                match ctx.format {
                    OutputFormat::Json => print_single(&members),
                    OutputFormat::Table => members.iter().for_each(|m| println!("{m}")),
                }
                Ok(())
            }
            AccountSubcommand::Test(args) => test_account(ctx, args).await,
            AccountSubcommand::Connect(args) => {
                let channel = ctx.state.controller.connect(&args.account, &args.target).await?;
                match ctx.format {
                    OutputFormat::Json => print_single(&channel),
                    OutputFormat::Table => print_success(&format!(
                        "Connected to {} at {} in {}ms",
                        channel.target, channel.address, channel.latency_ms
                    )),
                }
                Ok(())
            }
            AccountSubcommand::ListInstances(args) => list_instances(ctx, args).await,
            AccountSubcommand::Remove(args) => {
                match ctx.state.controller.remove(&args.account, &args.instance).await? {
                    RemoveOutcome::Accepted => {
                        print_success(&format!("Node {} is draining", args.instance))
                    }
                    RemoveOutcome::AlreadyDraining => {
                        print_info(&format!("Node {} is already draining", args.instance))
                    }
                }
                Ok(())
            }
            AccountSubcommand::Request(args) => {
                let id = ctx
                    .state
                    .controller
                    .submit(&args.account, &args.node_type, args.count)?;
                print_success(&format!(
                    "Queued {} x {} for {} (request {id})",
                    args.count, args.node_type, args.account
                ));
                Ok(())
            }
            AccountSubcommand::Provision(args) => {
                let node = ctx
                    .state
                    .controller
                    .provision(&args.account, &args.node_type)
                    .await?;
                match ctx.format {
                    OutputFormat::Json => print_single(&node),
                    OutputFormat::Table => print_success(&format!(
                        "Launched {} ({})",
                        node.hostname,
                        display_option(&node.instance_id)
                    )),
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct AccountRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Owner")]
    owner: String,
    #[tabled(rename = "Vendor")]
    vendor: String,
    #[tabled(rename = "Vendor Account")]
    vendor_account_id: String,
    #[tabled(rename = "Active")]
    active: bool,
    #[tabled(rename = "Endpoints")]
    endpoints: usize,
    #[tabled(rename = "Created", display = "display_time")]
    created_at: i64,
}

impl From<&CloudAccount> for AccountRow {
    fn from(a: &CloudAccount) -> Self {
        Self {
            name: a.name.clone(),
            owner: a.owner.clone(),
            vendor: a.vendor.to_string(),
            vendor_account_id: a.vendor_account_id.clone(),
            active: a.active,
            endpoints: a.endpoints.len(),
            created_at: a.created_at,
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
pub(super) struct NodeRow {
    #[tabled(rename = "Hostname")]
    hostname: String,
    #[tabled(rename = "Account")]
    account: String,
    #[tabled(rename = "Type")]
    node_type: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Instance", display = "display_option")]
    instance_id: Option<String>,
    #[tabled(rename = "IP", display = "display_option")]
    ip: Option<String>,
    #[tabled(rename = "Rate")]
    rate: f64,
    #[tabled(rename = "Started", display = "display_time")]
    started_at: i64,
}

impl From<&NodeInstance> for NodeRow {
    fn from(n: &NodeInstance) -> Self {
        Self {
            hostname: n.hostname.clone(),
            account: n.account.clone(),
            node_type: n.node_type.clone(),
            status: n.status.to_string(),
            instance_id: n.instance_id.clone(),
            ip: n.ip.clone(),
            rate: n.rate,
            started_at: n.started_at,
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct VendorRow {
    #[tabled(rename = "Instance")]
    instance_id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Shape")]
    shape: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "IP", display = "display_option")]
    ip: Option<String>,
    #[tabled(rename = "Launched", display = "display_time")]
    launched_at: i64,
}

impl From<&VendorInstance> for VendorRow {
    fn from(i: &VendorInstance) -> Self {
        Self {
            instance_id: i.instance_id.clone(),
            name: i.name.clone(),
            shape: i.shape.clone(),
            state: format!("{:?}", i.state).to_lowercase(),
            ip: i.ip.clone(),
            launched_at: i.launched_at,
        }
    }
}

fn list_accounts(ctx: CommandContext) -> Result<()> {
    let accounts = ctx.state.accounts.list()?;
    let rows: Vec<AccountRow> = accounts.iter().map(AccountRow::from).collect();
    print_output(&rows, &accounts, ctx.format);
    Ok(())
}

fn show_account(ctx: CommandContext, args: AccountArg) -> Result<()> {
    let account = ctx.state.accounts.get(&args.account)?;
    match ctx.format {
        OutputFormat::Json => print_single(&account),
        OutputFormat::Table => {
            print_output(&[AccountRow::from(&account)], &account, ctx.format);
            for (name, address) in &account.endpoints {
                println!("endpoint  {name:<16} {address}");
            }
            for instance in &account.protected_nodes {
                println!("protected {instance}");
            }
        }
    }
    Ok(())
}

fn create_account(ctx: CommandContext, args: CreateArgs) -> Result<()> {
    let endpoints: BTreeMap<String, String> = args.endpoints.into_iter().collect();
    let protected_nodes: BTreeSet<String> = args.protected.into_iter().collect();

    let account = ctx.state.accounts.create(NewAccount {
        name: args.name,
        owner: args.owner,
        vendor: args.vendor,
        vendor_account_id: args.vendor_account_id,
        endpoints,
        protected_nodes,
    })?;

    // The daemon picks up the new controller unit on its next health check.
    let unit = controller_unit(&account.name);
    let kind = UnitKind::Controller {
        account: account.name.clone(),
    };
    match ctx.state.units.register(&unit, &kind) {
        Ok(()) | Err(Error::Duplicate(_)) => {}
        Err(e) => return Err(e.into()),
    }

    match ctx.format {
        OutputFormat::Json => print_single(&account),
        OutputFormat::Table => {
            print_success(&format!("Created account {}", account.name));
            print_info("Create a budget with `skyway budget create` before provisioning.");
        }
    }
    Ok(())
}

fn set_active(ctx: CommandContext, args: AccountArg, active: bool) -> Result<()> {
    ctx.state.accounts.set_active(&args.account, active)?;
    let verb = if active { "activated" } else { "deactivated" };
    print_success(&format!("Account {} {verb}", args.account));
    Ok(())
}

async fn test_account(ctx: CommandContext, args: AccountArg) -> Result<()> {
    let report = ctx.state.controller.test(&args.account).await?;

    match ctx.format {
        OutputFormat::Json => print_single(&report),
        OutputFormat::Table => {
            for check in &report.checks {
                let mark = if check.passed { "ok  " } else { "FAIL" };
                println!("{mark} {:<24} {}", check.name, check.detail);
            }
        }
    }

    if report.passed {
        Ok(())
    } else {
        let failed: Vec<&str> = report
            .checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.as_str())
            .collect();
        Err(Error::Connectivity(format!("checks failed: {}", failed.join(", "))).into())
    }
}

async fn list_instances(ctx: CommandContext, args: ListInstancesArgs) -> Result<()> {
    if args.vendor {
        let instances = ctx.state.controller.vendor_inventory(&args.account).await?;
        let rows: Vec<VendorRow> = instances.iter().map(VendorRow::from).collect();
        print_output(&rows, &instances, ctx.format);
        return Ok(());
    }

    let nodes = ctx.state.controller.list(&args.account)?;
    let rows: Vec<NodeRow> = nodes.iter().map(NodeRow::from).collect();
    print_output(&rows, &nodes, ctx.format);

    let queued = ctx
        .state
        .store
        .list_requests(&args.account)
        .map_err(Error::from)?;
    if ctx.format == OutputFormat::Table {
        for request in queued {
            print_warning(&format!(
                "request {}: {} x {} queued ({} denied attempts)",
                request.id, request.count, request.node_type, request.attempts
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("login=10.0.0.5:22").unwrap(),
            ("login".to_string(), "10.0.0.5:22".to_string())
        );
        assert!(parse_endpoint("login").is_err());
        assert!(parse_endpoint("=10.0.0.5").is_err());
    }
}
