//! Budget commands.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use clap::{Args, Subcommand};
use serde::Serialize;
use skyway_control_plane::{
    budget::{BudgetField, SpendSummary, TypeUsage},
    error::Error,
    store::Budget,
};
use tabled::Tabled;

use crate::output::{display_money, print_output, print_single, print_success, OutputFormat};

use super::CommandContext;

/// Budget commands.
#[derive(Debug, Args)]
pub struct BudgetCommand {
    #[command(subcommand)]
    command: BudgetSubcommand,
}

#[derive(Debug, Subcommand)]
enum BudgetSubcommand {
    /// List all budgets.
    List,

    /// Create the budget of an account.
    Create(CreateArgs),

    /// Change a budget field: amount=N or rate=N.
    Set(SetArgs),

    /// Show spend against the budget and hours per node type.
    Summary(SummaryArgs),

    /// Start a new billing period.
    Reset(ResetArgs),
}

#[derive(Debug, Args)]
struct CreateArgs {
    account: String,

    /// Total for the billing period.
    #[arg(long)]
    amount: f64,

    /// Hourly rate cap per node.
    #[arg(long)]
    rate: f64,

    /// First day of the period (YYYY-MM-DD, default today).
    #[arg(long)]
    start: Option<NaiveDate>,
}

#[derive(Debug, Args)]
struct SetArgs {
    account: String,
    /// FIELD=VALUE
    assignment: String,
}

#[derive(Debug, Args)]
struct SummaryArgs {
    account: String,
}

#[derive(Debug, Args)]
struct ResetArgs {
    account: String,

    /// First day of the new period (YYYY-MM-DD, default today).
    #[arg(long)]
    start: Option<NaiveDate>,
}

/// Split `field=value` into a budget field and a number.
fn parse_assignment(s: &str) -> std::result::Result<(BudgetField, f64), Error> {
    let (field, value) = s
        .split_once('=')
        .ok_or_else(|| Error::Validation(format!("expected FIELD=VALUE, got '{s}'")))?;
    let field: BudgetField = field.trim().parse()?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| Error::Validation(format!("'{value}' is not a number")))?;
    Ok((field, value))
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

impl BudgetCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let enforcer = &ctx.state.enforcer;
        match self.command {
            BudgetSubcommand::List => {
                let budgets = enforcer.list()?;
                let rows: Vec<BudgetRow> = budgets.iter().map(BudgetRow::from).collect();
                print_output(&rows, &budgets, ctx.format);
            }
            BudgetSubcommand::Create(args) => {
                // The account must exist before it can carry a budget.
                ctx.state.accounts.get(&args.account)?;
                let budget = enforcer.create(
                    &args.account,
                    args.start.unwrap_or_else(today),
                    args.amount,
                    args.rate,
                )?;
                match ctx.format {
                    OutputFormat::Json => print_single(&budget),
                    OutputFormat::Table => print_success(&format!(
                        "Budget of {} set to {:.2} from {} (rate cap {:.2}/h)",
                        budget.account, budget.amount, budget.start_date, budget.max_rate
                    )),
                }
            }
            BudgetSubcommand::Set(args) => {
                let (field, value) = parse_assignment(&args.assignment)?;
                enforcer.set(&args.account, field, value)?;
                print_success(&format!("Updated budget of {}", args.account));
            }
            BudgetSubcommand::Summary(args) => {
                let summary = enforcer.summary(&args.account)?;
                let usage = enforcer.usage_by_type(&args.account)?;
                match ctx.format {
                    OutputFormat::Json => print_single(&SummaryReport {
                        summary: &summary,
                        usage_by_type: &usage,
                    }),
                    OutputFormat::Table => {
                        print_output(&[SummaryRow::from(&summary)], &summary, ctx.format);
                        let rows: Vec<UsageRow> = usage.iter().map(UsageRow::from).collect();
                        if !rows.is_empty() {
                            print_output(&rows, &usage, ctx.format);
                        }
                    }
                }
            }
            BudgetSubcommand::Reset(args) => {
                let start = args.start.unwrap_or_else(today);
                enforcer.reset_period(&args.account, start)?;
                print_success(&format!("Billing period of {} starts {start}", args.account));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Tabled)]
struct BudgetRow {
    #[tabled(rename = "Account")]
    account: String,
    #[tabled(rename = "Start")]
    start_date: NaiveDate,
    #[tabled(rename = "Amount", display = "display_money")]
    amount: f64,
    #[tabled(rename = "Rate Cap", display = "display_money")]
    max_rate: f64,
}

impl From<&Budget> for BudgetRow {
    fn from(b: &Budget) -> Self {
        Self {
            account: b.account.clone(),
            start_date: b.start_date,
            amount: b.amount,
            max_rate: b.max_rate,
        }
    }
}

#[derive(Serialize)]
struct SummaryReport<'a> {
    #[serde(flatten)]
    summary: &'a SpendSummary,
    usage_by_type: &'a BTreeMap<String, TypeUsage>,
}

#[derive(Debug, Serialize, Tabled)]
struct SummaryRow {
    #[tabled(rename = "Account")]
    account: String,
    #[tabled(rename = "Since")]
    period_start: NaiveDate,
    #[tabled(rename = "Total", display = "display_money")]
    total: f64,
    #[tabled(rename = "Spent", display = "display_money")]
    spend_to_date: f64,
    #[tabled(rename = "Remaining", display = "display_money")]
    remaining: f64,
    #[tabled(rename = "Rate/h", display = "display_money")]
    current_rate: f64,
    #[tabled(rename = "Nodes")]
    live_nodes: usize,
}

impl From<&SpendSummary> for SummaryRow {
    fn from(s: &SpendSummary) -> Self {
        Self {
            account: s.account.clone(),
            period_start: s.period_start,
            total: s.total,
            spend_to_date: s.spend_to_date,
            remaining: s.remaining,
            current_rate: s.current_rate,
            live_nodes: s.live_nodes,
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct UsageRow {
    #[tabled(rename = "Type")]
    node_type: String,
    #[tabled(rename = "Hours", display = "display_money")]
    hours: f64,
    #[tabled(rename = "Cost", display = "display_money")]
    cost: f64,
}

impl From<(&String, &TypeUsage)> for UsageRow {
    fn from((node_type, usage): (&String, &TypeUsage)) -> Self {
        Self {
            node_type: node_type.clone(),
            hours: usage.hours,
            cost: usage.cost,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use skyway_control_plane::error::ErrorKind;

    use super::*;

    #[test]
    fn test_parse_assignment() {
        let (field, value) = parse_assignment("amount=500").unwrap();
        assert_eq!(field, BudgetField::Amount);
        assert_eq!(value, 500.0);

        let (field, value) = parse_assignment("rate = 2.5").unwrap();
        assert_eq!(field, BudgetField::Rate);
        assert_eq!(value, 2.5);
    }

    #[rstest]
    #[case("amount")]
    #[case("color=blue")]
    #[case("amount=lots")]
    fn test_parse_assignment_invalid(#[case] input: &str) {
        let err = parse_assignment(input).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
