//! skyway - management CLI for the skyway control plane
//!
//! Operates directly on the state store shared with `skyway-daemon`. Exit
//! codes are stable per error kind so scripts can branch on them:
//!
//! | code | kind |
//! |------|------|
//! | 0 | success |
//! | 2 | validation (and usage errors) |
//! | 3 | not-found |
//! | 4 | duplicate |
//! | 5 | connectivity |
//! | 6 | budget-exceeded |
//! | 10 | internal |

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;
mod error;
mod output;

use commands::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(error::exit_code(&e));
    }
}
