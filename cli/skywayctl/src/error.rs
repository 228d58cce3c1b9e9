//! Error display and exit codes for the CLI.

use colored::Colorize;
use skyway_control_plane::error::{Error, ErrorKind};

/// Kind of a command failure. Anything that is not a domain error (bad
/// configuration, I/O) counts as internal.
pub fn error_kind(err: &anyhow::Error) -> ErrorKind {
    err.downcast_ref::<Error>()
        .map(Error::kind)
        .unwrap_or(ErrorKind::Internal)
}

pub fn exit_code(err: &anyhow::Error) -> i32 {
    error_kind(err).exit_code()
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    let kind = error_kind(err);
    let reason = match err.downcast_ref::<Error>() {
        Some(e) => e.reason().to_string(),
        None => format!("{err:#}"),
    };
    eprintln!("{} {}: {}", "Error:".red().bold(), kind.as_str(), reason);

    let hint = match kind {
        ErrorKind::Connectivity => Some("Hint: Check the vendor driver, endpoint addresses and network reachability."),
        ErrorKind::BudgetExceeded => Some("Hint: Run `skyway budget summary <account>` to see spend and remaining budget."),
        ErrorKind::NotFound => Some("Hint: Run `skyway account list` or `skyway service status` to see what exists."),
        _ => None,
    };
    if let Some(hint) = hint {
        eprintln!("\n{}", hint.yellow());
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Error::Validation("x".into()), 2)]
    #[case(Error::NotFound("x".into()), 3)]
    #[case(Error::Duplicate("x".into()), 4)]
    #[case(Error::Connectivity("x".into()), 5)]
    #[case(Error::BudgetExceeded("x".into()), 6)]
    #[case(Error::Internal("x".into()), 10)]
    fn test_exit_codes(#[case] err: Error, #[case] code: i32) {
        assert_eq!(exit_code(&anyhow::Error::new(err)), code);
    }

    #[test]
    fn test_context_keeps_kind() {
        let err: anyhow::Result<()> = Err(Error::NotFound("account x".into())).context("loading account");
        assert_eq!(exit_code(&err.unwrap_err()), 3);
    }

    #[test]
    fn test_other_errors_are_internal() {
        assert_eq!(exit_code(&anyhow::anyhow!("bad config")), 10);
    }
}
