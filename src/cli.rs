//! Command-line interface parsing for pricefetch
//!
//! This module handles parsing of CLI arguments using clap and turns the
//! `--kind`/`--term`/`--payment` combination into a `PriceKind`.

use clap::{Args, Parser, Subcommand, ValueEnum};
use thiserror::Error;

use crate::model::{LeaseTerm, PaymentOption, PriceKind};

/// Error types for CLI argument parsing
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CliError {
    /// The lease term is not recognized
    #[error("Invalid lease term: '{0}'. Valid terms: 1yr, 3yr")]
    InvalidTerm(String),

    /// The payment option is not recognized
    #[error("Invalid payment option: '{0}'. Valid options: no-upfront, partial-upfront, all-upfront")]
    InvalidPayment(String),

    /// An option was given that the price kind does not use
    #[error("--{option} does not apply to {kind} prices")]
    UnusedOption { option: &'static str, kind: &'static str },
}

/// Fetch catalog pricing quotes with a persistent cache
#[derive(Parser, Debug)]
#[command(name = "pricefetch")]
#[command(about = "Fetch catalog pricing quotes with a persistent TTL cache")]
#[command(version)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch prices for one or more items
    ///
    /// Examples:
    ///   pricefetch fetch t3.micro m5.large
    ///   pricefetch fetch --kind spot --region eu-west-1 c5.large
    ///   pricefetch fetch --kind reserved --term 3yr --payment all-upfront m5.large
    Fetch(FetchArgs),

    /// Inspect or maintain the price cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Manage the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Region code; defaults to the configured default region
    #[arg(long, short)]
    pub region: Option<String>,

    /// Pricing dimension
    #[arg(long, short, value_enum, default_value_t = KindArg::OnDemand)]
    pub kind: KindArg,

    /// Commitment term for reserved and savings plan prices (1yr, 3yr)
    #[arg(long)]
    pub term: Option<String>,

    /// Upfront payment for reserved prices
    #[arg(long)]
    pub payment: Option<String>,

    /// Show live progress and allow Ctrl-C to stop early
    #[arg(long, short)]
    pub watch: bool,

    /// Override the number of concurrent requests
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Drop cached entries for these items before fetching
    #[arg(long)]
    pub refresh: bool,

    /// Print results as JSON instead of lines
    #[arg(long)]
    pub json: bool,

    /// Items to price, e.g. instance types
    #[arg(required = true, value_name = "ITEM")]
    pub items: Vec<String>,
}

/// Price kinds accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    OnDemand,
    Spot,
    Reserved,
    SavingsPlan,
}

impl KindArg {
    fn name(&self) -> &'static str {
        match self {
            KindArg::OnDemand => "on-demand",
            KindArg::Spot => "spot",
            KindArg::Reserved => "reserved",
            KindArg::SavingsPlan => "savings-plan",
        }
    }
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum CacheAction {
    /// Show entry counts and size
    Stats,
    /// Remove entries, optionally only for a region or item
    Clear {
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        item: Option<String>,
    },
    /// Remove expired and unreadable entries
    Purge,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum ConfigAction {
    /// Print a commented config file template
    Init,
    /// Print the config file location
    Path,
}

/// Parses a lease term argument.
///
/// # Arguments
/// * `s` - The term string from CLI
///
/// # Returns
/// * `Ok(LeaseTerm)` if the string matches a valid term
/// * `Err(CliError::InvalidTerm)` if it doesn't
pub fn parse_term_arg(s: &str) -> Result<LeaseTerm, CliError> {
    LeaseTerm::from_str(s).ok_or_else(|| CliError::InvalidTerm(s.to_string()))
}

/// Parses a payment option argument.
pub fn parse_payment_arg(s: &str) -> Result<PaymentOption, CliError> {
    PaymentOption::from_str(s).ok_or_else(|| CliError::InvalidPayment(s.to_string()))
}

/// Builds the requested price kind from the CLI options.
///
/// Reserved prices default to a one-year, no-upfront term; savings plans
/// default to one year.
///
/// # Returns
/// * `Ok(PriceKind)` for a consistent combination
/// * `Err(CliError)` for unknown values or options the kind does not use
pub fn price_kind_from_args(
    kind: KindArg,
    term: Option<&str>,
    payment: Option<&str>,
) -> Result<PriceKind, CliError> {
    let unused = |option: &'static str| CliError::UnusedOption {
        option,
        kind: kind.name(),
    };

    match kind {
        KindArg::OnDemand | KindArg::Spot => {
            if term.is_some() {
                return Err(unused("term"));
            }
            if payment.is_some() {
                return Err(unused("payment"));
            }
            Ok(if kind == KindArg::Spot {
                PriceKind::Spot
            } else {
                PriceKind::OnDemand
            })
        }
        KindArg::Reserved => Ok(PriceKind::ReservedInstance {
            lease_term: term.map(parse_term_arg).transpose()?.unwrap_or(LeaseTerm::OneYear),
            payment_option: payment
                .map(parse_payment_arg)
                .transpose()?
                .unwrap_or(PaymentOption::NoUpfront),
        }),
        KindArg::SavingsPlan => {
            if payment.is_some() {
                return Err(unused("payment"));
            }
            Ok(PriceKind::SavingsPlan {
                lease_term: term.map(parse_term_arg).transpose()?.unwrap_or(LeaseTerm::OneYear),
            })
        }
    }
}

impl FetchArgs {
    /// The price kind these arguments describe
    pub fn price_kind(&self) -> Result<PriceKind, CliError> {
        price_kind_from_args(self.kind, self.term.as_deref(), self.payment.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch_args(args: &[&str]) -> FetchArgs {
        let mut argv = vec!["pricefetch", "fetch"];
        argv.extend_from_slice(args);
        match Cli::parse_from(argv).command {
            Command::Fetch(args) => args,
            other => panic!("Expected fetch command, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_term_arg_aliases() {
        assert_eq!(parse_term_arg("1yr").unwrap(), LeaseTerm::OneYear);
        assert_eq!(parse_term_arg("3y").unwrap(), LeaseTerm::ThreeYear);
    }

    #[test]
    fn test_parse_term_arg_invalid() {
        let err = parse_term_arg("5yr").unwrap_err();
        assert!(err.to_string().contains("Invalid lease term"));
        assert!(err.to_string().contains("5yr"));
    }

    #[test]
    fn test_parse_payment_arg_accepts_dashes() {
        assert_eq!(parse_payment_arg("all-upfront").unwrap(), PaymentOption::AllUpfront);
        assert_eq!(parse_payment_arg("partial_upfront").unwrap(), PaymentOption::PartialUpfront);
        assert!(parse_payment_arg("monthly").is_err());
    }

    #[test]
    fn test_price_kind_defaults() {
        assert_eq!(price_kind_from_args(KindArg::OnDemand, None, None), Ok(PriceKind::OnDemand));
        assert_eq!(price_kind_from_args(KindArg::Spot, None, None), Ok(PriceKind::Spot));
        assert_eq!(
            price_kind_from_args(KindArg::Reserved, None, None),
            Ok(PriceKind::ReservedInstance {
                lease_term: LeaseTerm::OneYear,
                payment_option: PaymentOption::NoUpfront,
            })
        );
    }

    #[test]
    fn test_price_kind_rejects_unused_options() {
        assert_eq!(
            price_kind_from_args(KindArg::OnDemand, Some("1yr"), None),
            Err(CliError::UnusedOption {
                option: "term",
                kind: "on-demand"
            })
        );
        assert!(price_kind_from_args(KindArg::SavingsPlan, None, Some("all-upfront")).is_err());
    }

    #[test]
    fn test_cli_parse_fetch_defaults() {
        let args = fetch_args(&["t3.micro", "m5.large"]);
        assert_eq!(args.items, vec!["t3.micro", "m5.large"]);
        assert_eq!(args.kind, KindArg::OnDemand);
        assert!(args.region.is_none());
        assert!(!args.watch);
    }

    #[test]
    fn test_cli_parse_fetch_reserved() {
        let args = fetch_args(&[
            "--kind",
            "reserved",
            "--term",
            "3yr",
            "--payment",
            "all-upfront",
            "--region",
            "eu-west-1",
            "m5.large",
        ]);
        assert_eq!(args.region.as_deref(), Some("eu-west-1"));
        assert_eq!(
            args.price_kind(),
            Ok(PriceKind::ReservedInstance {
                lease_term: LeaseTerm::ThreeYear,
                payment_option: PaymentOption::AllUpfront,
            })
        );
    }

    #[test]
    fn test_cli_parse_cache_clear_filters() {
        let cli = Cli::parse_from(["pricefetch", "cache", "clear", "--region", "us-east-1"]);
        match cli.command {
            Command::Cache { action } => assert_eq!(
                action,
                CacheAction::Clear {
                    region: Some("us-east-1".to_string()),
                    item: None
                }
            ),
            other => panic!("Expected cache command, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_verbosity_counts() {
        let cli = Cli::parse_from(["pricefetch", "-vv", "cache", "stats"]);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_cli_fetch_requires_items() {
        assert!(Cli::try_parse_from(["pricefetch", "fetch"]).is_err());
    }
}
