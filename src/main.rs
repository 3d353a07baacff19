//! pricefetch - fetch catalog pricing quotes from the command line
//!
//! Script mode prints one `item price` line per item on stdout. Watch mode
//! shows live progress on stderr and stops early on Ctrl-C.

use std::error::Error;
use std::process::ExitCode;

use clap::Parser;
use serde_json::json;
use tracing::debug;

use pricefetch::cache::ClearFilter;
use pricefetch::cli::{CacheAction, Cli, Command, ConfigAction, FetchArgs};
use pricefetch::config::{RunMode, Settings};
use pricefetch::fetch::{FetchError, FetchEvent, FetchReport};
use pricefetch::logging::init_logging;
use pricefetch::model::{FetchRequest, Origin};
use pricefetch::runtime::PricingRuntime;

/// Exit code for requests rejected before any work was done
const EXIT_INVALID_INPUT: u8 = 2;

fn invalid_input(err: &dyn Error) -> ExitCode {
    eprintln!("Error: {}", err);
    ExitCode::from(EXIT_INVALID_INPUT)
}

/// Prints the report; prices go to stdout, the summary to stderr
fn print_report(report: &FetchReport, as_json: bool) -> Result<(), Box<dyn Error>> {
    if as_json {
        let outcomes: Vec<_> = report.outcomes.values().collect();
        let document = json!({
            "outcomes": outcomes,
            "metrics": report.metrics.to_map(),
            "cancelled": report.cancelled,
        });
        println!("{}", serde_json::to_string_pretty(&document)?);
    } else {
        for outcome in report.outcomes.values() {
            match outcome.value {
                Some(price) => println!("{} {}", outcome.item_id, price),
                None => println!("{} N/A", outcome.item_id),
            }
        }
    }
    eprintln!("{}", report.metrics.summary());
    Ok(())
}

/// Drains the event stream with a live progress line
async fn watch(runtime: &PricingRuntime, request: FetchRequest) -> Result<FetchReport, FetchError> {
    let mut handle = runtime.orchestrator().spawn(request)?;
    let cancel = handle.cancel_token();
    let mut failures = 0;
    let mut hits = 0;

    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(FetchEvent::Outcome(outcome)) => {
                    if outcome.origin == Origin::ApiFailure {
                        failures += 1;
                    }
                }
                Some(FetchEvent::CacheHit { .. }) => hits += 1,
                Some(FetchEvent::Progress { completed, total }) => {
                    eprint!("\r{}/{} resolved, {} from cache, {} failed", completed, total, hits, failures);
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                eprint!("\nCancelling, waiting for requests in flight...");
                cancel.cancel();
            }
        }
    }
    eprintln!();

    let report = handle.wait().await?;
    let failed = report.failed_items();
    if !failed.is_empty() {
        eprintln!("Failed ({}), re-fetch with --refresh: {}", failed.len(), failed.join(" "));
    }
    if report.cancelled {
        eprintln!(
            "Cancelled: {} of {} items resolved",
            report.outcomes.len(),
            report.metrics.total_requested
        );
    }
    Ok(report)
}

async fn fetch_command(settings: Settings, args: FetchArgs) -> Result<ExitCode, Box<dyn Error>> {
    let price_kind = match args.price_kind() {
        Ok(kind) => kind,
        Err(e) => return Ok(invalid_input(&e)),
    };

    let runtime = PricingRuntime::init(settings)?;
    let region = args
        .region
        .clone()
        .unwrap_or_else(|| runtime.settings().default_region.clone());
    let mode = if args.watch {
        RunMode::Interactive
    } else {
        RunMode::Script
    };

    let mut request = runtime.request(args.items.iter().cloned(), region, price_kind, mode);
    if let Some(limit) = args.concurrency {
        request = request.with_concurrency_limit(limit);
    }

    if args.refresh {
        for item_id in &request.item_ids {
            if let Err(e) = runtime.cache().remove(&request.cache_key(item_id)) {
                eprintln!("Warning: could not drop cached {}: {}", item_id, e);
            }
        }
    }

    let result = if args.watch {
        watch(&runtime, request).await
    } else {
        runtime.fetch(request).await
    };

    let report = match result {
        Ok(report) => report,
        Err(FetchError::InvalidInput(e)) => return Ok(invalid_input(&e)),
        Err(e) => return Err(e.into()),
    };

    print_report(&report, args.json)?;
    let swept = runtime.shutdown();
    debug!(swept, "runtime shut down");
    Ok(ExitCode::SUCCESS)
}

fn cache_command(settings: Settings, action: CacheAction) -> Result<ExitCode, Box<dyn Error>> {
    let runtime = PricingRuntime::init(settings)?;
    let cache = runtime.cache();

    match action {
        CacheAction::Stats => {
            let stats = cache.stats()?;
            println!("Cache directory: {}", cache.dir().display());
            println!("Entries:         {}", stats.total_entries);
            println!("  fresh:         {}", stats.fresh_entries);
            println!("  expired:       {}", stats.expired_entries);
            println!("  unreadable:    {}", stats.unreadable_entries);
            println!("Size:            {} bytes", stats.approx_size_bytes);
            if let Some(oldest) = stats.oldest {
                println!("Oldest:          {}", oldest.to_rfc3339());
            }
            if let Some(newest) = stats.newest {
                println!("Newest:          {}", newest.to_rfc3339());
            }
        }
        CacheAction::Clear { region, item } => {
            let removed = cache.clear(&ClearFilter {
                region,
                item_id: item,
            })?;
            println!("Removed {} cache entries", removed);
        }
        CacheAction::Purge => {
            let removed = cache.purge_expired()?;
            println!("Purged {} expired cache entries", removed);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn config_command(action: ConfigAction) -> ExitCode {
    match action {
        ConfigAction::Init => print!("{}", Settings::default_config_toml()),
        ConfigAction::Path => match Settings::config_path() {
            Some(path) => println!("{}", path.display()),
            None => {
                eprintln!("No config directory available on this platform");
                return ExitCode::FAILURE;
            }
        },
    }
    ExitCode::SUCCESS
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Config { action } => Ok(config_command(action)),
        Command::Fetch(args) => fetch_command(Settings::load()?, args).await,
        Command::Cache { action } => cache_command(Settings::load()?, action),
    }
}
