//! Integration tests for CLI argument handling
//!
//! Runs the binary against a temporary cache directory so nothing touches the
//! user's real cache or the network.

use std::process::Command;
use std::time::Duration;

use pricefetch::cache::{CacheLookup, PricingCache};
use pricefetch::model::{CacheKey, PriceKind};
use rust_decimal_macros::dec;
use tempfile::TempDir;

/// Helper to run the CLI with given args and an isolated cache
fn run_cli(args: &[&str], cache_dir: &TempDir) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_pricefetch"))
        .args(args)
        .env("PRICEFETCH_CACHE_DIR", cache_dir.path())
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute pricefetch")
}

/// Runs the CLI against a pricing endpoint nothing listens on
fn run_cli_offline(args: &[&str], cache_dir: &TempDir) -> std::process::Output {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    Command::new(env!("CARGO_BIN_EXE_pricefetch"))
        .args(args)
        .env("PRICEFETCH_CACHE_DIR", cache_dir.path())
        .env("PRICEFETCH_ENDPOINT", endpoint)
        .env("PRICEFETCH_RETRY_LIMIT", "1")
        .env("PRICEFETCH_REQUEST_SPACING_MS", "0")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute pricefetch")
}

/// Writes a fresh on-demand price for `item` into the cache directory
fn seed_cache(cache_dir: &TempDir, item: &str) -> (PricingCache, CacheKey) {
    let cache = PricingCache::with_dir(cache_dir.path().to_path_buf());
    let key = CacheKey::new("us-east-1", item, PriceKind::OnDemand);
    cache
        .put(&key, Some(dec!(0.0104)), Duration::from_secs(3600))
        .expect("Seeding the cache should succeed");
    (cache, key)
}

#[test]
fn test_help_flag_exits_successfully() {
    let temp_dir = TempDir::new().unwrap();
    let output = run_cli(&["--help"], &temp_dir);
    assert!(output.status.success(), "Expected --help to exit successfully");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("pricefetch"), "Help should mention pricefetch");
    assert!(stdout.contains("fetch"), "Help should mention the fetch command");
    assert!(stdout.contains("cache"), "Help should mention the cache command");
}

#[test]
fn test_invalid_term_exits_with_invalid_input_code() {
    let temp_dir = TempDir::new().unwrap();
    let output = run_cli(&["fetch", "--kind", "reserved", "--term", "7yr", "m5.large"], &temp_dir);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Invalid lease term"), "Unexpected stderr: {}", stderr);
}

#[test]
fn test_unknown_region_exits_with_invalid_input_code() {
    let temp_dir = TempDir::new().unwrap();
    let output = run_cli(&["fetch", "--region", "mars-north-1", "t3.micro"], &temp_dir);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("mars-north-1"), "Unexpected stderr: {}", stderr);
}

#[test]
fn test_unknown_kind_is_rejected_by_parser() {
    let temp_dir = TempDir::new().unwrap();
    let output = run_cli(&["fetch", "--kind", "lease", "t3.micro"], &temp_dir);
    assert!(!output.status.success());
}

#[test]
fn test_cache_stats_on_empty_cache() {
    let temp_dir = TempDir::new().unwrap();
    let output = run_cli(&["cache", "stats"], &temp_dir);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Entries:         0"), "Unexpected stdout: {}", stdout);
}

#[test]
fn test_cache_clear_reports_count() {
    let temp_dir = TempDir::new().unwrap();
    let output = run_cli(&["cache", "clear", "--region", "us-east-1"], &temp_dir);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Removed 0 cache entries"));
}

#[test]
fn test_config_init_prints_template() {
    let temp_dir = TempDir::new().unwrap();
    let output = run_cli(&["config", "init"], &temp_dir);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("# retry_limit = 3"));
    assert!(stdout.contains("negative_ttl_secs"));
}

#[test]
fn test_fetch_refresh_drops_cached_price() {
    let temp_dir = TempDir::new().unwrap();
    let (cache, key) = seed_cache(&temp_dir, "t3.micro");

    let output = run_cli_offline(&["fetch", "--region", "us-east-1", "--refresh", "t3.micro"], &temp_dir);

    assert_eq!(output.status.code(), Some(0), "Partial data still exits 0");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("t3.micro N/A"), "Unexpected stdout: {}", stdout);
    assert_eq!(
        cache.get(&key),
        CacheLookup::Fresh(None),
        "The seeded price should be replaced by a cached failure"
    );
}

#[test]
fn test_fetch_without_refresh_uses_cached_price() {
    let temp_dir = TempDir::new().unwrap();
    seed_cache(&temp_dir, "t3.micro");

    let output = run_cli_offline(&["fetch", "--region", "us-east-1", "t3.micro"], &temp_dir);

    assert_eq!(output.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&output.stdout).contains("t3.micro 0.0104"));
}

#[test]
fn test_fetch_json_output() {
    let temp_dir = TempDir::new().unwrap();
    seed_cache(&temp_dir, "t3.micro");

    let output = run_cli_offline(&["fetch", "--region", "us-east-1", "--json", "t3.micro"], &temp_dir);

    assert_eq!(output.status.code(), Some(0));
    let document: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be one JSON document");
    let outcomes = document["outcomes"].as_array().expect("outcomes should be an array");
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0]["item_id"], "t3.micro");
    assert_eq!(outcomes[0]["origin"], "CacheHit");
    assert_eq!(document["metrics"]["cache_hits"], 1);
    assert_eq!(document["metrics"]["api_calls"], 0);
    assert_eq!(document["cancelled"], false);
}

#[cfg(test)]
mod unit_tests {
    //! Unit tests for CLI parsing that don't require running the binary

    use clap::Parser;
    use pricefetch::cli::{price_kind_from_args, Cli, Command, KindArg};
    use pricefetch::model::{LeaseTerm, PriceKind};

    #[test]
    fn test_cli_fetch_watch_flag() {
        let cli = Cli::parse_from(["pricefetch", "fetch", "--watch", "t3.micro"]);
        match cli.command {
            Command::Fetch(args) => {
                assert!(args.watch);
                assert_eq!(args.items, vec!["t3.micro"]);
            }
            other => panic!("Expected fetch command, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_fetch_spot_kind() {
        let cli = Cli::parse_from(["pricefetch", "fetch", "--kind", "spot", "c5.large"]);
        match cli.command {
            Command::Fetch(args) => assert_eq!(args.price_kind(), Ok(PriceKind::Spot)),
            other => panic!("Expected fetch command, got {:?}", other),
        }
    }

    #[test]
    fn test_savings_plan_term() {
        assert_eq!(
            price_kind_from_args(KindArg::SavingsPlan, Some("3yr"), None),
            Ok(PriceKind::SavingsPlan {
                lease_term: LeaseTerm::ThreeYear
            })
        );
    }

    #[test]
    fn test_cli_rejects_unknown_subcommand() {
        assert!(Cli::try_parse_from(["pricefetch", "export"]).is_err());
    }
}
