//! Log output setup for the binary

use tracing_subscriber::EnvFilter;

/// Default filter for the given number of `-v` flags
pub fn default_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "pricefetch=warn",
        1 => "pricefetch=info",
        _ => "pricefetch=debug",
    }
}

/// Installs a stderr subscriber; `RUST_LOG` wins over `verbosity`
///
/// Stdout stays reserved for prices so scripts can pipe it.
pub fn init_logging(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_raises_level() {
        assert_eq!(default_filter(0), "pricefetch=warn");
        assert_eq!(default_filter(1), "pricefetch=info");
        assert_eq!(default_filter(5), "pricefetch=debug");
    }
}
