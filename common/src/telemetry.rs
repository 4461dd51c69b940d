//! Provides helper functions for initializing log collection.
use anyhow::Result;
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

/// Initialize tracing with the given default level.
///
/// RUST_LOG overrides the default when set.
pub fn init_tracing(default_level: LevelFilter) -> Result<()> {
    // Setup log filter
    // Default to the requested level if no env is specified
    let log_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env()?;

    let logger = tracing_subscriber::fmt::layer()
        .with_ansi(true)
        .with_target(false)
        .with_filter(log_filter);
    tracing_subscriber::registry().with(logger).init();
    Ok(())
}

/// Parse a log level name as used by the CLI.
pub fn parse_level(level: &str) -> Result<LevelFilter> {
    Ok(match level {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        other => anyhow::bail!("unknown log level {other}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_levels() {
        assert_eq!(parse_level("debug").unwrap(), LevelFilter::DEBUG);
        assert_eq!(parse_level("error").unwrap(), LevelFilter::ERROR);
    }

    #[test]
    fn parse_unknown_level_errors() {
        assert!(parse_level("loud").is_err());
    }
}
