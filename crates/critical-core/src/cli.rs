//! Shared CLI helpers for workspace tools.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{Error, Result};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence when set; otherwise the level is `info`, or
/// `debug` with `verbose`.
pub fn setup_cli_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| Error::Logging(format!("Failed to initialize logger: {e}")))?;

    Ok(())
}
