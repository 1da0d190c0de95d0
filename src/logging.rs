use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber.
///
/// Honors `RUST_LOG`; defaults to `info` for this crate and `warn` elsewhere.
/// Logs go to stderr; stdout carries command output.
/// Returns an error when a subscriber is already installed, which callers
/// (tests, binaries started twice in-process) are free to ignore.
pub fn init() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,liquid_swap_wallet=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("install tracing subscriber: {e}"))
}
