//! corral-dispatch binary.
//!
//! Loads the option tree, starts the dispatcher, and drives it until the
//! dispatch machine terminates (or forever, in dev mode).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use corral_core::options::DispatchOptions;
use corral_dispatch::Dispatch;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// corral cluster dispatcher.
#[derive(Parser, Debug)]
#[command(name = "corral-dispatch")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the dispatcher options file.
    #[arg(short, long, default_value = "dispatch.toml")]
    config: PathBuf,

    /// Master port workers register on.
    #[arg(short, long, default_value = "10012")]
    port: u16,

    /// Milliseconds between dispatch ticks.
    #[arg(long, default_value = "100")]
    poll_interval_ms: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let options = if args.config.exists() {
        DispatchOptions::from_file(&args.config).context("failed to load options")?
    } else {
        info!(config = %args.config.display(), "options file not found, using defaults");
        DispatchOptions::default()
    };

    let mut dispatch =
        Dispatch::new(args.port, options).context("failed to start the dispatcher")?;
    info!(
        port = dispatch.local_port(),
        root = %dispatch.run_root().display(),
        "dispatcher running"
    );

    let tick = Duration::from_millis(args.poll_interval_ms);
    while !dispatch.is_terminated() {
        dispatch.run().context("dispatch tick failed")?;
        std::thread::sleep(tick);
    }

    info!("dispatcher finished");
    Ok(())
}
