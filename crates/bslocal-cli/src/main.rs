use anyhow::{Context, Result};
use bslocal_core::registry::atomic_writer::AtomicWriter;
use bslocal_core::{LocalConfig, ShutdownHooks};
use clap::Parser;
use dotenvy::dotenv;
use tracing::{debug, error, subscriber};
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

mod cli;
mod commands;

use cli::Cli;

/// Installs a stderr fmt layer filtered by RUST_LOG, or the default filter.
fn init_tracing(verbose: bool) -> Result<()> {
    let default_filter = if verbose {
        "debug,bslocal_core=debug"
    } else {
        "info,bslocal_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = Registry::default().with(filter).with(
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr),
    );

    subscriber::set_global_default(subscriber)
        .context("Failed to set global default tracing subscriber")?;
    Ok(())
}

#[tokio::main]
async fn main() {
    // Load environment variables from a .env file in the current directory.
    dotenv().ok();

    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.verbose) {
        eprintln!("{e:#}");
    }

    let hooks = ShutdownHooks::new();
    hooks
        .register("remove orphaned temp files", || async {
            let removed = AtomicWriter::global().cleanup_orphaned_temp_files();
            debug!(removed, "Cleaned up temp files");
        })
        .await;
    if let Err(e) = hooks.install_signal_handlers() {
        error!(error = %e, "Failed to install signal handlers");
    }

    let config = LocalConfig::from_env();
    let result = commands::execute(cli.command, config, &hooks).await;
    hooks.run().await;

    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}
