//! Subcommand implementations

use anyhow::{Context, Result};
use bslocal_core::manager::{LocalConfig, LocalOptions, TunnelController};
use bslocal_core::remote::HttpInstanceLister;
use bslocal_core::ShutdownHooks;
use tracing::{info, warn};

use crate::cli::Commands;

pub async fn execute(command: Commands, config: LocalConfig, hooks: &ShutdownHooks) -> Result<()> {
    let controller = TunnelController::new(config)?;

    match command {
        Commands::Start {
            identifier,
            key,
            flags,
        } => {
            let options = LocalOptions::from(&flags);
            let (tunnel, message) = controller
                .start_registered(identifier.as_deref(), key.as_deref(), &options)
                .await
                .context("Failed to start tunnel")?;
            info!(
                local_identifier = %tunnel.local_identifier(),
                pid = ?tunnel.pid(),
                "{message}"
            );
        }

        Commands::Stop { identifier, key } => {
            match controller
                .stop_registered(identifier.as_deref(), key.as_deref())
                .await
            {
                Ok(message) => info!("{message}"),
                Err(e) if e.is_not_running() => warn!("{e}"),
                Err(e) => return Err(e).context("Failed to stop tunnel"),
            }
        }

        Commands::List { remote } => {
            if remote {
                let key = controller.resolve_key(None)?;
                let lister = HttpInstanceLister::new(key)?;
                let statuses = controller.list_verified(&lister).await?;
                if statuses.is_empty() {
                    info!("No tunnels recorded");
                }
                for status in statuses {
                    let state = if status.active { "running" } else { "not found remotely" };
                    info!(local_identifier = %status.local_identifier, "{state}");
                }
            } else {
                let identifiers = controller.list().await?;
                if identifiers.is_empty() {
                    info!("No tunnels recorded");
                }
                for identifier in identifiers {
                    info!("{identifier}");
                }
            }
        }

        Commands::RunWith {
            identifier,
            key,
            flags,
            command,
        } => {
            let options = LocalOptions::from(&flags);
            controller
                .run_with(
                    identifier.as_deref(),
                    key.as_deref(),
                    &options,
                    &command,
                    hooks,
                )
                .await?;
        }
    }

    Ok(())
}
