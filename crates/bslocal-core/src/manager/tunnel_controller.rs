//! Tunnel controller
//!
//! Owns the configuration, the binary store and the instance registry, and
//! resolves identifiers and keys with the precedence explicit argument, then
//! environment, then generated default.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex};
use tracing::{error, info, warn};

use super::args::build_args;
use super::config::IDENTIFIER_ENV;
use super::{ForegroundTunnel, LocalConfig, LocalOptions, LocalTunnel, TunnelError};
use crate::binary::BinaryManager;
use crate::process::{launch, ShutdownHooks, StreamOptions};
use crate::registry::InstanceRegistry;
use crate::remote::{HttpArchiveSource, InstanceLister};

/// Registry entry cross-checked against the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    pub local_identifier: String,
    /// Whether the service reports an instance with this identifier
    pub active: bool,
}

/// Entry point for tunnel operations
pub struct TunnelController {
    config: LocalConfig,
    binaries: BinaryManager,
    registry: InstanceRegistry,
}

impl TunnelController {
    /// Create a controller for the host platform, downloading from the public endpoint
    pub fn new(config: LocalConfig) -> Result<Self> {
        config.validate()?;

        let source = Arc::new(HttpArchiveSource::new()?);
        let binaries = BinaryManager::for_current_platform(source)
            .context("Failed to select a BrowserStackLocal build")?;
        let registry = InstanceRegistry::new(config.registry_file());

        Ok(Self {
            config,
            binaries,
            registry,
        })
    }

    /// Create a controller from explicit parts
    pub fn with_parts(
        config: LocalConfig,
        binaries: BinaryManager,
        registry: InstanceRegistry,
    ) -> Result<Self, TunnelError> {
        config.validate()?;
        Ok(Self {
            config,
            binaries,
            registry,
        })
    }

    pub fn config(&self) -> &LocalConfig {
        &self.config
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// Explicit identifier, else the configured one, else a fresh UUID
    pub fn resolve_identifier(&self, explicit: Option<&str>) -> Result<String, TunnelError> {
        let identifier = explicit
            .map(str::to_string)
            .or_else(|| self.config.local_identifier.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        super::validate_identifier(&identifier)?;
        Ok(identifier)
    }

    /// Explicit key, else the configured one
    pub fn resolve_key(&self, explicit: Option<&str>) -> Result<String, TunnelError> {
        explicit
            .filter(|k| !k.trim().is_empty())
            .map(str::to_string)
            .or_else(|| self.config.access_key.clone())
            .ok_or(TunnelError::MissingKey)
    }

    /// Path to a usable binary, downloading it when missing or stale
    pub async fn ensure_binary(&self) -> Result<PathBuf, TunnelError> {
        let result = self.binaries.ensure_binary(&self.config.binary_dir).await?;
        Ok(result.into_path())
    }

    /// Check for a newer binary using the stored cache token
    pub async fn refresh_binary(&self) -> Result<PathBuf, TunnelError> {
        let result = self.binaries.refresh(&self.config.binary_dir).await?;
        Ok(result.into_path())
    }

    /// Version reported by the installed binary
    pub async fn get_version(&self) -> Result<String, TunnelError> {
        let path = self.ensure_binary().await?;
        Ok(self.binaries.binary_version(&path).await?)
    }

    /// A stopped tunnel for the resolved identifier and key, with the binary in place
    pub async fn tunnel(
        &self,
        identifier: Option<&str>,
        key: Option<&str>,
    ) -> Result<LocalTunnel, TunnelError> {
        let identifier = self.resolve_identifier(identifier)?;
        let key = self.resolve_key(key)?;
        let binary_path = self.ensure_binary().await?;
        LocalTunnel::new(binary_path, key, identifier, self.config.daemon_timeout)
    }

    /// Launch the binary in the foreground and return without waiting for readiness
    pub async fn run_foreground(
        &self,
        identifier: Option<&str>,
        key: Option<&str>,
        options: &LocalOptions,
        stream_options: StreamOptions,
    ) -> Result<ForegroundTunnel, TunnelError> {
        let identifier = self.resolve_identifier(identifier)?;
        let key = self.resolve_key(key)?;
        let binary_path = self.ensure_binary().await?;

        let args = build_args(&key, None, &identifier, options);
        let handle = launch(&binary_path, &args, stream_options)?;
        Ok(ForegroundTunnel::new(identifier, handle))
    }

    /// Start a daemon and record its identifier in the registry
    pub async fn start_registered(
        &self,
        identifier: Option<&str>,
        key: Option<&str>,
        options: &LocalOptions,
    ) -> Result<(LocalTunnel, String), TunnelError> {
        // An unusable registry must fail before anything is started
        self.registry.read().await?;

        let mut tunnel = self.tunnel(identifier, key).await?;
        let message = tunnel.start(options).await?;

        if let Err(e) = self.registry.add(tunnel.local_identifier()).await {
            warn!(
                local_identifier = %tunnel.local_identifier(),
                error = %e,
                "Failed to record tunnel, stopping it"
            );
            if let Err(stop_err) = tunnel.stop().await {
                error!(
                    local_identifier = %tunnel.local_identifier(),
                    error = %stop_err,
                    "Failed to stop unrecorded tunnel"
                );
            }
            return Err(e.into());
        }
        Ok((tunnel, message))
    }

    /// Stop a daemon and drop its identifier from the registry.
    ///
    /// The identifier is also dropped on [`TunnelError::NotRunning`], which is
    /// still returned so callers can report it.
    pub async fn stop_registered(
        &self,
        identifier: Option<&str>,
        key: Option<&str>,
    ) -> Result<String, TunnelError> {
        let identifier = self.resolve_stop_identifier(identifier).await?;
        let mut tunnel = self.tunnel(Some(&identifier), key).await?;
        let result = tunnel.stop().await;
        if result.is_ok() || result.as_ref().is_err_and(TunnelError::is_not_running) {
            self.registry.remove(tunnel.local_identifier()).await?;
        }
        result
    }

    /// Explicit identifier, else the configured one, else the only recorded one.
    ///
    /// A stop never targets a generated identifier.
    async fn resolve_stop_identifier(&self, explicit: Option<&str>) -> Result<String, TunnelError> {
        if explicit.is_some() || self.config.local_identifier.is_some() {
            return self.resolve_identifier(explicit);
        }

        let mut recorded = self.registry.list().await?;
        let reason = match recorded.len() {
            1 => return Ok(recorded.remove(0)),
            0 => "none given and no tunnel is recorded".to_string(),
            n => format!("none given and {n} tunnels are recorded"),
        };
        Err(TunnelError::InvalidIdentifier {
            identifier: String::new(),
            reason,
        })
    }

    /// Identifiers recorded as running
    pub async fn list(&self) -> Result<Vec<String>, TunnelError> {
        Ok(self.registry.list().await?)
    }

    /// Registry entries with the service's view of each
    pub async fn list_verified(
        &self,
        lister: &dyn InstanceLister,
    ) -> Result<Vec<InstanceStatus>> {
        let recorded = self.list().await?;
        let active = lister
            .list_active_instances()
            .await
            .context("Failed to query active instances")?;

        Ok(recorded
            .into_iter()
            .map(|local_identifier| {
                let active = active
                    .iter()
                    .any(|i| i.local_identifier.as_deref() == Some(local_identifier.as_str()));
                InstanceStatus {
                    local_identifier,
                    active,
                }
            })
            .collect())
    }

    /// Start a tunnel, run `command` with the identifier in its environment,
    /// then stop the tunnel.
    ///
    /// The stop is registered in `hooks`, so it runs exactly once whether the
    /// command succeeds, fails, or the process is interrupted by a signal
    /// handled by those hooks. A non-zero exit of the command is an error,
    /// and so is a failed stop after a successful command.
    pub async fn run_with(
        &self,
        identifier: Option<&str>,
        key: Option<&str>,
        options: &LocalOptions,
        command: &[String],
        hooks: &ShutdownHooks,
    ) -> Result<(), TunnelError> {
        let (program, program_args) = command.split_first().ok_or(TunnelError::EmptyCommand)?;

        let (tunnel, message) = self.start_registered(identifier, key, options).await?;
        let local_identifier = tunnel.local_identifier().to_string();
        info!(local_identifier = %local_identifier, message = %message, "Tunnel ready for command");

        let tunnel = Arc::new(Mutex::new(tunnel));
        let registry = self.registry.clone();
        let (stopped_tx, stopped_rx) = oneshot::channel();
        hooks
            .register(format!("stop tunnel {local_identifier}"), move || async move {
                let _ = stopped_tx.send(stop_and_unregister(tunnel, registry).await);
            })
            .await;

        let command_line = command.join(" ");
        info!(command = %command_line, local_identifier = %local_identifier, "Running command");
        let status = Command::new(program)
            .args(program_args)
            .env(IDENTIFIER_ENV, &local_identifier)
            .status()
            .await;

        hooks.run().await;
        // A dropped sender means the hook never ran, which only happens on exit
        let stopped = stopped_rx.await.unwrap_or(Ok(()));

        let status = status.map_err(|source| TunnelError::CommandSpawn {
            command: command_line.clone(),
            source,
        })?;
        if !status.success() {
            return Err(TunnelError::CommandExited {
                command: command_line,
                code: status.code(),
            });
        }
        stopped
    }
}

async fn stop_and_unregister(
    tunnel: Arc<Mutex<LocalTunnel>>,
    registry: InstanceRegistry,
) -> Result<(), TunnelError> {
    let mut tunnel = tunnel.lock().await;
    let local_identifier = tunnel.local_identifier().to_string();

    match tunnel.stop().await {
        Ok(message) => {
            info!(
                local_identifier = %local_identifier,
                message = %message,
                "Stopped tunnel"
            )
        }
        Err(TunnelError::NotRunning { message }) => {
            warn!(
                local_identifier = %local_identifier,
                message = %message,
                "Tunnel already stopped"
            )
        }
        Err(e) => {
            error!(local_identifier = %local_identifier, error = %e, "Failed to stop tunnel");
            return Err(e);
        }
    }

    if let Err(e) = registry.remove(&local_identifier).await {
        warn!(local_identifier = %local_identifier, error = %e, "Failed to update registry");
        return Err(e.into());
    }
    Ok(())
}
