//! Acquisition and supervision of the BrowserStackLocal tunnel binary
//!
//! The tunnel binary is an opaque executable. This crate downloads the right
//! build for the host, runs it either as a daemon command or as a long-lived
//! foreground process, and keeps a small on-disk registry of the named
//! instances started from independent invocations.
//!
//! # Architecture
//!
//! - [`binary`]: platform detection, archive download and the metadata sidecar
//! - [`process`]: daemon command protocol, streaming protocol, shutdown hooks
//! - [`registry`]: atomically replaced JSON registry of local identifiers
//! - [`manager`]: configuration, argument construction and the tunnel controller
//! - [`remote`]: capabilities backed by the cloud service (archives, live instances)
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use bslocal_core::manager::{LocalConfig, LocalOptions, TunnelController};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = LocalConfig::from_env();
//!     let controller = TunnelController::new(config)?;
//!
//!     let mut tunnel = controller.tunnel(Some("ci-run-42"), None).await?;
//!     let message = tunnel.start(&LocalOptions::default()).await?;
//!     println!("{message}");
//!
//!     tunnel.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod binary;
pub mod manager;
pub mod process;
pub mod registry;
pub mod remote;

// re-export main types for convenience
pub use binary::{BinaryError, BinaryManager, BinaryMetadata, PlatformTarget};
pub use manager::{
    ForegroundTunnel, LocalConfig, LocalOptions, LocalTunnel, TunnelController, TunnelError,
    TunnelState,
};
pub use process::{
    DaemonCommand, DaemonResponse, ProcessError, ShutdownHooks, StreamOptions, StreamOutput,
    StreamingHandle, TunnelEvent,
};
pub use registry::{InstanceRegistry, RegistryError, RegistryRecord};
pub use remote::{ActiveInstance, ArchiveFetch, ArchiveSource, InstanceLister};
