//! Command-line arguments

use std::path::PathBuf;

use bslocal_core::manager::{LocalOptions, ProxySettings, TestingMode};
use clap::{Args, Parser, Subcommand};

/// Start, stop and list BrowserStackLocal tunnels.
#[derive(Parser, Debug)]
#[command(name = "bslocal", version, about, long_about = None)]
pub struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a tunnel daemon and record it in the registry
    Start {
        /// Local identifier (default: $BROWSERSTACK_LOCAL_IDENTIFIER, else a new UUID)
        identifier: Option<String>,
        /// Access key (default: $BROWSERSTACK_ACCESS_KEY)
        key: Option<String>,
        #[command(flatten)]
        flags: TunnelFlags,
    },

    /// Stop a tunnel daemon and remove it from the registry
    Stop {
        /// Local identifier (default: $BROWSERSTACK_LOCAL_IDENTIFIER,
        /// else the only recorded tunnel)
        identifier: Option<String>,
        /// Access key (default: $BROWSERSTACK_ACCESS_KEY)
        key: Option<String>,
    },

    /// List the identifiers recorded as running
    List {
        /// Cross-check each identifier against the service
        #[arg(long)]
        remote: bool,
    },

    /// Start a tunnel, run a command with BROWSERSTACK_LOCAL_IDENTIFIER set, then stop it
    RunWith {
        #[arg(long)]
        identifier: Option<String>,
        #[arg(long)]
        key: Option<String>,
        #[command(flatten)]
        flags: TunnelFlags,
        /// Command to run, after `--`
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

/// Flags passed through to the tunnel binary
#[derive(Args, Debug, Default, Clone, PartialEq)]
pub struct TunnelFlags {
    /// Serve a local folder instead of tunnelling to hosts
    #[arg(long, short = 'f')]
    pub folder: Option<PathBuf>,

    /// Log level of the tunnel binary (1-3)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=3))]
    pub binary_verbose: Option<u8>,

    /// Kill other tunnels running with the same key
    #[arg(long)]
    pub force: bool,

    #[arg(long)]
    pub only_automate: bool,

    #[arg(long)]
    pub force_local: bool,

    #[arg(long)]
    pub force_proxy: bool,

    #[arg(long)]
    pub proxy_host: Option<String>,
    #[arg(long, requires = "proxy_host")]
    pub proxy_port: Option<u16>,
    #[arg(long, requires = "proxy_host")]
    pub proxy_user: Option<String>,
    #[arg(long, requires = "proxy_user")]
    pub proxy_pass: Option<String>,

    #[arg(long)]
    pub local_proxy_host: Option<String>,
    #[arg(long, requires = "local_proxy_host")]
    pub local_proxy_port: Option<u16>,
    #[arg(long, requires = "local_proxy_host")]
    pub local_proxy_user: Option<String>,
    #[arg(long, requires = "local_proxy_user")]
    pub local_proxy_pass: Option<String>,

    #[arg(long)]
    pub pac_file: Option<PathBuf>,

    /// Comma-separated hosts to route through the tunnel
    #[arg(long, value_delimiter = ',')]
    pub include_hosts: Vec<String>,

    /// Comma-separated hosts to keep off the tunnel
    #[arg(long, value_delimiter = ',')]
    pub exclude_hosts: Vec<String>,

    #[arg(long)]
    pub parallel_runs: Option<u32>,

    /// Seconds
    #[arg(long)]
    pub connect_timeout: Option<u32>,

    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Extra argument for the binary, repeatable
    #[arg(long = "binary-arg", allow_hyphen_values = true)]
    pub binary_args: Vec<String>,
}

impl From<&TunnelFlags> for LocalOptions {
    fn from(flags: &TunnelFlags) -> Self {
        LocalOptions {
            testing_mode: flags
                .folder
                .clone()
                .map(TestingMode::Folder)
                .unwrap_or_default(),
            verbose: flags.binary_verbose,
            force: flags.force,
            only_automate: flags.only_automate,
            force_local: flags.force_local,
            force_proxy: flags.force_proxy,
            proxy: proxy(
                &flags.proxy_host,
                flags.proxy_port,
                &flags.proxy_user,
                &flags.proxy_pass,
            ),
            local_proxy: proxy(
                &flags.local_proxy_host,
                flags.local_proxy_port,
                &flags.local_proxy_user,
                &flags.local_proxy_pass,
            ),
            pac_file: flags.pac_file.clone(),
            include_hosts: flags.include_hosts.clone(),
            exclude_hosts: flags.exclude_hosts.clone(),
            parallel_runs: flags.parallel_runs,
            connect_timeout: flags.connect_timeout,
            log_file: flags.log_file.clone(),
            extra_args: flags.binary_args.clone(),
        }
    }
}

fn proxy(
    host: &Option<String>,
    port: Option<u16>,
    user: &Option<String>,
    pass: &Option<String>,
) -> Option<ProxySettings> {
    let host = host.as_ref()?;
    Some(ProxySettings {
        host: host.clone(),
        port,
        user: user.clone(),
        pass: pass.clone(),
    })
}
