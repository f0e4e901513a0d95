//! Command-line construction for the tunnel binary
//!
//! Flags are emitted in a fixed order so the same options always produce the
//! same argument vector.

use std::path::PathBuf;

/// Flag carrying the access key; never retained on a tunnel instance
pub const KEY_FLAG: &str = "--key";

/// Pins the binary to the version recorded by the binary store
pub const SKIP_VERSION_CHECK_FLAG: &str = "--skip-version-check";

/// What the tunnel exposes to remote browsers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TestingMode {
    /// Route traffic to local and private hosts
    #[default]
    Tunnel,
    /// Serve a static folder (`-f <folder>`)
    Folder(PathBuf),
}

/// Proxy endpoint and optional credentials
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySettings {
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub pass: Option<String>,
}

impl ProxySettings {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.pass = Some(pass.into());
        self
    }

    /// `--<prefix>-host`, `--<prefix>-port`, `--<prefix>-user`, `--<prefix>-pass`
    fn push_args(&self, prefix: &str, args: &mut Vec<String>) {
        push_pair(args, &format!("--{prefix}-host"), &self.host);
        if let Some(port) = self.port {
            push_pair(args, &format!("--{prefix}-port"), &port.to_string());
        }
        if let Some(user) = &self.user {
            push_pair(args, &format!("--{prefix}-user"), user);
        }
        if let Some(pass) = &self.pass {
            push_pair(args, &format!("--{prefix}-pass"), pass);
        }
    }
}

/// Structured flag set for the tunnel binary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalOptions {
    pub testing_mode: TestingMode,
    /// Binary log level, 1 to 3
    pub verbose: Option<u8>,
    /// Kill other running instances with the same key
    pub force: bool,
    pub only_automate: bool,
    /// Route all traffic through the local machine
    pub force_local: bool,
    pub force_proxy: bool,
    pub proxy: Option<ProxySettings>,
    pub local_proxy: Option<ProxySettings>,
    pub pac_file: Option<PathBuf>,
    pub include_hosts: Vec<String>,
    pub exclude_hosts: Vec<String>,
    pub parallel_runs: Option<u32>,
    /// Seconds
    pub connect_timeout: Option<u32>,
    pub log_file: Option<PathBuf>,
    /// Passed through verbatim, before `--skip-version-check`
    pub extra_args: Vec<String>,
}

impl LocalOptions {
    /// Option flags in their fixed order
    pub fn flag_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let TestingMode::Folder(folder) = &self.testing_mode {
            push_pair(&mut args, "-f", &folder.display().to_string());
        }
        if let Some(level) = self.verbose {
            push_pair(&mut args, "--verbose", &level.to_string());
        }
        if self.force {
            args.push("--force".to_string());
        }
        if self.only_automate {
            args.push("--only-automate".to_string());
        }
        if self.force_local {
            args.push("--force-local".to_string());
        }
        if self.force_proxy {
            args.push("--force-proxy".to_string());
        }
        if let Some(proxy) = &self.proxy {
            proxy.push_args("proxy", &mut args);
        }
        if let Some(proxy) = &self.local_proxy {
            proxy.push_args("local-proxy", &mut args);
        }
        if let Some(pac_file) = &self.pac_file {
            push_pair(&mut args, "--pac-file", &pac_file.display().to_string());
        }
        if !self.include_hosts.is_empty() {
            push_pair(&mut args, "--include-hosts", &self.include_hosts.join(","));
        }
        if !self.exclude_hosts.is_empty() {
            push_pair(&mut args, "--exclude-hosts", &self.exclude_hosts.join(","));
        }
        if let Some(runs) = self.parallel_runs {
            push_pair(&mut args, "--parallel-runs", &runs.to_string());
        }
        if let Some(secs) = self.connect_timeout {
            push_pair(&mut args, "--connect-timeout", &secs.to_string());
        }
        if let Some(log_file) = &self.log_file {
            push_pair(&mut args, "--log-file", &log_file.display().to_string());
        }
        args.extend(self.extra_args.iter().cloned());

        args
    }
}

/// Full argument vector for one launch.
///
/// `daemon` is the daemon operation name, or `None` for a foreground run.
pub fn build_args(
    key: &str,
    daemon: Option<&str>,
    local_identifier: &str,
    options: &LocalOptions,
) -> Vec<String> {
    let mut args = Vec::new();
    push_pair(&mut args, KEY_FLAG, key);
    if let Some(operation) = daemon {
        push_pair(&mut args, "--daemon", operation);
    }
    push_pair(&mut args, "--local-identifier", local_identifier);
    args.extend(options.flag_args());
    args.push(SKIP_VERSION_CHECK_FLAG.to_string());
    args
}

/// Arguments for `--daemon stop`; option flags do not apply
pub fn build_stop_args(key: &str, local_identifier: &str) -> Vec<String> {
    let mut args = Vec::new();
    push_pair(&mut args, KEY_FLAG, key);
    push_pair(&mut args, "--daemon", "stop");
    push_pair(&mut args, "--local-identifier", local_identifier);
    args
}

/// `args` without the key flag and its value
pub fn strip_key(args: &[String]) -> Vec<String> {
    let mut stripped = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == KEY_FLAG {
            iter.next();
        } else {
            stripped.push(arg.clone());
        }
    }
    stripped
}

fn push_pair(args: &mut Vec<String>, flag: &str, value: &str) {
    args.push(flag.to_string());
    args.push(value.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_minimal_start_args() {
        let args = build_args("K", Some("start"), "ci-1", &LocalOptions::default());
        assert_eq!(
            args,
            strings(&[
                "--key",
                "K",
                "--daemon",
                "start",
                "--local-identifier",
                "ci-1",
                "--skip-version-check",
            ])
        );
        assert_eq!(strip_key(&args).len(), 5);
    }

    #[test]
    fn test_foreground_args_have_no_daemon_flag() {
        let args = build_args("K", None, "fg", &LocalOptions::default());
        assert!(!args.iter().any(|a| a == "--daemon"));
        assert_eq!(args.last().map(String::as_str), Some("--skip-version-check"));
    }

    #[test]
    fn test_flag_order_is_fixed() {
        let options = LocalOptions {
            testing_mode: TestingMode::Folder(PathBuf::from("/srv/site")),
            verbose: Some(2),
            force: true,
            only_automate: true,
            force_local: true,
            force_proxy: true,
            proxy: Some(ProxySettings::new("proxy.corp").with_port(3128)),
            local_proxy: Some(
                ProxySettings::new("127.0.0.1")
                    .with_port(8080)
                    .with_credentials("u", "p"),
            ),
            pac_file: Some(PathBuf::from("/etc/proxy.pac")),
            include_hosts: strings(&["a.test", "b.test"]),
            exclude_hosts: strings(&["c.test"]),
            parallel_runs: Some(4),
            connect_timeout: Some(30),
            log_file: Some(PathBuf::from("/tmp/bs.log")),
            extra_args: strings(&["--custom", "x"]),
        };

        assert_eq!(
            options.flag_args(),
            strings(&[
                "-f",
                "/srv/site",
                "--verbose",
                "2",
                "--force",
                "--only-automate",
                "--force-local",
                "--force-proxy",
                "--proxy-host",
                "proxy.corp",
                "--proxy-port",
                "3128",
                "--local-proxy-host",
                "127.0.0.1",
                "--local-proxy-port",
                "8080",
                "--local-proxy-user",
                "u",
                "--local-proxy-pass",
                "p",
                "--pac-file",
                "/etc/proxy.pac",
                "--include-hosts",
                "a.test,b.test",
                "--exclude-hosts",
                "c.test",
                "--parallel-runs",
                "4",
                "--connect-timeout",
                "30",
                "--log-file",
                "/tmp/bs.log",
                "--custom",
                "x",
            ])
        );
        assert_eq!(options.flag_args(), options.clone().flag_args());
    }

    #[test]
    fn test_stop_args() {
        assert_eq!(
            build_stop_args("K", "ci-1"),
            strings(&["--key", "K", "--daemon", "stop", "--local-identifier", "ci-1"])
        );
    }

    #[test]
    fn test_strip_key_removes_only_key_pair() {
        let args = strings(&["--key", "K", "--force", "--key"]);
        assert_eq!(strip_key(&args), strings(&["--force"]));
    }
}
