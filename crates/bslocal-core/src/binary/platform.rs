//! Platform detection for binary management

use std::env;
use std::path::Path;

use super::BinaryError;

/// Release targets the tunnel binary is published for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformTarget {
    DarwinX64,
    Win32,
    LinuxX64,
    LinuxIa32,
    LinuxArm64,
    Alpine,
}

impl PlatformTarget {
    /// Map an OS name and CPU architecture to a release target.
    ///
    /// `os` and `arch` use the `std::env::consts` vocabulary. `is_musl` is only
    /// consulted on Linux. There is no fallback: anything not listed is an error.
    pub fn resolve(os: &str, arch: &str, is_musl: bool) -> Result<Self, BinaryError> {
        let target = match (os, arch) {
            // Apple Silicon runs the x64 build under Rosetta
            ("macos", "x86_64") | ("macos", "aarch64") => PlatformTarget::DarwinX64,
            ("windows", "x86") | ("windows", "x86_64") => PlatformTarget::Win32,
            ("linux", "x86_64") if is_musl => PlatformTarget::Alpine,
            ("linux", "x86_64") => PlatformTarget::LinuxX64,
            ("linux", "x86") if !is_musl => PlatformTarget::LinuxIa32,
            ("linux", "aarch64") if !is_musl => PlatformTarget::LinuxArm64,
            _ => {
                return Err(BinaryError::UnsupportedPlatform {
                    platform: os.to_string(),
                    architecture: arch.to_string(),
                });
            }
        };
        Ok(target)
    }

    /// Get the release target of the running host
    pub fn current() -> Result<Self, BinaryError> {
        let is_musl = env::consts::OS == "linux" && detect_musl();
        Self::resolve(env::consts::OS, env::consts::ARCH, is_musl)
    }

    /// Archive key used in download URLs (e.g. "linux-x64")
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformTarget::DarwinX64 => "darwin-x64",
            PlatformTarget::Win32 => "win32",
            PlatformTarget::LinuxX64 => "linux-x64",
            PlatformTarget::LinuxIa32 => "linux-ia32",
            PlatformTarget::LinuxArm64 => "linux-arm64",
            PlatformTarget::Alpine => "alpine",
        }
    }

    /// Name of the executable inside the archive and on disk
    pub fn executable_name(&self) -> &'static str {
        match self {
            PlatformTarget::Win32 => "BrowserStackLocal.exe",
            _ => "BrowserStackLocal",
        }
    }

    /// All supported targets
    pub fn all() -> [PlatformTarget; 6] {
        [
            PlatformTarget::DarwinX64,
            PlatformTarget::Win32,
            PlatformTarget::LinuxX64,
            PlatformTarget::LinuxIa32,
            PlatformTarget::LinuxArm64,
            PlatformTarget::Alpine,
        ]
    }
}

impl std::fmt::Display for PlatformTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Probe whether the host links against musl libc
pub fn detect_musl() -> bool {
    if Path::new("/etc/alpine-release").exists() {
        return true;
    }

    // musl's ldd prints its banner on stderr and exits non-zero
    match std::process::Command::new("ldd").arg("--version").output() {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            stdout.to_lowercase().contains("musl") || stderr.to_lowercase().contains("musl")
        }
        Err(_) => false,
    }
}
