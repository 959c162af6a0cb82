//! Init configuration.
//!
//! Three layers feed the init:
//!
//! - [`InitConfig`]: where things live and how the bootstrap is paced.
//!   Built-in defaults, optionally overridden from a TOML file and then
//!   from the command line.
//! - [`SystemConfig`]: the values set by static directives in the root
//!   configuration file (hostname, console, ...).
//! - [`KernelCmdline`]: flags given on the kernel command line.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Canonical root configuration file.
pub const DEFAULT_CONFIG: &str = "/etc/finit.conf";

/// Directory of hot-reloadable service fragments.
pub const DEFAULT_FRAGMENT_DIR: &str = "/etc/finit.d";

/// Legacy compatibility script run at the end of bootstrap.
pub const DEFAULT_RC_LOCAL: &str = "/etc/rc.local";

pub const DEFAULT_USER: &str = "root";
pub const DEFAULT_HOST: &str = "noname";

/// Login shell used as TTY when neither a `tty` nor a `console` is given.
pub const FALLBACK_SHELL: &str = "/bin/sh";

/// Pacing of the bootstrap sequence.
///
/// Delays are kept in milliseconds so they read naturally in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapTimings {
    /// Delay before the first convergence step
    pub crank_delay_ms: u64,
    /// Interval between completion polls, also the initial poll delay
    pub poll_delay_ms: u64,
    /// Polls before giving up on bootstrap work
    pub poll_attempts: u32,
    /// Delay between leaving the poll and finalizing
    pub finalize_delay_ms: u64,
}

impl BootstrapTimings {
    pub fn crank_delay(&self) -> Duration {
        Duration::from_millis(self.crank_delay_ms)
    }

    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }

    pub fn finalize_delay(&self) -> Duration {
        Duration::from_millis(self.finalize_delay_ms)
    }

    /// Upper bound on the time spent waiting for bootstrap work.
    pub fn poll_budget(&self) -> Duration {
        self.poll_delay()
            .checked_mul(self.poll_attempts)
            .unwrap_or(Duration::MAX)
    }
}

impl Default for BootstrapTimings {
    fn default() -> Self {
        Self {
            crank_delay_ms: 10,
            poll_delay_ms: 100,
            poll_attempts: 120,
            finalize_delay_ms: 10,
        }
    }
}

/// Init system configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitConfig {
    /// Root configuration file
    pub config_file: PathBuf,
    /// Directory of service fragments
    pub fragment_dir: PathBuf,
    /// Compatibility script run when bootstrap finishes
    pub rc_local: PathBuf,
    /// Filesystem table consulted for fsck and the root remount
    pub fstab: PathBuf,
    /// Whether to mount virtual filesystems
    pub mount_filesystems: bool,
    /// Whether to enforce PID 1 requirement
    pub require_pid1: bool,
    /// Bootstrap pacing
    pub timings: BootstrapTimings,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from(DEFAULT_CONFIG),
            fragment_dir: PathBuf::from(DEFAULT_FRAGMENT_DIR),
            rc_local: PathBuf::from(DEFAULT_RC_LOCAL),
            fstab: PathBuf::from(crate::mounts::FSTAB),
            mount_filesystems: true,
            require_pid1: true,
            timings: BootstrapTimings::default(),
        }
    }
}

impl InitConfig {
    /// Load from a TOML file.  Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::unreadable(path, e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Whether `path` is the canonical root configuration file.
    pub fn is_root_file(&self, path: &Path) -> bool {
        path == self.config_file
    }
}

/// Values set by static directives.
///
/// Every slot is last-write-wins: a second `host` line replaces the first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemConfig {
    /// Owner of `startx` services
    pub user: Option<String>,
    pub host: Option<String>,
    /// Network setup script
    pub network: Option<String>,
    /// Post-bootstrap scripts, also searched by `include`
    pub runparts: Option<PathBuf>,
    pub console: Option<String>,
    /// Script run on the way down
    pub shutdown: Option<String>,
    /// Number of `tty` lines seen
    pub ttys: usize,
}

impl SystemConfig {
    /// Configuration before any file is read.
    pub fn with_defaults() -> Self {
        Self {
            user: Some(DEFAULT_USER.to_string()),
            host: Some(DEFAULT_HOST.to_string()),
            ..Self::default()
        }
    }

    /// Directory `include` falls back to for relative paths.
    pub fn include_dir<'a>(&'a self, fragment_dir: &'a Path) -> &'a Path {
        self.runparts.as_deref().unwrap_or(fragment_dir)
    }

    /// Command for the TTY registered when the configuration declared none.
    pub fn fallback_tty(&self) -> String {
        self.console
            .clone()
            .unwrap_or_else(|| FALLBACK_SHELL.to_string())
    }
}

/// Flags from `/proc/cmdline`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelCmdline {
    /// `debug`: verbose logging, kernel messages left on
    pub debug: bool,
    /// `rescue` or `recover`: skip scripts, offer a maintenance shell
    pub rescue: bool,
    /// `single`, `S` or a digit other than 0 and 6: runlevel to use instead
    /// of the configured one
    pub runlevel: Option<u8>,
}

impl KernelCmdline {
    pub const PATH: &'static str = "/proc/cmdline";

    pub fn parse(cmdline: &str) -> Self {
        let mut flags = Self::default();
        for arg in cmdline.split_whitespace() {
            match arg {
                "debug" => flags.debug = true,
                "rescue" | "recover" => flags.rescue = true,
                "single" | "S" => flags.runlevel = Some(1),
                _ => match arg.parse::<u8>() {
                    Ok(level) if (1..=9).contains(&level) && level != 6 => {
                        flags.runlevel = Some(level)
                    }
                    _ => {}
                },
            }
        }
        flags
    }

    /// Read the running kernel's command line.  Unreadable means no flags.
    pub fn read() -> Self {
        std::fs::read_to_string(Self::PATH)
            .map(|s| Self::parse(&s))
            .unwrap_or_default()
    }
}
