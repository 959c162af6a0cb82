//! Service descriptors produced from configuration.
//!
//! A descriptor is what the configuration parser hands to the service
//! registry.  The registry owns it from then on.

use crate::error::{Error, Result};
use crate::runlevel::RunlevelMask;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Runlevels a TTY is active in unless the `tty` line says otherwise.
pub const DEFAULT_TTY_RUNLEVELS: &str = "[12345]";

/// Program used to bring up a login prompt on a device line.
pub const GETTY: &str = "/sbin/getty";

const DEFAULT_BAUD: &str = "38400";
const DEFAULT_TERM: &str = "linux";

/// How a service is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Supervised daemon, respawned on exit
    Service,
    /// One-shot, not respawned
    Task,
    /// One-shot that holds up bootstrap until it has finished
    Run,
    /// Connection-triggered service
    Inetd,
    /// Login line, only started once bootstrap has finished
    Tty,
}

impl ServiceKind {
    /// `task` and `run` execute once per runlevel.
    pub fn is_oneshot(&self) -> bool {
        matches!(self, ServiceKind::Task | ServiceKind::Run)
    }

    /// Services held back until bootstrap has completed.
    pub fn is_respawn_class(&self) -> bool {
        matches!(self, ServiceKind::Tty)
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::Service => write!(f, "service"),
            ServiceKind::Task => write!(f, "task"),
            ServiceKind::Run => write!(f, "run"),
            ServiceKind::Inetd => write!(f, "inetd"),
            ServiceKind::Tty => write!(f, "tty"),
        }
    }
}

/// A service declaration from a `service`, `task`, `run`, `inetd`,
/// `startx` or `tty` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Kind of service
    pub kind: ServiceKind,
    /// Name, the basename of the program unless the line says otherwise
    pub name: String,
    /// Optional instance id, from `:id`
    pub id: Option<String>,
    /// Program to execute
    pub command: String,
    /// Program arguments
    pub args: Vec<String>,
    /// Free text after `--`
    pub description: Option<String>,
    /// Owning user, from `@user` or the configured default for `startx`
    pub user: Option<String>,
    /// Runlevels the service is active in
    pub runlevels: RunlevelMask,
    /// Modification time of the declaring file, 0 for the root file
    pub mtime: i64,
}

impl ServiceDescriptor {
    /// Build a descriptor from a declaration command line.
    ///
    /// The command line grammar is `@user :id /path/to/prog args -- text`
    /// with every part but the program optional.  The runlevel mask has
    /// already been split off by the directive dispatcher.
    pub fn parse(
        kind: ServiceKind,
        cmdline: &str,
        runlevels: RunlevelMask,
        mtime: i64,
    ) -> Result<Self> {
        let (exec, description) = match cmdline.split_once(" -- ") {
            Some((exec, desc)) => (exec, Some(desc.trim().to_string())),
            None => (cmdline.strip_suffix(" --").unwrap_or(cmdline), None),
        };

        let mut user = None;
        let mut id = None;
        let mut tokens = exec.split_whitespace().peekable();
        while let Some(token) = tokens.peek() {
            if let Some(name) = token.strip_prefix('@') {
                user = Some(name.to_string());
            } else if let Some(tag) = token.strip_prefix(':') {
                id = Some(tag.to_string());
            } else {
                break;
            }
            tokens.next();
        }

        let command = tokens
            .next()
            .ok_or_else(|| Error::ConfigError(format!("{} without a command: {:?}", kind, cmdline)))?
            .to_string();
        let args = tokens.map(str::to_string).collect();

        Ok(Self {
            kind,
            name: program_name(&command),
            id,
            command,
            args,
            description: description.filter(|d| !d.is_empty()),
            user,
            runlevels,
            mtime,
        })
    }

    /// Build a login line descriptor from a `tty` spec.
    ///
    /// `[mask] /dev/ttyS0 115200 vt100` runs a getty on the device, any
    /// other command (e.g. the `/bin/sh` fallback) is run as is.
    pub fn tty(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let (runlevels, rest) = match spec.strip_prefix('[') {
            Some(_) => {
                let end = spec.find(']').map(|i| i + 1).unwrap_or(spec.len());
                (RunlevelMask::parse(Some(&spec[..end])), &spec[end..])
            }
            None => (RunlevelMask::parse(Some(DEFAULT_TTY_RUNLEVELS)), spec),
        };

        let mut desc = Self::parse(ServiceKind::Tty, rest.trim(), runlevels, 0)?;
        if desc.is_device_line() {
            desc.description = Some(format!("Getty on {}", desc.command));
        }
        Ok(desc)
    }

    /// Whether this is a TTY bound to a device node.
    pub fn is_device_line(&self) -> bool {
        self.kind == ServiceKind::Tty && self.command.starts_with("/dev/")
    }

    /// Argument vector to execute, program first.
    pub fn argv(&self) -> Vec<String> {
        if self.is_device_line() {
            let port = self.command.trim_start_matches("/dev/").to_string();
            let baud = self
                .args
                .iter()
                .find(|a| a.chars().all(|c| c.is_ascii_digit() || c == ','))
                .cloned()
                .unwrap_or_else(|| DEFAULT_BAUD.to_string());
            let term = self
                .args
                .iter()
                .find(|a| !a.chars().all(|c| c.is_ascii_digit() || c == ','))
                .cloned()
                .unwrap_or_else(|| DEFAULT_TERM.to_string());
            return vec![GETTY.to_string(), "-L".to_string(), port, baud, term];
        }

        std::iter::once(self.command.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Whether `name`/`id` identify this descriptor.
    pub fn matches(&self, name: &str, id: Option<&str>) -> bool {
        self.name == name && self.id.as_deref() == id
    }

    /// Active in `level`.
    pub fn in_runlevel(&self, level: u8) -> bool {
        self.runlevels.contains(level)
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(ref id) = self.id {
            write!(f, ":{}", id)?;
        }
        Ok(())
    }
}

fn program_name(command: &str) -> String {
    Path::new(command)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(command)
        .to_string()
}
