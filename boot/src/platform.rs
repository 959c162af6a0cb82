//! Side effects on the host: running commands, scripts, and bringing the
//! machine down.

use crate::error::{Error, Result};
use crate::mounts;
use crate::process::STD_PATH;
use nix::sys::reboot::{reboot, RebootMode};
use nix::sys::stat::{umask, Mode};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Shell used for directive commands.
pub const SHELL: &str = "/bin/sh";

/// `klogctl` action that stops kernel messages on the console.
const SYSLOG_ACTION_CONSOLE_OFF: libc::c_int = 6;

/// Type of shutdown to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ShutdownType {
    /// Power off the system
    PowerOff,
    /// Reboot the system
    Reboot,
    /// Halt the system
    Halt,
}

/// Host operations used during boot and shutdown.
pub trait Platform {
    /// Mount `/proc`, `/dev` and `/sys`.
    fn mount_base(&mut self);

    /// Set up umask, working directory and the environment inherited by
    /// everything init starts.
    fn prepare_environment(&mut self);

    /// Stop kernel messages from cluttering the console.
    fn quiet_console(&mut self);

    /// Add the runtime mounts fstab did not provide.
    fn mount_runtime(&mut self);

    /// Whether `dir` is currently mounted read-write.
    fn mounted_rw(&self, dir: &str) -> bool;

    /// Run a shell command to completion, announcing it as `desc`.
    fn run_interactive(&mut self, cmd: &str, desc: &str) -> Result<()>;

    /// Run every executable in `dir`, in lexical order.
    fn run_parts(&mut self, dir: &Path);

    fn is_executable(&self, path: &Path) -> bool;

    fn set_hostname(&mut self, name: &str) -> Result<()>;

    /// Flush filesystem buffers.
    fn sync(&mut self);

    /// Unmount everything that can go, tmpfs first.
    fn unmount_all(&mut self);

    /// Halt, power off or reboot.  Only returns on failure or when the
    /// platform is not allowed to touch the machine.
    fn power(&mut self, kind: ShutdownType) -> Result<()>;
}

/// The real host.
#[derive(Debug, Clone)]
pub struct SystemPlatform {
    /// Whether reboot, unmount, console and hostname changes are allowed
    pid1: bool,
}

impl SystemPlatform {
    pub fn new(pid1: bool) -> Self {
        Self { pid1 }
    }
}

/// Executable regular files of `dir`, sorted by name.
pub fn list_parts(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "No scripts");
            return Vec::new();
        }
    };

    let mut parts: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| is_executable_file(p))
        .collect();
    parts.sort();
    parts
}

fn is_executable_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

impl Platform for SystemPlatform {
    fn mount_base(&mut self) {
        mounts::mount_base();
    }

    fn prepare_environment(&mut self) {
        // No group or world write on anything we create
        umask(Mode::from_bits_truncate(0o022));

        std::env::set_var("PATH", STD_PATH);
        std::env::set_var("SHELL", SHELL);
        std::env::set_var("USER", "root");
        std::env::set_var("LOGNAME", "root");
        if let Err(e) = std::env::set_current_dir("/") {
            warn!(error = %e, "Cannot change to /");
        }
    }

    fn quiet_console(&mut self) {
        if !self.pid1 {
            return;
        }
        // SAFETY: console-off takes no buffer.
        unsafe {
            libc::klogctl(SYSLOG_ACTION_CONSOLE_OFF, std::ptr::null_mut(), 0);
        }
    }

    fn mount_runtime(&mut self) {
        mounts::mount_runtime();
    }

    fn mounted_rw(&self, dir: &str) -> bool {
        mounts::is_mounted_rw(dir)
    }

    fn run_interactive(&mut self, cmd: &str, desc: &str) -> Result<()> {
        info!("{}", desc);

        let status = Command::new(SHELL)
            .arg("-c")
            .arg(cmd)
            .status()
            .map_err(|e| Error::ProcessSpawnFailed(format!("{}: {}", cmd, e)))?;

        if status.success() {
            debug!(command = cmd, "Command succeeded");
            Ok(())
        } else {
            Err(Error::CommandFailed {
                command: cmd.to_string(),
                code: status.code(),
            })
        }
    }

    fn run_parts(&mut self, dir: &Path) {
        for script in list_parts(dir) {
            let cmd = script.display().to_string();
            if let Err(e) = self.run_interactive(&cmd, &format!("Calling {}", cmd)) {
                warn!(error = %e, "Script failed");
            }
        }
    }

    fn is_executable(&self, path: &Path) -> bool {
        is_executable_file(path)
    }

    fn set_hostname(&mut self, name: &str) -> Result<()> {
        if self.pid1 {
            nix::unistd::sethostname(name)?;
        }
        Ok(())
    }

    fn sync(&mut self) {
        nix::unistd::sync();
    }

    fn unmount_all(&mut self) {
        if !self.pid1 {
            return;
        }
        let tmpfs = mounts::unmount_tmpfs();
        let regular = mounts::unmount_regular();
        info!(tmpfs = tmpfs, regular = regular, "Unmounted filesystems");
    }

    fn power(&mut self, kind: ShutdownType) -> Result<()> {
        if !self.pid1 {
            warn!(shutdown_type = ?kind, "Not PID 1, leaving the machine running");
            return Ok(());
        }

        let mode = match kind {
            ShutdownType::PowerOff => RebootMode::RB_POWER_OFF,
            ShutdownType::Reboot => RebootMode::RB_AUTOBOOT,
            ShutdownType::Halt => RebootMode::RB_HALT_SYSTEM,
        };

        reboot(mode)?;
        Ok(())
    }
}
