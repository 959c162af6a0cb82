//! Process management for the init system.
//!
//! This module handles spawning, signalling and reaping processes.  It is
//! used from the single event loop thread only, so nothing here locks.

use crate::error::{Error, Result};
use crate::service::{ServiceDescriptor, ServiceKind};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::Instant;
use tracing::{debug, error, info};

/// PATH given to every child.
pub const STD_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Information about a spawned process.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    /// Process ID
    pub pid: u32,
    /// Service this process belongs to
    pub service_name: String,
    /// When it was spawned
    pub started_at: Instant,
}

/// Exit status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Process ID
    pub pid: u32,
    /// Exit code (if exited normally)
    pub code: Option<i32>,
    /// Signal (if killed by signal)
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Check if the process exited successfully.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn from_wait(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(pid, code) => Some(Self {
                pid: pid.as_raw() as u32,
                code: Some(code),
                signal: None,
            }),
            WaitStatus::Signaled(pid, sig, _) => Some(Self {
                pid: pid.as_raw() as u32,
                code: None,
                signal: Some(sig as i32),
            }),
            _ => None,
        }
    }
}

/// What the service table needs from a process supervisor.
pub trait Supervise {
    /// Start the program described by `desc`, returning its PID.
    fn spawn(&mut self, desc: &ServiceDescriptor) -> Result<u32>;

    /// Ask a process to terminate.  It is reaped later.
    fn stop(&mut self, pid: u32) -> Result<()>;

    /// Block until `pid` has exited.
    fn wait(&mut self, pid: u32) -> Result<ExitStatus>;

    /// Collect every child that has exited so far.
    fn reap(&mut self) -> Vec<ExitStatus>;
}

/// Process supervisor that manages process lifecycle.
#[derive(Debug, Default)]
pub struct ProcessSupervisor {
    /// Map of PID to process info
    processes: HashMap<u32, ProcessInfo>,
}

impl ProcessSupervisor {
    /// Create a new process supervisor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a signal to a tracked process.
    pub fn signal(&self, pid: u32, sig: Signal) -> Result<()> {
        if !self.processes.contains_key(&pid) {
            return Err(Error::ProcessNotFound(pid));
        }

        signal::kill(Pid::from_raw(pid as i32), sig)?;
        debug!(pid = pid, signal = ?sig, "Sent signal to process");
        Ok(())
    }

    /// Get the service name for a PID.
    pub fn service_name(&self, pid: u32) -> Option<&str> {
        self.processes.get(&pid).map(|p| p.service_name.as_str())
    }

    /// Get all tracked PIDs.
    pub fn pids(&self) -> Vec<u32> {
        self.processes.keys().copied().collect()
    }

    fn forget(&mut self, status: &ExitStatus) {
        if let Some(info) = self.processes.remove(&status.pid) {
            debug!(
                service = %info.service_name,
                pid = status.pid,
                runtime_ms = info.started_at.elapsed().as_millis() as u64,
                "Process exited"
            );
        }
    }
}

impl Supervise for ProcessSupervisor {
    fn spawn(&mut self, desc: &ServiceDescriptor) -> Result<u32> {
        let argv = desc.argv();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::ProcessSpawnFailed(format!("{}: empty command", desc)))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.env("PATH", STD_PATH);
        cmd.current_dir("/");

        // Switch to the owning user, resolved through the password database
        if let Some(ref name) = desc.user {
            match users::get_user_by_name(name) {
                Some(user) => {
                    cmd.uid(user.uid()).gid(user.primary_group_id());
                    cmd.env("USER", name).env("LOGNAME", name);
                }
                None => {
                    return Err(Error::ProcessSpawnFailed(format!(
                        "{}: unknown user {}",
                        desc, name
                    )))
                }
            }
        }

        // Create new session for the process
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                Ok(())
            });
        }

        // A plain TTY command (e.g. the fallback shell) talks to the console
        if desc.kind == ServiceKind::Tty && !desc.is_device_line() {
            cmd.stdin(Stdio::inherit());
        } else {
            cmd.stdin(Stdio::null());
        }

        let child = cmd
            .spawn()
            .map_err(|e| Error::ProcessSpawnFailed(format!("{}: {}", program, e)))?;

        let pid = child.id();
        info!(service = %desc, pid = pid, "Spawned process");

        self.processes.insert(
            pid,
            ProcessInfo {
                pid,
                service_name: desc.to_string(),
                started_at: Instant::now(),
            },
        );

        Ok(pid)
    }

    fn stop(&mut self, pid: u32) -> Result<()> {
        self.signal(pid, Signal::SIGTERM)
    }

    fn wait(&mut self, pid: u32) -> Result<ExitStatus> {
        loop {
            match waitpid(Pid::from_raw(pid as i32), None) {
                Ok(status) => {
                    if let Some(status) = ExitStatus::from_wait(status) {
                        self.forget(&status);
                        return Ok(status);
                    }
                }
                Err(nix::Error::EINTR) => continue,
                Err(nix::Error::ECHILD) => {
                    // Already reaped elsewhere
                    let status = ExitStatus {
                        pid,
                        code: None,
                        signal: None,
                    };
                    self.forget(&status);
                    return Ok(status);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reap any zombie processes (for PID 1 duty).
    fn reap(&mut self) -> Vec<ExitStatus> {
        let mut statuses = Vec::new();

        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(nix::Error::ECHILD) => {
                    // No more zombies to reap
                    break;
                }
                Ok(status) => {
                    if let Some(status) = ExitStatus::from_wait(status) {
                        self.forget(&status);
                        statuses.push(status);
                    }
                }
                Err(nix::Error::EINTR) => continue,
                Err(e) => {
                    error!(error = %e, "Error reaping zombies");
                    break;
                }
            }
        }

        statuses
    }
}
