//! Init system core - PID 1 duties and signal handling.

use crate::bootstrap::{self, Work};
use crate::config::{InitConfig, KernelCmdline};
use crate::error::{Error, Result};
use crate::hooks::Hook;
use crate::mounts::{self, FstabEntry};
use crate::platform::ShutdownType;
use crate::registry::StepFilter;
use crate::schedule::Scheduler;
use crate::system::System;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Maintenance shell offered in rescue mode.
pub const SULOGIN: &str = "/sbin/sulogin";

/// Tried in order until one exits cleanly.
const SULOGIN_CANDIDATES: [&str; 2] = [SULOGIN, "sulogin"];

pub const REMOUNT_ROOT: &str = "mount -n -o remount,rw /";

/// The main init system.
pub struct Init {
    system: System,
    sched: Scheduler<Work>,
    /// Time zero of the scheduler clock
    epoch: Instant,
}

impl Init {
    /// Create a new init system.
    pub fn new(settings: InitConfig) -> Result<Self> {
        // Check if we're PID 1
        let pid = std::process::id();
        if settings.require_pid1 && pid != 1 {
            return Err(Error::NotPid1(pid));
        }

        Ok(Self::with_system(System::with_defaults(settings)))
    }

    /// Drive an already wired system.
    pub fn with_system(system: System) -> Self {
        Self {
            system,
            sched: Scheduler::new(),
            epoch: Instant::now(),
        }
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    /// Run the init system.  Returns once the machine is going down.
    pub async fn run(&mut self) -> Result<()> {
        info!("Ember init starting");

        let cmdline = KernelCmdline::read();
        self.early_boot(&cmdline);

        self.epoch = Instant::now();
        bootstrap::start(&mut self.sched, &self.system.settings.timings);

        self.event_loop().await
    }

    /// Everything up to the point where the service sequence can start.
    pub fn early_boot(&mut self, cmdline: &KernelCmdline) {
        let mount = self.system.settings.mount_filesystems;
        if mount {
            self.system.platform.mount_base();
        }

        self.system.state.debug = cmdline.debug;
        self.system.state.rescue = cmdline.rescue;
        self.system.platform.prepare_environment();

        if self.system.state.rescue {
            self.rescue_shell();
        }

        self.system.state.progress = true;
        if !cmdline.debug {
            self.system.platform.quiet_console();
        }

        self.system.run_hooks(Hook::Banner);

        if mount {
            self.mount_filesystems();
        }

        self.system.conditions.set_oneshot(Hook::Banner.condition());
        self.system.conditions.set_oneshot(Hook::RootfsUp.condition());

        if let Err(e) = self.system.load_system() {
            warn!(error = %e, "Failed loading configuration");
        }

        if let Some(level) = cmdline.runlevel {
            info!(runlevel = level, "Runlevel from kernel command line");
            self.system.state.cfglevel = level;
        }

        if let Some(host) = self.system.config.host.clone() {
            if let Err(e) = self.system.platform.set_hostname(&host) {
                warn!(hostname = %host, error = %e, "Failed to set hostname");
            }
        }

        self.system.run_hooks(Hook::BasefsUp);
    }

    /// Offer a maintenance shell.  Leaving it cleanly ends rescue mode.
    fn rescue_shell(&mut self) {
        for shell in SULOGIN_CANDIDATES {
            match self
                .system
                .platform
                .run_interactive(shell, "Entering rescue mode")
            {
                Ok(()) => {
                    info!("Leaving rescue mode");
                    self.system.state.rescue = false;
                    return;
                }
                Err(e) => debug!(shell = shell, error = %e, "Maintenance shell failed"),
            }
        }
        warn!("No usable maintenance shell, staying in rescue mode");
    }

    /// Check and mount what `/etc/fstab` lists, then fill in the usual
    /// runtime mounts.
    fn mount_filesystems(&mut self) {
        if !self.system.state.rescue {
            let fstab_path = self.system.settings.fstab.clone();
            match mounts::read_fstab(&fstab_path) {
                Ok(fstab) => {
                    let checked = self.check_filesystems(&fstab);
                    self.remount_root(&fstab, checked);
                }
                Err(e) => warn!(error = %e, "Skipping filesystem checks"),
            }
        }

        self.system.run_hooks(Hook::RootfsUp);

        if let Err(e) = self
            .system
            .platform
            .run_interactive("mount -na", "Mounting filesystems from /etc/fstab")
        {
            warn!(error = %e, "Failed mounting filesystems");
            self.system.run_hooks(Hook::MountError);
        }
        self.system.run_hooks(Hook::MountPost);

        if let Err(e) = self
            .system
            .platform
            .run_interactive("swapon -ea", "Enabling swap")
        {
            debug!(error = %e, "No swap enabled");
        }

        self.system.platform.mount_runtime();
    }

    /// fsck every pass in order.  Stops at the first pass with a failure.
    fn check_filesystems(&mut self, fstab: &[FstabEntry]) -> bool {
        let platform = &self.system.platform;
        let passes = mounts::fsck_passes(fstab, |dir| platform.mounted_rw(dir));

        for pass in passes {
            let mut clean = true;
            for cmd in &pass {
                let desc = format!("Checking filesystem ({})", cmd);
                if let Err(e) = self.system.platform.run_interactive(cmd, &desc) {
                    warn!(error = %e, "Filesystem check failed");
                    clean = false;
                }
            }
            if !clean {
                return false;
            }
        }
        true
    }

    fn remount_root(&mut self, fstab: &[FstabEntry], checked: bool) {
        if !mounts::root_wants_rw(fstab) {
            debug!("Leaving / as is");
            return;
        }
        if !checked {
            warn!("Cannot remount / as read-write, fsck failed before");
            return;
        }
        if let Err(e) = self
            .system
            .platform
            .run_interactive(REMOUNT_ROOT, "Remounting / as read-write")
        {
            warn!(error = %e, "Root filesystem stays read-only");
        }
    }

    /// Main event loop for the init system.
    async fn event_loop(&mut self) -> Result<()> {
        // Set up signal handlers
        let mut sigchld = signal(SignalKind::child())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;
        let mut sigusr2 = signal(SignalKind::user_defined2())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        info!("Init system ready, entering event loop");

        loop {
            let deadline = self.sched.next_deadline();
            let wake = self.epoch + deadline.unwrap_or_default();

            tokio::select! {
                _ = sleep_until(wake), if deadline.is_some() => {
                    let now = self.epoch.elapsed().max(deadline.unwrap_or_default());
                    self.sched.advance(now);
                    bootstrap::run_due(&mut self.system, &mut self.sched);
                }

                // Handle SIGCHLD - reap zombie processes
                _ = sigchld.recv() => {
                    self.handle_sigchld();
                }

                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading configuration");
                    if let Err(e) = self.reload() {
                        warn!(error = %e, "Reload failed");
                    }
                }

                _ = sigusr1.recv() => {
                    info!("Received SIGUSR1, halting");
                    return self.system.shutdown(ShutdownType::Halt);
                }

                _ = sigusr2.recv() => {
                    info!("Received SIGUSR2, powering off");
                    return self.system.shutdown(ShutdownType::PowerOff);
                }

                _ = sigterm.recv() => {
                    info!("Received SIGTERM, rebooting");
                    return self.system.shutdown(ShutdownType::Reboot);
                }

                _ = sigint.recv() => {
                    info!("Received SIGINT, rebooting");
                    return self.system.shutdown(ShutdownType::Reboot);
                }
            }
        }
    }

    /// Handle SIGCHLD signal - reap zombies and let services respawn.
    pub fn handle_sigchld(&mut self) {
        let reaped = self.system.registry.reap();
        debug!(reaped = reaped, "Reaped children");
        if reaped > 0 {
            self.system.step(StepFilter::Any);
        }
    }

    /// Re-read the fragment directory.
    pub fn reload(&mut self) -> Result<()> {
        self.system.reload()
    }

    /// Runlevel change requested from outside.
    pub fn change_runlevel(&mut self, level: u8) -> Result<()> {
        self.system.change_runlevel(level)
    }
}
