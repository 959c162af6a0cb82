//! The init context.
//!
//! [`System`] owns everything the boot sequence touches: runlevel state,
//! the values set by the configuration, and the collaborators.  It is
//! only ever used from the event loop thread.

use crate::bootstrap::{BootPhase, BootstrapState};
use crate::config::{InitConfig, SystemConfig};
use crate::error::{Error, Result};
use crate::hooks::{ConditionBus, ConditionLog, Hook, HookDispatcher, LogHooks};
use crate::platform::{Platform, ShutdownType, SystemPlatform};
use crate::process::ProcessSupervisor;
use crate::registry::{ServiceRegistry, ServiceTable, StepFilter};
use crate::runlevel::{runlevel_name, MAX_RUNLEVEL};
use tracing::{debug, info, warn};

/// Runlevel that powers the machine off once bootstrap is over.
pub const RUNLEVEL_HALT: u8 = 0;

/// Runlevel that reboots the machine once bootstrap is over.
pub const RUNLEVEL_REBOOT: u8 = 6;

pub struct System {
    pub state: BootstrapState,
    pub config: SystemConfig,
    pub settings: InitConfig,
    pub registry: Box<dyn ServiceRegistry>,
    pub hooks: Box<dyn HookDispatcher>,
    pub conditions: Box<dyn ConditionBus>,
    pub platform: Box<dyn Platform>,
}

impl System {
    pub fn new(
        settings: InitConfig,
        registry: Box<dyn ServiceRegistry>,
        hooks: Box<dyn HookDispatcher>,
        conditions: Box<dyn ConditionBus>,
        platform: Box<dyn Platform>,
    ) -> Self {
        Self {
            state: BootstrapState::default(),
            config: SystemConfig::with_defaults(),
            settings,
            registry,
            hooks,
            conditions,
            platform,
        }
    }

    /// A system wired to the real host and the in-tree service table.
    pub fn with_defaults(settings: InitConfig) -> Self {
        let pid1 = settings.require_pid1;
        Self::new(
            settings,
            Box::new(ServiceTable::new(ProcessSupervisor::new())),
            Box::new(LogHooks),
            Box::new(ConditionLog::new()),
            Box::new(SystemPlatform::new(pid1)),
        )
    }

    /// One convergence pass of the service registry.
    pub fn step(&mut self, filter: StepFilter) {
        self.registry.step(&self.state, filter);
    }

    pub fn run_hooks(&mut self, hook: Hook) {
        self.hooks.run_hooks(hook);
    }

    /// Report boot progress, loudly while progress output is enabled.
    pub fn progress(&self, msg: &str) {
        if self.state.progress {
            info!("{}", msg);
        } else {
            debug!("{}", msg);
        }
    }

    /// Runlevel change requested from outside (`telinit N`, `initctl`).
    ///
    /// While still in the bootstrap level the request only retargets the
    /// level bootstrap ends in.  Halt and reboot are not accepted as
    /// targets then.
    pub fn change_runlevel(&mut self, level: u8) -> Result<()> {
        if level > MAX_RUNLEVEL {
            return Err(Error::InvalidRunlevel(level));
        }

        if self.state.bootstrap {
            if level == RUNLEVEL_HALT || level == RUNLEVEL_REBOOT {
                warn!(runlevel = level, "Cannot halt or reboot while bootstrapping, ignoring");
                return Ok(());
            }
            if self.state.phase < BootPhase::Finalizing {
                info!(runlevel = level, "Bootstrap will end in runlevel {}", level);
                self.state.cfglevel = level;
                return Ok(());
            }
        }

        self.enter_runlevel(level)
    }

    /// Switch runlevel and converge the services to it.
    pub fn enter_runlevel(&mut self, level: u8) -> Result<()> {
        if level > MAX_RUNLEVEL {
            return Err(Error::InvalidRunlevel(level));
        }
        if level == self.state.runlevel {
            debug!(runlevel = level, "Already in requested runlevel");
            return Ok(());
        }

        let prev = self.state.runlevel;
        self.state.prevlevel = Some(prev);
        self.state.runlevel = level;
        info!(
            "Changing runlevel {} -> {}",
            runlevel_name(prev),
            runlevel_name(level)
        );

        if !self.state.bootstrap {
            match level {
                RUNLEVEL_HALT => return self.shutdown(ShutdownType::PowerOff),
                RUNLEVEL_REBOOT => return self.shutdown(ShutdownType::Reboot),
                _ => {}
            }
        }

        self.step(StepFilter::Any);
        Ok(())
    }

    /// Re-read the fragment directory and reconcile the service table.
    pub fn reload(&mut self) -> Result<()> {
        info!("Reloading configuration");
        self.registry.mark_dynamic();

        let dir = self.settings.fragment_dir.clone();
        let loaded = self.scan_directory(&dir)?;
        let removed = self.registry.sweep_removed();
        debug!(fragments = loaded, removed = removed, "Reload done");

        self.step(StepFilter::Any);
        Ok(())
    }

    /// Take the machine down.
    pub fn shutdown(&mut self, kind: ShutdownType) -> Result<()> {
        info!(shutdown_type = ?kind, "Initiating system shutdown");

        self.registry.stop_all();
        self.run_hooks(Hook::Shutdown);

        if let Some(script) = self.config.shutdown.clone() {
            if let Err(e) = self
                .platform
                .run_interactive(&script, &format!("Calling shutdown hook {}", script))
            {
                warn!(error = %e, "Shutdown script failed");
            }
        }

        self.platform.sync();
        self.platform.unmount_all();
        self.platform.sync();
        self.platform.power(kind)
    }
}
