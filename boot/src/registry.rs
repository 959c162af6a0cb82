//! Service registry.
//!
//! The boot sequence talks to the service supervision engine through
//! [`ServiceRegistry`] only.  [`ServiceTable`] is the engine shipped with
//! the crate: a flat table of descriptors reconciled against the current
//! runlevel on every step.  It has no restart backoff and no respawn
//! limits, a service that exits is started again on the next step.

use crate::bootstrap::BootstrapState;
use crate::error::Error;
use crate::process::{ExitStatus, Supervise};
use crate::runlevel::runlevel_name;
use crate::service::{ServiceDescriptor, ServiceKind};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

/// Which services a step looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepFilter {
    /// Everything
    Any,
    /// Respawn-class services (TTYs) only
    Respawn,
}

/// Opaque reference to a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceHandle(pub u64);

/// Operations the boot sequence needs from the supervision engine.
pub trait ServiceRegistry {
    /// Prepare the state machine.  Steps before this are ignored.
    fn init(&mut self);

    /// Add a service, or refresh the one with the same name and id.
    fn register(&mut self, desc: ServiceDescriptor) -> ServiceHandle;

    fn find(&self, name: &str, id: Option<&str>) -> Option<ServiceHandle>;

    /// One convergence pass: start what should run, stop what should not.
    fn step(&mut self, state: &BootstrapState, filter: StepFilter);

    /// Whether all bootstrap `run`/`task` work has finished.
    fn completed(&self) -> bool;

    /// Drop bootstrap-only services that never started.
    fn prune_bootstrap_only(&mut self) -> usize;

    /// Collect exited children.  Returns how many were collected.
    fn reap(&mut self) -> usize;

    /// Flag every fragment service as a removal candidate.  Registering
    /// it again before [`ServiceRegistry::sweep_removed`] clears the flag.
    fn mark_dynamic(&mut self);

    /// Stop and forget services still flagged by `mark_dynamic`.
    fn sweep_removed(&mut self) -> usize;

    /// Stop every running service.
    fn stop_all(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run state of a table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Halted,
    Running(u32),
    Stopping(u32),
}

impl RunState {
    pub fn pid(&self) -> Option<u32> {
        match *self {
            RunState::Halted => None,
            RunState::Running(pid) | RunState::Stopping(pid) => Some(pid),
        }
    }
}

#[derive(Debug)]
struct Entry {
    desc: ServiceDescriptor,
    state: RunState,
    /// Runlevel the current process was started in
    spawned_in: u8,
    /// Runlevel a one-shot last completed in
    ran_in: Option<u8>,
    /// Ever spawned
    started: bool,
    /// Removal candidate during reload
    removed: bool,
    /// Descriptor replaced while running, restart on next step
    changed: bool,
}

impl Entry {
    fn new(desc: ServiceDescriptor) -> Self {
        Self {
            desc,
            state: RunState::Halted,
            spawned_in: 0,
            ran_in: None,
            started: false,
            removed: false,
            changed: false,
        }
    }

    fn wanted(&self, state: &BootstrapState) -> bool {
        if self.desc.kind == ServiceKind::Inetd {
            // Started by the socket front-end, not here
            return false;
        }
        if self.desc.kind.is_respawn_class() && state.bootstrap {
            return false;
        }
        self.desc.in_runlevel(state.runlevel)
    }

    fn pending_bootstrap_work(&self) -> bool {
        self.desc.kind.is_oneshot()
            && self.desc.runlevels.contains(0)
            && (self.ran_in.is_none() || matches!(self.state, RunState::Running(_)))
    }
}

/// Table of services over a process supervisor.
#[derive(Debug)]
pub struct ServiceTable<S> {
    supervisor: S,
    entries: BTreeMap<u64, Entry>,
    next_id: u64,
    initialized: bool,
}

impl<S: Supervise> ServiceTable<S> {
    pub fn new(supervisor: S) -> Self {
        Self {
            supervisor,
            entries: BTreeMap::new(),
            next_id: 0,
            initialized: false,
        }
    }

    /// Get the process supervisor.
    pub fn supervisor(&self) -> &S {
        &self.supervisor
    }

    pub fn supervisor_mut(&mut self) -> &mut S {
        &mut self.supervisor
    }

    pub fn descriptor(&self, handle: ServiceHandle) -> Option<&ServiceDescriptor> {
        self.entries.get(&handle.0).map(|e| &e.desc)
    }

    pub fn state(&self, handle: ServiceHandle) -> Option<RunState> {
        self.entries.get(&handle.0).map(|e| e.state)
    }

    /// Registered descriptors in registration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.entries.values().map(|e| &e.desc)
    }

    fn step_entry(supervisor: &mut S, entry: &mut Entry, state: &BootstrapState) {
        let wanted = entry.wanted(state);

        match entry.state {
            RunState::Running(pid) if !wanted || entry.changed => {
                info!(service = %entry.desc, pid = pid, "Stopping service");
                entry.changed = false;
                match supervisor.stop(pid) {
                    Ok(()) => entry.state = RunState::Stopping(pid),
                    Err(Error::ProcessNotFound(_)) => entry.state = RunState::Halted,
                    Err(e) => warn!(service = %entry.desc, error = %e, "Failed to stop service"),
                }
            }
            RunState::Halted if wanted => {
                entry.changed = false;
                if entry.desc.kind.is_oneshot() && entry.ran_in == Some(state.runlevel) {
                    return;
                }
                Self::start_entry(supervisor, entry, state.runlevel);
            }
            _ => {}
        }
    }

    fn start_entry(supervisor: &mut S, entry: &mut Entry, runlevel: u8) {
        info!(
            service = %entry.desc,
            kind = %entry.desc.kind,
            runlevel = %runlevel_name(runlevel),
            "Starting service"
        );

        let pid = match supervisor.spawn(&entry.desc) {
            Ok(pid) => pid,
            Err(e) => {
                error!(service = %entry.desc, error = %e, "Failed to start service");
                if entry.desc.kind.is_oneshot() {
                    entry.ran_in = Some(runlevel);
                }
                return;
            }
        };

        entry.started = true;
        entry.spawned_in = runlevel;

        if entry.desc.kind == ServiceKind::Run {
            match supervisor.wait(pid) {
                Ok(status) => log_exit(&entry.desc, &status),
                Err(e) => warn!(service = %entry.desc, error = %e, "Lost track of run"),
            }
            entry.ran_in = Some(runlevel);
            return;
        }

        entry.state = RunState::Running(pid);
    }

    fn child_exited(&mut self, status: &ExitStatus) {
        let Some(entry) = self
            .entries
            .values_mut()
            .find(|e| e.state.pid() == Some(status.pid))
        else {
            debug!(pid = status.pid, "Unknown process exited");
            return;
        };

        if let RunState::Running(_) = entry.state {
            log_exit(&entry.desc, status);
            if entry.desc.kind.is_oneshot() {
                entry.ran_in = Some(entry.spawned_in);
            }
        }
        entry.state = RunState::Halted;
    }
}

fn log_exit(desc: &ServiceDescriptor, status: &ExitStatus) {
    if status.success() {
        debug!(service = %desc, pid = status.pid, "Service exited");
    } else {
        warn!(
            service = %desc,
            pid = status.pid,
            code = ?status.code,
            signal = ?status.signal,
            "Service exited abnormally"
        );
    }
}

impl<S: Supervise> ServiceRegistry for ServiceTable<S> {
    fn init(&mut self) {
        debug!(services = self.entries.len(), "Service state machine initialized");
        self.initialized = true;
    }

    fn register(&mut self, desc: ServiceDescriptor) -> ServiceHandle {
        if let Some((&id, entry)) = self
            .entries
            .iter_mut()
            .find(|(_, e)| e.desc.matches(&desc.name, desc.id.as_deref()))
        {
            if entry.desc != desc {
                if !entry.removed && entry.desc.mtime == desc.mtime {
                    warn!(service = %desc, "Duplicate service, use :id to tell them apart");
                }
                debug!(service = %desc, "Service declaration changed");
                entry.changed = entry.state.pid().is_some();
                entry.ran_in = None;
                entry.desc = desc;
            }
            entry.removed = false;
            return ServiceHandle(id);
        }

        let id = self.next_id;
        self.next_id += 1;
        debug!(service = %desc, kind = %desc.kind, runlevels = %desc.runlevels, "Registered service");
        self.entries.insert(id, Entry::new(desc));
        ServiceHandle(id)
    }

    fn find(&self, name: &str, id: Option<&str>) -> Option<ServiceHandle> {
        self.entries
            .iter()
            .find(|(_, e)| e.desc.matches(name, id))
            .map(|(&id, _)| ServiceHandle(id))
    }

    fn step(&mut self, state: &BootstrapState, filter: StepFilter) {
        if !self.initialized {
            debug!("Service state machine not started, ignoring step");
            return;
        }

        for entry in self.entries.values_mut() {
            if filter == StepFilter::Respawn && !entry.desc.kind.is_respawn_class() {
                continue;
            }
            Self::step_entry(&mut self.supervisor, entry, state);
        }
    }

    fn completed(&self) -> bool {
        !self.entries.values().any(Entry::pending_bootstrap_work)
    }

    fn prune_bootstrap_only(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| {
            let prune = e.desc.runlevels.is_bootstrap_only()
                && !e.started
                && e.state == RunState::Halted;
            if prune {
                debug!(service = %e.desc, "Pruning bootstrap-only service");
            }
            !prune
        });
        before - self.entries.len()
    }

    fn reap(&mut self) -> usize {
        let statuses = self.supervisor.reap();
        for status in &statuses {
            self.child_exited(status);
        }
        statuses.len()
    }

    fn mark_dynamic(&mut self) {
        for entry in self.entries.values_mut() {
            if entry.desc.mtime != 0 {
                entry.removed = true;
            }
        }
    }

    fn sweep_removed(&mut self) -> usize {
        let supervisor = &mut self.supervisor;
        let before = self.entries.len();
        self.entries.retain(|_, e| {
            if !e.removed {
                return true;
            }
            info!(service = %e.desc, "Service removed from configuration");
            if let RunState::Running(pid) = e.state {
                if let Err(err) = supervisor.stop(pid) {
                    warn!(pid = pid, error = %err, "Failed to stop removed service");
                }
            }
            false
        });
        before - self.entries.len()
    }

    fn stop_all(&mut self) {
        for entry in self.entries.values_mut() {
            if let RunState::Running(pid) = entry.state {
                info!(service = %entry.desc, pid = pid, "Stopping service");
                match self.supervisor.stop(pid) {
                    Ok(()) => entry.state = RunState::Stopping(pid),
                    Err(e) => warn!(service = %entry.desc, error = %e, "Failed to stop service"),
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
