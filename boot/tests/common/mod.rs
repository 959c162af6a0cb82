//! Recording test doubles shared by the integration tests.

#![allow(dead_code)]

use ember_boot::error::{Error, Result};
use ember_boot::{
    BootstrapState, ConditionBus, ExitStatus, Hook, HookDispatcher, InitConfig, Platform,
    ServiceDescriptor, ServiceHandle, ServiceRegistry, ServiceTable, ShutdownType, StepFilter,
    Supervise, System,
};
use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Something a collaborator was asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Register(ServiceDescriptor),
    Init,
    Reap,
    Step { runlevel: u8, bootstrap: bool, filter: StepFilter },
    Prune,
    MarkDynamic,
    Sweep,
    StopAll,
    Spawn(String),
    Hook(Hook),
    Condition(String),
    Run(String),
    RunParts(PathBuf),
    Hostname(String),
    MountBase,
    Environment,
    QuietConsole,
    MountRuntime,
    Sync,
    UnmountAll,
    Power(ShutdownType),
}

/// Shared, ordered log of events, plus the commands that should fail.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    events: Rc<RefCell<Vec<Event>>>,
    failing: Rc<RefCell<Vec<String>>>,
}

impl Journal {
    pub fn push(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }

    /// Make `cmd` exit non-zero from now on.
    pub fn fail(&self, cmd: &str) {
        self.failing.borrow_mut().push(cmd.to_string());
    }

    pub fn fails(&self, cmd: &str) -> bool {
        self.failing.borrow().iter().any(|c| c == cmd)
    }

    pub fn registered(&self) -> Vec<ServiceDescriptor> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Register(desc) => Some(desc),
                _ => None,
            })
            .collect()
    }

    pub fn commands(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Run(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    pub fn spawned(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Spawn(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    pub fn hooks(&self) -> Vec<Hook> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Hook(hook) => Some(hook),
                _ => None,
            })
            .collect()
    }

    pub fn position(&self, event: &Event) -> Option<usize> {
        self.events.borrow().iter().position(|e| e == event)
    }
}

/// Registry that records calls and reports completion after a number
/// of `completed` queries.
pub struct MockRegistry {
    journal: Journal,
    completes_after: Option<usize>,
    polls: Cell<usize>,
    count: usize,
    exited: usize,
}

impl MockRegistry {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            completes_after: Some(1),
            polls: Cell::new(0),
            count: 0,
            exited: 0,
        }
    }

    /// Have the next reap collect `n` children.
    pub fn with_exited(mut self, n: usize) -> Self {
        self.exited = n;
        self
    }

    /// Report completion on the `n`th query.  `None` never completes.
    pub fn completing_after(mut self, n: Option<usize>) -> Self {
        self.completes_after = n;
        self
    }
}

impl ServiceRegistry for MockRegistry {
    fn init(&mut self) {
        self.journal.push(Event::Init);
    }

    fn register(&mut self, desc: ServiceDescriptor) -> ServiceHandle {
        self.journal.push(Event::Register(desc));
        self.count += 1;
        ServiceHandle(self.count as u64)
    }

    fn find(&self, _name: &str, _id: Option<&str>) -> Option<ServiceHandle> {
        None
    }

    fn step(&mut self, state: &BootstrapState, filter: StepFilter) {
        self.journal.push(Event::Step {
            runlevel: state.runlevel,
            bootstrap: state.bootstrap,
            filter,
        });
    }

    fn completed(&self) -> bool {
        let polls = self.polls.get() + 1;
        self.polls.set(polls);
        self.completes_after.is_some_and(|n| polls >= n)
    }

    fn prune_bootstrap_only(&mut self) -> usize {
        self.journal.push(Event::Prune);
        0
    }

    fn reap(&mut self) -> usize {
        self.journal.push(Event::Reap);
        std::mem::take(&mut self.exited)
    }

    fn mark_dynamic(&mut self) {
        self.journal.push(Event::MarkDynamic);
    }

    fn sweep_removed(&mut self) -> usize {
        self.journal.push(Event::Sweep);
        0
    }

    fn stop_all(&mut self) {
        self.journal.push(Event::StopAll);
    }

    fn len(&self) -> usize {
        self.count
    }
}

/// Supervisor that records spawns.  One-shots finish when reaped.
pub struct RecordingSupervisor {
    journal: Journal,
    next_pid: u32,
    running: Vec<u32>,
}

impl RecordingSupervisor {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            next_pid: 100,
            running: Vec::new(),
        }
    }
}

impl Supervise for RecordingSupervisor {
    fn spawn(&mut self, desc: &ServiceDescriptor) -> Result<u32> {
        self.journal.push(Event::Spawn(desc.command.clone()));
        self.next_pid += 1;
        if desc.kind.is_oneshot() {
            self.running.push(self.next_pid);
        }
        Ok(self.next_pid)
    }

    fn stop(&mut self, pid: u32) -> Result<()> {
        self.running.push(pid);
        Ok(())
    }

    fn wait(&mut self, pid: u32) -> Result<ExitStatus> {
        self.running.retain(|&p| p != pid);
        Ok(ExitStatus {
            pid,
            code: Some(0),
            signal: None,
        })
    }

    fn reap(&mut self) -> Vec<ExitStatus> {
        self.running
            .drain(..)
            .map(|pid| ExitStatus {
                pid,
                code: Some(0),
                signal: None,
            })
            .collect()
    }
}

pub struct MockHooks(pub Journal);

impl HookDispatcher for MockHooks {
    fn run_hooks(&mut self, hook: Hook) {
        self.0.push(Event::Hook(hook));
    }
}

pub struct MockConditions(pub Journal);

impl ConditionBus for MockConditions {
    fn set_oneshot(&mut self, name: &str) {
        self.0.push(Event::Condition(name.to_string()));
    }
}

/// Platform that records every command.  Any existing file counts as
/// executable and nothing is mounted read-write.
pub struct MockPlatform(pub Journal);

impl Platform for MockPlatform {
    fn mount_base(&mut self) {
        self.0.push(Event::MountBase);
    }

    fn prepare_environment(&mut self) {
        self.0.push(Event::Environment);
    }

    fn quiet_console(&mut self) {
        self.0.push(Event::QuietConsole);
    }

    fn mount_runtime(&mut self) {
        self.0.push(Event::MountRuntime);
    }

    fn mounted_rw(&self, _dir: &str) -> bool {
        false
    }

    fn run_interactive(&mut self, cmd: &str, _desc: &str) -> Result<()> {
        self.0.push(Event::Run(cmd.to_string()));
        if self.0.fails(cmd) {
            return Err(Error::CommandFailed {
                command: cmd.to_string(),
                code: Some(1),
            });
        }
        Ok(())
    }

    fn run_parts(&mut self, dir: &Path) {
        self.0.push(Event::RunParts(dir.to_path_buf()));
    }

    fn is_executable(&self, path: &Path) -> bool {
        path.exists()
    }

    fn set_hostname(&mut self, name: &str) -> Result<()> {
        self.0.push(Event::Hostname(name.to_string()));
        Ok(())
    }

    fn sync(&mut self) {
        self.0.push(Event::Sync);
    }

    fn unmount_all(&mut self) {
        self.0.push(Event::UnmountAll);
    }

    fn power(&mut self, kind: ShutdownType) -> Result<()> {
        self.0.push(Event::Power(kind));
        Ok(())
    }
}

/// Settings pointing into a scratch directory.
pub fn settings_in(root: &Path) -> InitConfig {
    InitConfig {
        config_file: root.join("finit.conf"),
        fragment_dir: root.join("finit.d"),
        rc_local: root.join("rc.local"),
        fstab: root.join("fstab"),
        mount_filesystems: false,
        require_pid1: false,
        ..InitConfig::default()
    }
}

/// A system whose collaborators all record into `journal`.
pub fn mock_system(settings: InitConfig, journal: &Journal, registry: MockRegistry) -> System {
    System::new(
        settings,
        Box::new(registry),
        Box::new(MockHooks(journal.clone())),
        Box::new(MockConditions(journal.clone())),
        Box::new(MockPlatform(journal.clone())),
    )
}

/// A system over the in-tree service table with a recording supervisor.
pub fn table_system(settings: InitConfig, journal: &Journal) -> System {
    System::new(
        settings,
        Box::new(ServiceTable::new(RecordingSupervisor::new(journal.clone()))),
        Box::new(MockHooks(journal.clone())),
        Box::new(MockConditions(journal.clone())),
        Box::new(MockPlatform(journal.clone())),
    )
}
