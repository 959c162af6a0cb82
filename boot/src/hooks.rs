//! Hook points and conditions.
//!
//! Plugins attach to fixed points in the boot sequence.  The dispatcher
//! itself lives outside this crate; [`LogHooks`] is what runs when no
//! plugin host is wired in.

use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

/// Fixed extension points, in the order they fire during boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Hook {
    /// Before anything is up, right after the banner
    Banner,
    /// Root filesystem checked and remounted
    RootfsUp,
    /// `mount -a` failed
    MountError,
    /// After `mount -a`, whether it failed or not
    MountPost,
    /// Configuration loaded, base filesystems up
    BasefsUp,
    /// Services of the configured runlevel started
    SvcUp,
    /// Very end of bootstrap
    SystemUp,
    /// On the way down
    Shutdown,
}

impl Hook {
    /// Condition name asserted when the hook has fired.
    pub fn condition(&self) -> &'static str {
        match self {
            Hook::Banner => "hook/sys/banner",
            Hook::RootfsUp => "hook/mount/root",
            Hook::MountError => "hook/mount/error",
            Hook::MountPost => "hook/mount/post",
            Hook::BasefsUp => "hook/mount/all",
            Hook::SvcUp => "hook/svc/up",
            Hook::SystemUp => "hook/sys/up",
            Hook::Shutdown => "hook/sys/shutdown",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.condition())
    }
}

/// Runs the plugins attached to a hook.
pub trait HookDispatcher {
    fn run_hooks(&mut self, hook: Hook);
}

/// Condition bus as seen by the boot sequence.
pub trait ConditionBus {
    /// Assert a condition that is never retracted.
    fn set_oneshot(&mut self, name: &str);
}

/// Dispatcher with no plugins.
#[derive(Debug, Default)]
pub struct LogHooks;

impl HookDispatcher for LogHooks {
    fn run_hooks(&mut self, hook: Hook) {
        debug!(hook = %hook, "Running hooks");
    }
}

/// In-memory condition store.
#[derive(Debug, Default)]
pub struct ConditionLog {
    set: BTreeSet<String>,
}

impl ConditionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.set.contains(name)
    }
}

impl ConditionBus for ConditionLog {
    fn set_oneshot(&mut self, name: &str) {
        if self.set.insert(name.to_string()) {
            debug!(condition = name, "Condition asserted");
        }
    }
}
