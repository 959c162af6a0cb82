//! Bootstrap sequencing.
//!
//! Leaving the bootstrap runlevel `S` for the configured runlevel is a
//! small state machine run off the [`Scheduler`]:
//!
//! ```text
//! Cranking -> AwaitingBootstrapCompletion -> Finalizing -> SteadyState
//! ```
//!
//! - **Crank**: start the service state machine and everything in `[S]`.
//! - **Await**: poll until every `[S]` task and run has finished, or the
//!   poll budget is spent.  Either way boot continues, the outcome just
//!   records which it was.
//! - **Leave**: queue the finalize step, run the runparts scripts and
//!   switch to the configured runlevel.
//! - **Finalize**: prune, hooks, `rc.local`, and finally clear the
//!   bootstrap flag so TTYs may start.

use crate::config::BootstrapTimings;
use crate::hooks::Hook;
use crate::registry::StepFilter;
use crate::runlevel::runlevel_name;
use crate::schedule::Scheduler;
use crate::system::System;
use std::fmt;
use tracing::{debug, info, warn};

/// Where the boot sequence is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum BootPhase {
    /// Sequencer not started yet
    #[default]
    Early,
    Cranking,
    AwaitingBootstrapCompletion,
    Finalizing,
    SteadyState,
}

impl fmt::Display for BootPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootPhase::Early => write!(f, "early"),
            BootPhase::Cranking => write!(f, "cranking"),
            BootPhase::AwaitingBootstrapCompletion => write!(f, "awaiting bootstrap completion"),
            BootPhase::Finalizing => write!(f, "finalizing"),
            BootPhase::SteadyState => write!(f, "steady state"),
        }
    }
}

/// How the wait for bootstrap work ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    /// Every bootstrap task and run finished
    Clean,
    /// The poll budget ran out first
    TimedOut,
}

/// Runlevel bookkeeping and boot progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapState {
    /// Current runlevel, 0 is `S`
    pub runlevel: u8,
    /// Runlevel before the last change, `None` until the first change
    pub prevlevel: Option<u8>,
    /// Runlevel to enter when bootstrap is over
    pub cfglevel: u8,
    /// Set until the finalize step has completed
    pub bootstrap: bool,
    pub phase: BootPhase,
    /// How the bootstrap wait ended, once it has
    pub outcome: Option<BootOutcome>,
    /// Boot progress is reported at info level while set
    pub progress: bool,
    /// Rescue mode: no scripts, maintenance shell
    pub rescue: bool,
    /// Debug mode from the kernel command line
    pub debug: bool,
}

impl Default for BootstrapState {
    fn default() -> Self {
        Self {
            runlevel: 0,
            prevlevel: None,
            cfglevel: crate::directive::FALLBACK_RUNLEVEL,
            bootstrap: true,
            phase: BootPhase::Early,
            outcome: None,
            progress: false,
            rescue: false,
            debug: false,
        }
    }
}

/// The completion poll as a value: it carries its own countdown and is
/// handed back to the scheduler for every retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTask {
    /// Polls left, including the next one
    pub remaining: u32,
}

/// Result of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// Not done, poll again later
    Again(PollTask),
    Done(BootOutcome),
}

impl PollTask {
    pub fn new(attempts: u32) -> Self {
        Self {
            remaining: attempts,
        }
    }

    /// Account for one poll given the current completion state.
    ///
    /// With `n` attempts a predicate that never holds gives up on the
    /// `n`th poll.
    pub fn tick(self, completed: bool) -> Poll {
        if completed {
            return Poll::Done(BootOutcome::Clean);
        }

        let remaining = self.remaining.saturating_sub(1);
        if remaining == 0 {
            Poll::Done(BootOutcome::TimedOut)
        } else {
            Poll::Again(PollTask { remaining })
        }
    }
}

/// Work items of the boot sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Work {
    Crank,
    AwaitBootstrap(PollTask),
    Finalize,
}

/// Queue the first two steps of the sequence.
pub fn start(sched: &mut Scheduler<Work>, timings: &BootstrapTimings) {
    debug!("Starting the big state machine");
    sched.submit(timings.crank_delay(), Work::Crank);

    debug!("Starting bootstrap finalize timer");
    sched.submit(
        timings.poll_delay(),
        Work::AwaitBootstrap(PollTask::new(timings.poll_attempts)),
    );
}

/// Run one work item.
pub fn handle(system: &mut System, sched: &mut Scheduler<Work>, work: Work) {
    match work {
        Work::Crank => crank(system),
        Work::AwaitBootstrap(task) => await_bootstrap(system, sched, task),
        Work::Finalize => finalize(system),
    }
}

/// Run everything that is due.  Returns the number of items run.
pub fn run_due(system: &mut System, sched: &mut Scheduler<Work>) -> usize {
    let mut count = 0;
    while let Some(work) = sched.pop_due() {
        handle(system, sched, work);
        count += 1;
    }
    count
}

fn crank(system: &mut System) {
    system.state.phase = BootPhase::Cranking;
    system.registry.init();
    system.step(StepFilter::Any);
    system.state.phase = BootPhase::AwaitingBootstrapCompletion;
}

fn await_bootstrap(system: &mut System, sched: &mut Scheduler<Work>, task: PollTask) {
    debug!("Step all services");
    system.step(StepFilter::Any);

    match task.tick(system.registry.completed()) {
        Poll::Again(task) => {
            debug!(remaining = task.remaining, "Not all bootstrap run/tasks have completed yet");
            sched.submit(system.settings.timings.poll_delay(), Work::AwaitBootstrap(task));
        }
        Poll::Done(outcome) => leave_bootstrap(system, sched, outcome),
    }
}

fn leave_bootstrap(system: &mut System, sched: &mut Scheduler<Work>, outcome: BootOutcome) {
    match outcome {
        BootOutcome::Clean => debug!("All run/task have completed, resuming bootstrap"),
        BootOutcome::TimedOut => warn!(
            budget_ms = system.settings.timings.poll_budget().as_millis() as u64,
            "Timeout waiting for bootstrap run/tasks, resuming bootstrap"
        ),
    }
    system.state.outcome = Some(outcome);
    system.state.phase = BootPhase::Finalizing;

    sched.submit(system.settings.timings.finalize_delay(), Work::Finalize);

    if !system.state.rescue {
        if let Some(dir) = system.config.runparts.clone() {
            if dir.is_dir() {
                system.platform.run_parts(&dir);
            } else {
                debug!(dir = %dir.display(), "No runparts directory");
            }
        }
    }

    let level = system.state.cfglevel;
    debug!(runlevel = %runlevel_name(level), "Change to default runlevel, starting all services");
    if let Err(e) = system.enter_runlevel(level) {
        warn!(error = %e, "Failed to enter configured runlevel");
    }
}

fn finalize(system: &mut System) {
    let pruned = system.registry.prune_bootstrap_only();
    debug!(pruned = pruned, "Cleaned up bootstrap-only tasks/services");

    system.run_hooks(Hook::SvcUp);
    system.step(StepFilter::Any);

    let rc_local = system.settings.rc_local.clone();
    if !system.state.rescue && system.platform.is_executable(&rc_local) {
        let cmd = rc_local.display().to_string();
        if let Err(e) = system
            .platform
            .run_interactive(&cmd, &format!("Calling {}", cmd))
        {
            warn!(error = %e, "rc.local failed");
        }
    }

    system.run_hooks(Hook::SystemUp);
    system.step(StepFilter::Any);

    system.state.progress = false;
    system.state.bootstrap = false;
    system.state.phase = BootPhase::SteadyState;
    info!(runlevel = %runlevel_name(system.state.runlevel), "System bootstrapped");

    system.step(StepFilter::Respawn);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_completes_when_predicate_holds() {
        let mut task = PollTask::new(120);
        for tick in 1..=5 {
            match task.tick(tick == 5) {
                Poll::Again(next) => {
                    assert!(tick < 5);
                    task = next;
                }
                Poll::Done(outcome) => {
                    assert_eq!(tick, 5);
                    assert_eq!(outcome, BootOutcome::Clean);
                    return;
                }
            }
        }
        panic!("poll never finished");
    }

    #[test]
    fn test_poll_gives_up_at_countdown() {
        let mut task = PollTask::new(120);
        let mut ticks = 0;
        loop {
            ticks += 1;
            match task.tick(false) {
                Poll::Again(next) => task = next,
                Poll::Done(outcome) => {
                    assert_eq!(outcome, BootOutcome::TimedOut);
                    break;
                }
            }
            assert!(ticks <= 120);
        }
        assert_eq!(ticks, 120);
    }

    #[test]
    fn test_zero_attempts_still_terminates() {
        assert_eq!(PollTask::new(0).tick(false), Poll::Done(BootOutcome::TimedOut));
        assert_eq!(PollTask::new(0).tick(true), Poll::Done(BootOutcome::Clean));
    }

    #[test]
    fn test_start_schedules_crank_first() {
        let mut sched = Scheduler::new();
        let timings = BootstrapTimings::default();
        start(&mut sched, &timings);

        sched.advance_to_next();
        assert_eq!(sched.now(), timings.crank_delay());
        assert_eq!(sched.pop_due(), Some(Work::Crank));
        assert_eq!(sched.pop_due(), None);

        sched.advance_to_next();
        assert_eq!(sched.now(), timings.poll_delay());
        assert_eq!(sched.pop_due(), Some(Work::AwaitBootstrap(PollTask::new(120))));
    }

    #[test]
    fn test_initial_state() {
        let state = BootstrapState::default();
        assert_eq!(state.runlevel, 0);
        assert_eq!(state.prevlevel, None);
        assert_eq!(state.cfglevel, 2);
        assert!(state.bootstrap);
        assert_eq!(state.phase, BootPhase::Early);
    }
}
