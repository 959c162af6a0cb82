//! Ember init core - configuration and bootstrap for PID 1.
//!
//! This crate holds everything a small init needs between the kernel
//! handing over control and the system reaching its configured runlevel:
//!
//! - Parsing the line-oriented configuration (`/etc/finit.conf` and the
//!   fragments in `/etc/finit.d`)
//! - Runlevel masks like `[S12345]`
//! - A deferred work queue on a virtual clock
//! - The bootstrap sequence: crank, wait for `[S]` work, switch runlevel,
//!   finalize
//! - Process supervision and zombie reaping
//! - Signal handling (SIGCHLD, SIGHUP, SIGUSR1, SIGUSR2, SIGTERM, SIGINT)
//!
//! # Architecture
//!
//! - **Init**: PID 1 duties and the event loop
//! - **System**: the context every step works on
//! - **ServiceRegistry**: the service state machine, behind a trait
//! - **Scheduler**: deadline-ordered deferred work
//! - **Platform**: commands, mounts and power, behind a trait
//!
//! # Example
//!
//! ```no_run
//! use ember_boot::{Init, InitConfig, Result};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<()> {
//!     let mut init = Init::new(InitConfig::default())?;
//!     init.run().await?;
//!     Ok(())
//! }
//! ```

pub mod bootstrap;
pub mod config;
pub mod directive;
pub mod error;
pub mod hooks;
pub mod init;
pub mod loader;
pub mod mounts;
pub mod platform;
pub mod process;
pub mod registry;
pub mod runlevel;
pub mod schedule;
pub mod service;
pub mod system;

// Re-export main types
pub use bootstrap::{BootOutcome, BootPhase, BootstrapState, PollTask, Work};
pub use config::{BootstrapTimings, InitConfig, KernelCmdline, SystemConfig};
pub use directive::{classify, classify_dynamic, classify_static, Declaration, Directive};
pub use error::{Error, Result};
pub use hooks::{ConditionBus, Hook, HookDispatcher};
pub use init::Init;
pub use platform::{Platform, ShutdownType};
pub use process::{ExitStatus, ProcessSupervisor, Supervise};
pub use registry::{ServiceHandle, ServiceRegistry, ServiceTable, StepFilter};
pub use runlevel::RunlevelMask;
pub use schedule::Scheduler;
pub use service::{ServiceDescriptor, ServiceKind};
pub use system::System;
