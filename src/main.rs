//! Ember init binary.
//!
//! As PID 1 this is the init.  Run by anyone else it is a SysV style
//! `telinit` that hands the request to `initctl`.

use anyhow::Context;
use boot::{Init, InitConfig, KernelCmdline};
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::process::Command;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Control tool of the running init.
const INITCTL: &str = "initctl";

#[derive(Parser, Debug)]
#[command(
    name = "ember",
    about = "Ember init - a small PID 1 with runlevels",
    author,
    version,
    disable_version_flag = true,
    after_help = "Requests:\n  \
        0        Power-off the system\n  \
        6        Reboot the system\n  \
        2-9      Change runlevel\n  \
        q, Q     Reload *.conf in the fragment directory\n  \
        1, s, S  Enter system rescue mode, runlevel 1"
)]
struct Cli {
    /// Request for the running init
    #[arg(value_parser = parse_request)]
    request: Option<Request>,

    /// Print version
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,

    /// TOML file with init settings
    #[arg(long, env = "EMBER_CONFIG")]
    config: Option<PathBuf>,

    /// Root configuration file
    #[arg(short = 'f', long = "file")]
    file: Option<PathBuf>,

    /// Service fragment directory
    #[arg(short = 'd', long = "fragment-dir")]
    fragment_dir: Option<PathBuf>,

    /// Don't require running as PID 1
    #[arg(long)]
    no_pid1: bool,

    /// Don't mount virtual filesystems
    #[arg(long)]
    no_mount: bool,
}

/// What `telinit` was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Reload,
    Runlevel(char),
}

fn parse_request(arg: &str) -> Result<Request, String> {
    let mut chars = arg.chars();
    match (chars.next(), chars.next()) {
        (Some('q' | 'Q'), None) => Ok(Request::Reload),
        (Some(c @ ('s' | 'S' | '0'..='9')), None) => Ok(Request::Runlevel(c)),
        _ => Err(format!("unsupported request {:?}", arg)),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let pid1 = std::process::id() == 1;

    // The kernel hands PID 1 any boot argument it did not understand
    let cli = if pid1 {
        Cli::try_parse().unwrap_or_else(|_| Cli::parse_from(["ember"]))
    } else {
        Cli::parse()
    };

    // Initialize logging
    let cmdline = KernelCmdline::read();
    let fallback = if cmdline.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.request {
        Some(request) if !pid1 => telinit(request),
        None if !pid1 && !cli.no_pid1 => {
            error!("Not PID 1, give a request or --no-pid1");
            std::process::exit(1);
        }
        _ => run_init(&cli).await,
    }
}

/// Run as the init system.
async fn run_init(cli: &Cli) -> anyhow::Result<()> {
    let mut settings = match &cli.config {
        Some(path) => InitConfig::from_file(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => InitConfig::default(),
    };

    if let Some(file) = &cli.file {
        settings.config_file = file.clone();
    }
    if let Some(dir) = &cli.fragment_dir {
        settings.fragment_dir = dir.clone();
    }
    if cli.no_mount {
        settings.mount_filesystems = false;
    }
    if cli.no_pid1 {
        settings.require_pid1 = false;
    }

    let mut init = Init::new(settings)?;
    init.run().await?;

    Ok(())
}

/// Forward a request to the running init.
fn telinit(request: Request) -> anyhow::Result<()> {
    let mut cmd = Command::new(INITCTL);
    cmd.arg("-b");
    match request {
        Request::Reload => cmd.arg("reload"),
        Request::Runlevel(level) => cmd.arg("runlevel").arg(level.to_string()),
    };

    info!(request = ?request, "Forwarding to {}", INITCTL);
    let status = cmd
        .status()
        .with_context(|| format!("failed to run {}", INITCTL))?;

    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}
