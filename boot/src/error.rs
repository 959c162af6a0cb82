//! Error types for the ember init core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for init core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the init core.
///
/// Very few of these ever reach the top of the event loop: configuration
/// and supervision problems are logged where they happen and bootstrap
/// carries on.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration source could not be read
    #[error("Cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Runlevel outside 0-9
    #[error("Invalid runlevel: {0}")]
    InvalidRunlevel(u8),

    /// Process spawn error
    #[error("Failed to spawn process: {0}")]
    ProcessSpawnFailed(String),

    /// External command ran but did not succeed
    #[error("Command {command:?} failed: {}", describe_exit(.code))]
    CommandFailed { command: String, code: Option<i32> },

    /// Process not found
    #[error("Process not found: PID {0}")]
    ProcessNotFound(u32),

    /// Not running as PID 1
    #[error("Not running as PID 1 (current PID: {0})")]
    NotPid1(u32),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Nix error
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),
}

impl Error {
    /// Wrap an IO error with the path it happened on.
    pub fn unreadable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Unreadable {
            path: path.into(),
            source,
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {}", code),
        None => "killed by signal".to_string(),
    }
}
