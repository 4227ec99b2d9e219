//! Error handling module for pkgops
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Library code returns [`PkgOpsError`]; a run that has to stop is reported to
//! the caller as a [`JobFailure`] (short title plus detailed message).

use std::fmt;
use thiserror::Error;

/// Exit code reserved for an attempt that exceeded its wall-clock timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Main error type for pkgops
#[derive(Error, Debug)]
pub enum PkgOpsError {
    /// Repository index query exited non-zero
    #[error("Repository query `{command}` failed with exit code {exit_code}")]
    Query {
        command: String,
        exit_code: i32,
        output: String,
    },

    /// Backend command failed after all retries
    #[error("Command `{command}` failed with exit code {exit_code}")]
    BackendCommand {
        command: String,
        exit_code: i32,
        output: String,
    },

    /// A single attempt ran past its deadline (best-effort backends only)
    #[error("Command `{command}` timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    /// Malformed operation list, bad backend name, invalid settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Run state machine errors (illegal transition)
    #[error("State error: {0}")]
    State(String),

    /// IO errors (spawning processes, reading files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for pkgops operations
pub type Result<T> = std::result::Result<T, PkgOpsError>;

impl PkgOpsError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a backend command error from a joined command line
    pub fn command(command: impl Into<String>, exit_code: i32, output: impl Into<String>) -> Self {
        Self::BackendCommand {
            command: command.into(),
            exit_code,
            output: output.into(),
        }
    }

    /// The failing command line, if this error carries one
    pub fn command_line(&self) -> Option<&str> {
        match self {
            Self::Query { command, .. }
            | Self::BackendCommand { command, .. }
            | Self::Timeout { command, .. } => Some(command),
            _ => None,
        }
    }

    /// Exit code of the failing command (124 for timeouts)
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Query { exit_code, .. } | Self::BackendCommand { exit_code, .. } => {
                Some(*exit_code)
            }
            Self::Timeout { .. } => Some(TIMEOUT_EXIT_CODE),
            _ => None,
        }
    }

    /// Captured output of the failing command, if any
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            Self::Query { output, .. } | Self::BackendCommand { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// A run that stopped with an error the caller has to see.
///
/// Mirrors the `(title, message)` pair an installer shows in its error dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub title: String,
    pub message: String,
}

impl JobFailure {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
        }
    }

    /// Failure for a command that could not change the installed system.
    pub fn package_manager(err: &PkgOpsError) -> Self {
        Self::new(
            "Package Manager error",
            format!(
                "The package manager could not make changes to the installed system. \
                 The command {} returned error code {}.",
                describe_command(err),
                describe_code(err)
            ),
        )
    }

    /// Failure of the database refresh that runs before any operation.
    pub fn update_db(err: &PkgOpsError) -> Self {
        Self::new(
            "Package Manager error",
            format!(
                "The package manager could not make changes to the installed system.\n\
                 Command: {}\nExit code: {}\n",
                describe_command(err),
                describe_code(err)
            ),
        )
    }

    /// Failure of the full system upgrade.
    pub fn update_system(err: &PkgOpsError) -> Self {
        Self::new(
            "Package Manager error",
            format!(
                "The package manager could not update the system. \
                 The command {} returned error code {}.",
                describe_command(err),
                describe_code(err)
            ),
        )
    }

    /// Failure to build the repository index.
    pub fn query(err: &PkgOpsError) -> Self {
        Self::new(
            "Repository metadata query failed",
            format!(
                "The package manager could not query repository metadata. \
                 The command {} returned error code {}.",
                describe_command(err),
                describe_code(err)
            ),
        )
    }

    /// Unsupported backend name in the configuration.
    pub fn bad_backend(name: &str) -> Self {
        Self::new("Bad backend", format!("backend=\"{}\"", name))
    }

    /// Configuration that could not be interpreted.
    pub fn configuration(err: &PkgOpsError) -> Self {
        Self::new("Bad configuration", err.to_string())
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.title, self.message)
    }
}

impl std::error::Error for JobFailure {}

fn describe_command(err: &PkgOpsError) -> String {
    err.command_line()
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string())
}

fn describe_code(err: &PkgOpsError) -> String {
    err.exit_code()
        .map(|code| code.to_string())
        .unwrap_or_else(|| "?".to_string())
}
