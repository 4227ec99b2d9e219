//! Job configuration
//!
//! A job is described by a JSON file with the same keys an installer's
//! package module is configured with:
//!
//! ```json
//! {
//!   "backend": "pacman",
//!   "skip_if_no_internet": false,
//!   "update_db": true,
//!   "update_system": false,
//!   "pacman": { "num_retries": 2, "needed_only": true },
//!   "operations": [
//!     { "install": ["vim", { "package": "foo", "post-script": "foo-setup --all" }] },
//!     { "try_remove": ["nano"] }
//!   ]
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::PkgOpsError;
use crate::types::{BackendKind, ExecPolicy, OperationList};

/// Per-backend tuning, read from the sub-object named after the backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Extra attempts after a failed command
    pub num_retries: u32,
    pub disable_download_timeout: bool,
    /// Pass `--needed` so up-to-date packages are not reinstalled
    pub needed_only: bool,
    /// Seconds one command may run; 0 means no limit (best-effort backends only)
    pub timeout: u64,
}

impl BackendSettings {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }
}

/// Complete job configuration
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    /// Backend name; validated at run time so a bad name is reported, not a parse error
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub operations: OperationList,
    #[serde(default)]
    pub skip_if_no_internet: bool,
    #[serde(default)]
    pub update_db: bool,
    #[serde(default)]
    pub update_system: bool,
    /// Refresh the sync DB before building the repository index
    #[serde(default)]
    pub sync_db: bool,
    /// Filter operations against the repository index (backend default when unset)
    #[serde(default)]
    pub check_existence: Option<bool>,
    /// Failure policy (backend default when unset)
    #[serde(default)]
    pub policy: Option<ExecPolicy>,
    #[serde(default)]
    pub pacman: Option<Value>,
    #[serde(default)]
    pub paru: Option<Value>,
}

fn default_backend() -> String {
    BackendKind::Pacman.to_string()
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            operations: Vec::new(),
            skip_if_no_internet: false,
            update_db: false,
            update_system: false,
            sync_db: false,
            check_existence: None,
            policy: None,
            pacman: None,
            paru: None,
        }
    }
}

impl JobConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Check everything that can be checked without running a command
    pub fn validate(&self) -> Result<()> {
        let backend = self.backend_kind()?;
        let policy = self.policy(backend);
        let settings = self.backend_settings(backend);

        if settings.timeout > 0 && policy == ExecPolicy::Strict {
            anyhow::bail!(
                "{}.timeout is only supported with the best_effort policy",
                backend
            );
        }

        Ok(())
    }

    pub fn backend_kind(&self) -> std::result::Result<BackendKind, PkgOpsError> {
        self.backend
            .parse()
            .map_err(|_| PkgOpsError::config(format!("unsupported backend \"{}\"", self.backend)))
    }

    pub fn policy(&self, backend: BackendKind) -> ExecPolicy {
        self.policy.unwrap_or(backend.default_policy())
    }

    pub fn check_existence(&self, backend: BackendKind) -> bool {
        self.check_existence
            .unwrap_or(backend.checks_existence_by_default())
    }

    /// Settings for `backend`; a sub-config that is not an object is ignored
    pub fn backend_settings(&self, backend: BackendKind) -> BackendSettings {
        let raw = match backend {
            BackendKind::Pacman => self.pacman.as_ref(),
            BackendKind::Paru => self.paru.as_ref(),
        };

        match raw {
            None | Some(Value::Null) => BackendSettings::default(),
            Some(value @ Value::Object(_)) => serde_json::from_value(value.clone())
                .unwrap_or_else(|e| {
                    warn!("Job configuration *{}* is invalid ({}), using defaults.", backend, e);
                    BackendSettings::default()
                }),
            Some(_) => {
                warn!("Job configuration *{}* will be ignored.", backend);
                BackendSettings::default()
            }
        }
    }
}

/// Load a standalone operation list (JSON array), e.g. one accumulated by
/// earlier installer steps
pub fn load_operations<P: AsRef<Path>>(path: P) -> Result<OperationList> {
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read operations from {:?}", path.as_ref()))?;

    serde_json::from_str(&content).context("Failed to parse operation list JSON")
}
