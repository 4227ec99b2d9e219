//! Type-safe operation types for pkgops
//!
//! This module replaces the stringly-typed operation lists of installer
//! configuration files with proper Rust enums that provide compile-time
//! validation and exhaustive matching.

use crate::error::PkgOpsError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumIter, EnumString};

/// Package manager backend an executor wraps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
    /// Official repositories through pacman
    #[default]
    Pacman,
    /// AUR helper, run as the unprivileged build user
    Paru,
}

/// Cache directory the paru build user writes to
pub const PARU_CACHE_DIR: &str = "/var/cache/paru_cache";

/// Unprivileged account AUR builds run as
pub const BUILD_USER: &str = "nobody";

impl BackendKind {
    /// Name of the backend binary
    pub const fn program(self) -> &'static str {
        match self {
            Self::Pacman => "pacman",
            Self::Paru => "paru",
        }
    }

    /// argv prefix every backend invocation starts with
    pub fn command_prefix(self) -> Vec<String> {
        match self {
            Self::Pacman => vec!["pacman".to_string()],
            Self::Paru => ["sudo", "-E", "-u", BUILD_USER, "paru"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Environment every backend invocation runs with
    pub fn build_env(self) -> Vec<(String, String)> {
        match self {
            Self::Pacman => vec![],
            Self::Paru => ["PWD", "XDG_CACHE_HOME", "XDG_DATA_HOME"]
                .iter()
                .map(|key| (key.to_string(), PARU_CACHE_DIR.to_string()))
                .collect(),
        }
    }

    /// Policy used when the configuration does not name one
    pub const fn default_policy(self) -> ExecPolicy {
        match self {
            Self::Pacman => ExecPolicy::Strict,
            Self::Paru => ExecPolicy::BestEffort,
        }
    }

    /// Whether the repository index filters operations unless configured otherwise
    pub const fn checks_existence_by_default(self) -> bool {
        matches!(self, Self::Pacman)
    }

    /// Whether an operation tagged with `source` belongs to this backend
    ///
    /// Untagged operations belong to pacman only.
    pub fn accepts_source(self, source: Option<&str>) -> bool {
        let source = source.unwrap_or_default().to_lowercase();
        match self {
            Self::Pacman => !source.contains("paru") && !source.contains("flatpak"),
            Self::Paru => source.contains("paru"),
        }
    }
}

/// What happens when a backend command keeps failing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecPolicy {
    /// Exhausted retries abort the run
    Strict,
    /// Exhausted retries are logged and the run continues
    BestEffort,
}

/// Operation keys recognized in an operation list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Display, EnumString, EnumIter)]
pub enum OperationKind {
    #[strum(serialize = "install")]
    Install,
    #[strum(serialize = "try_install")]
    TryInstall,
    #[strum(serialize = "remove")]
    Remove,
    #[strum(serialize = "try_remove")]
    TryRemove,
    #[strum(to_string = "local_install", serialize = "localInstall")]
    LocalInstall,
    /// Informational tag naming where an operation came from
    #[strum(serialize = "source")]
    Source,
}

impl OperationKind {
    /// Keys that run a backend command and count toward progress
    pub const fn is_executable(self) -> bool {
        !matches!(self, Self::Source)
    }

    /// Keys whose entries must exist in the repository index
    ///
    /// Local installs name files on disk, not repository members.
    pub const fn is_existence_checked(self) -> bool {
        matches!(
            self,
            Self::Install | Self::TryInstall | Self::Remove | Self::TryRemove
        )
    }

    /// Progress mode a step of this kind runs under
    pub const fn mode(self) -> Mode {
        match self {
            Self::Install | Self::TryInstall | Self::LocalInstall => Mode::Install,
            Self::Remove | Self::TryRemove => Mode::Remove,
            Self::Source => Mode::None,
        }
    }
}

/// What the current group of packages is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    Install,
    Remove,
    #[default]
    None,
}

/// One package in an operation list
///
/// Either a bare name or a record carrying scripts to run around the
/// package command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PackageEntry {
    Simple(String),
    Scripted(ScriptedPackage),
}

/// Package record with optional pre/post scripts
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScriptedPackage {
    #[serde(default)]
    pub package: String,
    #[serde(
        default,
        rename = "pre-script",
        alias = "pre_script",
        skip_serializing_if = "Option::is_none"
    )]
    pub pre_script: Option<String>,
    #[serde(
        default,
        rename = "post-script",
        alias = "post_script",
        skip_serializing_if = "Option::is_none"
    )]
    pub post_script: Option<String>,
}

impl PackageEntry {
    pub fn simple(name: impl Into<String>) -> Self {
        Self::Simple(name.into())
    }

    pub fn scripted(
        name: impl Into<String>,
        pre_script: Option<&str>,
        post_script: Option<&str>,
    ) -> Self {
        Self::Scripted(ScriptedPackage {
            package: name.into(),
            pre_script: pre_script.map(str::to_string),
            post_script: post_script.map(str::to_string),
        })
    }

    /// Package (or group, or local file) name
    pub fn name(&self) -> &str {
        match self {
            Self::Simple(name) => name,
            Self::Scripted(record) => &record.package,
        }
    }

    /// Same entry with its name replaced, scripts kept
    pub fn with_name(&self, name: String) -> Self {
        match self {
            Self::Simple(_) => Self::Simple(name),
            Self::Scripted(record) => Self::Scripted(ScriptedPackage {
                package: name,
                ..record.clone()
            }),
        }
    }

    pub fn pre_script(&self) -> Option<&str> {
        match self {
            Self::Simple(_) => None,
            Self::Scripted(record) => record.pre_script.as_deref(),
        }
    }

    pub fn post_script(&self) -> Option<&str> {
        match self {
            Self::Simple(_) => None,
            Self::Scripted(record) => record.post_script.as_deref(),
        }
    }

    pub fn is_simple(&self) -> bool {
        matches!(self, Self::Simple(_))
    }
}

impl From<&str> for PackageEntry {
    fn from(name: &str) -> Self {
        Self::Simple(name.to_string())
    }
}

/// Key of one step inside an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKey {
    Known(OperationKind),
    /// Unrecognized key, kept so it can be reported at dispatch time
    Unknown(String),
}

impl std::fmt::Display for StepKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Known(kind) => write!(f, "{}", kind),
            Self::Unknown(key) => write!(f, "{}", key),
        }
    }
}

/// A key and the entries it applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationStep {
    pub key: StepKey,
    pub entries: Vec<PackageEntry>,
}

impl OperationStep {
    pub fn new(kind: OperationKind, entries: Vec<PackageEntry>) -> Self {
        Self {
            key: StepKey::Known(kind),
            entries,
        }
    }

    /// The recognized executable kind of this step, if any
    pub fn executable_kind(&self) -> Option<OperationKind> {
        match self.key {
            StepKey::Known(kind) if kind.is_executable() => Some(kind),
            _ => None,
        }
    }
}

/// One declarative unit of an operation list
///
/// Deserialized from a JSON object such as
/// `{"install": ["vim", {"package": "foo", "post-script": "foo-setup"}], "source": "paru"}`.
/// Steps keep the order their keys were declared in.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct Operation {
    pub source: Option<String>,
    pub steps: Vec<OperationStep>,
}

/// Ordered list of operations
pub type OperationList = Vec<Operation>;

impl Operation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step (builder style)
    pub fn with_step<I, E>(mut self, kind: OperationKind, entries: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<PackageEntry>,
    {
        self.steps
            .push(OperationStep::new(kind, entries.into_iter().map(Into::into).collect()));
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Whether any step still has entries
    pub fn has_entries(&self) -> bool {
        self.steps.iter().any(|step| !step.entries.is_empty())
    }
}

impl TryFrom<Map<String, Value>> for Operation {
    type Error = PkgOpsError;

    fn try_from(map: Map<String, Value>) -> Result<Self, Self::Error> {
        let mut operation = Operation::default();

        for (key, value) in map {
            match key.parse::<OperationKind>() {
                Ok(OperationKind::Source) => {
                    operation.source = Some(match value {
                        Value::String(s) => s,
                        other => other.to_string(),
                    });
                }
                Ok(kind) => {
                    let entries: Vec<PackageEntry> = serde_json::from_value(value).map_err(|e| {
                        PkgOpsError::config(format!("invalid package list for '{}': {}", key, e))
                    })?;
                    operation.steps.push(OperationStep::new(kind, entries));
                }
                Err(_) => {
                    // Unknown keys are reported at dispatch, so malformed values are tolerated
                    let entries = serde_json::from_value(value).unwrap_or_default();
                    operation.steps.push(OperationStep {
                        key: StepKey::Unknown(key),
                        entries,
                    });
                }
            }
        }

        Ok(operation)
    }
}
