//! Repository index
//!
//! The set of package and group names the active backend can currently
//! install, taken from its sync databases. It only decides which entries of an
//! operation list survive preprocessing; nothing is installed from it.

use crate::error::{PkgOpsError, Result};
use crate::runner::{CommandRunner, Invocation};
use crate::types::BackendKind;
use std::collections::HashSet;
use tracing::debug;

/// Installable package names and group names, read-only once built
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryIndex {
    pub packages: HashSet<String>,
    pub groups: HashSet<String>,
}

impl RepositoryIndex {
    pub fn new<P, G, S>(packages: P, groups: G) -> Self
    where
        P: IntoIterator<Item = S>,
        G: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            packages: packages.into_iter().map(Into::into).collect(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    /// Query `backend` for its package list (`-Slq`) and group list (`-Sgq`).
    ///
    /// A query that exits non-zero fails the build; there is no retry here.
    pub fn build(runner: &dyn CommandRunner, backend: BackendKind) -> Result<Self> {
        let packages = query_names(runner, backend, "-Slq")?;
        let groups = query_names(runner, backend, "-Sgq")?;
        debug!(
            "{} repo index: {} packages, {} groups",
            backend,
            packages.len(),
            groups.len()
        );
        Ok(Self { packages, groups })
    }

    /// Whether `name` is a known package or group
    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains(name) || self.groups.contains(name)
    }
}

fn query_names(runner: &dyn CommandRunner, backend: BackendKind, flag: &str) -> Result<HashSet<String>> {
    let mut argv = backend.command_prefix();
    argv.push(flag.to_string());
    let invocation = Invocation::new(argv).with_env(backend.build_env());

    let mut names = HashSet::new();
    let out = runner.run(&invocation, &mut |line| {
        let name = line.trim();
        if !name.is_empty() {
            names.insert(name.to_string());
        }
    })?;

    if !out.success() {
        return Err(PkgOpsError::Query {
            command: invocation.command_line(),
            exit_code: out.exit_code,
            output: out.output,
        });
    }

    Ok(names)
}
