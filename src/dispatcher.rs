//! Operation dispatcher
//!
//! Drives one run from the raw operation list to the final progress update.
//!
//! # State Flow
//!
//! ```text
//! Idle
//!   ↓
//! Preprocessing ──→ Failed   (repository index query failed)
//!   ↓
//! Executing ──────→ Failed   (strict backend command failed)
//!   ↓
//! Done
//! ```
//!
//! Operations run one at a time in declared order. Counters that were
//! advanced before a failure stay advanced.

use crate::config::JobConfig;
use crate::error::{JobFailure, PkgOpsError, Result};
use crate::executor::BackendExecutor;
use crate::index::RepositoryIndex;
use crate::locale::DEFAULT_LOCALE;
use crate::preprocess::{preprocess, select_for_backend, Preprocessed};
use crate::progress::{ProgressSink, ProgressTracker};
use crate::runner::CommandRunner;
use crate::types::{Operation, OperationKind, OperationList, OperationStep, StepKey};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Idle,
    Preprocessing,
    Executing,
    Done,
    Failed,
}

impl RunState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether `self → next` is a legal move
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Preprocessing)
                | (Self::Preprocessing, Self::Executing)
                | (Self::Preprocessing, Self::Failed)
                | (Self::Executing, Self::Done)
                | (Self::Executing, Self::Failed)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Preprocessing => "preprocessing",
            Self::Executing => "executing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Inputs of a run that don't come from the job configuration
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Selected locale, `en` when none was chosen
    pub locale: String,
    /// Network-dependent steps (db refresh, upgrade, sync) only run when set
    pub has_internet: bool,
    /// Operations accumulated by earlier installer steps, run after the configured ones
    pub dynamic_operations: OperationList,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            locale: DEFAULT_LOCALE.to_string(),
            has_internet: false,
            dynamic_operations: Vec::new(),
        }
    }
}

impl RunContext {
    /// A blank `locale` means no locale was chosen
    pub fn new(locale: impl Into<String>, has_internet: bool) -> Self {
        let locale = locale.into();
        let locale = match locale.trim() {
            "" => DEFAULT_LOCALE.to_string(),
            _ => locale,
        };
        Self {
            locale,
            has_internet,
            dynamic_operations: Vec::new(),
        }
    }

    pub fn with_dynamic_operations(mut self, operations: OperationList) -> Self {
        self.dynamic_operations = operations;
        self
    }
}

/// How a run ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { total: usize, completed: usize },
    /// `skip_if_no_internet` was set and there is no network
    Skipped,
}

/// Walks a filtered operation list against one executor
#[derive(Debug)]
pub struct Dispatcher {
    executor: BackendExecutor,
    progress: ProgressTracker,
    state: RunState,
}

impl Dispatcher {
    pub fn new(executor: BackendExecutor, progress: ProgressTracker) -> Self {
        Self {
            executor,
            progress,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    fn transition(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(PkgOpsError::State(format!(
                "cannot go from {} to {}",
                self.state, next
            )));
        }
        debug!("run state: {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Resolve locales, filter against the repository index and fix the total.
    ///
    /// The index is only queried when `check_existence` is set.
    pub fn preprocess(
        &mut self,
        operations: &[Operation],
        locale: &str,
        check_existence: bool,
    ) -> Result<Preprocessed> {
        self.transition(RunState::Preprocessing)?;

        let index = if check_existence {
            match RepositoryIndex::build(self.executor.runner(), self.executor.backend()) {
                Ok(index) => Some(index),
                Err(e) => {
                    self.transition(RunState::Failed)?;
                    return Err(e);
                }
            }
        } else {
            None
        };

        let result = preprocess(operations, locale, index.as_ref());
        self.progress.init(result.total);
        info!(
            "{} operation(s), {} package(s) to process",
            result.operations.len(),
            result.total
        );
        Ok(result)
    }

    /// Run every operation, then report completion.
    ///
    /// With nothing to process the run completes immediately.
    pub fn execute(&mut self, operations: &[Operation]) -> Result<()> {
        self.transition(RunState::Executing)?;

        if self.progress.total() > 0 {
            for op in operations {
                if let Err(e) = self.run_operation(op) {
                    self.transition(RunState::Failed)?;
                    return Err(e);
                }
            }
        } else {
            info!("Nothing to do: every package was filtered out");
        }

        self.transition(RunState::Done)?;
        self.progress.complete();
        Ok(())
    }

    fn run_operation(&mut self, op: &Operation) -> Result<()> {
        if let Some(source) = &op.source {
            debug!("Package-list from {}", source);
        }

        for step in &op.steps {
            self.run_step(step)?;
        }

        self.progress.end_group();
        Ok(())
    }

    fn run_step(&mut self, step: &OperationStep) -> Result<()> {
        let kind = match &step.key {
            StepKey::Known(kind) if kind.is_executable() => *kind,
            StepKey::Known(_) => return Ok(()),
            StepKey::Unknown(key) => {
                warn!("Unknown package-operation key {}", key);
                return Ok(());
            }
        };

        let entries = &step.entries;
        self.progress.begin_group(kind.mode(), entries.len());

        if entries.is_empty() {
            debug!("{}: nothing left after filtering", kind);
        } else {
            let exec = &self.executor;
            let progress = &mut self.progress;
            match kind {
                OperationKind::Install => exec.operation_install(entries, false, progress)?,
                OperationKind::TryInstall => exec.operation_try_install(entries, progress)?,
                OperationKind::Remove => exec.operation_remove(entries, progress)?,
                OperationKind::TryRemove => exec.operation_try_remove(entries, progress)?,
                OperationKind::LocalInstall => exec.operation_install(entries, true, progress)?,
                OperationKind::Source => {}
            }
        }

        self.progress.advance(entries.len());
        Ok(())
    }
}

/// Run a whole job: optional db refresh and upgrade, preprocessing, dispatch.
///
/// Errors come back as a [`JobFailure`] ready to show to the user. With a
/// best-effort backend only configuration and index problems can fail a run.
pub fn run_job(
    config: &JobConfig,
    ctx: &RunContext,
    runner: Arc<dyn CommandRunner>,
    sink: Box<dyn ProgressSink>,
) -> std::result::Result<RunOutcome, JobFailure> {
    let backend = config
        .backend_kind()
        .map_err(|_| JobFailure::bad_backend(&config.backend))?;

    if config.skip_if_no_internet && !ctx.has_internet {
        warn!("Package installation has been skipped: no internet");
        return Ok(RunOutcome::Skipped);
    }

    let executor = BackendExecutor::from_config(config, backend, runner);
    executor.bootstrap();

    if config.update_db && ctx.has_internet {
        executor.update_db().map_err(|e| {
            log_failure(&e);
            JobFailure::update_db(&e)
        })?;
    }

    if config.update_system && ctx.has_internet {
        executor.update_system().map_err(|e| {
            log_failure(&e);
            JobFailure::update_system(&e)
        })?;
    }

    let mut operations = config.operations.clone();
    operations.extend(ctx.dynamic_operations.iter().cloned());
    let operations = select_for_backend(operations, backend);

    if config.sync_db && !config.update_db {
        if ctx.has_internet {
            if let Err(e) = executor.update_db() {
                warn!("{} sync failed; continuing with existing sync DB: {}", backend, e);
            }
        } else {
            warn!("No internet detected; skipping {} sync before filtering.", backend);
        }
    }

    let mut dispatcher = Dispatcher::new(executor, ProgressTracker::new(sink));

    let prepared = dispatcher
        .preprocess(&operations, &ctx.locale, config.check_existence(backend))
        .map_err(|e| {
            log_failure(&e);
            match e {
                PkgOpsError::Query { .. } => JobFailure::query(&e),
                _ => JobFailure::configuration(&e),
            }
        })?;

    dispatcher.execute(&prepared.operations).map_err(|e| {
        log_failure(&e);
        JobFailure::package_manager(&e)
    })?;

    Ok(RunOutcome::Completed {
        total: dispatcher.progress().total(),
        completed: dispatcher.progress().completed(),
    })
}

fn log_failure(err: &PkgOpsError) {
    warn!("{}", err);
    if let Some(output) = err.captured_output() {
        debug!("output: {}", output);
    }
}
