//! pkgops Library
//!
//! Runs declarative package-operation lists against pacman or paru with
//! locale substitution, repository-existence filtering, retry and timeout
//! policies, and progress reporting.

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod index;
pub mod locale;
pub mod preprocess;
pub mod process_guard;
pub mod progress;
pub mod runner;
pub mod types;

// Re-export main types for convenience
pub use config::{load_operations, BackendSettings, JobConfig};
pub use dispatcher::{run_job, Dispatcher, RunContext, RunOutcome, RunState};
pub use error::{JobFailure, PkgOpsError, TIMEOUT_EXIT_CODE};
pub use executor::BackendExecutor;
pub use index::RepositoryIndex;
pub use preprocess::{preprocess, select_for_backend, Preprocessed};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use progress::{
    ChannelSink, JsonLinesSink, LogSink, NullSink, ProgressEvent, ProgressSink, ProgressTracker,
};
pub use runner::{CommandOutput, CommandRunner, Invocation, SystemRunner};
pub use types::{
    BackendKind, ExecPolicy, Mode, Operation, OperationKind, OperationList, OperationStep,
    PackageEntry, StepKey,
};
