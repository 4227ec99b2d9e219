//! Operation list preprocessing
//!
//! Turns the raw operation list from configuration into the list the
//! dispatcher executes:
//!
//! 1. Routes operations to the backend they were written for (`source` tag)
//! 2. Resolves `${LOCALE}` in every package list
//! 3. Drops install/remove entries the repository index doesn't know,
//!    so a stale or trimmed mirror can't fail the whole transaction
//! 4. Counts the entries left, which is the denominator for progress
//!
//! Nothing is reordered: operations and entries keep their input order.

use crate::index::RepositoryIndex;
use crate::locale;
use crate::types::{BackendKind, Operation, OperationList, OperationStep, PackageEntry, StepKey};
use tracing::{debug, warn};

/// Output of [`preprocess`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preprocessed {
    pub operations: OperationList,
    /// Number of entries across every executable list
    pub total: usize,
}

/// Keep only the operations `backend` is responsible for.
pub fn select_for_backend(operations: OperationList, backend: BackendKind) -> OperationList {
    operations
        .into_iter()
        .filter(|op| {
            let keep = backend.accepts_source(op.source.as_deref());
            if !keep {
                debug!(
                    "{}: skipping operation from source {:?}",
                    backend,
                    op.source.as_deref().unwrap_or_default()
                );
            }
            keep
        })
        .collect()
}

/// Locale-resolve and existence-filter `operations`.
///
/// With `index == None` no existence check happens; only locale resolution
/// and empty-entry dropping apply.
pub fn preprocess(
    operations: &[Operation],
    locale: &str,
    index: Option<&RepositoryIndex>,
) -> Preprocessed {
    let mut result = Preprocessed::default();

    for op in operations {
        let mut new_op = Operation {
            source: op.source.clone(),
            steps: Vec::with_capacity(op.steps.len()),
        };

        for step in &op.steps {
            let localized = locale::resolve(&step.entries, locale);

            let entries = match (&step.key, index) {
                (StepKey::Known(kind), Some(index)) if kind.is_existence_checked() => {
                    filter_entries(&kind.to_string(), localized, index)
                }
                _ => localized,
            };

            if step.executable_kind().is_some() {
                result.total += entries.len();
            }

            new_op.steps.push(OperationStep {
                key: step.key.clone(),
                entries,
            });
        }

        if new_op.has_entries() {
            result.operations.push(new_op);
        } else {
            debug!("dropping operation with no remaining entries: {:?}", op);
        }
    }

    result
}

/// Keep the entries that name a package or group present in `index`.
///
/// Every dropped entry is logged under `action_key`.
pub fn filter_entries(
    action_key: &str,
    entries: Vec<PackageEntry>,
    index: &RepositoryIndex,
) -> Vec<PackageEntry> {
    entries
        .into_iter()
        .filter(|entry| {
            let name = entry.name();
            if name.is_empty() {
                warn!("{}: empty package entry ignored: {:?}", action_key, entry);
                false
            } else if index.contains(name) {
                true
            } else {
                warn!("{}: dropping missing package/group: {}", action_key, name);
                debug!("{}: dropped entry: {:?}", action_key, entry);
                false
            }
        })
        .collect()
}
