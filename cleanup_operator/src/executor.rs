//! Deletes (or pretends to delete) the selected candidates

use std::ops::{Add, AddAssign};

use k8s_util::references::ResourceKind;
use log::{error, info};

use crate::classifier::Candidates;
use crate::store::{DeleteOutcome, NamespaceStore};

/// Deletion counts of one namespace, or of a whole cycle once merged.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupResult {
    pub secrets_deleted: usize,
    pub configmaps_deleted: usize,
}

impl CleanupResult {
    fn record(&mut self, kind: ResourceKind) {
        match kind {
            ResourceKind::Secret => self.secrets_deleted += 1,
            ResourceKind::ConfigMap => self.configmaps_deleted += 1,
        }
    }
}

impl Add for CleanupResult {
    type Output = CleanupResult;

    fn add(self, rhs: CleanupResult) -> CleanupResult {
        CleanupResult {
            secrets_deleted: self.secrets_deleted + rhs.secrets_deleted,
            configmaps_deleted: self.configmaps_deleted + rhs.configmaps_deleted,
        }
    }
}

impl AddAssign for CleanupResult {
    fn add_assign(&mut self, rhs: CleanupResult) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for CleanupResult {
    fn sum<I: Iterator<Item = CleanupResult>>(iter: I) -> Self {
        iter.fold(CleanupResult::default(), Add::add)
    }
}

/// Deletes every candidate independently; a failed delete is logged and not
/// counted. In dry run nothing is sent to the API but the counts are the same
/// as a fully successful live run.
pub async fn execute(
    store: &dyn NamespaceStore,
    namespace: &str,
    candidates: &Candidates,
    dry_run: bool,
) -> CleanupResult {
    let mut result = CleanupResult::default();

    let all = candidates
        .secrets
        .iter()
        .map(|name| (ResourceKind::Secret, name))
        .chain(
            candidates
                .config_maps
                .iter()
                .map(|name| (ResourceKind::ConfigMap, name)),
        );

    for (kind, name) in all {
        if dry_run {
            info!("[DRY RUN] Would delete unused {}: {}/{}", kind, namespace, name);
            result.record(kind);
            continue;
        }

        match store.delete(kind, name).await {
            Ok(DeleteOutcome::Deleted) => {
                info!("Deleted unused {}: {}/{}", kind, namespace, name);
                result.record(kind);
            }
            Ok(DeleteOutcome::AlreadyGone) => {
                info!("Unused {} {}/{} was already gone", kind, namespace, name);
                result.record(kind);
            }
            Err(err) => {
                error!("Failed to delete {} {}/{}: {}", kind, namespace, name, err);
            }
        }
    }

    result
}
