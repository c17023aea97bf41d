//! The `Cleanup` custom resource
//!
//! Creating one requests an immediate cleanup cycle. The spec is informational
//! only; the status records the acknowledgment once the cycle has run.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::executor::CleanupResult;

/// Cleanup spec
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "resources.muntashir.com",
    version = "v1",
    kind = "Cleanup",
    plural = "cleanups",
    namespaced,
    status = "CleanupStatus",
    printcolumn = r#"{"name":"Secrets", "type":"integer", "jsonPath":".status.secretsDeleted"}"#,
    printcolumn = r#"{"name":"ConfigMaps", "type":"integer", "jsonPath":".status.configmapsDeleted"}"#,
    printcolumn = r#"{"name":"Completed", "type":"string", "jsonPath":".status.completedAt"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CleanupSpec {
    /// Why the cleanup was requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Who requested it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
}

/// Cleanup status
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CleanupStatus {
    pub message: String,
    /// Secrets deleted (or that would have been, in dry run) by the cycle
    #[serde(default)]
    pub secrets_deleted: u64,
    /// ConfigMaps deleted (or that would have been, in dry run) by the cycle
    #[serde(default)]
    pub configmaps_deleted: u64,
    #[serde(default)]
    pub dry_run: bool,
    /// RFC 3339 time the triggered cycle finished
    pub completed_at: Option<String>,
}

pub const ACKNOWLEDGED_MESSAGE: &str = "Cleanup triggered manually";

impl CleanupStatus {
    pub fn acknowledged(total: CleanupResult, dry_run: bool, completed_at: DateTime<Utc>) -> Self {
        CleanupStatus {
            message: ACKNOWLEDGED_MESSAGE.to_string(),
            secrets_deleted: total.secrets_deleted as u64,
            configmaps_deleted: total.configmaps_deleted as u64,
            dry_run,
            completed_at: Some(completed_at.to_rfc3339()),
        }
    }
}
