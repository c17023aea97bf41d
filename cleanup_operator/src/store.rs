//! The operator's view of the cluster
//!
//! The cleanup logic only talks to these traits, which keeps it testable with
//! mocks. The real implementations sit on top of `k8s_util::apis`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, PodSpec, Secret};
use k8s_util::{
    apis::{is_not_found, Apis, Cluster},
    references::{service_account_secret_names, ResourceKind},
    workload::WorkloadKind,
};
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams},
    Api, ResourceExt,
};
use log::debug;

use crate::config::{annotations, trigger_requested, CONFIG_MAP_NAME};
use crate::crd::{Cleanup, CleanupStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// Someone else removed it first
    AlreadyGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerClear {
    Cleared,
    /// The annotation was no longer `now` when we looked
    NotSet,
    /// The configuration ConfigMap does not exist
    Missing,
    /// The ConfigMap changed since the observation the trigger came from
    Superseded,
}

/// Reads and deletions within one namespace.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NamespaceStore: Send + Sync {
    /// Called before each reference scan; drops anything cached by the last one.
    fn begin_scan(&self);

    async fn list_pod_specs(&self, kind: WorkloadKind) -> kube::Result<Vec<PodSpec>>;

    /// Secrets listed by a service account, `None` when it cannot be read.
    async fn service_account_secrets(&self, name: &str) -> kube::Result<Option<Vec<String>>>;

    async fn list_secrets(&self) -> kube::Result<Vec<Secret>>;

    async fn list_config_maps(&self) -> kube::Result<Vec<ConfigMap>>;

    async fn delete(&self, kind: ResourceKind, name: &str) -> kube::Result<DeleteOutcome>;
}

/// Cluster wide operations of the operator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    fn namespace_store(&self, namespace: &str) -> Arc<dyn NamespaceStore>;

    /// The configuration ConfigMap, `None` if it does not exist.
    async fn fetch_config_map(&self) -> kube::Result<Option<ConfigMap>>;

    /// Removes the manual trigger annotation from the configuration ConfigMap.
    ///
    /// With a `resource_version` the removal only applies to that exact
    /// version of the object, a newer `now` is never wiped.
    async fn clear_trigger(
        &self,
        resource_version: Option<String>,
        consumed_at: DateTime<Utc>,
    ) -> kube::Result<TriggerClear>;

    /// Records the outcome of the cycle a new `Cleanup` requested.
    async fn acknowledge_cleanup(
        &self,
        cleanup: &Cleanup,
        status: CleanupStatus,
    ) -> kube::Result<()>;
}

#[async_trait]
impl NamespaceStore for Apis {
    fn begin_scan(&self) {
        self.service_account.clear();
    }

    async fn list_pod_specs(&self, kind: WorkloadKind) -> kube::Result<Vec<PodSpec>> {
        Apis::list_pod_specs(self, kind).await
    }

    async fn service_account_secrets(&self, name: &str) -> kube::Result<Option<Vec<String>>> {
        let sa = self.service_account.get_opt_cached(name).await?;
        Ok(sa.map(|sa| {
            service_account_secret_names(&sa)
                .map(str::to_owned)
                .collect()
        }))
    }

    async fn list_secrets(&self) -> kube::Result<Vec<Secret>> {
        Ok(self.secret.list(&ListParams::default()).await?.items)
    }

    async fn list_config_maps(&self) -> kube::Result<Vec<ConfigMap>> {
        Ok(self.config_map.list(&ListParams::default()).await?.items)
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> kube::Result<DeleteOutcome> {
        let params = DeleteParams::default();
        let result = match kind {
            ResourceKind::Secret => self.secret.delete(name, &params).await.map(|_| ()),
            ResourceKind::ConfigMap => self.config_map.delete(name, &params).await.map(|_| ()),
        };
        match result {
            Ok(()) => Ok(DeleteOutcome::Deleted),
            Err(err) if is_not_found(&err) => Ok(DeleteOutcome::AlreadyGone),
            Err(err) => Err(err),
        }
    }
}

/// [`ClusterBackend`] talking to a real cluster.
pub struct KubeBackend {
    cluster: Arc<Cluster>,
    config_namespace: String,
}

impl KubeBackend {
    pub fn new(cluster: Arc<Cluster>, config_namespace: &str) -> Self {
        KubeBackend {
            cluster,
            config_namespace: config_namespace.to_owned(),
        }
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        self.cluster
            .get_namespace(&self.config_namespace)
            .config_map
            .clone()
    }
}

#[async_trait]
impl ClusterBackend for KubeBackend {
    fn namespace_store(&self, namespace: &str) -> Arc<dyn NamespaceStore> {
        self.cluster.get_namespace(namespace)
    }

    async fn fetch_config_map(&self) -> kube::Result<Option<ConfigMap>> {
        self.config_maps().get_opt(CONFIG_MAP_NAME).await
    }

    async fn clear_trigger(
        &self,
        resource_version: Option<String>,
        consumed_at: DateTime<Utc>,
    ) -> kube::Result<TriggerClear> {
        let api = self.config_maps();
        let Some(current) = api.get_opt(CONFIG_MAP_NAME).await? else {
            return Ok(TriggerClear::Missing);
        };
        if resource_version.is_some() && current.metadata.resource_version != resource_version {
            debug!(
                "{} changed since the trigger was observed, not clearing",
                CONFIG_MAP_NAME
            );
            return Ok(TriggerClear::Superseded);
        }
        if !trigger_requested(&current) {
            debug!("trigger annotation already gone from {}", CONFIG_MAP_NAME);
            return Ok(TriggerClear::NotSet);
        }

        let patch = trigger_clear_patch(resource_version.as_deref(), consumed_at);
        match api
            .patch(CONFIG_MAP_NAME, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(TriggerClear::Cleared),
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(TriggerClear::Superseded),
            Err(err) => Err(err),
        }
    }

    async fn acknowledge_cleanup(
        &self,
        cleanup: &Cleanup,
        status: CleanupStatus,
    ) -> kube::Result<()> {
        let namespace = cleanup.namespace().unwrap_or_default();
        let api: Api<Cleanup> = Api::namespaced(self.cluster.client.clone(), &namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(
            &cleanup.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

/// Merge patch dropping the trigger annotation and stamping the consumption
/// time. A merge patch touches only these keys, concurrent edits to the rest
/// of the object survive. The resourceVersion makes the API server reject the
/// patch with a conflict once the object has moved on.
fn trigger_clear_patch(
    resource_version: Option<&str>,
    consumed_at: DateTime<Utc>,
) -> serde_json::Value {
    let mut changes = serde_json::Map::new();
    changes.insert(annotations::TRIGGER.to_owned(), serde_json::Value::Null);
    changes.insert(
        annotations::LAST_TRIGGERED.to_owned(),
        consumed_at.to_rfc3339().into(),
    );
    let mut metadata = serde_json::Map::new();
    metadata.insert("annotations".to_owned(), changes.into());
    if let Some(version) = resource_version {
        metadata.insert("resourceVersion".to_owned(), version.into());
    }
    serde_json::json!({ "metadata": metadata })
}
