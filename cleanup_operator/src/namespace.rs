//! One namespace's sweep: collect, classify, delete

use anyhow::Context;
use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::classifier::{cutoff, select_candidates, StalenessPolicy};
use crate::collector::collect_references;
use crate::config::OperatorConfig;
use crate::exclusion::ExclusionFilter;
use crate::executor::{execute, CleanupResult};
use crate::store::NamespaceStore;

/// Everything a cycle decides once and shares between its namespaces.
pub struct CycleSettings {
    pub filter: ExclusionFilter,
    pub cutoff: DateTime<Utc>,
    pub dry_run: bool,
}

impl CycleSettings {
    pub fn new(config: &OperatorConfig, now: DateTime<Utc>) -> Self {
        CycleSettings {
            filter: ExclusionFilter::new(&config.exclude_patterns),
            cutoff: cutoff(now, config.unused_threshold_hours),
            dry_run: config.dry_run,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceOutcome {
    Cleaned(CleanupResult),
    /// Reference collection was incomplete, nothing was deleted
    Skipped { reasons: Vec<String> },
    Failed(String),
    /// Shutdown was requested before the namespace was started
    Cancelled,
}

impl NamespaceOutcome {
    pub fn result(&self) -> CleanupResult {
        match self {
            NamespaceOutcome::Cleaned(result) => *result,
            _ => CleanupResult::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceReport {
    pub namespace: String,
    pub outcome: NamespaceOutcome,
}

pub async fn cleanup_namespace(
    store: &dyn NamespaceStore,
    namespace: &str,
    settings: &CycleSettings,
) -> anyhow::Result<NamespaceOutcome> {
    let scan = collect_references(store, namespace).await;
    if !scan.is_complete() {
        let reasons: Vec<String> = scan.failures.iter().map(ToString::to_string).collect();
        warn!(
            "Skipping deletions in namespace {}, reference scan incomplete: {}",
            namespace,
            reasons.join("; ")
        );
        return Ok(NamespaceOutcome::Skipped { reasons });
    }

    let secrets = store
        .list_secrets()
        .await
        .with_context(|| format!("failed to list secrets in namespace {}", namespace))?;
    let config_maps = store
        .list_config_maps()
        .await
        .with_context(|| format!("failed to list configmaps in namespace {}", namespace))?;

    let policy = StalenessPolicy {
        references: &scan.references,
        filter: &settings.filter,
        cutoff: settings.cutoff,
    };
    let (candidates, summary) = select_candidates(&policy, &secrets, &config_maps);
    info!(
        "Namespace {}: {} eligible, {} referenced, {} excluded, {} too young",
        namespace, summary.eligible, summary.referenced, summary.excluded, summary.too_young
    );

    if candidates.is_empty() {
        return Ok(NamespaceOutcome::Cleaned(CleanupResult::default()));
    }

    let result = execute(store, namespace, &candidates, settings.dry_run).await;
    Ok(NamespaceOutcome::Cleaned(result))
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use k8s_openapi::{
        api::core::v1::{
            ConfigMap, ConfigMapVolumeSource, Container, EnvFromSource, PodSpec, Secret,
            SecretEnvSource, Volume,
        },
        apimachinery::pkg::apis::meta::v1::Time,
    };
    use k8s_util::{references::ResourceKind, workload::WorkloadKind};
    use kube::{api::ObjectMeta, error::ErrorResponse};
    use mockall::predicate::eq;

    use super::*;
    use crate::store::{DeleteOutcome, MockNamespaceStore};

    fn meta(name: &str, age_hours: i64) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            creation_timestamp: Some(Time(Utc::now() - Duration::hours(age_hours))),
            ..Default::default()
        }
    }

    fn deployment_spec() -> PodSpec {
        PodSpec {
            volumes: Some(vec![Volume {
                name: "config".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: "app-config".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            containers: vec![Container {
                name: "app".to_string(),
                env_from: Some(vec![EnvFromSource {
                    secret_ref: Some(SecretEnvSource {
                        name: "db-creds".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn scenario_store() -> MockNamespaceStore {
        let mut store = MockNamespaceStore::new();
        store.expect_begin_scan().return_const(());
        store.expect_list_pod_specs().returning(|kind| match kind {
            WorkloadKind::Deployment => Ok(vec![deployment_spec()]),
            _ => Ok(vec![]),
        });
        store.expect_list_secrets().returning(|| {
            Ok(vec![
                Secret {
                    metadata: meta("db-creds", 3),
                    type_: Some("Opaque".to_string()),
                    ..Default::default()
                },
                Secret {
                    metadata: meta("orphan-secret", 3),
                    type_: Some("Opaque".to_string()),
                    ..Default::default()
                },
            ])
        });
        store.expect_list_config_maps().returning(|| {
            Ok(["app-config", "orphan-cm", "kube-root-ca.crt"]
                .into_iter()
                .map(|name| ConfigMap {
                    metadata: meta(name, 3),
                    ..Default::default()
                })
                .collect())
        });
        store
    }

    fn settings(dry_run: bool) -> CycleSettings {
        let config = OperatorConfig {
            dry_run,
            ..Default::default()
        };
        CycleSettings::new(&config, Utc::now())
    }

    #[tokio::test]
    async fn test_deletes_only_orphans() {
        let mut store = scenario_store();
        store
            .expect_delete()
            .with(eq(ResourceKind::Secret), eq("orphan-secret"))
            .times(1)
            .returning(|_, _| Ok(DeleteOutcome::Deleted));
        store
            .expect_delete()
            .with(eq(ResourceKind::ConfigMap), eq("orphan-cm"))
            .times(1)
            .returning(|_, _| Ok(DeleteOutcome::Deleted));

        let outcome = cleanup_namespace(&store, "ns1", &settings(false))
            .await
            .expect("namespace processed");

        assert_eq!(
            outcome,
            NamespaceOutcome::Cleaned(CleanupResult {
                secrets_deleted: 1,
                configmaps_deleted: 1,
            })
        );
    }

    #[tokio::test]
    async fn test_dry_run_reports_same_counts() {
        let mut store = scenario_store();
        store.expect_delete().never();

        let outcome = cleanup_namespace(&store, "ns1", &settings(true))
            .await
            .expect("namespace processed");

        assert_eq!(
            outcome.result(),
            CleanupResult {
                secrets_deleted: 1,
                configmaps_deleted: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_incomplete_scan_skips_deletion() {
        let mut store = MockNamespaceStore::new();
        store.expect_begin_scan().return_const(());
        store.expect_list_pod_specs().returning(|kind| match kind {
            WorkloadKind::DaemonSet => Err(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: "etcd timeout".to_string(),
                reason: "Timeout".to_string(),
                code: 504,
            })),
            _ => Ok(vec![]),
        });
        store.expect_list_secrets().never();
        store.expect_list_config_maps().never();
        store.expect_delete().never();

        let outcome = cleanup_namespace(&store, "ns1", &settings(false))
            .await
            .expect("namespace processed");

        match outcome {
            NamespaceOutcome::Skipped { reasons } => {
                assert_eq!(reasons.len(), 1);
                assert!(reasons[0].contains("DaemonSet"), "{}", reasons[0]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_secret_listing_failure_is_an_error() {
        let mut store = MockNamespaceStore::new();
        store.expect_begin_scan().return_const(());
        store.expect_list_pod_specs().returning(|_| Ok(vec![]));
        store.expect_list_secrets().returning(|| {
            Err(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: "forbidden".to_string(),
                reason: "Forbidden".to_string(),
                code: 403,
            }))
        });
        store.expect_delete().never();

        let err = cleanup_namespace(&store, "ns1", &settings(false))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("ns1"));
    }
}
