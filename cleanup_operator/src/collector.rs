//! Reference collection: the mark phase
//!
//! Walks every workload in a namespace and gathers the Secret and ConfigMap
//! names they reach, including secrets listed by the service accounts the
//! workloads run as.

use k8s_util::{
    references::{collect_pod_spec_references, pod_spec_service_account, ReferenceSet},
    workload::WorkloadKind,
};
use log::{debug, error, warn};
use thiserror::Error;

use crate::store::NamespaceStore;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to list {kind}s: {source}")]
    ListWorkloads {
        kind: WorkloadKind,
        #[source]
        source: kube::Error,
    },
    #[error("failed to read service account {name}: {source}")]
    ServiceAccount {
        name: String,
        #[source]
        source: kube::Error,
    },
}

#[derive(Debug, Default)]
pub struct ReferenceScan {
    pub references: ReferenceSet,
    /// Sub-calls that failed; the reference set may be missing their share.
    pub failures: Vec<ScanError>,
}

impl ReferenceScan {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

pub async fn collect_references(store: &dyn NamespaceStore, namespace: &str) -> ReferenceScan {
    store.begin_scan();
    let mut scan = ReferenceScan::default();

    for kind in WorkloadKind::ALL {
        let specs = match store.list_pod_specs(kind).await {
            Ok(specs) => specs,
            Err(source) => {
                error!(
                    "Error listing {}s in namespace {}: {}",
                    kind, namespace, source
                );
                scan.failures.push(ScanError::ListWorkloads { kind, source });
                continue;
            }
        };

        for spec in &specs {
            collect_pod_spec_references(spec, &mut scan.references);

            let Some(sa_name) = pod_spec_service_account(spec) else {
                continue;
            };
            match store.service_account_secrets(sa_name).await {
                Ok(Some(secrets)) => {
                    for secret in &secrets {
                        scan.references.insert_secret(secret);
                    }
                }
                Ok(None) => {
                    debug!(
                        "service account {}/{} not readable, no secrets added",
                        namespace, sa_name
                    );
                }
                Err(source) => {
                    warn!(
                        "Error reading service account {}/{}: {}",
                        namespace, sa_name, source
                    );
                    scan.failures.push(ScanError::ServiceAccount {
                        name: sa_name.to_owned(),
                        source,
                    });
                }
            }
        }
    }

    debug!(
        "namespace {}: {} secrets and {} configmaps referenced",
        namespace,
        scan.references.secret_count(),
        scan.references.config_map_count()
    );

    scan
}
