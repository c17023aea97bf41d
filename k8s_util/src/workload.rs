use std::fmt;

use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment, StatefulSet},
    core::v1::{Pod, PodSpec},
};

/// The workload kinds whose pod specs are scanned for references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Pod,
    Deployment,
    DaemonSet,
    StatefulSet,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 4] = [
        WorkloadKind::Pod,
        WorkloadKind::Deployment,
        WorkloadKind::DaemonSet,
        WorkloadKind::StatefulSet,
    ];
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkloadKind::Pod => "Pod",
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::StatefulSet => "StatefulSet",
        };
        f.write_str(name)
    }
}

/// Anything that carries a pod spec, either directly (bare pods) or through a
/// pod template (controllers).
///
/// Every level of nesting is optional in the API types, so the spec may be
/// absent; such objects contribute no references.
pub trait Workload {
    const KIND: WorkloadKind;

    fn into_pod_spec(self) -> Option<PodSpec>;
}

impl Workload for Pod {
    const KIND: WorkloadKind = WorkloadKind::Pod;

    fn into_pod_spec(self) -> Option<PodSpec> {
        self.spec
    }
}

impl Workload for Deployment {
    const KIND: WorkloadKind = WorkloadKind::Deployment;

    fn into_pod_spec(self) -> Option<PodSpec> {
        self.spec?.template.spec
    }
}

impl Workload for DaemonSet {
    const KIND: WorkloadKind = WorkloadKind::DaemonSet;

    fn into_pod_spec(self) -> Option<PodSpec> {
        self.spec?.template.spec
    }
}

impl Workload for StatefulSet {
    const KIND: WorkloadKind = WorkloadKind::StatefulSet;

    fn into_pod_spec(self) -> Option<PodSpec> {
        self.spec?.template.spec
    }
}

/// Drops objects without a spec and keeps the pod specs of the rest.
pub fn pod_specs<W: Workload>(items: Vec<W>) -> Vec<PodSpec> {
    items.into_iter().filter_map(W::into_pod_spec).collect()
}
