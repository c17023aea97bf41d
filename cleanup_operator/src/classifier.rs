//! Staleness classification
//!
//! Sorts every Secret and ConfigMap of a namespace into excluded, referenced,
//! too young or eligible. Only eligible resources become deletion candidates.

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_util::references::{ReferenceSet, ResourceKind};
use kube::api::ObjectMeta;
use log::debug;

use crate::exclusion::ExclusionFilter;

/// Secret types managed by the platform itself.
pub const SYSTEM_SECRET_TYPES: [&str; 3] = [
    "kubernetes.io/service-account-token",
    "kubernetes.io/dockercfg",
    "kubernetes.io/dockerconfigjson",
];

pub fn is_system_secret_type(secret_type: Option<&str>) -> bool {
    secret_type.is_some_and(|t| SYSTEM_SECRET_TYPES.contains(&t))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Excluded,
    Referenced,
    TooYoung,
    Eligible,
}

/// The parts of a Secret or ConfigMap the classifier looks at.
#[derive(Debug, Clone, Copy)]
pub struct ManagedResource<'a> {
    pub kind: ResourceKind,
    pub name: &'a str,
    pub created: Option<DateTime<Utc>>,
    pub secret_type: Option<&'a str>,
}

impl<'a> ManagedResource<'a> {
    fn from_meta(
        kind: ResourceKind,
        meta: &'a ObjectMeta,
        secret_type: Option<&'a str>,
    ) -> Option<Self> {
        Some(ManagedResource {
            kind,
            name: meta.name.as_deref()?,
            created: meta.creation_timestamp.as_ref().map(|t| t.0),
            secret_type,
        })
    }

    pub fn from_secret(secret: &'a Secret) -> Option<Self> {
        Self::from_meta(
            ResourceKind::Secret,
            &secret.metadata,
            secret.type_.as_deref(),
        )
    }

    pub fn from_config_map(config_map: &'a ConfigMap) -> Option<Self> {
        Self::from_meta(ResourceKind::ConfigMap, &config_map.metadata, None)
    }
}

/// Oldest creation time that still counts as too young, `threshold_hours`
/// before `now`.
pub fn cutoff(now: DateTime<Utc>, threshold_hours: u32) -> DateTime<Utc> {
    now.checked_sub_signed(Duration::hours(i64::from(threshold_hours)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub struct StalenessPolicy<'a> {
    pub references: &'a ReferenceSet,
    pub filter: &'a ExclusionFilter,
    /// Fixed once per cycle so every resource is judged against the same time.
    pub cutoff: DateTime<Utc>,
}

impl StalenessPolicy<'_> {
    pub fn classify(&self, resource: &ManagedResource<'_>) -> Classification {
        if let Some(reason) = self.filter.exclusion_reason(resource.name, resource.kind) {
            debug!("{} {} excluded: {}", resource.kind, resource.name, reason);
            return Classification::Excluded;
        }
        if resource.kind == ResourceKind::Secret && is_system_secret_type(resource.secret_type) {
            debug!(
                "{} {} excluded: system type {:?}",
                resource.kind, resource.name, resource.secret_type
            );
            return Classification::Excluded;
        }
        if self.references.contains(resource.kind, resource.name) {
            return Classification::Referenced;
        }
        match resource.created {
            Some(created) if created < self.cutoff => Classification::Eligible,
            _ => Classification::TooYoung,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Candidates {
    pub secrets: Vec<String>,
    pub config_maps: Vec<String>,
}

impl Candidates {
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty() && self.config_maps.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClassificationSummary {
    pub excluded: usize,
    pub referenced: usize,
    pub too_young: usize,
    pub eligible: usize,
}

impl ClassificationSummary {
    fn record(&mut self, class: Classification) {
        match class {
            Classification::Excluded => self.excluded += 1,
            Classification::Referenced => self.referenced += 1,
            Classification::TooYoung => self.too_young += 1,
            Classification::Eligible => self.eligible += 1,
        }
    }
}

/// Returns the deletion candidates, in listing order, and how everything was
/// classified.
pub fn select_candidates(
    policy: &StalenessPolicy<'_>,
    secrets: &[Secret],
    config_maps: &[ConfigMap],
) -> (Candidates, ClassificationSummary) {
    let mut candidates = Candidates::default();
    let mut summary = ClassificationSummary::default();

    for resource in secrets.iter().filter_map(ManagedResource::from_secret) {
        let class = policy.classify(&resource);
        summary.record(class);
        if class == Classification::Eligible {
            candidates.secrets.push(resource.name.to_owned());
        }
    }

    for resource in config_maps.iter().filter_map(ManagedResource::from_config_map) {
        let class = policy.classify(&resource);
        summary.record(class);
        if class == Classification::Eligible {
            candidates.config_maps.push(resource.name.to_owned());
        }
    }

    (candidates, summary)
}
