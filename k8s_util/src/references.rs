//! Finds the Secret and ConfigMap names a pod spec depends on.
//!
//! Everything here is a pure walk over `k8s-openapi` types; resolving the
//! service account a spec runs as is left to the caller, which needs the API.

use std::{collections::HashSet, fmt};

use k8s_openapi::api::core::v1::{
    EnvFromSource, EnvVar, EnvVarSource, PodSpec, ServiceAccount, Volume,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Secret,
    ConfigMap,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Secret => f.write_str("secret"),
            ResourceKind::ConfigMap => f.write_str("configmap"),
        }
    }
}

/// Deduplicated set of referenced names, one namespace's worth.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReferenceSet {
    secrets: HashSet<String>,
    config_maps: HashSet<String>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty names are never inserted; the API defaults unset references to "".
    pub fn insert(&mut self, kind: ResourceKind, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        let set = match kind {
            ResourceKind::Secret => &mut self.secrets,
            ResourceKind::ConfigMap => &mut self.config_maps,
        };
        set.insert(name.to_owned())
    }

    pub fn insert_secret(&mut self, name: &str) -> bool {
        self.insert(ResourceKind::Secret, name)
    }

    pub fn insert_config_map(&mut self, name: &str) -> bool {
        self.insert(ResourceKind::ConfigMap, name)
    }

    pub fn contains(&self, kind: ResourceKind, name: &str) -> bool {
        match kind {
            ResourceKind::Secret => self.secrets.contains(name),
            ResourceKind::ConfigMap => self.config_maps.contains(name),
        }
    }

    pub fn secret_count(&self) -> usize {
        self.secrets.len()
    }

    pub fn config_map_count(&self) -> usize {
        self.config_maps.len()
    }

    pub fn len(&self) -> usize {
        self.secrets.len() + self.config_maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Adds every Secret/ConfigMap referenced by volumes, container environments
/// and image pull secrets of `pod_spec` to `out`.
///
/// The service account is not followed here, see [`pod_spec_service_account`].
pub fn collect_pod_spec_references(pod_spec: &PodSpec, out: &mut ReferenceSet) {
    for volume in pod_spec.volumes.iter().flat_map(|v| v.iter()) {
        collect_volume_references(volume, out);
    }

    for container in pod_spec
        .containers
        .iter()
        .chain(pod_spec.init_containers.iter().flat_map(|v| v.iter()))
    {
        collect_env_references(&container.env, &container.env_from, out);
    }
    for container in pod_spec.ephemeral_containers.iter().flat_map(|v| v.iter()) {
        collect_env_references(&container.env, &container.env_from, out);
    }

    for pull_secret in pod_spec.image_pull_secrets.iter().flat_map(|v| v.iter()) {
        out.insert_secret(&pull_secret.name);
    }
}

fn collect_volume_references(volume: &Volume, out: &mut ReferenceSet) {
    if let Some(secret) = &volume.secret {
        if let Some(name) = &secret.secret_name {
            out.insert_secret(name);
        }
    }

    if let Some(config_map) = &volume.config_map {
        out.insert_config_map(&config_map.name);
    }

    if let Some(projected) = &volume.projected {
        for source in projected.sources.iter().flat_map(|v| v.iter()) {
            if let Some(secret) = &source.secret {
                out.insert_secret(&secret.name);
            }
            if let Some(config_map) = &source.config_map {
                out.insert_config_map(&config_map.name);
            }
        }
    }

    // Volume plugins that authenticate with a secret of their own.
    let plugin_secrets = [
        volume.csi.as_ref().and_then(|v| v.node_publish_secret_ref.as_ref()),
        volume.flex_volume.as_ref().and_then(|v| v.secret_ref.as_ref()),
        volume.cephfs.as_ref().and_then(|v| v.secret_ref.as_ref()),
        volume.rbd.as_ref().and_then(|v| v.secret_ref.as_ref()),
        volume.iscsi.as_ref().and_then(|v| v.secret_ref.as_ref()),
    ];
    for secret_ref in plugin_secrets.into_iter().flatten() {
        out.insert_secret(&secret_ref.name);
    }
    if let Some(azure_file) = &volume.azure_file {
        out.insert_secret(&azure_file.secret_name);
    }
}

/// Adds the names behind `env[].valueFrom` key references and `envFrom`
/// sources.
pub fn collect_env_references(
    env: &Option<Vec<EnvVar>>,
    env_from: &Option<Vec<EnvFromSource>>,
    out: &mut ReferenceSet,
) {
    for source in env_from.iter().flat_map(|v| v.iter()) {
        if let Some(cm_ref) = &source.config_map_ref {
            out.insert_config_map(&cm_ref.name);
        }
        if let Some(sec_ref) = &source.secret_ref {
            out.insert_secret(&sec_ref.name);
        }
    }

    for var in env.iter().flat_map(|v| v.iter()) {
        if let Some(from) = &var.value_from {
            collect_env_var_source(from, out);
        }
    }
}

fn collect_env_var_source(source: &EnvVarSource, out: &mut ReferenceSet) {
    if let Some(cm_ref) = &source.config_map_key_ref {
        out.insert_config_map(&cm_ref.name);
    }
    if let Some(s_ref) = &source.secret_key_ref {
        out.insert_secret(&s_ref.name);
    }
}

/// The service account a pod spec runs as, if one is named explicitly.
///
/// Falls back to the deprecated `serviceAccount` field.
pub fn pod_spec_service_account(pod_spec: &PodSpec) -> Option<&str> {
    pod_spec
        .service_account_name
        .as_deref()
        .or(pod_spec.service_account.as_deref())
        .filter(|name| !name.is_empty())
}

/// Every secret a service account lists, generic and image pull secrets alike.
pub fn service_account_secret_names(sa: &ServiceAccount) -> impl Iterator<Item = &str> {
    let secrets = sa
        .secrets
        .iter()
        .flat_map(|v| v.iter())
        .filter_map(|r| r.name.as_deref());
    let pull_secrets = sa
        .image_pull_secrets
        .iter()
        .flat_map(|v| v.iter())
        .map(|r| r.name.as_str());
    secrets.chain(pull_secrets)
}
