//! Operator configuration
//!
//! The configuration lives in a ConfigMap as a YAML document and can be
//! overridden by environment variables. A loaded configuration is an immutable
//! snapshot; reloads publish a new snapshot instead of editing the old one.

use std::{collections::HashSet, sync::Arc, time::Duration};

use k8s_openapi::api::core::v1::ConfigMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

/// Name of the ConfigMap holding the operator configuration
pub const CONFIG_MAP_NAME: &str = "cleanup-operator-config";
/// Namespace the configuration ConfigMap is read from unless overridden
pub const DEFAULT_CONFIG_NAMESPACE: &str = "cleanup-system";
/// Key of the YAML document inside the ConfigMap
pub const CONFIG_KEY: &str = "config.yaml";

/// Annotations on the configuration ConfigMap
pub mod annotations {
    /// Manual trigger, acted upon when set to [`TRIGGER_NOW`]
    pub const TRIGGER: &str = "cleanup.operator/trigger";
    pub const TRIGGER_NOW: &str = "now";
    /// Stamped when a manual trigger is consumed
    pub const LAST_TRIGGERED: &str = "cleanup.operator/last-triggered";
}

/// Environment variable overrides
pub mod env {
    /// Comma separated namespace list
    pub const NAMESPACES: &str = "CLEANUP_NAMESPACES";
    /// Cycle interval in seconds
    pub const INTERVAL: &str = "CLEANUP_INTERVAL";
    /// `true` (any case) enables dry run
    pub const DRY_RUN: &str = "DRY_RUN";
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {key}: {source}")]
    Yaml {
        key: &'static str,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Namespaces swept by every cycle
    pub namespaces: Vec<String>,
    /// Seconds between timer-driven cycles
    pub cleanup_interval: u64,
    /// Minimum age before an unreferenced resource may be deleted
    pub unused_threshold_hours: u32,
    /// Log deletions instead of performing them
    pub dry_run: bool,
    /// Glob patterns of names that are never deleted
    pub exclude_patterns: Vec<String>,
    /// Namespaces processed at the same time within one cycle
    pub max_concurrent_namespaces: usize,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespaces: vec!["default".to_string()],
            cleanup_interval: 3600,
            unused_threshold_hours: 1,
            dry_run: false,
            exclude_patterns: vec!["kube-*".to_string(), "default-token-*".to_string()],
            max_concurrent_namespaces: 4,
        }
    }
}

impl OperatorConfig {
    /// Parses the YAML document; keys that are absent keep their defaults.
    pub fn from_yaml(document: &str) -> Result<Self, ConfigError> {
        if document.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(document).map_err(|source| ConfigError::Yaml {
            key: CONFIG_KEY,
            source,
        })
    }

    /// Builds the configuration from the ConfigMap (if there is one) and the
    /// environment.
    pub fn load(
        object: Option<&ConfigMap>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let document = object
            .and_then(|cm| cm.data.as_ref())
            .and_then(|data| data.get(CONFIG_KEY));
        let config = match document {
            Some(document) => Self::from_yaml(document)?,
            None => Self::default(),
        };
        Ok(config.with_env(lookup)?.normalized())
    }

    /// Applies the environment overrides on top of `self`.
    pub fn with_env(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(namespaces) = lookup(env::NAMESPACES) {
            self.namespaces = namespaces
                .split(',')
                .map(str::trim)
                .filter(|ns| !ns.is_empty())
                .map(str::to_owned)
                .collect();
        }
        if let Some(interval) = lookup(env::INTERVAL) {
            self.cleanup_interval = interval
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv {
                    var: env::INTERVAL,
                    value: interval.clone(),
                })?;
        }
        if let Some(dry_run) = lookup(env::DRY_RUN) {
            self.dry_run = dry_run.trim().eq_ignore_ascii_case("true");
        }
        Ok(self)
    }

    fn normalized(mut self) -> Self {
        let mut seen = HashSet::new();
        self.namespaces.retain(|ns| !ns.is_empty() && seen.insert(ns.clone()));
        self.cleanup_interval = self.cleanup_interval.max(1);
        self.max_concurrent_namespaces = self.max_concurrent_namespaces.max(1);
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval.max(1))
    }
}

/// True when the ConfigMap carries the manual trigger annotation set to `now`.
pub fn trigger_requested(object: &ConfigMap) -> bool {
    object
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(annotations::TRIGGER))
        .is_some_and(|value| value == annotations::TRIGGER_NOW)
}

/// Holds the current configuration snapshot.
///
/// Readers take an `Arc` to a snapshot and keep using it even if a reload
/// swaps in a new one meanwhile.
pub struct ConfigStore {
    tx: watch::Sender<Arc<OperatorConfig>>,
}

impl ConfigStore {
    pub fn new(initial: OperatorConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        ConfigStore { tx }
    }

    pub fn snapshot(&self) -> Arc<OperatorConfig> {
        self.tx.borrow().clone()
    }

    pub fn replace(&self, config: OperatorConfig) -> Arc<OperatorConfig> {
        let config = Arc::new(config);
        self.tx.send_replace(config.clone());
        config
    }

    /// Notified whenever a new snapshot is published.
    pub fn subscribe(&self) -> watch::Receiver<Arc<OperatorConfig>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn config_map(document: &str) -> ConfigMap {
        ConfigMap {
            data: Some(BTreeMap::from([(
                CONFIG_KEY.to_string(),
                document.to_string(),
            )])),
            ..Default::default()
        }
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
namespaces:
  - ns1
  - ns2
cleanup_interval: 600
unused_threshold_hours: 24
dry_run: true
exclude_patterns:
  - "kube-*"
  - "keep-*"
"#;
        let config = OperatorConfig::from_yaml(yaml).expect("test YAML should parse successfully");
        assert_eq!(config.namespaces, vec!["ns1", "ns2"]);
        assert_eq!(config.cleanup_interval, 600);
        assert_eq!(config.unused_threshold_hours, 24);
        assert!(config.dry_run);
        assert_eq!(config.exclude_patterns, vec!["kube-*", "keep-*"]);
        assert_eq!(config.max_concurrent_namespaces, 4);
    }

    #[test]
    fn test_missing_keys_use_defaults() {
        let config = OperatorConfig::from_yaml("dry_run: true\nunknown_option: 5\n")
            .expect("test YAML should parse successfully");
        assert!(config.dry_run);
        assert_eq!(config.namespaces, vec!["default"]);
        assert_eq!(config.cleanup_interval, 3600);
        assert_eq!(config.unused_threshold_hours, 1);
        assert_eq!(config.exclude_patterns, vec!["kube-*", "default-token-*"]);

        assert_eq!(
            OperatorConfig::from_yaml("  \n").expect("empty document is allowed"),
            OperatorConfig::default()
        );
    }

    #[test]
    fn test_invalid_yaml() {
        let err = OperatorConfig::from_yaml("cleanup_interval: soon").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml { .. }));
    }

    #[test]
    fn test_env_overrides_file() {
        let cm = config_map("namespaces: [from-file]\ncleanup_interval: 60\n");
        let env = env_from(&[
            (env::NAMESPACES, " a, b ,,a "),
            (env::INTERVAL, "120"),
            (env::DRY_RUN, "TRUE"),
        ]);

        let config = OperatorConfig::load(Some(&cm), env).expect("config loads");
        assert_eq!(config.namespaces, vec!["a", "b"]);
        assert_eq!(config.cleanup_interval, 120);
        assert!(config.dry_run);
    }

    #[test]
    fn test_dry_run_env_only_true_enables() {
        let yes = OperatorConfig::default()
            .with_env(env_from(&[(env::DRY_RUN, "True")]))
            .expect("valid env");
        assert!(yes.dry_run);

        let file_says_yes = OperatorConfig {
            dry_run: true,
            ..Default::default()
        };
        let no = file_says_yes
            .with_env(env_from(&[(env::DRY_RUN, "yes")]))
            .expect("valid env");
        assert!(!no.dry_run);
    }

    #[test]
    fn test_invalid_interval_env() {
        let err = OperatorConfig::default()
            .with_env(env_from(&[(env::INTERVAL, "hourly")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: env::INTERVAL, .. }));
    }

    #[test]
    fn test_load_without_config_map() {
        let config = OperatorConfig::load(None, no_env).expect("defaults load");
        assert_eq!(config, OperatorConfig::default());

        let no_key = ConfigMap::default();
        let config = OperatorConfig::load(Some(&no_key), no_env).expect("defaults load");
        assert_eq!(config, OperatorConfig::default());
    }

    #[test]
    fn test_normalized_bounds() {
        let cm = config_map("cleanup_interval: 0\nmax_concurrent_namespaces: 0\n");
        let config = OperatorConfig::load(Some(&cm), no_env).expect("config loads");
        assert_eq!(config.cleanup_interval, 1);
        assert_eq!(config.max_concurrent_namespaces, 1);
        assert_eq!(config.interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_trigger_requested() {
        let mut cm = ConfigMap::default();
        assert!(!trigger_requested(&cm));

        cm.metadata.annotations = Some(BTreeMap::from([(
            annotations::TRIGGER.to_string(),
            "later".to_string(),
        )]));
        assert!(!trigger_requested(&cm));

        cm.metadata.annotations = Some(BTreeMap::from([(
            annotations::TRIGGER.to_string(),
            "now".to_string(),
        )]));
        assert!(trigger_requested(&cm));
    }

    #[test]
    fn test_store_replaces_snapshot() {
        let store = ConfigStore::new(OperatorConfig::default());
        let before = store.snapshot();
        let mut rx = store.subscribe();

        store.replace(OperatorConfig {
            dry_run: true,
            ..Default::default()
        });

        assert!(!before.dry_run);
        assert!(store.snapshot().dry_run);
        assert!(rx.has_changed().expect("sender alive"));
        assert!(rx.borrow_and_update().dry_run);
    }
}
