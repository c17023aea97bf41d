//! Name based protection from cleanup

use std::fmt;

use k8s_util::references::ResourceKind;

use crate::pattern::{first_match, NamePattern};

/// Secrets created for the default service account before token projection.
pub const DEFAULT_TOKEN_PREFIX: &str = "default-token-";
/// Any secret named like a token is assumed to be one.
pub const TOKEN_SUFFIX: &str = "-token";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExclusionReason {
    /// Matched a configured pattern
    Pattern(String),
    /// Secret named like a service account token
    TokenName,
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusionReason::Pattern(pattern) => write!(f, "matches pattern {:?}", pattern),
            ExclusionReason::TokenName => f.write_str("token secret name"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExclusionFilter {
    patterns: Vec<NamePattern>,
}

impl ExclusionFilter {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        ExclusionFilter {
            patterns: patterns.iter().map(|p| NamePattern::new(p.as_ref())).collect(),
        }
    }

    pub fn is_excluded(&self, name: &str, kind: ResourceKind) -> bool {
        self.exclusion_reason(name, kind).is_some()
    }

    pub fn exclusion_reason(&self, name: &str, kind: ResourceKind) -> Option<ExclusionReason> {
        if let Some(pattern) = first_match(&self.patterns, name) {
            return Some(ExclusionReason::Pattern(pattern.as_str().to_owned()));
        }

        if kind == ResourceKind::Secret
            && (name.starts_with(DEFAULT_TOKEN_PREFIX) || name.ends_with(TOKEN_SUFFIX))
        {
            return Some(ExclusionReason::TokenName);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_filter() -> ExclusionFilter {
        ExclusionFilter::new(&["kube-*", "default-token-*"])
    }

    #[test]
    fn test_configured_patterns_apply_to_both_kinds() {
        let filter = default_filter();
        assert!(filter.is_excluded("kube-root-ca.crt", ResourceKind::ConfigMap));
        assert!(filter.is_excluded("kube-root-ca.crt", ResourceKind::Secret));
        assert!(!filter.is_excluded("orphan-cm", ResourceKind::ConfigMap));
    }

    #[test]
    fn test_token_names_only_protect_secrets() {
        let filter = ExclusionFilter::new::<&str>(&[]);
        assert!(filter.is_excluded("default-token-x7k2p", ResourceKind::Secret));
        assert!(filter.is_excluded("builder-token", ResourceKind::Secret));
        assert!(!filter.is_excluded("builder-token", ResourceKind::ConfigMap));
        assert!(!filter.is_excluded("builder-token-old", ResourceKind::Secret));
    }

    #[test]
    fn test_reason() {
        let filter = default_filter();
        assert_eq!(
            filter.exclusion_reason("kube-proxy", ResourceKind::ConfigMap),
            Some(ExclusionReason::Pattern("kube-*".to_string()))
        );
        assert_eq!(
            filter.exclusion_reason("ci-token", ResourceKind::Secret),
            Some(ExclusionReason::TokenName)
        );
        assert_eq!(
            filter.exclusion_reason("orphan-secret", ResourceKind::Secret),
            None
        );
    }
}
