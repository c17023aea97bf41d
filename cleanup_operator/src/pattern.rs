//! Shell-style name patterns
//!
//! Supports `*`, `?`, `[abc]`, `[a-z]` and `[!abc]`, matched against the whole
//! name. Resource names never contain `/`, so there is no path semantics.

use glob::{MatchOptions, Pattern};
use log::warn;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
pub struct NamePattern {
    source: String,
    /// `None` when `source` is not a valid pattern; it then only matches itself.
    compiled: Option<Pattern>,
}

impl NamePattern {
    pub fn new(source: &str) -> Self {
        let compiled = match Pattern::new(&collapse_stars(source)) {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                warn!(
                    "invalid exclusion pattern {:?} ({}), matching it literally",
                    source, err.msg
                );
                None
            }
        };
        NamePattern {
            source: source.to_owned(),
            compiled,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, name: &str) -> bool {
        match &self.compiled {
            Some(pattern) => pattern.matches_with(name, MATCH_OPTIONS),
            None => self.source == name,
        }
    }
}

/// `**` has a recursive meaning to `glob` and is rejected outside a path
/// component; for flat names it is the same as `*`.
fn collapse_stars(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut prev_star = false;
    for c in source.chars() {
        if c == '*' && prev_star {
            continue;
        }
        prev_star = c == '*';
        out.push(c);
    }
    out
}

/// Returns the first pattern that matches `name`.
pub fn first_match<'a>(patterns: &'a [NamePattern], name: &str) -> Option<&'a NamePattern> {
    patterns.iter().find(|p| p.matches(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_star() {
        let pattern = NamePattern::new("kube-*");
        assert!(pattern.matches("kube-root-ca.crt"));
        assert!(pattern.matches("kube-"));
        assert!(!pattern.matches("my-kube-config"));
        assert!(!pattern.matches("kube"));
    }

    #[test]
    fn test_whole_name_match() {
        let pattern = NamePattern::new("app-config");
        assert!(pattern.matches("app-config"));
        assert!(!pattern.matches("app-config-v2"));
    }

    #[test]
    fn test_question_mark_and_classes() {
        assert!(NamePattern::new("cfg-?").matches("cfg-1"));
        assert!(!NamePattern::new("cfg-?").matches("cfg-10"));
        assert!(NamePattern::new("cfg-[0-9]").matches("cfg-7"));
        assert!(!NamePattern::new("cfg-[0-9]").matches("cfg-x"));
        assert!(NamePattern::new("cfg-[!0-9]").matches("cfg-x"));
    }

    #[test]
    fn test_case_sensitive() {
        assert!(!NamePattern::new("Kube-*").matches("kube-proxy"));
    }

    #[test]
    fn test_double_star() {
        let pattern = NamePattern::new("cache-**-old");
        assert!(pattern.matches("cache-a-b-old"));
    }

    #[test]
    fn test_invalid_pattern_is_literal() {
        let pattern = NamePattern::new("broken[");
        assert!(pattern.matches("broken["));
        assert!(!pattern.matches("broken"));
        assert_eq!(pattern.as_str(), "broken[");
    }

    #[test]
    fn test_first_match() {
        let patterns = vec![NamePattern::new("kube-*"), NamePattern::new("*-ca.crt")];
        let hit = first_match(&patterns, "kube-root-ca.crt").map(NamePattern::as_str);
        assert_eq!(hit, Some("kube-*"));
        assert!(first_match(&patterns, "app").is_none());
        assert!(first_match(&[], "app").is_none());
    }
}
