//! Observation classifier
//!
//! Decides whether a raw (method, URL) observation is a countable user send.
//! Rules are host-scoped: each table maps a [`HostPattern`] to an ordered list
//! of path predicates. Deny is consulted before allow, so noisy sub-paths of a
//! counted host can be carved out without negative lookahead in allow rules.
//!
//! Classification is a pure function of the rule set and its input.

use regex::Regex;
use url::Url;

use crate::config::RulesConfig;
use crate::error::{Error, Result};
use crate::types::Verdict;

const BUILTIN_RULES: &str = include_str!("default_rules.toml");

/// Host side of a rule entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    /// Matches one host exactly
    Exact(String),
    /// `*.domain`: matches `domain` and any host ending in `.domain`
    WildcardSuffix(String),
}

impl HostPattern {
    /// Parse `example.com` or `*.example.com`
    pub fn parse(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim().to_ascii_lowercase();

        let parsed = match pattern.strip_prefix("*.") {
            Some(suffix) => HostPattern::WildcardSuffix(suffix.to_string()),
            None => HostPattern::Exact(pattern.clone()),
        };

        let host = match &parsed {
            HostPattern::Exact(host) | HostPattern::WildcardSuffix(host) => host,
        };
        if host.is_empty() || host.contains('*') || host.contains('/') {
            return Err(Error::Rules(format!("invalid host pattern: {:?}", pattern)));
        }

        Ok(parsed)
    }

    pub fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Exact(exact) => host == exact,
            HostPattern::WildcardSuffix(suffix) => {
                host == suffix
                    || (host.len() > suffix.len()
                        && host.ends_with(suffix.as_str())
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
            }
        }
    }
}

/// One host pattern and the path predicates that apply to it
#[derive(Debug, Clone)]
pub struct HostRule {
    pub pattern: HostPattern,
    pub predicates: Vec<Regex>,
}

impl HostRule {
    fn any_matches(&self, path: &str, path_and_query: &str) -> bool {
        self.predicates
            .iter()
            .any(|re| re.is_match(path) || re.is_match(path_and_query))
    }
}

/// A table of host rules (either the allow or the deny side)
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: Vec<HostRule>,
}

impl RuleTable {
    fn from_entries<'a>(
        entries: impl IntoIterator<Item = (&'a String, &'a Vec<String>)>,
    ) -> Result<Self> {
        let mut rules = Vec::new();
        for (pattern, predicates) in entries {
            let pattern = HostPattern::parse(pattern)?;
            let predicates = predicates
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        Error::Rules(format!("invalid path predicate {:?}: {}", p, e))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            rules.push(HostRule {
                pattern,
                predicates,
            });
        }
        Ok(Self { rules })
    }

    /// Rule entry for a host: exact match first, otherwise the longest
    /// matching wildcard suffix.
    pub fn lookup(&self, host: &str) -> Option<&HostRule> {
        if let Some(rule) = self
            .rules
            .iter()
            .find(|r| matches!(&r.pattern, HostPattern::Exact(h) if h == host))
        {
            return Some(rule);
        }

        self.rules
            .iter()
            .filter_map(|r| match &r.pattern {
                HostPattern::WildcardSuffix(suffix) if r.pattern.matches(host) => {
                    Some((suffix.len(), r))
                }
                _ => None,
            })
            .max_by_key(|(specificity, _)| *specificity)
            .map(|(_, r)| r)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Immutable allow/deny rule set, loaded once at startup
#[derive(Debug, Clone)]
pub struct RuleSet {
    methods: Vec<String>,
    allow: RuleTable,
    deny: RuleTable,
}

impl RuleSet {
    /// Compile a rule set from configuration
    pub fn from_config(config: &RulesConfig) -> Result<Self> {
        if config.methods.is_empty() {
            return Err(Error::Rules("rules.methods must not be empty".to_string()));
        }

        Ok(Self {
            methods: config
                .methods
                .iter()
                .map(|m| m.trim().to_ascii_uppercase())
                .collect(),
            allow: RuleTable::from_entries(&config.allow)?,
            deny: RuleTable::from_entries(&config.deny)?,
        })
    }

    /// The rule set shipped with usagesync
    pub fn builtin() -> Result<Self> {
        let config: RulesConfig = toml::from_str(BUILTIN_RULES)
            .map_err(|e| Error::Rules(format!("failed to parse built-in rules: {}", e)))?;
        Self::from_config(&config)
    }

    /// Use configured rules when present, else the built-in set
    pub fn load(config: Option<&RulesConfig>) -> Result<Self> {
        match config {
            Some(config) => Self::from_config(config),
            None => Self::builtin(),
        }
    }

    pub fn allow(&self) -> &RuleTable {
        &self.allow
    }

    pub fn deny(&self) -> &RuleTable {
        &self.deny
    }

    /// Classify a request
    pub fn classify(&self, method: &str, url: &Url) -> Verdict {
        if !self.methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
            return Verdict::NotAllowlisted;
        }

        let Some(host) = url.host_str() else {
            return Verdict::NotAllowlisted;
        };
        let host = host.to_ascii_lowercase();

        let path = url.path();
        let path_and_query = match url.query() {
            Some(query) => format!("{}?{}", path, query),
            None => path.to_string(),
        };

        if self
            .deny
            .lookup(&host)
            .is_some_and(|rule| rule.any_matches(path, &path_and_query))
        {
            return Verdict::HostDenied;
        }

        match self.allow.lookup(&host) {
            Some(rule) if rule.any_matches(path, &path_and_query) => Verdict::Counted,
            _ => Verdict::NotAllowlisted,
        }
    }

    /// Classify a request given as a string; unparseable URLs are not counted
    pub fn classify_str(&self, method: &str, url: &str) -> Verdict {
        match Url::parse(url) {
            Ok(url) => self.classify(method, &url),
            Err(_) => Verdict::NotAllowlisted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn rules(allow: &[(&str, &[&str])], deny: &[(&str, &[&str])]) -> RuleSet {
        let table = |entries: &[(&str, &[&str])]| -> BTreeMap<String, Vec<String>> {
            entries
                .iter()
                .map(|(host, preds)| {
                    (
                        host.to_string(),
                        preds.iter().map(|p| p.to_string()).collect(),
                    )
                })
                .collect()
        };
        RuleSet::from_config(&RulesConfig {
            methods: vec!["POST".to_string()],
            allow: table(allow),
            deny: table(deny),
        })
        .unwrap()
    }

    #[test]
    fn test_host_pattern_parse() {
        assert_eq!(
            HostPattern::parse("*.Example.com").unwrap(),
            HostPattern::WildcardSuffix("example.com".to_string())
        );
        assert_eq!(
            HostPattern::parse("api.example.com").unwrap(),
            HostPattern::Exact("api.example.com".to_string())
        );
        assert!(HostPattern::parse("*").is_err());
        assert!(HostPattern::parse("*.").is_err());
        assert!(HostPattern::parse("a.*.com").is_err());
    }

    #[test]
    fn test_wildcard_is_right_anchored() {
        let pattern = HostPattern::parse("*.example.com").unwrap();
        assert!(pattern.matches("example.com"));
        assert!(pattern.matches("a.example.com"));
        assert!(pattern.matches("a.b.example.com"));
        assert!(!pattern.matches("badexample.com"));
        assert!(!pattern.matches("example.com.evil.net"));
    }

    #[test]
    fn test_only_mutating_methods_are_eligible() {
        let set = rules(&[("a.test", &["^/send$"])], &[]);
        assert_eq!(set.classify_str("POST", "https://a.test/send"), Verdict::Counted);
        assert_eq!(set.classify_str("post", "https://a.test/send"), Verdict::Counted);
        assert_eq!(
            set.classify_str("GET", "https://a.test/send"),
            Verdict::NotAllowlisted
        );
    }

    #[test]
    fn test_method_short_circuits_before_deny() {
        let set = rules(&[], &[("a.test", &["^/"])]);
        assert_eq!(
            set.classify_str("GET", "https://a.test/anything"),
            Verdict::NotAllowlisted
        );
    }

    #[test]
    fn test_unknown_host_is_not_allowlisted() {
        let set = rules(&[("a.test", &["^/send$"])], &[]);
        assert_eq!(
            set.classify_str("POST", "https://b.test/send"),
            Verdict::NotAllowlisted
        );
        assert_eq!(set.classify_str("POST", "not a url"), Verdict::NotAllowlisted);
    }

    #[test]
    fn test_deny_overrides_allow() {
        let set = rules(
            &[("chat.test", &["^/api/"])],
            &[("chat.test", &["^/api/telemetry$"])],
        );
        assert_eq!(
            set.classify_str("POST", "https://chat.test/api/send"),
            Verdict::Counted
        );
        assert_eq!(
            set.classify_str("POST", "https://chat.test/api/telemetry"),
            Verdict::HostDenied
        );
    }

    #[test]
    fn test_predicates_see_path_and_query() {
        let set = rules(
            &[("a.test", &["^/send\\?mode=user$"])],
            &[("a.test", &["dry_run=1"])],
        );
        assert_eq!(
            set.classify_str("POST", "https://a.test/send?mode=user"),
            Verdict::Counted
        );
        assert_eq!(
            set.classify_str("POST", "https://a.test/send?dry_run=1"),
            Verdict::HostDenied
        );
        assert_eq!(
            set.classify_str("POST", "https://a.test/send"),
            Verdict::NotAllowlisted
        );
    }

    #[test]
    fn test_exact_host_beats_wildcard() {
        let set = rules(
            &[("*.a.test", &["^/wild$"]), ("api.a.test", &["^/exact$"])],
            &[],
        );
        assert_eq!(
            set.classify_str("POST", "https://api.a.test/exact"),
            Verdict::Counted
        );
        assert_eq!(
            set.classify_str("POST", "https://api.a.test/wild"),
            Verdict::NotAllowlisted
        );
        assert_eq!(
            set.classify_str("POST", "https://www.a.test/wild"),
            Verdict::Counted
        );
    }

    #[test]
    fn test_most_specific_wildcard_wins() {
        let set = rules(
            &[("*.test", &["^/broad$"]), ("*.a.test", &["^/narrow$"])],
            &[],
        );
        assert_eq!(
            set.classify_str("POST", "https://x.a.test/narrow"),
            Verdict::Counted
        );
        assert_eq!(
            set.classify_str("POST", "https://x.a.test/broad"),
            Verdict::NotAllowlisted
        );
        assert_eq!(
            set.classify_str("POST", "https://x.b.test/broad"),
            Verdict::Counted
        );
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        let mut allow = BTreeMap::new();
        allow.insert("a.test".to_string(), vec!["(".to_string()]);
        let err = RuleSet::from_config(&RulesConfig {
            allow,
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::Rules(_)));
    }

    #[test]
    fn test_builtin_rules() {
        let set = RuleSet::builtin().unwrap();
        assert!(!set.allow().is_empty());
        assert!(!set.deny().is_empty());

        assert_eq!(
            set.classify_str("POST", "https://chatgpt.com/backend-api/conversation"),
            Verdict::Counted
        );
        assert_eq!(
            set.classify_str("POST", "https://chatgpt.com/backend-api/sentinel/chat-requirements"),
            Verdict::HostDenied
        );
        assert_eq!(
            set.classify_str("POST", "https://ab.chatgpt.com/v1/rgstr"),
            Verdict::HostDenied
        );
        assert_eq!(
            set.classify_str("POST", "https://www.perplexity.ai/rest/sse/perplexity_ask"),
            Verdict::Counted
        );
        assert_eq!(
            set.classify_str(
                "POST",
                "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent?key=x"
            ),
            Verdict::Counted
        );
        assert_eq!(
            set.classify_str("GET", "https://chatgpt.com/backend-api/conversation"),
            Verdict::NotAllowlisted
        );
    }
}
