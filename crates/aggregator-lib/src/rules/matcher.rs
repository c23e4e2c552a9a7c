//! Rule predicate evaluation
//!
//! Decides whether a sample is admitted by a rule: name patterns (exact,
//! `*`, or glob), exact label matches, and regex label matches must all
//! hold. Compiled regexes are memoised for the lifetime of the matcher.

use crate::models::{Rule, Sample};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

/// Evaluates rule predicates against samples
pub struct Matcher {
    /// Compiled patterns keyed by their source string; `None` records a
    /// pattern that failed to compile so the rule fails closed without
    /// recompiling on every sample
    cache: Mutex<HashMap<String, Option<Regex>>>,
}

impl Matcher {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// True when all three predicate clauses admit the sample
    pub fn matches(&self, sample: &Sample, rule: &Rule) -> bool {
        if !self.name_matches(&sample.name, rule) {
            return false;
        }

        for (key, value) in &rule.matcher.labels {
            if sample.labels.get(key) != Some(value) {
                return false;
            }
        }

        for (key, pattern) in &rule.matcher.label_regex {
            let Some(sample_value) = sample.labels.get(key) else {
                return false;
            };

            let cache_key = format!("{key}:{pattern}");
            match self.compiled(&cache_key, pattern) {
                Some(re) => {
                    if !re.is_match(sample_value) {
                        return false;
                    }
                }
                // Malformed regex disqualifies the rule from all matches
                None => return false,
            }
        }

        true
    }

    /// True when at least one name pattern admits the metric name.
    ///
    /// This is the looser pre-filter used by callers that index by name
    /// only; it ignores the label clauses.
    pub fn name_matches(&self, metric_name: &str, rule: &Rule) -> bool {
        for pattern in &rule.matcher.metric_names {
            if pattern == metric_name || pattern == "*" {
                return true;
            }

            if pattern.contains('*') {
                let source = format!("^{}$", pattern.replace('*', ".*"));
                if let Some(re) = self.compiled(&source, &source) {
                    if re.is_match(metric_name) {
                        return true;
                    }
                }
            }
        }

        false
    }

    fn compiled(&self, cache_key: &str, pattern: &str) -> Option<Regex> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(entry) = cache.get(cache_key) {
            return entry.clone();
        }

        let compiled = match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Failed to compile matcher regex");
                None
            }
        };
        cache.insert(cache_key.to_string(), compiled.clone());
        compiled
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AggregationConfig, AggregationOp, MetricMatcher, OutputConfig};
    use chrono::Utc;

    fn rule_with_matcher(matcher: MetricMatcher) -> Rule {
        Rule {
            id: "r1".to_string(),
            name: "test".to_string(),
            description: String::new(),
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            matcher,
            aggregation: AggregationConfig {
                op: AggregationOp::Sum,
                interval_seconds: 60,
                segmentation: vec![],
                segmentation_rules: vec![],
                delay_ms: 0,
            },
            output: OutputConfig {
                metric_name: "out".to_string(),
                additional_labels: HashMap::new(),
                drop_original: false,
            },
            recommendation_id: None,
            source: None,
            confidence: None,
            estimated_impact: None,
        }
    }

    fn sample(name: &str, labels: &[(&str, &str)]) -> Sample {
        Sample {
            name: name.to_string(),
            value: 1.0,
            timestamp: Utc::now(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_exact_name_match() {
        let matcher = Matcher::new();
        let rule = rule_with_matcher(MetricMatcher {
            metric_names: vec!["http_requests_total".to_string()],
            ..Default::default()
        });

        assert!(matcher.matches(&sample("http_requests_total", &[]), &rule));
        assert!(!matcher.matches(&sample("http_requests", &[]), &rule));
    }

    #[test]
    fn test_wildcard_matches_any_name() {
        let matcher = Matcher::new();
        let rule = rule_with_matcher(MetricMatcher {
            metric_names: vec!["*".to_string()],
            ..Default::default()
        });

        assert!(matcher.matches(&sample("anything_at_all", &[]), &rule));
    }

    #[test]
    fn test_glob_name_match() {
        let matcher = Matcher::new();
        let rule = rule_with_matcher(MetricMatcher {
            metric_names: vec!["http_*".to_string()],
            ..Default::default()
        });

        assert!(matcher.matches(&sample("http_requests_total", &[]), &rule));
        assert!(matcher.matches(&sample("http_latency_seconds", &[]), &rule));
        assert!(!matcher.matches(&sample("node_cpu_seconds_total", &[]), &rule));
    }

    #[test]
    fn test_glob_is_anchored() {
        let matcher = Matcher::new();
        let rule = rule_with_matcher(MetricMatcher {
            metric_names: vec!["*_total".to_string()],
            ..Default::default()
        });

        assert!(matcher.matches(&sample("http_requests_total", &[]), &rule));
        assert!(!matcher.matches(&sample("http_total_requests", &[]), &rule));
    }

    #[test]
    fn test_label_equality_clause() {
        let matcher = Matcher::new();
        let rule = rule_with_matcher(MetricMatcher {
            metric_names: vec!["*".to_string()],
            labels: [("env".to_string(), "prod".to_string())].into(),
            ..Default::default()
        });

        assert!(matcher.matches(&sample("m", &[("env", "prod")]), &rule));
        assert!(!matcher.matches(&sample("m", &[("env", "dev")]), &rule));
        // Absence of the key is a mismatch
        assert!(!matcher.matches(&sample("m", &[]), &rule));
    }

    #[test]
    fn test_label_regex_clause() {
        let matcher = Matcher::new();
        let rule = rule_with_matcher(MetricMatcher {
            metric_names: vec!["*".to_string()],
            label_regex: [("status".to_string(), "^5..$".to_string())].into(),
            ..Default::default()
        });

        assert!(matcher.matches(&sample("m", &[("status", "503")]), &rule));
        assert!(!matcher.matches(&sample("m", &[("status", "200")]), &rule));
        assert!(!matcher.matches(&sample("m", &[]), &rule));
    }

    #[test]
    fn test_malformed_regex_fails_closed() {
        let matcher = Matcher::new();
        let rule = rule_with_matcher(MetricMatcher {
            metric_names: vec!["*".to_string()],
            label_regex: [("status".to_string(), "[unclosed".to_string())].into(),
            ..Default::default()
        });

        assert!(!matcher.matches(&sample("m", &[("status", "200")]), &rule));
        // Second call hits the memoised failure and still fails closed
        assert!(!matcher.matches(&sample("m", &[("status", "200")]), &rule));
    }

    #[test]
    fn test_all_clauses_are_conjunctive() {
        let matcher = Matcher::new();
        let rule = rule_with_matcher(MetricMatcher {
            metric_names: vec!["http_*".to_string()],
            labels: [("env".to_string(), "prod".to_string())].into(),
            label_regex: [("status".to_string(), "^2..$".to_string())].into(),
        });

        let admitted = sample("http_requests_total", &[("env", "prod"), ("status", "200")]);
        assert!(matcher.matches(&admitted, &rule));

        let wrong_label = sample("http_requests_total", &[("env", "dev"), ("status", "200")]);
        assert!(!matcher.matches(&wrong_label, &rule));

        let wrong_regex = sample("http_requests_total", &[("env", "prod"), ("status", "500")]);
        assert!(!matcher.matches(&wrong_regex, &rule));
    }
}
