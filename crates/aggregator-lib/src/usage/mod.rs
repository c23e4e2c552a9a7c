//! Per-metric usage and cardinality tracking
//!
//! Maintains a summary per metric name and a detail record per observed
//! label combination. Summaries feed the recommendation engine; stale
//! records are garbage-collected against a retention window.

mod recommend;

pub use recommend::{RecommendationEngine, RecommendationEngineConfig, RecommendationStore};

use crate::pipeline::Tracker;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

/// Usage summary for one metric name
#[derive(Debug, Clone, Serialize)]
pub struct MetricUsage {
    pub metric_name: String,
    pub sample_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Number of distinct label combinations observed
    pub cardinality: usize,
    /// Distinct values seen per label key.
    ///
    /// A value first seen inside an already-recorded combination is not
    /// counted; the increment only happens when the combination itself is
    /// new, so counts are sensitive to discovery order.
    pub label_cardinality: HashMap<String, usize>,
    pub min_value: f64,
    pub max_value: f64,
    pub sum_value: f64,
}

/// Usage record for one (metric, label combination) pair
#[derive(Debug, Clone, Serialize)]
pub struct MetricUsageDetail {
    pub labels: HashMap<String, String>,
    pub sample_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub min_value: f64,
    pub max_value: f64,
    pub sum_value: f64,
}

struct TrackerInner {
    summaries: HashMap<String, MetricUsage>,
    /// metric name -> label hash -> detail
    details: HashMap<String, HashMap<String, MetricUsageDetail>>,
    last_cleanup: DateTime<Utc>,
}

/// Thread-safe usage tracker with bounded retention
pub struct UsageTracker {
    inner: RwLock<TrackerInner>,
    retention: Duration,
}

impl UsageTracker {
    pub fn new(retention: std::time::Duration) -> Self {
        Self {
            inner: RwLock::new(TrackerInner {
                summaries: HashMap::new(),
                details: HashMap::new(),
                last_cleanup: Utc::now(),
            }),
            retention: Duration::from_std(retention).unwrap_or(Duration::days(90)),
        }
    }

    /// Record one observation of a metric
    pub fn track_metric(&self, name: &str, labels: &HashMap<String, String>, value: f64) {
        let now = Utc::now();
        let mut inner = self.inner.write().unwrap();

        let summary = inner
            .summaries
            .entry(name.to_string())
            .or_insert_with(|| MetricUsage {
                metric_name: name.to_string(),
                sample_count: 0,
                first_seen: now,
                last_seen: now,
                cardinality: 0,
                label_cardinality: HashMap::new(),
                min_value: value,
                max_value: value,
                sum_value: 0.0,
            });
        summary.sample_count += 1;
        summary.last_seen = now;
        summary.min_value = summary.min_value.min(value);
        summary.max_value = summary.max_value.max(value);
        summary.sum_value += value;

        let label_hash = hash_labels(labels);
        let known = inner
            .details
            .get(name)
            .map(|details| details.contains_key(&label_hash))
            .unwrap_or(false);

        if !known {
            // New combination: bump cardinality and count each label value
            // not present in any previously recorded combination
            let new_values: Vec<&String> = labels
                .iter()
                .filter(|(key, value)| {
                    !inner
                        .details
                        .get(name)
                        .map(|details| {
                            details
                                .values()
                                .any(|detail| detail.labels.get(*key) == Some(*value))
                        })
                        .unwrap_or(false)
                })
                .map(|(key, _)| key)
                .collect();
            let new_values: Vec<String> = new_values.into_iter().cloned().collect();

            if let Some(summary) = inner.summaries.get_mut(name) {
                summary.cardinality += 1;
                for key in labels.keys() {
                    summary.label_cardinality.entry(key.clone()).or_insert(0);
                }
                for key in new_values {
                    *summary.label_cardinality.entry(key).or_insert(0) += 1;
                }
            }

            inner
                .details
                .entry(name.to_string())
                .or_default()
                .insert(
                    label_hash.clone(),
                    MetricUsageDetail {
                        labels: labels.clone(),
                        sample_count: 0,
                        first_seen: now,
                        last_seen: now,
                        min_value: value,
                        max_value: value,
                        sum_value: 0.0,
                    },
                );
        }

        if let Some(detail) = inner
            .details
            .get_mut(name)
            .and_then(|details| details.get_mut(&label_hash))
        {
            detail.sample_count += 1;
            detail.last_seen = now;
            detail.min_value = detail.min_value.min(value);
            detail.max_value = detail.max_value.max(value);
            detail.sum_value += value;
        }

        // Amortised cleanup, at most once per tenth of the retention window
        if now - inner.last_cleanup > self.retention / 10 {
            Self::cleanup(&mut inner, now, self.retention);
        }
    }

    /// Usage summary for one metric, copied out
    pub fn metric_info(&self, name: &str) -> Option<MetricUsage> {
        let inner = self.inner.read().unwrap();
        inner.summaries.get(name).cloned()
    }

    /// Usage summaries for all tracked metrics, copied out
    pub fn all_metrics_info(&self) -> Vec<MetricUsage> {
        let inner = self.inner.read().unwrap();
        inner.summaries.values().cloned().collect()
    }

    /// Detail records for one metric, copied out
    pub fn metric_details(&self, name: &str) -> Vec<MetricUsageDetail> {
        let inner = self.inner.read().unwrap();
        inner
            .details
            .get(name)
            .map(|details| details.values().cloned().collect())
            .unwrap_or_default()
    }

    fn cleanup(inner: &mut TrackerInner, now: DateTime<Utc>, retention: Duration) {
        let cutoff = now - retention;
        inner.last_cleanup = now;

        let stale: Vec<String> = inner
            .summaries
            .iter()
            .filter(|(_, summary)| summary.last_seen < cutoff)
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            inner.summaries.remove(&name);
            inner.details.remove(&name);
        }

        for (name, details) in inner.details.iter_mut() {
            let stale_hashes: Vec<String> = details
                .iter()
                .filter(|(_, detail)| detail.last_seen < cutoff)
                .map(|(hash, _)| hash.clone())
                .collect();
            if stale_hashes.is_empty() {
                continue;
            }
            for hash in &stale_hashes {
                details.remove(hash);
            }
            if let Some(summary) = inner.summaries.get_mut(name) {
                summary.cardinality = summary.cardinality.saturating_sub(stale_hashes.len());
            }
        }
    }
}

impl Tracker for UsageTracker {
    fn track(&self, name: &str, labels: &HashMap<String, String>, value: f64) {
        self.track_metric(name, labels, value);
    }
}

/// Canonical hash of a label combination: entries sorted by key so two maps
/// with identical contents hash identically
fn hash_labels(labels: &HashMap<String, String>) -> String {
    let mut entries: Vec<(&String, &String)> = labels.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    let mut hash = String::new();
    for (key, value) in entries {
        hash.push_str(key);
        hash.push('=');
        hash.push_str(value);
        hash.push(';');
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_summary_accumulates() {
        let tracker = UsageTracker::new(StdDuration::from_secs(3600));
        tracker.track_metric("m", &labels(&[("a", "1")]), 2.0);
        tracker.track_metric("m", &labels(&[("a", "1")]), 5.0);
        tracker.track_metric("m", &labels(&[("a", "1")]), -1.0);

        let info = tracker.metric_info("m").unwrap();
        assert_eq!(info.sample_count, 3);
        assert_eq!(info.min_value, -1.0);
        assert_eq!(info.max_value, 5.0);
        assert_eq!(info.sum_value, 6.0);
        assert_eq!(info.cardinality, 1);
    }

    #[test]
    fn test_cardinality_counts_distinct_combinations() {
        let tracker = UsageTracker::new(StdDuration::from_secs(3600));
        tracker.track_metric("m", &labels(&[("region", "a"), ("status", "ok")]), 1.0);
        tracker.track_metric("m", &labels(&[("region", "a"), ("status", "err")]), 1.0);
        tracker.track_metric("m", &labels(&[("region", "b"), ("status", "ok")]), 1.0);
        // Repeat of an existing combination
        tracker.track_metric("m", &labels(&[("status", "ok"), ("region", "a")]), 1.0);

        let info = tracker.metric_info("m").unwrap();
        assert_eq!(info.cardinality, 3);
        assert_eq!(info.label_cardinality["region"], 2);
        assert_eq!(info.label_cardinality["status"], 2);
    }

    #[test]
    fn test_label_hash_is_order_independent() {
        let a = hash_labels(&labels(&[("x", "1"), ("y", "2")]));
        let b = hash_labels(&labels(&[("y", "2"), ("x", "1")]));
        assert_eq!(a, b);
    }

    #[test]
    fn test_label_cardinality_bounded_by_cardinality() {
        let tracker = UsageTracker::new(StdDuration::from_secs(3600));
        for region in ["a", "b", "c", "d"] {
            for status in ["ok", "err"] {
                tracker.track_metric(
                    "m",
                    &labels(&[("region", region), ("status", status)]),
                    1.0,
                );
            }
        }

        let info = tracker.metric_info("m").unwrap();
        assert_eq!(info.cardinality, 8);
        assert_eq!(info.label_cardinality["region"], 4);
        assert_eq!(info.label_cardinality["status"], 2);
        for count in info.label_cardinality.values() {
            assert!(*count <= info.cardinality);
        }
    }

    #[test]
    fn test_detail_records_per_combination() {
        let tracker = UsageTracker::new(StdDuration::from_secs(3600));
        tracker.track_metric("m", &labels(&[("a", "1")]), 1.0);
        tracker.track_metric("m", &labels(&[("a", "1")]), 3.0);
        tracker.track_metric("m", &labels(&[("a", "2")]), 9.0);

        let details = tracker.metric_details("m");
        assert_eq!(details.len(), 2);
        let first = details
            .iter()
            .find(|d| d.labels.get("a") == Some(&"1".to_string()))
            .unwrap();
        assert_eq!(first.sample_count, 2);
        assert_eq!(first.sum_value, 4.0);
    }

    #[test]
    fn test_cleanup_drops_stale_metrics() {
        // Zero retention expires everything at the next cleanup pass
        let tracker = UsageTracker::new(StdDuration::from_secs(0));
        tracker.track_metric("m", &labels(&[("a", "1")]), 1.0);
        std::thread::sleep(StdDuration::from_millis(5));
        tracker.track_metric("other", &labels(&[]), 1.0);

        assert!(tracker.metric_info("m").is_none());
    }

    #[test]
    fn test_unknown_metric_is_none() {
        let tracker = UsageTracker::new(StdDuration::from_secs(3600));
        assert!(tracker.metric_info("missing").is_none());
        assert!(tracker.all_metrics_info().is_empty());
    }
}
