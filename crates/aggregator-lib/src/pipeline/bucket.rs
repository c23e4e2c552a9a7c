//! Time buckets and segment reduction
//!
//! A bucket accumulates the samples one rule matched during one interval,
//! partitioned into segments by the rule's segmentation labels. Buckets are
//! created and destroyed by the processor and never leave this module's
//! owner.

use crate::models::{AggregationOp, Rule, Sample};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Segment key used when a rule has no segmentation labels
pub(crate) const ALL_SEGMENT: &str = "_all_";

/// One rule-interval accumulator
pub(crate) struct Bucket {
    pub rule: Rule,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub segments: HashMap<String, Segment>,
}

/// Samples sharing one combination of segmentation label values.
///
/// The projected label values are kept alongside the samples so emitted
/// metrics carry their segmentation labels.
pub(crate) struct Segment {
    pub labels: HashMap<String, String>,
    pub samples: Vec<Sample>,
}

impl Bucket {
    pub fn new(rule: Rule, now: DateTime<Utc>) -> Self {
        let (start_time, end_time) = bucket_bounds(now, rule.aggregation.interval_seconds);
        Self {
            rule,
            start_time,
            end_time,
            segments: HashMap::new(),
        }
    }

    /// Instant after which the bucket stops accepting samples and becomes
    /// eligible for flushing
    pub fn deadline(&self) -> DateTime<Utc> {
        self.end_time + Duration::milliseconds(self.rule.aggregation.delay_ms as i64)
    }

    pub fn add_sample(&mut self, sample: Sample) {
        let (key, labels) = segment_for(&sample.labels, &self.rule.aggregation.segmentation);
        self.segments
            .entry(key)
            .or_insert_with(|| Segment {
                labels,
                samples: Vec::new(),
            })
            .samples
            .push(sample);
    }
}

/// Interval boundaries containing `now`, aligned to the epoch
pub(crate) fn bucket_bounds(now: DateTime<Utc>, interval_seconds: u64) -> (DateTime<Utc>, DateTime<Utc>) {
    let interval = interval_seconds.max(1) as i64;
    let start_secs = now.timestamp().div_euclid(interval) * interval;
    let start = DateTime::<Utc>::from_timestamp(start_secs, 0).unwrap_or(now);
    (start, start + Duration::seconds(interval))
}

/// Segment key and projected labels for a sample.
///
/// The key is the sorted `label=value` parts joined with commas, with an
/// empty value for labels the sample lacks; the sentinel `_all_` stands in
/// when the rule has no segmentation. The projected map only carries labels
/// the sample actually has.
pub(crate) fn segment_for(
    labels: &HashMap<String, String>,
    segmentation: &[String],
) -> (String, HashMap<String, String>) {
    if segmentation.is_empty() {
        return (ALL_SEGMENT.to_string(), HashMap::new());
    }

    let mut parts: Vec<String> = segmentation
        .iter()
        .map(|label| {
            let value = labels.get(label).map(String::as_str).unwrap_or("");
            format!("{label}={value}")
        })
        .collect();
    parts.sort();

    let projected = segmentation
        .iter()
        .filter_map(|label| labels.get(label).map(|v| (label.clone(), v.clone())))
        .collect();

    (parts.join(","), projected)
}

/// Reduce a segment's samples to a single value
pub(crate) fn reduce(op: AggregationOp, samples: &[Sample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    match op {
        AggregationOp::Sum => samples.iter().map(|s| s.value).sum(),
        AggregationOp::Avg => {
            samples.iter().map(|s| s.value).sum::<f64>() / samples.len() as f64
        }
        AggregationOp::Min => samples.iter().map(|s| s.value).fold(f64::INFINITY, f64::min),
        AggregationOp::Max => samples
            .iter()
            .map(|s| s.value)
            .fold(f64::NEG_INFINITY, f64::max),
        AggregationOp::Count => samples.len() as f64,
    }
}
