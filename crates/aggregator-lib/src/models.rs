//! Core data models for the aggregation service

use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single metric sample entering the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// An aggregated metric produced when a bucket is flushed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedMetric {
    pub name: String,
    pub value: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub labels: HashMap<String, String>,
    pub source_rule: String,
    pub sample_count: usize,
}

/// Aggregation operator applied to the samples of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationOp {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl AggregationOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationOp::Sum => "sum",
            AggregationOp::Avg => "avg",
            AggregationOp::Min => "min",
            AggregationOp::Max => "max",
            AggregationOp::Count => "count",
        }
    }
}

/// A metrics aggregation rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,

    pub matcher: MetricMatcher,
    pub aggregation: AggregationConfig,
    pub output: OutputConfig,

    /// Recommendation provenance, set when the rule was applied from one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_impact: Option<EstimatedImpact>,
}

/// Criteria deciding which samples a rule admits
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricMatcher {
    /// Name patterns: exact names, `*`, or globs containing `*`
    pub metric_names: Vec<String>,
    /// Exact label matches; a missing key is a mismatch
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Regex label matches; the key must be present
    #[serde(default)]
    pub label_regex: HashMap<String, String>,
}

/// How matched samples are reduced over time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(rename = "type")]
    pub op: AggregationOp,
    pub interval_seconds: u64,
    /// Label keys that partition the samples; labels outside this set are
    /// discarded on output
    #[serde(default)]
    pub segmentation: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segmentation_rules: Vec<SegmentationRule>,
    /// Grace period after the interval ends during which late samples are
    /// still accepted
    #[serde(default)]
    pub delay_ms: u64,
}

/// Limit applied to the values of a single segmentation label
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationRule {
    pub label: String,
    pub limit_type: SegmentationLimitType,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentationLimitType {
    Top,
    Bottom,
    Include,
    Exclude,
}

/// Shape of the metric a rule emits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub metric_name: String,
    #[serde(default)]
    pub additional_labels: HashMap<String, String>,
    #[serde(default)]
    pub drop_original: bool,
}

/// Estimated effect of applying a recommended rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatedImpact {
    pub cardinality_reduction: f64,
    pub savings_percentage: f64,
    pub affected_series: usize,
    #[serde(default)]
    pub retention_period: String,
}

/// A proposed aggregation rule generated from usage statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub rule: Rule,
    pub confidence: f64,
    pub estimated_impact: EstimatedImpact,
    pub source: String,
    pub status: RecommendationStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationStatus {
    Pending,
    Applied,
    Rejected,
}

impl RecommendationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationStatus::Pending => "pending",
            RecommendationStatus::Applied => "applied",
            RecommendationStatus::Rejected => "rejected",
        }
    }
}

impl Rule {
    /// Check that the rule configuration is internally consistent
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::Validation("rule name is required".into()));
        }

        if self.matcher.metric_names.is_empty() {
            return Err(Error::Validation(
                "at least one metric name must be specified".into(),
            ));
        }

        // Regexes must compile up front so a bad rule is rejected at save
        // time instead of silently never matching
        for (label, pattern) in &self.matcher.label_regex {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(Error::Validation(format!(
                    "invalid regex for label {label}: {e}"
                )));
            }
        }

        if self.aggregation.interval_seconds == 0 {
            return Err(Error::Validation(
                "aggregation interval must be greater than 0".into(),
            ));
        }

        for seg_rule in &self.aggregation.segmentation_rules {
            if seg_rule.label.is_empty() {
                return Err(Error::Validation(
                    "segmentation rule label is required".into(),
                ));
            }

            match seg_rule.limit_type {
                SegmentationLimitType::Top | SegmentationLimitType::Bottom => {
                    if seg_rule.limit == 0 {
                        return Err(Error::Validation(format!(
                            "segmentation limit must be greater than 0 for type {:?}",
                            seg_rule.limit_type
                        )));
                    }
                }
                SegmentationLimitType::Include | SegmentationLimitType::Exclude => {
                    if seg_rule.values.is_empty() {
                        return Err(Error::Validation(format!(
                            "segmentation values must be specified for type {:?}",
                            seg_rule.limit_type
                        )));
                    }
                }
            }
        }

        if self.output.metric_name.is_empty() {
            return Err(Error::Validation("output metric name is required".into()));
        }

        Ok(())
    }
}
