//! Rule recommendations derived from usage statistics
//!
//! Scans tracked metrics for high-cardinality candidates and proposes
//! disabled aggregation rules, each scored with a confidence value and an
//! estimated cardinality impact.

use super::{MetricUsage, UsageTracker};
use crate::error::{Error, Result};
use crate::models::{
    AggregationConfig, AggregationOp, EstimatedImpact, MetricMatcher, OutputConfig,
    Recommendation, RecommendationStatus, Rule,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Aggregation interval proposed for every recommendation, pending scrape
/// cadence inference
const DEFAULT_INTERVAL_SECONDS: u64 = 60;

/// Late-arrival tolerance proposed for every recommendation
const DEFAULT_DELAY_MS: u64 = 5000;

/// Recommendations below this cardinality reduction are not worth applying
const MIN_CARDINALITY_REDUCTION: f64 = 2.0;

/// Thresholds gating recommendation generation
#[derive(Debug, Clone)]
pub struct RecommendationEngineConfig {
    pub min_sample_threshold: u64,
    pub min_cardinality_threshold: usize,
    pub min_confidence: f64,
}

impl Default for RecommendationEngineConfig {
    fn default() -> Self {
        Self {
            min_sample_threshold: 1000,
            min_cardinality_threshold: 100,
            min_confidence: 0.5,
        }
    }
}

/// Generates rule recommendations from tracked usage
pub struct RecommendationEngine {
    tracker: Arc<UsageTracker>,
    config: RecommendationEngineConfig,
}

impl RecommendationEngine {
    pub fn new(tracker: Arc<UsageTracker>, config: RecommendationEngineConfig) -> Self {
        Self { tracker, config }
    }

    /// Scan all tracked metrics and return a recommendation for each one
    /// that clears every threshold
    pub fn generate(&self) -> Vec<Recommendation> {
        let mut recommendations = Vec::new();

        for info in self.tracker.all_metrics_info() {
            if info.sample_count < self.config.min_sample_threshold
                || info.cardinality < self.config.min_cardinality_threshold
            {
                continue;
            }

            if let Some(recommendation) = self.recommend_for_metric(&info) {
                recommendations.push(recommendation);
            }
        }

        info!(count = recommendations.len(), "Recommendation scan complete");
        recommendations
    }

    fn recommend_for_metric(&self, info: &MetricUsage) -> Option<Recommendation> {
        let segmentation = self.segmentation_labels(info);
        if segmentation.is_empty() {
            debug!(metric = %info.metric_name, "No usable segmentation labels");
            return None;
        }

        let impact = self.estimate_impact(info, &segmentation);
        if impact.cardinality_reduction < MIN_CARDINALITY_REDUCTION {
            return None;
        }

        let confidence = self.confidence(info, &impact);
        if confidence < self.config.min_confidence {
            debug!(
                metric = %info.metric_name,
                confidence,
                "Recommendation below confidence threshold"
            );
            return None;
        }

        let op = if info.min_value >= 0.0 && info.sum_value >= 0.0 {
            // Counter-like metrics aggregate meaningfully under sum
            AggregationOp::Sum
        } else {
            AggregationOp::Avg
        };

        let rule = Rule {
            id: format!("autogen-{}", &Uuid::new_v4().simple().to_string()[..8]),
            name: format!("Recommended aggregation for {}", info.metric_name),
            description: format!(
                "Automatically generated rule to aggregate high-cardinality metric {} based on usage patterns",
                info.metric_name
            ),
            enabled: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            matcher: MetricMatcher {
                metric_names: vec![info.metric_name.clone()],
                labels: HashMap::new(),
                label_regex: HashMap::new(),
            },
            aggregation: AggregationConfig {
                op,
                interval_seconds: DEFAULT_INTERVAL_SECONDS,
                segmentation,
                segmentation_rules: vec![],
                delay_ms: DEFAULT_DELAY_MS,
            },
            output: OutputConfig {
                metric_name: format!("{}_aggregated", info.metric_name),
                additional_labels: [
                    ("aggregated_by".to_string(), "adaptive_metrics".to_string()),
                    (
                        "source".to_string(),
                        "usage_based_recommendation".to_string(),
                    ),
                ]
                .into(),
                drop_original: false,
            },
            recommendation_id: None,
            source: Some("usage_analysis".to_string()),
            confidence: Some(confidence),
            estimated_impact: Some(impact.clone()),
        };

        Some(Recommendation {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            rule,
            confidence,
            estimated_impact: impact,
            source: "usage_analysis".to_string(),
            status: RecommendationStatus::Pending,
        })
    }

    /// Pick up to three labels with moderate cardinality, walking from the
    /// lowest cardinality upward. Very low cardinality (< 2) is too coarse,
    /// and anything above 20% of the metric's cardinality would defeat the
    /// aggregation.
    fn segmentation_labels(&self, info: &MetricUsage) -> Vec<String> {
        let mut ranked: Vec<(&String, usize)> = info
            .label_cardinality
            .iter()
            .map(|(label, cardinality)| (label, *cardinality))
            .collect();
        ranked.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));

        let ceiling = info.cardinality as f64 * 0.2;
        let mut selected = Vec::new();
        for (label, cardinality) in ranked {
            if cardinality < 2 || cardinality as f64 > ceiling {
                continue;
            }
            selected.push(label.clone());
            if selected.len() >= 3 {
                break;
            }
        }

        selected
    }

    fn estimate_impact(&self, info: &MetricUsage, segmentation: &[String]) -> EstimatedImpact {
        let mut post_cardinality: usize = 1;
        for label in segmentation {
            if let Some(cardinality) = info.label_cardinality.get(label) {
                post_cardinality = post_cardinality.saturating_mul(*cardinality);
            }
        }
        let post_cardinality = post_cardinality.max(1);

        let cardinality_reduction = info.cardinality as f64 / post_cardinality as f64;
        let savings_percentage = (1.0 - 1.0 / cardinality_reduction) * 100.0;

        EstimatedImpact {
            cardinality_reduction,
            savings_percentage,
            affected_series: info.cardinality,
            retention_period: "30d".to_string(),
        }
    }

    /// Weighted blend of sample volume, cardinality, and estimated impact,
    /// each capped at 1.0
    fn confidence(&self, info: &MetricUsage, impact: &EstimatedImpact) -> f64 {
        let sample_score = (info.sample_count as f64 / 10_000.0).min(1.0);
        let cardinality_score = (info.cardinality as f64 / 1000.0).min(1.0);
        let impact_score = (impact.cardinality_reduction / 100.0).min(1.0);

        sample_score * 0.3 + cardinality_score * 0.4 + impact_score * 0.3
    }
}

/// Stores recommendations keyed by ID.
///
/// Status transitions are monotonic: `pending` moves to `applied` or
/// `rejected` and never back.
pub struct RecommendationStore {
    recommendations: RwLock<HashMap<String, Recommendation>>,
}

impl RecommendationStore {
    pub fn new() -> Self {
        Self {
            recommendations: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, recommendation: Recommendation) {
        let mut recommendations = self.recommendations.write().unwrap();
        recommendations.insert(recommendation.id.clone(), recommendation);
    }

    pub fn get(&self, id: &str) -> Result<Recommendation> {
        let recommendations = self.recommendations.read().unwrap();
        recommendations
            .get(id)
            .cloned()
            .ok_or_else(|| Error::RecommendationNotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<Recommendation> {
        let recommendations = self.recommendations.read().unwrap();
        recommendations.values().cloned().collect()
    }

    /// Transition a pending recommendation to a terminal status, returning
    /// the updated record
    pub fn resolve(&self, id: &str, status: RecommendationStatus) -> Result<Recommendation> {
        let mut recommendations = self.recommendations.write().unwrap();
        let recommendation = recommendations
            .get_mut(id)
            .ok_or_else(|| Error::RecommendationNotFound(id.to_string()))?;

        if recommendation.status != RecommendationStatus::Pending {
            return Err(Error::RecommendationResolved {
                id: id.to_string(),
                status: recommendation.status.as_str(),
            });
        }

        recommendation.status = status;
        Ok(recommendation.clone())
    }
}

impl Default for RecommendationStore {
    fn default() -> Self {
        Self::new()
    }
}
