//! Service facade wiring the pipeline together
//!
//! Owns the rule engine, usage tracker, recommendation machinery,
//! aggregation processor, and optional remote-write client, and exposes the
//! operations the HTTP layer (or an embedding host) calls.

use crate::error::Result;
use crate::health::{components, HealthRegistry};
use crate::models::{AggregatedMetric, Recommendation, RecommendationStatus, Rule, Sample};
use crate::pipeline::{MetricSink, Processor, ProcessorConfig, Tracker};
use crate::remote::{RemoteWriteClient, RemoteWriteConfig};
use crate::rules::RuleEngine;
use crate::usage::{
    MetricUsage, RecommendationEngine, RecommendationEngineConfig, RecommendationStore,
    UsageTracker,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Top-level service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub processor: ProcessorConfig,
    /// How long usage records live past their last observation
    pub usage_retention: Duration,
    pub recommendation: RecommendationEngineConfig,
    /// Remote write is disabled when unset
    pub remote_write: Option<RemoteWriteConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            processor: ProcessorConfig::default(),
            usage_retention: Duration::from_secs(90 * 24 * 60 * 60),
            recommendation: RecommendationEngineConfig::default(),
            remote_write: None,
        }
    }
}

/// The assembled aggregation service
pub struct MetricsService {
    rules: Arc<RuleEngine>,
    tracker: Arc<UsageTracker>,
    recommender: RecommendationEngine,
    recommendations: RecommendationStore,
    processor: Arc<Processor>,
    remote: Option<Arc<RemoteWriteClient>>,
    health: HealthRegistry,
}

impl MetricsService {
    /// Build the service and return it together with its stream of
    /// aggregated metrics
    pub fn new(
        config: ServiceConfig,
    ) -> anyhow::Result<(Self, mpsc::Receiver<AggregatedMetric>)> {
        let rules = Arc::new(RuleEngine::new());
        let tracker = Arc::new(UsageTracker::new(config.usage_retention));
        let health = HealthRegistry::new();

        let remote = match config.remote_write {
            Some(remote_config) => Some(Arc::new(
                RemoteWriteClient::new(remote_config)?.with_health(health.clone()),
            )),
            None => None,
        };

        let (processor, output_rx) = Processor::new(config.processor, Arc::clone(&rules));
        let mut processor =
            processor.with_tracker(Arc::clone(&tracker) as Arc<dyn Tracker>);
        if let Some(remote) = &remote {
            processor = processor.with_sink(Arc::clone(remote) as Arc<dyn MetricSink>);
        }

        let recommender =
            RecommendationEngine::new(Arc::clone(&tracker), config.recommendation);

        let service = Self {
            rules,
            tracker,
            recommender,
            recommendations: RecommendationStore::new(),
            processor: Arc::new(processor),
            remote,
            health,
        };

        Ok((service, output_rx))
    }

    /// Start the aggregation workers, flusher, and remote-write dispatcher
    pub async fn start(&self) {
        self.processor.start();
        self.health.set_healthy(components::AGGREGATOR).await;
        self.health.set_healthy(components::RULE_ENGINE).await;
        self.health.set_healthy(components::USAGE_TRACKER).await;

        if let Some(remote) = &self.remote {
            remote.start();
            self.health.set_healthy(components::REMOTE_WRITE).await;
        }

        self.health.set_ready(true).await;
        info!("Metrics service started");
    }

    /// Stop the pipeline, then drain and stop the remote-write client
    pub async fn stop(&self) {
        self.health.set_ready(false).await;
        self.processor.stop().await;
        if let Some(remote) = &self.remote {
            remote.stop().await;
        }
        info!("Metrics service stopped");
    }

    /// Submit a sample for aggregation and usage tracking. Non-blocking.
    pub fn submit(&self, sample: Sample) {
        self.processor.submit(sample);
    }

    /// Record a metric observation for usage tracking only
    pub fn track_metric(&self, name: &str, labels: &HashMap<String, String>, value: f64) {
        self.tracker.track_metric(name, labels, value);
    }

    pub fn save_rule(&self, rule: Rule) -> Result<String> {
        self.rules.save_rule(rule)
    }

    pub fn update_rule(&self, rule: Rule) -> Result<()> {
        self.rules.update_rule(rule)
    }

    pub fn delete_rule(&self, id: &str) -> Result<()> {
        self.rules.delete_rule(id)
    }

    pub fn get_rule(&self, id: &str) -> Result<Rule> {
        self.rules.get_rule(id)
    }

    pub fn list_rules(&self) -> Vec<Rule> {
        self.rules.list_rules()
    }

    pub fn metric_info(&self, name: &str) -> Option<MetricUsage> {
        self.tracker.metric_info(name)
    }

    pub fn all_metrics_info(&self) -> Vec<MetricUsage> {
        self.tracker.all_metrics_info()
    }

    /// Run the recommendation engine and persist whatever it proposes
    pub fn generate_recommendations(&self) -> Vec<Recommendation> {
        let generated = self.recommender.generate();
        for recommendation in &generated {
            self.recommendations.add(recommendation.clone());
        }
        generated
    }

    pub fn list_recommendations(&self) -> Vec<Recommendation> {
        self.recommendations.list()
    }

    pub fn get_recommendation(&self, id: &str) -> Result<Recommendation> {
        self.recommendations.get(id)
    }

    /// Turn a pending recommendation into an enabled rule.
    ///
    /// The rule is saved with a back-pointer to the recommendation and
    /// registered with the remote-write client so its output passes the
    /// recommendation-only filter.
    pub fn apply_recommendation(&self, id: &str) -> Result<Rule> {
        let recommendation = self.recommendations.get(id)?;

        let mut rule = recommendation.rule.clone();
        rule.enabled = true;
        rule.recommendation_id = Some(recommendation.id.clone());
        // Validate before the status transition so a bad rule leaves the
        // recommendation pending
        rule.validate()?;

        self.recommendations
            .resolve(id, RecommendationStatus::Applied)?;
        let rule_id = self.rules.save_rule(rule)?;
        self.register_recommendation_rule(&rule_id);

        info!(recommendation_id = %id, rule_id = %rule_id, "Recommendation applied");
        self.rules.get_rule(&rule_id)
    }

    pub fn reject_recommendation(&self, id: &str) -> Result<()> {
        self.recommendations
            .resolve(id, RecommendationStatus::Rejected)?;
        info!(recommendation_id = %id, "Recommendation rejected");
        Ok(())
    }

    /// Mark a rule's output as recommendation-sourced for remote-write
    /// filtering
    pub fn register_recommendation_rule(&self, rule_id: &str) {
        if let Some(remote) = &self.remote {
            remote.register_recommendation_rule(rule_id);
        }
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }
}
