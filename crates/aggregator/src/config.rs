//! Service configuration

use aggregator_lib::pipeline::ProcessorConfig;
use aggregator_lib::remote::RemoteWriteConfig;
use aggregator_lib::usage::RecommendationEngineConfig;
use aggregator_lib::ServiceConfig;
use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP listen port
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub aggregator: AggregatorSettings,

    #[serde(default)]
    pub usage: UsageSettings,

    #[serde(default)]
    pub remote_write: RemoteWriteSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregatorSettings {
    /// Capacity of the ingest queue and output stream
    pub batch_size: usize,
    /// Number of aggregation workers
    pub worker_count: usize,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            worker_count: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UsageSettings {
    /// Usage records expire after this many days without a sample
    pub retention_days: u64,
    pub min_sample_threshold: u64,
    pub min_cardinality_threshold: usize,
    pub min_confidence: f64,
}

impl Default for UsageSettings {
    fn default() -> Self {
        Self {
            retention_days: 90,
            min_sample_threshold: 1000,
            min_cardinality_threshold: 100,
            min_confidence: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteWriteSettings {
    pub enabled: bool,
    pub endpoints: Vec<String>,
    pub username: String,
    pub password: String,
    pub headers: HashMap<String, String>,
    pub max_retries: u32,
    pub retry_interval_seconds: u64,
    pub batch_size: usize,
    pub timeout_seconds: u64,
    pub recommendation_metrics_only: bool,
}

impl Default for RemoteWriteSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoints: Vec::new(),
            username: String::new(),
            password: String::new(),
            headers: HashMap::new(),
            max_retries: 3,
            retry_interval_seconds: 30,
            batch_size: 1000,
            timeout_seconds: 30,
            recommendation_metrics_only: true,
        }
    }
}

fn default_port() -> u16 {
    8080
}

impl AppConfig {
    /// Load configuration from an optional `config` file and environment
    /// variables prefixed with `AGGREGATOR`
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("AGGREGATOR").separator("__"),
            )
            .build()?;

        Ok(config.try_deserialize().unwrap_or_else(|_| AppConfig {
            port: default_port(),
            aggregator: AggregatorSettings::default(),
            usage: UsageSettings::default(),
            remote_write: RemoteWriteSettings::default(),
        }))
    }

    /// Translate into the library's service configuration
    pub fn service_config(&self) -> ServiceConfig {
        let remote_write = if self.remote_write.enabled && !self.remote_write.endpoints.is_empty()
        {
            Some(RemoteWriteConfig {
                endpoints: self.remote_write.endpoints.clone(),
                username: if self.remote_write.username.is_empty() {
                    None
                } else {
                    Some(self.remote_write.username.clone())
                },
                password: if self.remote_write.password.is_empty() {
                    None
                } else {
                    Some(self.remote_write.password.clone())
                },
                headers: self.remote_write.headers.clone(),
                max_retries: self.remote_write.max_retries,
                retry_interval: Duration::from_secs(self.remote_write.retry_interval_seconds),
                batch_size: self.remote_write.batch_size,
                timeout: Duration::from_secs(self.remote_write.timeout_seconds),
                recommendation_metrics_only: self.remote_write.recommendation_metrics_only,
            })
        } else {
            None
        };

        ServiceConfig {
            processor: ProcessorConfig {
                batch_size: self.aggregator.batch_size,
                worker_count: self.aggregator.worker_count,
                ..Default::default()
            },
            usage_retention: Duration::from_secs(self.usage.retention_days * 24 * 60 * 60),
            recommendation: RecommendationEngineConfig {
                min_sample_threshold: self.usage.min_sample_threshold,
                min_cardinality_threshold: self.usage.min_cardinality_threshold,
                min_confidence: self.usage.min_confidence,
            },
            remote_write,
        }
    }
}
