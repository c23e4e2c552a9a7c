//! Prometheus remote-write client
//!
//! Batches aggregated metrics and ships them to one or more endpoints as
//! Snappy-compressed protobuf. Endpoints are independent: a failing
//! endpoint is retried on its own and never blocks the others. Enqueueing
//! never blocks; the queue drops newest under pressure.

pub mod prompb;

use crate::health::{components, HealthRegistry};
use crate::models::AggregatedMetric;
use crate::observability::ServiceMetrics;
use crate::pipeline::MetricSink;
use anyhow::{bail, Context, Result};
use prost::Message;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for the remote-write client
#[derive(Debug, Clone)]
pub struct RemoteWriteConfig {
    /// Remote-write endpoint URLs
    pub endpoints: Vec<String>,
    /// Basic auth credentials, sent when a username is set
    pub username: Option<String>,
    pub password: Option<String>,
    /// Extra headers added to every request
    pub headers: HashMap<String, String>,
    /// Additional attempts after the first failure
    pub max_retries: u32,
    /// Sleep between attempts
    pub retry_interval: Duration,
    /// Queue capacity and flush threshold
    pub batch_size: usize,
    /// Per-request HTTP timeout
    pub timeout: Duration,
    /// When set, only metrics produced by registered recommendation rules
    /// are shipped
    pub recommendation_metrics_only: bool,
}

impl Default for RemoteWriteConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            username: None,
            password: None,
            headers: HashMap::new(),
            max_retries: 3,
            retry_interval: Duration::from_secs(30),
            batch_size: 1000,
            timeout: Duration::from_secs(30),
            recommendation_metrics_only: true,
        }
    }
}

/// Batched, retrying remote-write forwarder
pub struct RemoteWriteClient {
    config: RemoteWriteConfig,
    http: reqwest::Client,
    queue_tx: mpsc::Sender<AggregatedMetric>,
    queue_rx: Mutex<Option<mpsc::Receiver<AggregatedMetric>>>,
    recommendation_rules: RwLock<HashSet<String>>,
    shutdown: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
    metrics: ServiceMetrics,
    health: Option<HealthRegistry>,
}

impl RemoteWriteClient {
    pub fn new(config: RemoteWriteConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            bail!("at least one remote write endpoint must be configured");
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build remote write HTTP client")?;

        let (queue_tx, queue_rx) = mpsc::channel(config.batch_size);
        let (shutdown, _) = broadcast::channel(1);

        Ok(Self {
            config,
            http,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            recommendation_rules: RwLock::new(HashSet::new()),
            shutdown,
            handle: Mutex::new(None),
            metrics: ServiceMetrics::new(),
            health: None,
        })
    }

    /// Report endpoint reachability into the shared health registry: the
    /// remote-write component degrades when a send exhausts its retries and
    /// recovers on the next successful send
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Mark a rule's output as recommendation-sourced so the
    /// `recommendation_metrics_only` filter lets it through
    pub fn register_recommendation_rule(&self, rule_id: &str) {
        let mut rules = self.recommendation_rules.write().unwrap();
        rules.insert(rule_id.to_string());
        debug!(rule_id = %rule_id, "Registered recommendation rule for remote write");
    }

    /// Queue a metric for shipping. Never blocks; drops newest when the
    /// queue is full, and silently discards metrics filtered out by
    /// `recommendation_metrics_only`.
    pub fn enqueue(&self, metric: &AggregatedMetric) {
        if self.config.recommendation_metrics_only {
            let rules = self.recommendation_rules.read().unwrap();
            if !rules.contains(&metric.source_rule) {
                return;
            }
        }

        match self.queue_tx.try_send(metric.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(metric)) => {
                warn!(metric = %metric.name, "Remote write queue full, dropping metric");
                self.metrics.inc_remote_write_dropped();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Start the dispatcher task
    pub fn start(self: &Arc<Self>) {
        let Some(queue_rx) = self.queue_rx.lock().unwrap().take() else {
            warn!("Remote write client already started");
            return;
        };

        info!(
            endpoints = self.config.endpoints.len(),
            batch_size = self.config.batch_size,
            "Starting remote write client"
        );

        let client = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(dispatch_loop(client, queue_rx, shutdown));
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Signal shutdown and wait for the dispatcher to flush its final batch
    pub async fn stop(&self) {
        let _ = self.shutdown.send(());
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Remote write client stopped");
    }

    async fn send_batch(&self, batch: &[AggregatedMetric]) {
        if batch.is_empty() {
            return;
        }

        let request = build_write_request(batch);
        let encoded = request.encode_to_vec();
        let compressed = match snap::raw::Encoder::new().compress_vec(&encoded) {
            Ok(compressed) => compressed,
            Err(e) => {
                warn!(error = %e, "Failed to compress remote write payload");
                return;
            }
        };

        for endpoint in &self.config.endpoints {
            self.send_to_endpoint(endpoint, &compressed, batch.len())
                .await;
        }
    }

    async fn send_to_endpoint(&self, endpoint: &str, body: &[u8], series: usize) {
        let attempts = self.config.max_retries + 1;
        for attempt in 1..=attempts {
            match self.post(endpoint, body).await {
                Ok(()) => {
                    debug!(endpoint = %endpoint, series, "Remote write batch sent");
                    self.metrics.inc_remote_write_batches();
                    if let Some(health) = &self.health {
                        health.set_healthy(components::REMOTE_WRITE).await;
                    }
                    return;
                }
                Err(e) => {
                    warn!(
                        endpoint = %endpoint,
                        attempt,
                        attempts,
                        error = %e,
                        "Remote write attempt failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_interval).await;
                    }
                }
            }
        }
        self.metrics.inc_remote_write_failures();
        if let Some(health) = &self.health {
            health
                .set_degraded(
                    components::REMOTE_WRITE,
                    format!("endpoint {endpoint} unreachable after {attempts} attempts"),
                )
                .await;
        }
    }

    async fn post(&self, endpoint: &str, body: &[u8]) -> Result<()> {
        let mut request = self
            .http
            .post(endpoint)
            .header("Content-Type", "application/x-protobuf")
            .header("Content-Encoding", "snappy")
            .header("X-Prometheus-Remote-Write-Version", "0.1.0")
            .body(body.to_vec());

        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_deref());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            bail!("unexpected status {}", response.status());
        }
        Ok(())
    }
}

impl MetricSink for RemoteWriteClient {
    fn write(&self, metric: &AggregatedMetric) {
        self.enqueue(metric);
    }
}

async fn dispatch_loop(
    client: Arc<RemoteWriteClient>,
    mut queue_rx: mpsc::Receiver<AggregatedMetric>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let batch_size = client.config.batch_size;
    let mut batch: Vec<AggregatedMetric> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                // Drain whatever is already queued, then flush and exit
                while let Ok(metric) = queue_rx.try_recv() {
                    batch.push(metric);
                    if batch.len() >= batch_size {
                        client.send_batch(&batch).await;
                        batch.clear();
                    }
                }
                client.send_batch(&batch).await;
                break;
            }
            Some(metric) = queue_rx.recv() => {
                batch.push(metric);
                if batch.len() >= batch_size {
                    client.send_batch(&batch).await;
                    batch.clear();
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    client.send_batch(&batch).await;
                    batch.clear();
                }
            }
        }
    }
}

/// One time series per metric; the series labels are the metric's labels
/// plus `__name__`, sorted by name, with the interval end as the sample
/// timestamp
fn build_write_request(batch: &[AggregatedMetric]) -> prompb::WriteRequest {
    let mut timeseries = Vec::with_capacity(batch.len());

    for metric in batch {
        let mut labels = Vec::with_capacity(metric.labels.len() + 1);
        labels.push(prompb::Label {
            name: "__name__".to_string(),
            value: metric.name.clone(),
        });
        for (name, value) in &metric.labels {
            labels.push(prompb::Label {
                name: name.clone(),
                value: value.clone(),
            });
        }
        labels.sort_by(|a, b| a.name.cmp(&b.name));

        timeseries.push(prompb::TimeSeries {
            labels,
            samples: vec![prompb::Sample {
                value: metric.value,
                timestamp: metric.end_time.timestamp_millis(),
            }],
        });
    }

    prompb::WriteRequest { timeseries }
}
