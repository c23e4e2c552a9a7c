//! Rule-driven aggregation pipeline
//!
//! Samples enter through a bounded queue, a worker pool matches them against
//! rules and files them into time buckets, and a periodic flusher reduces
//! completed buckets into aggregated metrics. Backpressure is drop-newest at
//! every boundary; submitting never blocks the caller.

mod bucket;

use crate::models::{AggregatedMetric, Sample};
use crate::observability::ServiceMetrics;
use crate::rules::RuleEngine;
use bucket::{reduce, Bucket};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Usage bookkeeping seam consumed by the pipeline.
///
/// Implementations must be non-blocking; `track` is called on the ingest
/// path and under the flusher's bucket pass.
pub trait Tracker: Send + Sync {
    fn track(&self, name: &str, labels: &HashMap<String, String>, value: f64);
}

/// Delivery seam for aggregated metrics.
///
/// `write` must be non-blocking; implementations queue internally and drop
/// under pressure.
pub trait MetricSink: Send + Sync {
    fn write(&self, metric: &AggregatedMetric);
}

/// Configuration for the aggregation pipeline
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Capacity of the ingest queue and the output stream
    pub batch_size: usize,
    /// Number of worker tasks draining the ingest queue
    pub worker_count: usize,
    /// Flusher tick period
    pub flush_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            worker_count: 5,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Buckets keyed by rule ID and interval length.
///
/// A bucket displaced by a newer interval moves to `awaiting_flush` so its
/// samples survive until the flusher's next pass.
#[derive(Default)]
struct BucketMap {
    active: HashMap<(String, u64), Bucket>,
    awaiting_flush: Vec<Bucket>,
}

/// Aggregation processor: worker pool plus periodic flusher
pub struct Processor {
    config: ProcessorConfig,
    engine: Arc<RuleEngine>,
    buckets: Mutex<BucketMap>,
    input_tx: mpsc::Sender<Sample>,
    input_rx: Mutex<Option<mpsc::Receiver<Sample>>>,
    output_tx: mpsc::Sender<AggregatedMetric>,
    tracker: Option<Arc<dyn Tracker>>,
    sink: Option<Arc<dyn MetricSink>>,
    shutdown: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    metrics: ServiceMetrics,
}

impl Processor {
    /// Create a processor and the stream of aggregated metrics it emits
    pub fn new(
        config: ProcessorConfig,
        engine: Arc<RuleEngine>,
    ) -> (Self, mpsc::Receiver<AggregatedMetric>) {
        let (input_tx, input_rx) = mpsc::channel(config.batch_size);
        let (output_tx, output_rx) = mpsc::channel(config.batch_size);
        let (shutdown, _) = broadcast::channel(1);

        let processor = Self {
            config,
            engine,
            buckets: Mutex::new(BucketMap::default()),
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            output_tx,
            tracker: None,
            sink: None,
            shutdown,
            handles: Mutex::new(Vec::new()),
            metrics: ServiceMetrics::new(),
        };

        (processor, output_rx)
    }

    /// Attach the usage tracker fed on ingest and on emission
    pub fn with_tracker(mut self, tracker: Arc<dyn Tracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Attach the sink that receives every emitted metric
    pub fn with_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Submit a sample for aggregation. Never blocks; when the queue is
    /// full the sample is dropped and counted.
    pub fn submit(&self, sample: Sample) {
        if let Some(tracker) = &self.tracker {
            tracker.track(&sample.name, &sample.labels, sample.value);
        }

        match self.input_tx.try_send(sample) {
            Ok(()) => self.metrics.inc_samples_submitted(),
            Err(mpsc::error::TrySendError::Full(sample)) => {
                warn!(metric = %sample.name, "Input queue full, dropping sample");
                self.metrics.inc_samples_dropped();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Start the worker pool and the flusher
    pub fn start(self: &Arc<Self>) {
        let Some(input_rx) = self.input_rx.lock().unwrap().take() else {
            warn!("Pipeline already started");
            return;
        };

        info!(
            workers = self.config.worker_count,
            batch_size = self.config.batch_size,
            "Starting aggregation pipeline"
        );

        let input_rx = Arc::new(tokio::sync::Mutex::new(input_rx));
        let mut handles = self.handles.lock().unwrap();

        for _ in 0..self.config.worker_count {
            let processor = Arc::clone(self);
            let rx = Arc::clone(&input_rx);
            let shutdown = self.shutdown.subscribe();
            handles.push(tokio::spawn(worker_loop(processor, rx, shutdown)));
        }

        let processor = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        handles.push(tokio::spawn(flusher_loop(processor, shutdown)));
    }

    /// Signal shutdown and wait for workers and flusher to finish their
    /// current item. Buckets in flight are discarded.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(());
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
        info!("Aggregation pipeline stopped");
    }

    /// Match one sample against the rule set and file it into buckets.
    ///
    /// Bucket boundaries derive from `now`, not the sample's own timestamp;
    /// a bucket keeps accepting samples until its end plus the rule's delay
    /// has passed.
    fn place_sample(&self, sample: &Sample, now: DateTime<Utc>) {
        let matched = self.engine.matching_rules(sample);
        if matched.is_empty() {
            return;
        }

        let mut map = self.buckets.lock().unwrap();
        for rule in matched {
            let key = (rule.id.clone(), rule.aggregation.interval_seconds);

            let expired = map
                .active
                .get(&key)
                .map(|bucket| now >= bucket.deadline())
                .unwrap_or(true);
            if expired {
                if let Some(old) = map.active.remove(&key) {
                    map.awaiting_flush.push(old);
                }
                map.active.insert(key.clone(), Bucket::new(rule, now));
            }

            if let Some(bucket) = map.active.get_mut(&key) {
                bucket.add_sample(sample.clone());
            }
        }
        self.metrics.set_active_buckets(map.active.len() as i64);
    }

    /// Flush every bucket whose deadline has passed, plus any displaced
    /// buckets still awaiting flush. Holds the bucket lock for the whole
    /// pass; reductions are in-memory and brief.
    fn flush_ready(&self, now: DateTime<Utc>) {
        let mut map = self.buckets.lock().unwrap();

        let mut ready = std::mem::take(&mut map.awaiting_flush);
        let expired: Vec<(String, u64)> = map
            .active
            .iter()
            .filter(|(_, bucket)| now >= bucket.deadline())
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(bucket) = map.active.remove(&key) {
                ready.push(bucket);
            }
        }
        self.metrics.set_active_buckets(map.active.len() as i64);

        for bucket in ready {
            self.flush_bucket(bucket);
        }
    }

    fn flush_bucket(&self, bucket: Bucket) {
        let rule = &bucket.rule;
        for (_, segment) in bucket.segments.iter() {
            if segment.samples.is_empty() {
                continue;
            }

            let value = reduce(rule.aggregation.op, &segment.samples);

            let mut labels = segment.labels.clone();
            for (k, v) in &rule.output.additional_labels {
                labels.insert(k.clone(), v.clone());
            }

            let metric = AggregatedMetric {
                name: rule.output.metric_name.clone(),
                value,
                start_time: bucket.start_time,
                end_time: bucket.end_time,
                labels,
                source_rule: rule.id.clone(),
                sample_count: segment.samples.len(),
            };

            // Aggregated series are observable in usage statistics too
            if let Some(tracker) = &self.tracker {
                tracker.track(&metric.name, &metric.labels, metric.value);
            }

            if let Some(sink) = &self.sink {
                sink.write(&metric);
            }

            self.metrics.inc_metrics_emitted();
            match self.output_tx.try_send(metric) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(metric)) => {
                    warn!(metric = %metric.name, "Output stream full, dropping aggregated metric");
                    self.metrics.inc_emissions_dropped();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        debug!(
            rule_id = %rule.id,
            segments = bucket.segments.len(),
            "Bucket flushed"
        );
        self.metrics.inc_buckets_flushed();
    }
}

async fn worker_loop(
    processor: Arc<Processor>,
    input_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Sample>>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        // The queue lock is held only while waiting; processing happens
        // after it is released so workers drain in parallel
        let sample = {
            let mut rx = input_rx.lock().await;
            tokio::select! {
                _ = shutdown.recv() => None,
                sample = rx.recv() => sample,
            }
        };

        match sample {
            Some(sample) => processor.place_sample(&sample, Utc::now()),
            None => break,
        }
    }
}

async fn flusher_loop(processor: Arc<Processor>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(processor.config.flush_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => processor.flush_ready(Utc::now()),
            _ = shutdown.recv() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AggregationConfig, AggregationOp, MetricMatcher, OutputConfig, Rule,
    };
    use chrono::TimeZone;

    fn engine_with_rule(rule: Rule) -> Arc<RuleEngine> {
        let engine = Arc::new(RuleEngine::new());
        engine.save_rule(rule).unwrap();
        engine
    }

    fn sum_rule(id: &str, segmentation: &[&str], delay_ms: u64) -> Rule {
        Rule {
            id: id.to_string(),
            name: format!("rule {id}"),
            description: String::new(),
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            matcher: MetricMatcher {
                metric_names: vec!["http_requests_total".to_string()],
                ..Default::default()
            },
            aggregation: AggregationConfig {
                op: AggregationOp::Sum,
                interval_seconds: 60,
                segmentation: segmentation.iter().map(|s| s.to_string()).collect(),
                segmentation_rules: vec![],
                delay_ms,
            },
            output: OutputConfig {
                metric_name: "http_requests_total_agg".to_string(),
                additional_labels: HashMap::new(),
                drop_original: false,
            },
            recommendation_id: None,
            source: None,
            confidence: None,
            estimated_impact: None,
        }
    }

    fn sample_at(value: f64, labels: &[(&str, &str)]) -> Sample {
        Sample {
            name: "http_requests_total".to_string(),
            value,
            timestamp: Utc::now(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_sum_with_two_segmentation_labels() {
        let engine = engine_with_rule(sum_rule("r1", &["method", "status"], 0));
        let (processor, mut output) = Processor::new(ProcessorConfig::default(), engine);

        let t0 = at(0);
        processor.place_sample(&sample_at(1.0, &[("method", "GET"), ("status", "200")]), t0);
        processor.place_sample(&sample_at(2.0, &[("method", "GET"), ("status", "200")]), t0);
        processor.place_sample(&sample_at(7.0, &[("method", "POST"), ("status", "500")]), t0);

        processor.flush_ready(at(61));

        let mut emitted = vec![output.try_recv().unwrap(), output.try_recv().unwrap()];
        assert!(output.try_recv().is_err());
        emitted.sort_by(|a, b| a.value.partial_cmp(&b.value).unwrap());

        assert_eq!(emitted[0].value, 3.0);
        assert_eq!(emitted[0].sample_count, 2);
        assert_eq!(emitted[0].labels["method"], "GET");
        assert_eq!(emitted[0].labels["status"], "200");

        assert_eq!(emitted[1].value, 7.0);
        assert_eq!(emitted[1].sample_count, 1);
        assert_eq!(emitted[1].labels["method"], "POST");
        assert_eq!(emitted[1].labels["status"], "500");

        for metric in &emitted {
            assert_eq!((metric.end_time - metric.start_time).num_seconds(), 60);
            assert_eq!(metric.name, "http_requests_total_agg");
            assert_eq!(metric.source_rule, "r1");
        }
    }

    #[tokio::test]
    async fn test_bucket_not_flushed_before_interval_ends() {
        let engine = engine_with_rule(sum_rule("r1", &[], 0));
        let (processor, mut output) = Processor::new(ProcessorConfig::default(), engine);

        processor.place_sample(&sample_at(1.0, &[]), at(10));
        processor.flush_ready(at(59));
        assert!(output.try_recv().is_err());

        processor.flush_ready(at(60));
        let metric = output.try_recv().unwrap();
        assert_eq!(metric.value, 1.0);
    }

    #[tokio::test]
    async fn test_late_sample_within_delay_joins_bucket() {
        let engine = engine_with_rule(sum_rule("r1", &[], 5000));
        let (processor, mut output) = Processor::new(ProcessorConfig::default(), engine);

        for i in 0..9 {
            processor.place_sample(&sample_at(1.0, &[]), at(i * 6));
        }
        // Bucket [0, 60) is draining at t=62 but still within the 5s delay
        processor.place_sample(&sample_at(1.0, &[]), at(62));

        processor.flush_ready(at(64));
        assert!(output.try_recv().is_err());

        processor.flush_ready(at(66));
        let metric = output.try_recv().unwrap();
        assert_eq!(metric.value, 10.0);
        assert_eq!(metric.sample_count, 10);
        assert!(output.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_displaced_bucket_survives_until_flush() {
        let engine = engine_with_rule(sum_rule("r1", &[], 0));
        let (processor, mut output) = Processor::new(ProcessorConfig::default(), engine);

        processor.place_sample(&sample_at(5.0, &[]), at(10));
        // A sample in the next interval displaces the old bucket before the
        // flusher has seen it
        processor.place_sample(&sample_at(3.0, &[]), at(70));

        processor.flush_ready(at(71));
        let metric = output.try_recv().unwrap();
        assert_eq!(metric.value, 5.0);
        assert_eq!(metric.start_time.timestamp(), 0);
        assert!(output.try_recv().is_err());

        processor.flush_ready(at(121));
        let metric = output.try_recv().unwrap();
        assert_eq!(metric.value, 3.0);
        assert_eq!(metric.start_time.timestamp(), 60);
    }

    #[tokio::test]
    async fn test_additional_labels_merged_on_output() {
        let mut rule = sum_rule("r1", &["method"], 0);
        rule.output
            .additional_labels
            .insert("aggregated_by".to_string(), "adaptive_metrics".to_string());
        let engine = engine_with_rule(rule);
        let (processor, mut output) = Processor::new(ProcessorConfig::default(), engine);

        processor.place_sample(&sample_at(1.0, &[("method", "GET")]), at(0));
        processor.flush_ready(at(61));

        let metric = output.try_recv().unwrap();
        assert_eq!(metric.labels["method"], "GET");
        assert_eq!(metric.labels["aggregated_by"], "adaptive_metrics");
    }

    #[tokio::test]
    async fn test_unmatched_sample_creates_no_bucket() {
        let engine = engine_with_rule(sum_rule("r1", &[], 0));
        let (processor, mut output) = Processor::new(ProcessorConfig::default(), engine);

        let mut sample = sample_at(1.0, &[]);
        sample.name = "node_cpu_seconds_total".to_string();
        processor.place_sample(&sample, at(0));

        processor.flush_ready(at(61));
        assert!(output.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_submit_drops_newest_when_queue_full() {
        let engine = engine_with_rule(sum_rule("r1", &[], 0));
        let config = ProcessorConfig {
            batch_size: 1,
            worker_count: 1,
            ..Default::default()
        };
        let (processor, mut output) = Processor::new(config, engine);
        let processor = Arc::new(processor);

        // Workers are not running yet, so only the first sample fits
        processor.submit(sample_at(1.0, &[]));
        processor.submit(sample_at(2.0, &[]));
        processor.submit(sample_at(3.0, &[]));

        processor.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        processor.flush_ready(at(Utc::now().timestamp() + 61));
        processor.stop().await;

        let metric = output.try_recv().unwrap();
        assert_eq!(metric.sample_count, 1);
        assert_eq!(metric.value, 1.0);
    }

    #[tokio::test]
    async fn test_stop_halts_emission() {
        let engine = engine_with_rule(sum_rule("r1", &[], 0));
        let (processor, mut output) = Processor::new(ProcessorConfig::default(), engine);
        let processor = Arc::new(processor);

        processor.start();
        processor.stop().await;

        processor.submit(sample_at(1.0, &[]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(output.try_recv().is_err());
    }

    struct RecordingTracker {
        seen: Mutex<Vec<(String, f64)>>,
    }

    impl Tracker for RecordingTracker {
        fn track(&self, name: &str, _labels: &HashMap<String, String>, value: f64) {
            self.seen.lock().unwrap().push((name.to_string(), value));
        }
    }

    #[tokio::test]
    async fn test_emissions_feed_back_into_tracker() {
        let engine = engine_with_rule(sum_rule("r1", &[], 0));
        let tracker = Arc::new(RecordingTracker {
            seen: Mutex::new(Vec::new()),
        });
        let (processor, _output) =
            Processor::new(ProcessorConfig::default(), engine);
        let processor = processor.with_tracker(tracker.clone());

        processor.place_sample(&sample_at(4.0, &[]), at(0));
        processor.flush_ready(at(61));

        let seen = tracker.seen.lock().unwrap();
        assert!(seen
            .iter()
            .any(|(name, value)| name == "http_requests_total_agg" && *value == 4.0));
    }
}
