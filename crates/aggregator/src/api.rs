//! HTTP API: sample ingest, rule and recommendation management, health
//! probes, and Prometheus exposition

use aggregator_lib::remote::prompb;
use aggregator_lib::usage::MetricUsage;
use aggregator_lib::{Error, MetricsService, Rule, Sample};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, TextEncoder};
use prost::Message;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<MetricsService>,
}

impl AppState {
    pub fn new(service: Arc<MetricsService>) -> Self {
        Self { service }
    }
}

/// Library errors mapped onto HTTP status codes
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::RuleNotFound(_) | Error::RecommendationNotFound(_) => StatusCode::NOT_FOUND,
            Error::RecommendationResolved { .. } => StatusCode::CONFLICT,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Health check: 200 while at least partially operational, 503 otherwise
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.service.health().health().await;

    let status_code = match health.status {
        aggregator_lib::health::ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };

    (status_code, Json(health))
}

/// Readiness check: 200 once the pipeline is started
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.service.health().readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Prometheus remote-write ingest: Snappy-compressed protobuf body
async fn push(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let decompressed = match snap::raw::Decoder::new().decompress_vec(&body) {
        Ok(data) => data,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid snappy payload: {e}") })),
            )
                .into_response();
        }
    };

    let request = match prompb::WriteRequest::decode(decompressed.as_slice()) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid write request: {e}") })),
            )
                .into_response();
        }
    };

    let mut processed = 0usize;
    for series in request.timeseries {
        let mut name = String::new();
        let mut labels = HashMap::new();
        for label in series.labels {
            if label.name == "__name__" {
                name = label.value;
            } else {
                labels.insert(label.name, label.value);
            }
        }
        if name.is_empty() {
            continue;
        }

        for sample in series.samples {
            let timestamp =
                DateTime::from_timestamp_millis(sample.timestamp).unwrap_or_else(Utc::now);
            state.service.submit(Sample {
                name: name.clone(),
                value: sample.value,
                timestamp,
                labels: labels.clone(),
            });
            processed += 1;
        }
    }

    Json(json!({ "status": "success", "metrics_processed": processed })).into_response()
}

#[derive(Debug, Deserialize)]
struct SampleBody {
    name: String,
    value: f64,
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    labels: HashMap<String, String>,
}

/// JSON ingest for batches of samples
async fn ingest_samples(
    State(state): State<Arc<AppState>>,
    Json(samples): Json<Vec<SampleBody>>,
) -> impl IntoResponse {
    let accepted = samples.len();
    for body in samples {
        state.service.submit(Sample {
            name: body.name,
            value: body.value,
            timestamp: body.timestamp.unwrap_or_else(Utc::now),
            labels: body.labels,
        });
    }
    Json(json!({ "status": "success", "samples_accepted": accepted }))
}

async fn list_rules(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rules = state.service.list_rules();
    Json(json!({ "total": rules.len(), "rules": rules }))
}

async fn create_rule(
    State(state): State<Arc<AppState>>,
    Json(rule): Json<Rule>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state.service.save_rule(rule)?;
    let rule = state.service.get_rule(&id)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn get_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.get_rule(&id)?))
}

async fn update_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut rule): Json<Rule>,
) -> Result<impl IntoResponse, ApiError> {
    rule.id = id;
    state.service.update_rule(rule.clone())?;
    Ok(Json(state.service.get_rule(&rule.id)?))
}

async fn delete_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.delete_rule(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn generate_recommendations(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let recommendations = state.service.generate_recommendations();
    Json(json!({
        "status": "success",
        "total": recommendations.len(),
        "recommendations": recommendations,
    }))
}

async fn list_recommendations(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let recommendations = state.service.list_recommendations();
    Json(json!({
        "total": recommendations.len(),
        "recommendations": recommendations,
    }))
}

async fn get_recommendation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.get_recommendation(&id)?))
}

async fn apply_recommendation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let rule = state.service.apply_recommendation(&id)?;
    Ok(Json(json!({
        "status": "success",
        "message": "Recommendation applied successfully",
        "rule": rule,
    })))
}

async fn reject_recommendation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.reject_recommendation(&id)?;
    Ok(Json(json!({
        "status": "success",
        "message": "Recommendation rejected",
    })))
}

fn usage_response(info: &MetricUsage) -> serde_json::Value {
    let avg_value = if info.sample_count > 0 {
        info.sum_value / info.sample_count as f64
    } else {
        0.0
    };
    let mut value = serde_json::to_value(info).unwrap_or_default();
    if let Some(object) = value.as_object_mut() {
        object.insert("avg_value".to_string(), json!(avg_value));
    }
    value
}

async fn list_usage(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metrics: Vec<serde_json::Value> = state
        .service
        .all_metrics_info()
        .iter()
        .map(usage_response)
        .collect();
    Json(json!({ "total": metrics.len(), "metrics": metrics }))
}

async fn get_usage(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.service.metric_info(&name) {
        Some(info) => Json(usage_response(&info)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "metric not found" })),
        )
            .into_response(),
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/push", post(push))
        .route("/api/v1/samples", post(ingest_samples))
        .route("/api/v1/rules", get(list_rules).post(create_rule))
        .route(
            "/api/v1/rules/:id",
            get(get_rule).put(update_rule).delete(delete_rule),
        )
        .route(
            "/api/v1/recommendations",
            get(list_recommendations),
        )
        .route(
            "/api/v1/recommendations/generate",
            post(generate_recommendations),
        )
        .route("/api/v1/recommendations/:id", get(get_recommendation))
        .route(
            "/api/v1/recommendations/:id/apply",
            post(apply_recommendation),
        )
        .route(
            "/api/v1/recommendations/:id/reject",
            post(reject_recommendation),
        )
        .route("/api/v1/usage", get(list_usage))
        .route("/api/v1/usage/:name", get(get_usage))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
