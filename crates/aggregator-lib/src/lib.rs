//! Adaptive metrics aggregation library
//!
//! This crate provides the core of a rule-driven metrics pipeline:
//! - Rule storage and sample matching (globs, label equality, label regex)
//! - Concurrent time-bucketed aggregation with late-sample tolerance
//! - Per-metric usage and cardinality tracking
//! - Usage-driven rule recommendations
//! - A batched Prometheus remote-write client

pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod remote;
pub mod rules;
pub mod service;
pub mod usage;

pub use error::{Error, Result};
pub use models::*;
pub use observability::ServiceMetrics;
pub use service::{MetricsService, ServiceConfig};
