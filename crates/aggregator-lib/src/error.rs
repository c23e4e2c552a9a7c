//! Error types shared across the library

use thiserror::Error;

/// Errors surfaced to callers of rule and recommendation operations.
///
/// Pipeline-internal failures (queue overflow, regex compile at match time,
/// remote-write transport errors) are never represented here; they are logged
/// and counted where they occur.
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rule {0} does not exist")]
    RuleNotFound(String),

    #[error("recommendation {0} does not exist")]
    RecommendationNotFound(String),

    #[error("recommendation {id} is already {status}")]
    RecommendationResolved { id: String, status: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;
