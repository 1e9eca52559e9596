use crate::ast::NodeRef;
use thiserror::Error;

/// Custom error type for the time-series core operations.
#[derive(Error, Debug)]
pub enum TimeSeriesError {
    /// Construction-time validation failure: malformed compressed arrays,
    /// non-monotonic instants, bad spacing, out-of-range split positions, ...
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A calculated time series was materialized before being bound to a
    /// finite time index.
    #[error("Time series has not been synchronized on a finite time index: {0}")]
    NotSynchronized(String),

    #[error("Time series not found: {0}")]
    SeriesNotFound(String),

    /// The simplifier hit its recursion bound. Carries the offending subtree
    /// so callers can log or trim it and retry.
    #[error("Too many recursion levels ({depth}) while simplifying expression tree")]
    TooManyRecursion { depth: usize, node: NodeRef },

    #[error("JSON Error: {0}")]
    Json(String),

    #[error("CSV Error: {0}")]
    Csv(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for TimeSeriesError {
    fn from(err: serde_json::Error) -> Self {
        TimeSeriesError::Json(err.to_string())
    }
}

impl From<bincode::Error> for TimeSeriesError {
    fn from(err: bincode::Error) -> Self {
        TimeSeriesError::Serialization(err.to_string())
    }
}
