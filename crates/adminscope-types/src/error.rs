//! Error types for adminscope

use std::fmt;

use thiserror::Error;

use crate::Target;

/// Result type alias for adminscope
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while resolving, tunnelling to, and querying admin APIs
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("pod {pod} is not running (phase {phase})")]
    NotRunning { pod: String, phase: String },

    #[error("label selector {selector} matched {} pods, expected exactly one: {}", matches.len(), matches.join(", "))]
    AmbiguousTarget {
        selector: String,
        matches: Vec<String>,
    },

    #[error("admin API at {address} is unreachable: {reason}")]
    Unreachable { address: String, reason: String },

    #[error("request to {path} failed with status {status}: {body}")]
    BadStatus {
        path: String,
        status: u16,
        body: String,
    },

    #[error("failed to decode response: {0}")]
    DecodeFailure(String),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    #[error("port-forward to {target} failed: {reason}")]
    Tunnel { target: String, reason: String },

    #[error("kubernetes API error: {0}")]
    Kubernetes(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::DecodeFailure(e.to_string())
    }
}

/// One failed target inside an aggregated request
#[derive(Debug)]
pub struct TargetFailure {
    pub target: Target,
    pub error: Error,
}

impl fmt::Display for TargetFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.target, self.error)
    }
}

/// Joined error with one cause per failed target
#[derive(Debug, Default)]
pub struct AggregationError {
    causes: Vec<TargetFailure>,
}

impl AggregationError {
    pub fn new(causes: Vec<TargetFailure>) -> Self {
        Self { causes }
    }

    pub fn push(&mut self, target: Target, error: Error) {
        self.causes.push(TargetFailure { target, error });
    }

    pub fn causes(&self) -> &[TargetFailure] {
        &self.causes
    }

    pub fn len(&self) -> usize {
        self.causes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.causes.is_empty()
    }

    pub fn into_causes(self) -> Vec<TargetFailure> {
        self.causes
    }
}

impl fmt::Display for AggregationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} target(s) failed", self.causes.len())?;
        for cause in &self.causes {
            write!(f, "\n  {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregationError {}
