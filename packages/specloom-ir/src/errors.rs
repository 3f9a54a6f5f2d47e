//! Error types for specloom-ir
//!
//! Analyses surface infeasibility through sentinel results (a `None` plan,
//! a negative expected speedup); errors here are reserved for broken inputs
//! and violated invariants.

use thiserror::Error;

/// Main error type for specloom-ir operations
#[derive(Debug, Error)]
pub enum SpecloomError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Profile parse error
    #[error("Profile parse error at line {line}: {message}")]
    ProfileParse { line: usize, message: String },

    /// Malformed dependence-record file
    #[error("Dependence record error: {0}")]
    DepRecord(String),

    /// Analysis error
    #[error("Analysis error: {0}")]
    Analysis(String),

    /// Transform error
    #[error("Transform error: {0}")]
    Transform(String),

    /// A pipeline invariant was violated and no remedy exists.
    /// This is the fatal "violated pipeline property" case.
    #[error("Violated pipeline property: {0}")]
    PipelineProperty(String),
}

impl SpecloomError {
    pub fn analysis(msg: impl Into<String>) -> Self {
        SpecloomError::Analysis(msg.into())
    }

    pub fn transform(msg: impl Into<String>) -> Self {
        SpecloomError::Transform(msg.into())
    }
}

/// Result type alias for specloom operations
pub type Result<T> = std::result::Result<T, SpecloomError>;
