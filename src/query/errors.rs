#![forbid(unsafe_code)]
#![allow(missing_docs)]

use thiserror::Error;

/// Structured errors emitted while translating a data request.
///
/// Every variant names the classes or relationships at fault so callers can
/// point analysts at the offending part of the method definition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryBuildError {
    /// Row limit must be positive when supplied.
    #[error("limit must be a positive integer (got {limit})")]
    InvalidLimit { limit: i64 },
    /// Some classes share no relationship path with the rest of the request.
    #[error("classes {classes:?} are not related to the rest of the request")]
    Disconnected { classes: Vec<String> },
    /// Two classes would produce the same variable and column names.
    #[error("classes '{first}' and '{second}' both map to tag '{tag}'")]
    AmbiguousTag {
        tag: String,
        first: String,
        second: String,
    },
    /// A constraint names a class outside the request.
    #[error("constraint on '{class}' does not match any requested class")]
    UnknownClass { class: String },
    /// Relationship descriptor has an empty endpoint.
    #[error("relationship '{from}' -> '{to}' has an empty endpoint")]
    EmptyEndpoint { from: String, to: String },
    /// A value constraint could not be interpreted.
    #[error("invalid condition on '{class}'.'{property}': {reason}")]
    InvalidCondition {
        class: String,
        property: String,
        reason: String,
    },
}

impl QueryBuildError {
    /// Stable identifier for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            QueryBuildError::InvalidLimit { .. } => "QueryBuild.InvalidLimit",
            QueryBuildError::Disconnected { .. } => "QueryBuild.Disconnected",
            QueryBuildError::AmbiguousTag { .. } => "QueryBuild.AmbiguousTag",
            QueryBuildError::UnknownClass { .. } => "QueryBuild.UnknownClass",
            QueryBuildError::EmptyEndpoint { .. } => "QueryBuild.EmptyEndpoint",
            QueryBuildError::InvalidCondition { .. } => "QueryBuild.InvalidCondition",
        }
    }
}
