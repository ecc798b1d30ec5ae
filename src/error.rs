#![allow(missing_docs)]

use std::io;

use thiserror::Error;

use crate::engine::RunFailure;
use crate::query::QueryBuildError;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Load-time failures: malformed method documents, broken chains, missing
/// metadata. Raised before any graph side effect occurs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// No Method node carries the requested id.
    #[error("method '{id}' not found")]
    MethodNotFound { id: String },
    /// Document root must be a Method whose id equals the document name.
    #[error("document '{name}' has no root method with the same id")]
    MissingRoot { name: String },
    /// Two records share an id.
    #[error("duplicate id '{id}'")]
    DuplicateId { id: String },
    /// Edge endpoint refers to an unknown record.
    #[error("{edge_type} edge references unknown node '{node}'")]
    DanglingEdge { edge_type: String, node: String },
    /// A chain has no child without an incoming NEXT.
    #[error("actions under '{parent}' have no entry action")]
    NoEntry { parent: String },
    /// More than one child lacks an incoming NEXT.
    #[error("actions under '{parent}' have several entry actions: {entries:?}")]
    AmbiguousEntry { parent: String, entries: Vec<String> },
    /// NEXT edges branch, loop, or leave the sibling group.
    #[error("actions under '{parent}' do not form a simple NEXT path (at '{at}')")]
    BrokenChain { parent: String, at: String },
    /// Method not attached to the root by METHOD_ACTION edges.
    #[error("method '{id}' is not reachable from '{root}'")]
    Unreachable { id: String, root: String },
    /// The `type` property names no known action kind.
    #[error("method '{id}' has unknown type '{kind}'")]
    UnknownType { id: String, kind: String },
    /// A required reference edge or property is absent.
    #[error("method '{id}' is missing {what}")]
    MissingMetadata { id: String, what: String },
    /// A property could not be interpreted.
    #[error("method '{id}' has invalid {property}: {reason}")]
    InvalidProperty {
        id: String,
        property: String,
        reason: String,
    },
    /// GetData/Filter ordering rules were violated.
    #[error("method '{id}' is misplaced: {reason}")]
    Placement { id: String, reason: String },
    /// RunScript/CallAPI target is not available.
    #[error("method '{id}' references unregistered script '{package}.{script}'")]
    UnregisteredScript {
        id: String,
        package: String,
        script: String,
    },
    /// Filter value is outside the class's controlled terminology.
    #[error("method '{id}' filters '{class}' on '{value}', which is not one of its terms")]
    UnknownTerm {
        id: String,
        class: String,
        value: String,
    },
}

impl ResolutionError {
    /// Stable identifier for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            ResolutionError::MethodNotFound { .. } => "Resolution.MethodNotFound",
            ResolutionError::MissingRoot { .. } => "Resolution.MissingRoot",
            ResolutionError::DuplicateId { .. } => "Resolution.DuplicateId",
            ResolutionError::DanglingEdge { .. } => "Resolution.DanglingEdge",
            ResolutionError::NoEntry { .. } => "Resolution.NoEntry",
            ResolutionError::AmbiguousEntry { .. } => "Resolution.AmbiguousEntry",
            ResolutionError::BrokenChain { .. } => "Resolution.BrokenChain",
            ResolutionError::Unreachable { .. } => "Resolution.Unreachable",
            ResolutionError::UnknownType { .. } => "Resolution.UnknownType",
            ResolutionError::MissingMetadata { .. } => "Resolution.MissingMetadata",
            ResolutionError::InvalidProperty { .. } => "Resolution.InvalidProperty",
            ResolutionError::Placement { .. } => "Resolution.Placement",
            ResolutionError::UnregisteredScript { .. } => "Resolution.UnregisteredScript",
            ResolutionError::UnknownTerm { .. } => "Resolution.UnknownTerm",
        }
    }

    pub(crate) fn missing(id: &str, what: impl Into<String>) -> Self {
        ResolutionError::MissingMetadata {
            id: id.to_owned(),
            what: what.into(),
        }
    }

    pub(crate) fn invalid(id: &str, property: &str, reason: impl Into<String>) -> Self {
        ResolutionError::InvalidProperty {
            id: id.to_owned(),
            property: property.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Method document or chain could not be resolved.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    /// Data request could not be turned into a query.
    #[error(transparent)]
    QueryBuild(#[from] QueryBuildError),
    /// An action needed a column the context does not have.
    #[error("column '{column}' required by '{action}' is missing")]
    MissingColumn { action: String, column: String },
    /// BranchLoad/BranchCombine referenced a key that was never saved.
    #[error("branch '{key}' has not been saved")]
    BranchMissing { key: String },
    /// Registry lookup failed at call time.
    #[error("script '{package}.{script}' is not registered")]
    ScriptNotFound { package: String, script: String },
    /// Script returned an error.
    #[error("script '{package}.{script}' failed: {message}")]
    Script {
        package: String,
        script: String,
        message: String,
    },
    /// Remote execution failed.
    #[error("remote call '{function}' failed: {message}")]
    Remote {
        function: String,
        message: String,
        retryable: bool,
    },
    /// Graph store rejected a read or write.
    #[error("graph store error: {0}")]
    Store(String),
    /// A derived value is outside the class's controlled terminology.
    #[error("value '{value}' is not a controlled term of '{class}'")]
    NonCompliantValue { class: String, value: String },
    /// Table operation received arguments it cannot honour.
    #[error("invalid table operation: {0}")]
    Table(String),
    /// I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// JSON (de)serialization failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// CSV output failure.
    #[error(transparent)]
    Csv(#[from] csv::Error),
    /// An action failed and every applied mutation was compensated.
    #[error("{0}")]
    ActionFailed(Box<RunFailure>),
    /// An action failed and at least one compensation failed too; the store
    /// is partially compensated.
    #[error("{0}")]
    PartialRollback(Box<RunFailure>),
}

impl Error {
    /// Transient failures CallAPI may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Remote { retryable: true, .. })
    }

    /// Run failure details for pipeline errors.
    pub fn run_failure(&self) -> Option<&RunFailure> {
        match self {
            Error::ActionFailed(failure) | Error::PartialRollback(failure) => Some(failure),
            _ => None,
        }
    }

    pub(crate) fn store(message: impl Into<String>) -> Self {
        Error::Store(message.into())
    }

    pub(crate) fn missing_column(action: &str, column: impl Into<String>) -> Self {
        Error::MissingColumn {
            action: action.to_owned(),
            column: column.into(),
        }
    }
}
