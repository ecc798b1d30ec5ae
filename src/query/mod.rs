#![forbid(unsafe_code)]

//! Metadata-driven query construction.
//!
//! A [`DataRequest`] names classes, relationships and value constraints in
//! terms of the metadata model. The [`QueryBuilder`] resolves them against a
//! [`Schema`](crate::model::Schema) and produces a [`QueryPlan`]: Cypher text,
//! bound parameters and the ordered column list of the result table.

/// Structured clauses, predicates and output columns.
pub mod ast;

/// Translation of requests into plans.
pub mod builder;

/// Errors raised while translating requests.
pub mod errors;

/// Compiled plans and their Cypher rendering.
pub mod plan;

/// Request and constraint types.
pub mod request;

pub use ast::{ColumnSource, EdgeDirection, MatchGroup, OutputColumn, PropPredicate, Var};
pub use builder::{id_column, uri_column, QueryBuilder, ID_PREFIX, URI_PREFIX};
pub use errors::QueryBuildError;
pub use plan::{quote, QueryPlan};
pub use request::{
    ClassRequest, ColumnNaming, Condition, DataRequest, ExistenceCheck, QueryOptions, RangeSpec,
    RelDescriptor,
};
