//! Metadata-driven derivations over a property graph.
//!
//! Two halves share this crate. The [`query`] module turns requests phrased
//! in classes and relationships of the metadata model into Cypher text,
//! parameters and a column plan. The [`engine`] module loads a method
//! definition, resolves its METHOD_ACTION/NEXT chain into [`actions`],
//! threads one [`Table`] through them and compensates graph writes when a
//! step fails.
//!
//! ```no_run
//! use derivation::engine::{Engine, RunOptions};
//! use derivation::store::MemoryGraph;
//!
//! # fn main() -> derivation::Result<()> {
//! let mut engine = Engine::new(MemoryGraph::new());
//! let outcome = engine.run("derive_age_groups", &RunOptions::default())?;
//! println!("{} rows", outcome.table.len());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod actions;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod query;
pub mod scripts;
pub mod store;
pub mod table;
pub mod telemetry;
pub mod value;

pub use error::{Error, ResolutionError, Result};
pub use table::Table;
pub use value::Value;
