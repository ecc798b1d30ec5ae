//! Graph-store boundary.
//!
//! The engine only talks to a property graph through [`GraphStore`]: reads
//! arrive as compiled [`QueryPlan`]s or literal Cypher, writes as typed
//! [`GraphWrite`]s. Identifier columns carry the store's node references
//! opaquely.

mod memory;
mod neo4j;
mod write;

pub use memory::{CypherHandler, MemoryGraph, MemoryNode};
pub use neo4j::{Neo4jHttp, Neo4jSettings};
pub use write::{GraphWrite, Statement, WriteReceipt};

use serde_json::{Map, Value as JsonValue};

use crate::error::Result;
use crate::model::{MethodDocument, Schema};
use crate::query::QueryPlan;
use crate::table::Table;

/// Parameters of literal Cypher statements.
pub type Params = Map<String, JsonValue>;

/// Property graph the engine reads from and writes to.
pub trait GraphStore {
    /// Executes a compiled plan; the result has exactly the plan's columns.
    fn fetch(&self, plan: &QueryPlan) -> Result<Table>;

    /// Executes a literal statement.
    fn run_cypher(&mut self, text: &str, params: &Params) -> Result<Table>;

    /// Applies one mutation.
    fn apply(&mut self, write: &GraphWrite) -> Result<WriteReceipt>;

    /// Method document rooted at `root_id`, with the metadata it references.
    fn load_method(&self, root_id: &str) -> Result<MethodDocument>;

    /// Every class, relationship and term known to the store.
    fn load_schema(&self) -> Result<Schema>;

    /// Stores a method document. Class, term and relationship records are
    /// merged with existing metadata; method records are created.
    fn import_method(&mut self, doc: &MethodDocument) -> Result<()>;
}

impl<S: GraphStore + ?Sized> GraphStore for Box<S> {
    fn fetch(&self, plan: &QueryPlan) -> Result<Table> {
        (**self).fetch(plan)
    }

    fn run_cypher(&mut self, text: &str, params: &Params) -> Result<Table> {
        (**self).run_cypher(text, params)
    }

    fn apply(&mut self, write: &GraphWrite) -> Result<WriteReceipt> {
        (**self).apply(write)
    }

    fn load_method(&self, root_id: &str) -> Result<MethodDocument> {
        (**self).load_method(root_id)
    }

    fn load_schema(&self) -> Result<Schema> {
        (**self).load_schema()
    }

    fn import_method(&mut self, doc: &MethodDocument) -> Result<()> {
        (**self).import_method(doc)
    }
}
