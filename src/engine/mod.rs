//! Method resolution and execution.
//!
//! [`Resolver`] turns a method document into a flat list of [`Step`]s:
//! chains are ordered along their NEXT edges, nested methods are inlined,
//! Filter nodes fold into the GetData before them and SuperMethods expand
//! into their generated actions. [`Engine`] then runs the steps against a
//! [`GraphStore`](crate::store::GraphStore), keeping the compensation of
//! every graph write until the run ends.

mod chain;
mod expand;
mod pipeline;
mod resolve;

pub use chain::{ChainIndex, MethodIdx};
pub use expand::{PERCENT_CLASS, PERCENT_TAG};
pub use pipeline::{
    ActionRecord, ActionState, Engine, RollbackEntry, RollbackFailure, RollbackLog, RunFailure,
    RunOptions, RunOutcome,
};
pub use resolve::{ResolvedMethod, Resolver, Step};
