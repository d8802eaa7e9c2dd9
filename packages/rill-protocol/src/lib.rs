//! Boundary types for the rill live-query engine.
//!
//! Everything in this crate is plain data: the query IR handed over by a
//! query builder, and the change messages of the base-collection sync
//! protocol. The engine in `rill` consumes these; it never produces them.

pub mod change;
pub mod expr;
pub mod query;

pub use change::{ChangeMessage, ChangeOp};
pub use expr::Expr;
pub use query::{
    Direction, JoinClause, JoinType, OrderBySpec, QueryIr, SelectItem, SourceBinding, SourceRef,
    Window,
};
