pub mod eval;
pub mod fractional;
pub mod graph;
pub mod operators;
pub mod types;

use thiserror::Error;

/// Errors surfaced by a graph run. Both kinds abort the running batch
/// before the sink commits anything.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Eval(#[from] eval::EvalError),
    #[error(transparent)]
    Fractional(#[from] fractional::FractionalKeyError),
}
