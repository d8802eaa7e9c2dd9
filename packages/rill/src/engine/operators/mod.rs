mod join;
mod linear;
mod order_by;
mod ordered_index;

pub use join::{JoinOperator, KeyFn};
pub use linear::{FilterFn, FilterOperator, InputOperator, MapFn, MapOperator, OutputOperator};
pub use order_by::{unwrap_ordered, wrap_ordered, OrderByOperator, SortFn, ORDERED_INDEX, ORDERED_VALUE};
pub use ordered_index::{
    FlatOrderedIndex, IndexKind, OrderedIndex, OrderedKey, SortComparator, SortValues,
    TreeOrderedIndex,
};

use crate::engine::types::DeltaBatch;
use crate::engine::EngineError;

/// One node's operator. A closed set so the graph can match exhaustively;
/// only join and order-by carry state that survives across runs.
pub enum OperatorNode {
    Input(InputOperator),
    Map(MapOperator),
    Filter(FilterOperator),
    Join(JoinOperator),
    OrderBy(OrderByOperator),
    Output(OutputOperator),
}

impl OperatorNode {
    pub fn input_ports(&self) -> usize {
        match self {
            OperatorNode::Join(_) => 2,
            _ => 1,
        }
    }

    /// Consume everything buffered on the input ports for this wave and
    /// produce the output batch.
    pub fn process(&mut self, mut inputs: Vec<DeltaBatch>) -> Result<DeltaBatch, EngineError> {
        let mut take = |i: usize| -> DeltaBatch {
            if i < inputs.len() {
                std::mem::take(&mut inputs[i])
            } else {
                DeltaBatch::new()
            }
        };
        match self {
            OperatorNode::Input(op) => op.process(take(0)),
            OperatorNode::Map(op) => op.process(take(0)),
            OperatorNode::Filter(op) => op.process(take(0)),
            OperatorNode::Join(op) => {
                let left = take(0);
                let right = take(1);
                op.process(left, right)
            }
            OperatorNode::OrderBy(op) => op.process(take(0)),
            OperatorNode::Output(op) => op.process(take(0)),
        }
    }
}
