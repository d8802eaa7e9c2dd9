//! The dataflow graph: a DAG of operator nodes with a scheduling queue.
//!
//! `send_data` enqueues a batch on an input node; `run` drains the queue
//! to a fixed point, pushing batches through the nodes in topological
//! order. Each queued batch is one *wave*: it propagates completely
//! (every operator sees everything buffered on all of its ports before it
//! emits) before the next batch is accepted, so a sink never observes a
//! half-applied batch.

use super::operators::OperatorNode;
use super::types::DeltaBatch;
use super::EngineError;
use rill_protocol::Window;
use smallvec::SmallVec;
use std::collections::VecDeque;
use tracing::{debug, trace};

pub type NodeId = usize;

struct NodeState {
    op: OperatorNode,
    /// `(target node, target port)` edges; targets always have larger ids.
    downstream: SmallVec<[(NodeId, usize); 2]>,
    inbox: SmallVec<[Vec<DeltaBatch>; 2]>,
}

#[derive(Default)]
pub struct DataflowGraph {
    nodes: Vec<NodeState>,
    queue: VecDeque<(NodeId, DeltaBatch)>,
    running: bool,
}

impl DataflowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node fed by `inputs`, in order, one port per input. Nodes are
    /// appended after everything that feeds them, so node ids double as a
    /// topological order.
    pub fn add_node(&mut self, op: OperatorNode, inputs: &[NodeId]) -> NodeId {
        let id = self.nodes.len();
        debug_assert_eq!(inputs.len().max(1), op.input_ports());
        let ports = op.input_ports();
        for (port, &input) in inputs.iter().enumerate() {
            debug_assert!(input < id, "graph edges must point forward");
            self.nodes[input].downstream.push((id, port));
        }
        self.nodes.push(NodeState {
            op,
            downstream: SmallVec::new(),
            inbox: std::iter::repeat_with(Vec::new).take(ports).collect(),
        });
        id
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Queue a batch for an input node. Nothing propagates until `run`.
    pub fn send_data(&mut self, node: NodeId, batch: DeltaBatch) {
        if !batch.is_empty() {
            self.queue.push_back((node, batch));
        }
    }

    /// Drain every queued batch to a fixed point. Re-entrant calls are
    /// no-ops: the outermost drain finishes all work, including batches
    /// queued while it runs.
    pub fn run(&mut self) -> Result<(), EngineError> {
        if self.running {
            trace!("re-entrant run, outer drain continues");
            return Ok(());
        }
        self.running = true;
        let result = self.drain();
        self.running = false;
        if result.is_err() {
            // Abort the batch: drop everything in flight so no operator
            // replays half a wave on the next run.
            for node in &mut self.nodes {
                for port in &mut node.inbox {
                    port.clear();
                }
            }
            self.queue.clear();
        }
        result
    }

    fn drain(&mut self) -> Result<(), EngineError> {
        while let Some((node, batch)) = self.queue.pop_front() {
            trace!(node, entries = batch.len(), "wave start");
            self.deliver(node, 0, batch);
            self.propagate()?;
        }
        Ok(())
    }

    /// One wave: a single forward sweep in topological order. Every
    /// delivery targets a later node, so one sweep reaches the fixed
    /// point.
    fn propagate(&mut self) -> Result<(), EngineError> {
        for id in 0..self.nodes.len() {
            if self.nodes[id].inbox.iter().all(|port| port.is_empty()) {
                continue;
            }
            let inputs: Vec<DeltaBatch> = self.nodes[id]
                .inbox
                .iter_mut()
                .map(|port| {
                    let mut merged = DeltaBatch::new();
                    for batch in port.drain(..) {
                        merged.concat(batch);
                    }
                    merged.consolidate()
                })
                .collect();
            let out = self.nodes[id].op.process(inputs)?;
            if out.is_empty() {
                continue;
            }
            let downstream = self.nodes[id].downstream.clone();
            for (target, port) in downstream {
                self.deliver(target, port, out.clone());
            }
        }
        Ok(())
    }

    fn deliver(&mut self, node: NodeId, port: usize, batch: DeltaBatch) {
        self.nodes[node].inbox[port].push(batch);
    }

    /// Move an order-by node's window and propagate the resulting delta.
    pub fn set_window(&mut self, node: NodeId, window: Window) -> Result<(), EngineError> {
        debug!(node, ?window, "window move");
        let out = match &mut self.nodes[node].op {
            OperatorNode::OrderBy(op) => op.set_window(window)?,
            _ => return Ok(()),
        };
        if !out.is_empty() {
            let downstream = self.nodes[node].downstream.clone();
            for (target, port) in downstream {
                self.deliver(target, port, out.clone());
            }
            if self.running {
                // Mid-run move: the active drain flushes the delivery.
                return Ok(());
            }
            self.running = true;
            let result = self.propagate();
            self.running = false;
            result?;
        }
        Ok(())
    }

    /// Drain the staged batches of an output node.
    pub fn take_output(&mut self, node: NodeId) -> Vec<DeltaBatch> {
        match &mut self.nodes[node].op {
            OperatorNode::Output(op) => op.take_staged(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod graph_tests {
    use super::*;
    use crate::engine::eval::EvalError;
    use crate::engine::operators::{
        FilterOperator, InputOperator, MapOperator, OutputOperator,
    };
    use crate::engine::types::{FastMap, RillValue, RowKey, Weight};
    use serde_json::json;

    fn v(j: serde_json::Value) -> RillValue {
        RillValue::from(j)
    }

    fn batch(entries: &[(&str, f64, Weight)]) -> DeltaBatch {
        let mut b = DeltaBatch::new();
        for (k, n, w) in entries {
            b.push(*k, v(json!(n)), *w);
        }
        b
    }

    fn collect(graph: &mut DataflowGraph, sink: NodeId) -> FastMap<RowKey, Weight> {
        let mut merged = DeltaBatch::new();
        for b in graph.take_output(sink) {
            merged.concat(b);
        }
        merged.net_weights()
    }

    #[test]
    fn test_pipe_map_filter_to_sink() {
        let mut graph = DataflowGraph::new();
        let input = graph.add_node(OperatorNode::Input(InputOperator::new("t")), &[]);
        let map = graph.add_node(
            OperatorNode::Map(MapOperator::new(Box::new(|k, val| {
                Ok((k.clone(), v(json!(val.as_f64().unwrap() * 2.0))))
            }))),
            &[input],
        );
        let filter = graph.add_node(
            OperatorNode::Filter(FilterOperator::new(Box::new(|_, val| {
                Ok(val.as_f64().unwrap() > 2.0)
            }))),
            &[map],
        );
        let sink = graph.add_node(OperatorNode::Output(OutputOperator::new()), &[filter]);

        graph.send_data(input, batch(&[("a", 1.0, 1), ("b", 2.0, 1)]));
        graph.run().unwrap();

        let weights = collect(&mut graph, sink);
        // a: 1*2 = 2, filtered out; b: 2*2 = 4, kept.
        assert_eq!(weights.len(), 1);
        assert_eq!(weights.get("b"), Some(&1));
    }

    #[test]
    fn test_waves_commit_batch_by_batch() {
        let mut graph = DataflowGraph::new();
        let input = graph.add_node(OperatorNode::Input(InputOperator::new("t")), &[]);
        let sink = graph.add_node(OperatorNode::Output(OutputOperator::new()), &[input]);

        graph.send_data(input, batch(&[("a", 1.0, 1)]));
        graph.send_data(input, batch(&[("b", 1.0, 1)]));
        graph.run().unwrap();

        // Two queued batches, two staged sink batches.
        assert_eq!(graph.take_output(sink).len(), 2);
    }

    #[test]
    fn test_error_aborts_and_clears_in_flight_state() {
        let mut graph = DataflowGraph::new();
        let input = graph.add_node(OperatorNode::Input(InputOperator::new("t")), &[]);
        let map = graph.add_node(
            OperatorNode::Map(MapOperator::new(Box::new(|k, val| {
                if val.as_f64() == Some(13.0) {
                    Err(EvalError::NotAnObject)
                } else {
                    Ok((k.clone(), val.clone()))
                }
            }))),
            &[input],
        );
        let sink = graph.add_node(OperatorNode::Output(OutputOperator::new()), &[map]);

        graph.send_data(input, batch(&[("a", 13.0, 1)]));
        graph.send_data(input, batch(&[("b", 1.0, 1)]));
        assert!(graph.run().is_err());

        // Nothing committed, nothing left queued.
        assert!(graph.take_output(sink).is_empty());
        graph.run().unwrap();
        assert!(graph.take_output(sink).is_empty());

        // The graph still works for later batches.
        graph.send_data(input, batch(&[("c", 2.0, 1)]));
        graph.run().unwrap();
        let weights = collect(&mut graph, sink);
        assert_eq!(weights.get("c"), Some(&1));
    }

    #[test]
    fn test_send_without_run_buffers() {
        let mut graph = DataflowGraph::new();
        let input = graph.add_node(OperatorNode::Input(InputOperator::new("t")), &[]);
        let sink = graph.add_node(OperatorNode::Output(OutputOperator::new()), &[input]);
        graph.send_data(input, batch(&[("a", 1.0, 1)]));
        assert!(graph.take_output(sink).is_empty());
        graph.run().unwrap();
        assert_eq!(graph.take_output(sink).len(), 1);
    }

    #[test]
    fn test_empty_batch_is_elided() {
        let mut graph = DataflowGraph::new();
        let input = graph.add_node(OperatorNode::Input(InputOperator::new("t")), &[]);
        graph.send_data(input, DeltaBatch::new());
        graph.run().unwrap();
        assert_eq!(graph.node_count(), 1);
    }
}
