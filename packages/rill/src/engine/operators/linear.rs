use crate::engine::eval::EvalError;
use crate::engine::types::{DeltaBatch, RillValue, RowKey};
use crate::engine::EngineError;
use smol_str::SmolStr;

pub type MapFn = Box<dyn FnMut(&RowKey, &RillValue) -> Result<(RowKey, RillValue), EvalError>>;
pub type FilterFn = Box<dyn FnMut(&RowKey, &RillValue) -> Result<bool, EvalError>>;

/// Entry point of a pipeline; forwards whatever the graph feeds it.
pub struct InputOperator {
    pub alias: SmolStr,
}

impl InputOperator {
    pub fn new(alias: impl Into<SmolStr>) -> Self {
        Self {
            alias: alias.into(),
        }
    }

    pub fn process(&mut self, batch: DeltaBatch) -> Result<DeltaBatch, EngineError> {
        Ok(batch)
    }
}

/// Per-entry transformation; weights pass through untouched.
pub struct MapOperator {
    f: MapFn,
}

impl MapOperator {
    pub fn new(f: MapFn) -> Self {
        Self { f }
    }

    pub fn process(&mut self, batch: DeltaBatch) -> Result<DeltaBatch, EngineError> {
        Ok(batch.map(|k, v| (self.f)(k, v))?)
    }
}

/// Keeps entries whose predicate holds; weights pass through.
pub struct FilterOperator {
    pred: FilterFn,
}

impl FilterOperator {
    pub fn new(pred: FilterFn) -> Self {
        Self { pred }
    }

    pub fn process(&mut self, batch: DeltaBatch) -> Result<DeltaBatch, EngineError> {
        Ok(batch.filter(|k, v| (self.pred)(k, v))?)
    }
}

/// Terminal sink. Stages every consolidated batch of a run for the live
/// collection to drain after `run()` returns.
#[derive(Default)]
pub struct OutputOperator {
    staged: Vec<DeltaBatch>,
}

impl OutputOperator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, batch: DeltaBatch) -> Result<DeltaBatch, EngineError> {
        if !batch.is_empty() {
            self.staged.push(batch);
        }
        Ok(DeltaBatch::new())
    }

    pub fn take_staged(&mut self) -> Vec<DeltaBatch> {
        std::mem::take(&mut self.staged)
    }
}

#[cfg(test)]
mod linear_tests {
    use super::*;
    use serde_json::json;

    fn v(j: serde_json::Value) -> RillValue {
        RillValue::from(j)
    }

    #[test]
    fn test_map_transforms_and_keeps_weight() {
        let mut op = MapOperator::new(Box::new(|k, val| {
            Ok((k.clone(), v(json!(val.as_f64().unwrap() * 10.0))))
        }));
        let mut batch = DeltaBatch::new();
        batch.push("a", v(json!(2)), -3);
        let out = op.process(batch).unwrap();
        let entry = out.iter().next().unwrap();
        assert_eq!(entry.value, v(json!(20.0)));
        assert_eq!(entry.weight, -3);
    }

    #[test]
    fn test_filter_drops_entries() {
        let mut op = FilterOperator::new(Box::new(|_, val| Ok(val.as_f64().unwrap() > 1.0)));
        let mut batch = DeltaBatch::new();
        batch.push("a", v(json!(1)), 1);
        batch.push("b", v(json!(5)), 1);
        let out = op.process(batch).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_map_error_propagates() {
        let mut op = MapOperator::new(Box::new(|_, _| Err(EvalError::NotAnObject)));
        let mut batch = DeltaBatch::new();
        batch.push("a", v(json!(1)), 1);
        assert!(op.process(batch).is_err());
    }

    #[test]
    fn test_output_stages_batches() {
        let mut op = OutputOperator::new();
        let mut batch = DeltaBatch::new();
        batch.push("a", v(json!(1)), 1);
        let out = op.process(batch).unwrap();
        assert!(out.is_empty());
        let staged = op.take_staged();
        assert_eq!(staged.len(), 1);
        assert!(op.take_staged().is_empty());
    }
}
