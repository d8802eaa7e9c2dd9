//! Query compiler: turns the declarative IR into a dataflow graph.
//!
//! Sources resolve against the collection registry; nested subqueries
//! compile recursively and lift their alias bindings into the parent
//! scope with one-hop remapping. Each join clause is planned into an
//! active side (streamed fully) and, when the shape allows it, a lazy
//! side loaded on demand by join key.

use crate::engine::eval::{AliasScope, CompiledExpr, EvalError};
use crate::engine::graph::{DataflowGraph, NodeId};
use crate::engine::operators::{
    unwrap_ordered, wrap_ordered, FilterOperator, IndexKind, InputOperator, JoinOperator,
    MapFn, MapOperator, OperatorNode, OrderByOperator, OutputOperator, SortComparator, SortFn,
    SortValues,
};
use crate::engine::types::{FastMap, FastSet, Path, RillValue};
use crate::source::{CollectionRegistry, SourceCollection};
use rill_protocol::{Direction, Expr, JoinClause, JoinType, QueryIr, SourceRef, Window};
use smallvec::SmallVec;
use smol_str::SmolStr;
use std::rc::Rc;
use thiserror::Error;
use tracing::debug;

/// Windows up to this size default to the flat ordered-index engine;
/// larger or unbounded windows get the tree engine.
const FLAT_WINDOW_MAX: usize = 128;

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("unknown collection {0:?}")]
    UnknownCollection(SmolStr),
    #[error("alias {0:?} bound twice")]
    DuplicateAlias(SmolStr),
    #[error("join condition references alias {0:?} on both sides")]
    SameAliasJoin(SmolStr),
    #[error("join condition does not resolve to exactly one alias per side")]
    UnresolvableJoinExpr,
    #[error("no subscription for lazily loaded alias {0:?}")]
    MissingSubscription(SmolStr),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CompileOptions {
    /// Force an ordered-index engine instead of the window-size heuristic.
    pub index_kind: Option<IndexKind>,
}

/// Instruction to load one join side on demand: as batches for
/// `active_alias` stream in, their join keys are extracted with
/// `active_key` and the lazy side is asked for rows whose `lazy_field`
/// matches.
pub struct LazyLoader {
    pub active_alias: SmolStr,
    pub lazy_alias: SmolStr,
    pub active_key: CompiledExpr,
    pub lazy_field: Path,
}

/// A compiled query, ready to be wired to its sources by a live
/// collection.
pub struct CompiledQuery {
    pub graph: DataflowGraph,
    /// Canonical source alias → graph input node.
    pub inputs: FastMap<SmolStr, NodeId>,
    /// Canonical source alias → base collection.
    pub sources: FastMap<SmolStr, Rc<dyn SourceCollection>>,
    /// Aliases loaded on demand rather than streamed fully.
    pub lazy_aliases: FastSet<SmolStr>,
    pub loaders: Vec<LazyLoader>,
    /// The root order-by node when the query is ordered; target of
    /// runtime window moves.
    pub order_node: Option<NodeId>,
    pub output_node: NodeId,
}

impl CompiledQuery {
    pub fn ordered(&self) -> bool {
        self.order_node.is_some()
    }
}

/// Result of compiling one (sub)query: the node emitting its rows and the
/// canonical aliases those rows are namespaced under.
struct CompiledUnit {
    node: NodeId,
    main_alias: SmolStr,
    aliases: SmallVec<[SmolStr; 2]>,
    windowed: bool,
    order_node: Option<NodeId>,
}

pub fn compile_query(
    ir: &QueryIr,
    registry: &CollectionRegistry,
    options: CompileOptions,
) -> Result<CompiledQuery, CompileError> {
    let mut ctx = Compilation {
        registry,
        options,
        graph: DataflowGraph::new(),
        scope: AliasScope::new(),
        inputs: FastMap::default(),
        sources: FastMap::default(),
        lazy_aliases: FastSet::default(),
        loaders: Vec::new(),
    };
    let unit = ctx.compile_unit(ir)?;
    let output_node = ctx
        .graph
        .add_node(OperatorNode::Output(OutputOperator::new()), &[unit.node]);

    debug!(
        nodes = ctx.graph.node_count(),
        sources = ctx.sources.len(),
        lazy = ctx.lazy_aliases.len(),
        "query compiled"
    );
    Ok(CompiledQuery {
        graph: ctx.graph,
        inputs: ctx.inputs,
        sources: ctx.sources,
        lazy_aliases: ctx.lazy_aliases,
        loaders: ctx.loaders,
        order_node: unit.order_node,
        output_node,
    })
}

struct Compilation<'a> {
    registry: &'a CollectionRegistry,
    options: CompileOptions,
    graph: DataflowGraph,
    scope: AliasScope,
    inputs: FastMap<SmolStr, NodeId>,
    sources: FastMap<SmolStr, Rc<dyn SourceCollection>>,
    lazy_aliases: FastSet<SmolStr>,
    loaders: Vec<LazyLoader>,
}

impl<'a> Compilation<'a> {
    fn compile_unit(&mut self, ir: &QueryIr) -> Result<CompiledUnit, CompileError> {
        let mut current = self.resolve_source(&ir.from.alias, &ir.from.source)?;

        for clause in &ir.joins {
            current = self.compile_join(current, clause)?;
        }

        if let Some(where_clause) = &ir.where_clause {
            let pred = CompiledExpr::compile(where_clause, &self.scope)?;
            current.node = self.graph.add_node(
                OperatorNode::Filter(FilterOperator::new(Box::new(move |_, row| {
                    Ok(pred.eval_truth(row)?.is_true())
                }))),
                &[current.node],
            );
        }

        let ordered = ir.order_by.is_some() || ir.is_windowed();
        if ordered {
            let order_node = self.compile_order_by(ir, current.node)?;
            current.node = order_node;
            current.order_node = Some(order_node);
            current.windowed = current.windowed || ir.is_windowed();
        }

        if let Some(select) = &ir.select {
            let mut items: Vec<(SmolStr, CompiledExpr)> = Vec::with_capacity(select.len());
            for item in select {
                items.push((
                    item.name.clone(),
                    CompiledExpr::compile(&item.expr, &self.scope)?,
                ));
            }
            let project = move |row: &RillValue| -> Result<RillValue, EvalError> {
                let mut out: FastMap<SmolStr, RillValue> = FastMap::default();
                for (name, expr) in &items {
                    out.insert(name.clone(), expr.eval(row)?);
                }
                Ok(RillValue::Object(out))
            };
            let map: MapFn = if ordered {
                // Downstream of order-by, rows travel wrapped with their
                // fractional index; project the inner value, keep the index.
                Box::new(move |key, wrapped| {
                    let (value, index) = unwrap_ordered(wrapped).ok_or(EvalError::NotAnObject)?;
                    let projected = project(value)?;
                    Ok((key.clone(), wrap_ordered(projected, index)))
                })
            } else {
                Box::new(move |key, row| Ok((key.clone(), project(row)?)))
            };
            current.node = self
                .graph
                .add_node(OperatorNode::Map(MapOperator::new(map)), &[current.node]);
        }

        Ok(current)
    }

    fn resolve_source(
        &mut self,
        alias: &SmolStr,
        source: &SourceRef,
    ) -> Result<CompiledUnit, CompileError> {
        if self.scope.contains(alias) {
            return Err(CompileError::DuplicateAlias(alias.clone()));
        }
        match source {
            SourceRef::Collection { id } => {
                let collection = self
                    .registry
                    .get(id)
                    .ok_or_else(|| CompileError::UnknownCollection(id.clone()))?;
                self.scope.bind(alias.clone());
                let input = self
                    .graph
                    .add_node(OperatorNode::Input(InputOperator::new(alias.clone())), &[]);
                let ns_alias = alias.clone();
                let namespace = self.graph.add_node(
                    OperatorNode::Map(MapOperator::new(Box::new(move |key, row| {
                        Ok((
                            key.clone(),
                            RillValue::object_of([(ns_alias.clone(), row.clone())]),
                        ))
                    }))),
                    &[input],
                );
                self.inputs.insert(alias.clone(), input);
                self.sources.insert(alias.clone(), collection);
                Ok(CompiledUnit {
                    node: namespace,
                    main_alias: alias.clone(),
                    aliases: SmallVec::from_iter([alias.clone()]),
                    windowed: false,
                    order_node: None,
                })
            }
            SourceRef::Query { query } => {
                let mut sub = self.compile_unit(query)?;
                if sub.order_node.is_some() {
                    // Strip the fractional-index wrapper; only the root
                    // query exposes indices downstream.
                    sub.node = self.graph.add_node(
                        OperatorNode::Map(MapOperator::new(Box::new(|key, wrapped| {
                            let (value, _) =
                                unwrap_ordered(wrapped).ok_or(EvalError::NotAnObject)?;
                            Ok((key.clone(), value.clone()))
                        }))),
                        &[sub.node],
                    );
                    // The subquery's window is fixed at compile time; only
                    // the root query's order node takes runtime moves.
                    sub.order_node = None;
                }
                if query.select.is_some() {
                    // A projected subquery emits flat rows; namespace them
                    // back under its main alias for the outer scope.
                    let main = sub.main_alias.clone();
                    sub.node = self.graph.add_node(
                        OperatorNode::Map(MapOperator::new(Box::new(move |key, row| {
                            Ok((
                                key.clone(),
                                RillValue::object_of([(main.clone(), row.clone())]),
                            ))
                        }))),
                        &[sub.node],
                    );
                    sub.aliases = SmallVec::from_iter([sub.main_alias.clone()]);
                }
                // The outer alias is another name for the subquery's main
                // source; one hop, the innermost alias wins.
                self.scope.lift(alias.clone(), &sub.main_alias);
                Ok(sub)
            }
        }
    }

    fn compile_join(
        &mut self,
        main: CompiledUnit,
        clause: &JoinClause,
    ) -> Result<CompiledUnit, CompileError> {
        let side = self.resolve_source(&clause.source.alias, &clause.source.source)?;

        let (main_expr, side_expr) =
            self.classify_condition(&main, &side, &clause.left_expr, &clause.right_expr)?;

        self.plan_lazy_side(&main, &side, clause.join_type, main_expr, side_expr)?;

        let main_key = CompiledExpr::compile(main_expr, &self.scope)?;
        let side_key = CompiledExpr::compile(side_expr, &self.scope)?;
        let node = self.graph.add_node(
            OperatorNode::Join(JoinOperator::new(
                clause.join_type,
                Box::new(move |row| main_key.eval(row)),
                Box::new(move |row| side_key.eval(row)),
                main.aliases.iter().cloned(),
                side.aliases.iter().cloned(),
            )),
            &[main.node, side.node],
        );

        let mut aliases = main.aliases.clone();
        aliases.extend(side.aliases.iter().cloned());
        Ok(CompiledUnit {
            node,
            main_alias: main.main_alias,
            aliases,
            windowed: main.windowed || side.windowed,
            order_node: None,
        })
    }

    /// Sort the two condition expressions into (main-side, joined-side),
    /// rejecting conditions that do not put exactly one expression on each
    /// side.
    fn classify_condition<'e>(
        &self,
        main: &CompiledUnit,
        side: &CompiledUnit,
        left: &'e Expr,
        right: &'e Expr,
    ) -> Result<(&'e Expr, &'e Expr), CompileError> {
        // true = main side, false = joined side
        let locate = |expr: &Expr| -> Result<bool, CompileError> {
            let alias = expr
                .single_alias()
                .ok_or(CompileError::UnresolvableJoinExpr)?;
            let canonical = self
                .scope
                .resolve(alias)
                .ok_or_else(|| CompileError::Eval(EvalError::UnknownAlias(SmolStr::new(alias))))?;
            if main.aliases.contains(canonical) {
                Ok(true)
            } else if side.aliases.contains(canonical) {
                Ok(false)
            } else {
                Err(CompileError::UnresolvableJoinExpr)
            }
        };
        match (locate(left)?, locate(right)?) {
            (true, false) => Ok((left, right)),
            (false, true) => Ok((right, left)),
            (true, true) => Err(CompileError::SameAliasJoin(main.main_alias.clone())),
            (false, false) => Err(CompileError::SameAliasJoin(side.main_alias.clone())),
        }
    }

    /// Decide which join side streams fully and whether the other side can
    /// be loaded on demand.
    fn plan_lazy_side(
        &mut self,
        main: &CompiledUnit,
        side: &CompiledUnit,
        join_type: JoinType,
        main_expr: &Expr,
        side_expr: &Expr,
    ) -> Result<(), CompileError> {
        // (active unit, active expr, lazy unit, lazy expr)
        let plan = match join_type {
            JoinType::Left => Some((main, main_expr, side, side_expr)),
            JoinType::Right => Some((side, side_expr, main, main_expr)),
            JoinType::Inner => {
                // Stream the smaller side; a subquery's cardinality is
                // unknown before hydration, so it streams and a direct
                // opposite side may be lazy. Ties keep the main side
                // active.
                match (self.direct_len(main), self.direct_len(side)) {
                    (None, None) => None,
                    (None, Some(_)) => Some((main, main_expr, side, side_expr)),
                    (Some(_), None) => Some((side, side_expr, main, main_expr)),
                    (Some(m), Some(s)) => {
                        if s >= m {
                            Some((main, main_expr, side, side_expr))
                        } else {
                            Some((side, side_expr, main, main_expr))
                        }
                    }
                }
            }
            // Both sides of a full join are preserved, so both stream.
            JoinType::Full => None,
        };

        let Some((active, active_expr, lazy, lazy_expr)) = plan else {
            return Ok(());
        };

        // The lazy side must bottom out in a plain collection: a windowed
        // subquery's membership cannot be pre-filtered by key, and a
        // computed join key cannot be served from an index.
        if lazy.windowed || !self.sources.contains_key(&lazy.main_alias) {
            return Ok(());
        }
        let Some((lazy_alias, field)) = lazy_expr.as_field_ref() else {
            return Ok(());
        };
        let Some(canonical) = self.scope.resolve(lazy_alias) else {
            return Ok(());
        };
        if *canonical != lazy.main_alias {
            return Ok(());
        }
        if active.main_alias == lazy.main_alias {
            return Ok(());
        }

        let active_alias = active_expr
            .single_alias()
            .and_then(|a| self.scope.resolve(a))
            .cloned()
            .ok_or(CompileError::UnresolvableJoinExpr)?;

        debug!(active = %active_alias, lazy = %lazy.main_alias, "lazy join side");
        self.lazy_aliases.insert(lazy.main_alias.clone());
        self.loaders.push(LazyLoader {
            active_alias,
            lazy_alias: lazy.main_alias.clone(),
            active_key: CompiledExpr::compile(active_expr, &self.scope)?,
            lazy_field: Path::from_segments(field.iter().cloned()),
        });
        Ok(())
    }

    fn direct_len(&self, unit: &CompiledUnit) -> Option<usize> {
        if unit.aliases.len() == 1 && !unit.windowed {
            self.sources.get(&unit.main_alias).map(|s| s.len())
        } else {
            None
        }
    }

    fn compile_order_by(&mut self, ir: &QueryIr, input: NodeId) -> Result<NodeId, CompileError> {
        let specs = ir.order_by.as_deref().unwrap_or(&[]);
        let mut exprs: Vec<CompiledExpr> = Vec::with_capacity(specs.len());
        let mut directions: Vec<Direction> = Vec::with_capacity(specs.len());
        for spec in specs {
            exprs.push(CompiledExpr::compile(&spec.expr, &self.scope)?);
            directions.push(spec.direction);
        }

        let window = Window::new(ir.offset.unwrap_or(0), ir.limit);
        let kind = self.options.index_kind.unwrap_or(match ir.limit {
            Some(limit) if limit <= FLAT_WINDOW_MAX => IndexKind::Flat,
            _ => IndexKind::Tree,
        });

        let sort_fn: SortFn = Box::new(move |row| {
            let mut out = SortValues::new();
            for expr in &exprs {
                out.push(expr.eval(row)?);
            }
            Ok(out)
        });

        Ok(self.graph.add_node(
            OperatorNode::OrderBy(OrderByOperator::new(
                sort_fn,
                SortComparator::new(directions),
                kind,
                window,
            )),
            &[input],
        ))
    }
}

#[cfg(test)]
mod compiler_tests {
    use super::*;
    use crate::source::MemoryCollection;
    use rill_protocol::{ChangeMessage, OrderBySpec, SelectItem, SourceBinding};
    use serde_json::json;

    fn registry_with(names: &[(&str, usize)]) -> CollectionRegistry {
        let mut registry = CollectionRegistry::new();
        for (name, rows) in names {
            let col = MemoryCollection::new(*name).with_index("id");
            let mut tx = col.begin();
            for i in 0..*rows {
                tx.write(ChangeMessage::insert(format!("{i}"), json!({"id": i})));
            }
            col.commit(tx);
            registry.register(Rc::new(col));
        }
        registry
    }

    fn join_clause(join_type: JoinType, alias: &str, collection: &str, left: Expr, right: Expr) -> JoinClause {
        JoinClause {
            join_type,
            source: SourceBinding {
                alias: alias.into(),
                source: SourceRef::Collection {
                    id: collection.into(),
                },
            },
            left_expr: left,
            right_expr: right,
        }
    }

    #[test]
    fn test_minimal_query_shape() {
        let registry = registry_with(&[("users", 0)]);
        let ir = QueryIr::from_collection("u", "users");
        let compiled = compile_query(&ir, &registry, CompileOptions::default()).unwrap();
        // input, namespace map, output
        assert_eq!(compiled.graph.node_count(), 3);
        assert!(compiled.inputs.contains_key("u"));
        assert!(!compiled.ordered());
        assert!(compiled.loaders.is_empty());
    }

    #[test]
    fn test_unknown_collection() {
        let registry = registry_with(&[]);
        let ir = QueryIr::from_collection("u", "nope");
        assert!(matches!(
            compile_query(&ir, &registry, CompileOptions::default()),
            Err(CompileError::UnknownCollection(_))
        ));
    }

    #[test]
    fn test_duplicate_alias() {
        let registry = registry_with(&[("users", 0), ("depts", 0)]);
        let mut ir = QueryIr::from_collection("u", "users");
        ir.joins.push(join_clause(
            JoinType::Inner,
            "u",
            "depts",
            Expr::field("u", "dept"),
            Expr::field("u", "id"),
        ));
        assert!(matches!(
            compile_query(&ir, &registry, CompileOptions::default()),
            Err(CompileError::DuplicateAlias(_))
        ));
    }

    #[test]
    fn test_same_alias_join_condition() {
        let registry = registry_with(&[("users", 0), ("depts", 0)]);
        let mut ir = QueryIr::from_collection("u", "users");
        ir.joins.push(join_clause(
            JoinType::Inner,
            "d",
            "depts",
            Expr::field("u", "dept"),
            Expr::field("u", "id"),
        ));
        assert!(matches!(
            compile_query(&ir, &registry, CompileOptions::default()),
            Err(CompileError::SameAliasJoin(_))
        ));
    }

    #[test]
    fn test_literal_join_condition_unresolvable() {
        let registry = registry_with(&[("users", 0), ("depts", 0)]);
        let mut ir = QueryIr::from_collection("u", "users");
        ir.joins.push(join_clause(
            JoinType::Inner,
            "d",
            "depts",
            Expr::val(json!(1)),
            Expr::field("d", "id"),
        ));
        assert!(matches!(
            compile_query(&ir, &registry, CompileOptions::default()),
            Err(CompileError::UnresolvableJoinExpr)
        ));
    }

    #[test]
    fn test_left_join_installs_lazy_loader() {
        let registry = registry_with(&[("users", 2), ("depts", 50)]);
        let mut ir = QueryIr::from_collection("u", "users");
        ir.joins.push(join_clause(
            JoinType::Left,
            "d",
            "depts",
            Expr::field("u", "dept"),
            Expr::field("d", "id"),
        ));
        let compiled = compile_query(&ir, &registry, CompileOptions::default()).unwrap();
        assert_eq!(compiled.loaders.len(), 1);
        let loader = &compiled.loaders[0];
        assert_eq!(loader.active_alias, "u");
        assert_eq!(loader.lazy_alias, "d");
        assert_eq!(loader.lazy_field, Path::new("id"));
        assert!(compiled.lazy_aliases.contains("d"));
    }

    #[test]
    fn test_right_join_lazy_side_is_main() {
        let registry = registry_with(&[("users", 2), ("depts", 5)]);
        let mut ir = QueryIr::from_collection("u", "users");
        ir.joins.push(join_clause(
            JoinType::Right,
            "d",
            "depts",
            Expr::field("u", "dept"),
            Expr::field("d", "id"),
        ));
        let compiled = compile_query(&ir, &registry, CompileOptions::default()).unwrap();
        assert_eq!(compiled.loaders.len(), 1);
        assert_eq!(compiled.loaders[0].active_alias, "d");
        assert_eq!(compiled.loaders[0].lazy_alias, "u");
    }

    #[test]
    fn test_inner_join_streams_smaller_side() {
        let registry = registry_with(&[("users", 100), ("depts", 3)]);
        let mut ir = QueryIr::from_collection("u", "users");
        ir.joins.push(join_clause(
            JoinType::Inner,
            "d",
            "depts",
            Expr::field("u", "dept"),
            Expr::field("d", "id"),
        ));
        let compiled = compile_query(&ir, &registry, CompileOptions::default()).unwrap();
        // depts is smaller: it streams, users is lazy.
        assert_eq!(compiled.loaders.len(), 1);
        assert_eq!(compiled.loaders[0].active_alias, "d");
        assert_eq!(compiled.loaders[0].lazy_alias, "u");
    }

    #[test]
    fn test_full_join_has_no_lazy_side() {
        let registry = registry_with(&[("users", 2), ("depts", 50)]);
        let mut ir = QueryIr::from_collection("u", "users");
        ir.joins.push(join_clause(
            JoinType::Full,
            "d",
            "depts",
            Expr::field("u", "dept"),
            Expr::field("d", "id"),
        ));
        let compiled = compile_query(&ir, &registry, CompileOptions::default()).unwrap();
        assert!(compiled.loaders.is_empty());
        assert!(compiled.lazy_aliases.is_empty());
    }

    #[test]
    fn test_computed_lazy_key_disables_lazy_loading() {
        let registry = registry_with(&[("users", 2), ("depts", 50)]);
        let mut ir = QueryIr::from_collection("u", "users");
        ir.joins.push(join_clause(
            JoinType::Left,
            "d",
            "depts",
            Expr::field("u", "dept"),
            Expr::func("lower", vec![Expr::field("d", "id")]),
        ));
        let compiled = compile_query(&ir, &registry, CompileOptions::default()).unwrap();
        assert!(compiled.loaders.is_empty());
    }

    #[test]
    fn test_windowed_subquery_side_disables_lazy_loading() {
        let registry = registry_with(&[("users", 2), ("depts", 50)]);
        let mut inner = QueryIr::from_collection("d", "depts");
        inner.limit = Some(10);
        inner.order_by = Some(vec![OrderBySpec {
            expr: Expr::field("d", "id"),
            direction: Direction::Asc,
        }]);
        let mut ir = QueryIr::from_collection("u", "users");
        ir.joins.push(JoinClause {
            join_type: JoinType::Left,
            source: SourceBinding {
                alias: "top".into(),
                source: SourceRef::Query {
                    query: Box::new(inner),
                },
            },
            left_expr: Expr::field("u", "dept"),
            right_expr: Expr::field("top", "id"),
        });
        let compiled = compile_query(&ir, &registry, CompileOptions::default()).unwrap();
        assert!(compiled.loaders.is_empty());
        // The outer alias resolves straight to the inner one.
        assert!(compiled.inputs.contains_key("d"));
    }

    #[test]
    fn test_nested_subquery_alias_lifting() {
        let registry = registry_with(&[("users", 0), ("posts", 0)]);
        let inner = QueryIr {
            where_clause: Some(Expr::func(
                "eq",
                vec![Expr::field("p", "published"), Expr::val(json!(true))],
            )),
            ..QueryIr::from_collection("p", "posts")
        };
        let mut ir = QueryIr {
            from: SourceBinding {
                alias: "published".into(),
                source: SourceRef::Query {
                    query: Box::new(inner),
                },
            },
            ..QueryIr::from_collection("x", "unused")
        };
        // Reference through the outer alias; it must remap to "p".
        ir.where_clause = Some(Expr::func(
            "eq",
            vec![Expr::field("published", "author"), Expr::val(json!("ada"))],
        ));
        let compiled = compile_query(&ir, &registry, CompileOptions::default()).unwrap();
        assert!(compiled.inputs.contains_key("p"));
        assert_eq!(compiled.inputs.len(), 1);
    }

    #[test]
    fn test_ordered_query_has_order_node() {
        let registry = registry_with(&[("users", 0)]);
        let mut ir = QueryIr::from_collection("u", "users");
        ir.order_by = Some(vec![OrderBySpec {
            expr: Expr::field("u", "name"),
            direction: Direction::Desc,
        }]);
        ir.limit = Some(10);
        let compiled = compile_query(&ir, &registry, CompileOptions::default()).unwrap();
        assert!(compiled.ordered());
    }

    #[test]
    fn test_select_without_order() {
        let registry = registry_with(&[("users", 0)]);
        let mut ir = QueryIr::from_collection("u", "users");
        ir.select = Some(vec![SelectItem {
            name: "name".into(),
            expr: Expr::field("u", "name"),
        }]);
        let compiled = compile_query(&ir, &registry, CompileOptions::default()).unwrap();
        assert!(!compiled.ordered());
        // input, namespace, select map, output
        assert_eq!(compiled.graph.node_count(), 4);
    }
}
