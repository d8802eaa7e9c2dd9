use crate::expr::Expr;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// A compiled, language-agnostic query: one root source, zero or more
/// joins, optional predicate, projection and ordering.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryIr {
    pub from: SourceBinding,
    #[serde(default)]
    pub joins: Vec<JoinClause>,
    #[serde(default, rename = "where")]
    pub where_clause: Option<Expr>,
    /// Output columns as `(name, expression)` pairs. `None` keeps the
    /// namespaced record untouched.
    #[serde(default)]
    pub select: Option<Vec<SelectItem>>,
    #[serde(default)]
    pub order_by: Option<Vec<OrderBySpec>>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl QueryIr {
    pub fn from_collection(alias: impl Into<SmolStr>, collection: impl Into<SmolStr>) -> Self {
        Self {
            from: SourceBinding {
                alias: alias.into(),
                source: SourceRef::Collection {
                    id: collection.into(),
                },
            },
            joins: Vec::new(),
            where_clause: None,
            select: None,
            order_by: None,
            limit: None,
            offset: None,
        }
    }

    /// True when the result set is bounded by `limit`/`offset`.
    pub fn is_windowed(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }
}

/// A source together with the alias it is bound to in the query scope.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SourceBinding {
    pub alias: SmolStr,
    pub source: SourceRef,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceRef {
    /// A base collection registered with the engine.
    Collection { id: SmolStr },
    /// A nested subquery, compiled recursively.
    Query { query: Box<QueryIr> },
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinClause {
    #[serde(rename = "type")]
    pub join_type: JoinType,
    pub source: SourceBinding,
    /// Condition side that must resolve to an already-bound alias.
    pub left_expr: Expr,
    /// Condition side that must resolve to the joined source's alias.
    pub right_expr: Expr,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SelectItem {
    pub name: SmolStr,
    pub expr: Expr,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderBySpec {
    pub expr: Expr,
    #[serde(default)]
    pub direction: Direction,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// Bounds of an ordered view, mutable at runtime.
///
/// A negative `offset`, an offset past the candidate count, or a zero
/// `limit` all denote an empty window; none of them is an error.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Window {
    pub fn new(offset: i64, limit: Option<usize>) -> Self {
        Self { offset, limit }
    }

    /// The half-open member-rank range `[start, end)` for `total` candidates.
    pub fn bounds(&self, total: usize) -> (usize, usize) {
        if self.offset < 0 {
            return (0, 0);
        }
        let start = (self.offset as usize).min(total);
        let end = match self.limit {
            Some(limit) => start.saturating_add(limit).min(total),
            None => total,
        };
        (start, end)
    }
}

impl Default for Window {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: None,
        }
    }
}
