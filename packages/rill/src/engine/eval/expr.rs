use super::ops::{compare_values, resolve_path};
use crate::engine::types::{FastMap, Path, RillValue};
use rill_protocol::Expr;
use smol_str::SmolStr;
use std::cmp::Ordering;
use thiserror::Error;

/// Errors from expression compilation and evaluation.
///
/// Compilation errors surface synchronously while building a graph; the
/// shape errors surface during a `run()` and abort that batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("unknown function {0:?}")]
    UnknownFunction(SmolStr),
    #[error("empty reference path")]
    EmptyReferencePath,
    #[error("unknown alias {0:?}")]
    UnknownAlias(SmolStr),
    #[error("function {func:?} takes {expected} argument(s)")]
    WrongArity { func: SmolStr, expected: usize },
    #[error("row is not an object")]
    NotAnObject,
    #[error("function {func:?} applied to a value of the wrong kind")]
    KindMismatch { func: SmolStr },
}

/// Three-valued logic result. Comparisons and boolean operators over a
/// null operand yield `Unknown` rather than collapsing to false; a filter
/// keeps a row only when its predicate is definitely true.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    #[inline]
    pub fn from_bool(b: bool) -> Self {
        if b {
            Truth::True
        } else {
            Truth::False
        }
    }

    #[inline]
    pub fn is_true(self) -> bool {
        self == Truth::True
    }

    pub fn and(self, other: Truth) -> Truth {
        match (self, other) {
            (Truth::False, _) | (_, Truth::False) => Truth::False,
            (Truth::True, Truth::True) => Truth::True,
            _ => Truth::Unknown,
        }
    }

    pub fn or(self, other: Truth) -> Truth {
        match (self, other) {
            (Truth::True, _) | (_, Truth::True) => Truth::True,
            (Truth::False, Truth::False) => Truth::False,
            _ => Truth::Unknown,
        }
    }

    pub fn not(self) -> Truth {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Unknown => Truth::Unknown,
        }
    }

    /// The value a truth materializes as: `Unknown` becomes null.
    pub fn into_value(self) -> RillValue {
        match self {
            Truth::True => RillValue::Bool(true),
            Truth::False => RillValue::Bool(false),
            Truth::Unknown => RillValue::Null,
        }
    }
}

/// Alias bindings visible to an expression: every alias in scope maps to
/// the canonical (innermost) alias its rows are namespaced under. Built
/// bottom-up during compilation; lookups never chase chains.
#[derive(Clone, Debug, Default)]
pub struct AliasScope {
    map: FastMap<SmolStr, SmolStr>,
}

impl AliasScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `alias` to itself.
    pub fn bind(&mut self, alias: impl Into<SmolStr>) {
        let alias = alias.into();
        self.map.insert(alias.clone(), alias);
    }

    /// Make `outer` visible as another name for whatever `inner` already
    /// resolves to. One hop only: the stored target is `inner`'s canonical
    /// alias, never `inner` itself.
    pub fn lift(&mut self, outer: impl Into<SmolStr>, inner: &str) {
        if let Some(canonical) = self.map.get(inner).cloned() {
            self.map.insert(outer.into(), canonical);
        }
    }

    /// Merge every binding of `other` into this scope. Later bindings win,
    /// so inner scopes are merged before the aliases that wrap them.
    pub fn absorb(&mut self, other: &AliasScope) {
        for (k, v) in &other.map {
            self.map.insert(k.clone(), v.clone());
        }
    }

    pub fn resolve(&self, alias: &str) -> Option<&SmolStr> {
        self.map.get(alias)
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.map.contains_key(alias)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FuncKind {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    And,
    Or,
    Not,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Concat,
    Upper,
    Lower,
    Length,
    Coalesce,
}

impl FuncKind {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "eq" => FuncKind::Eq,
            "neq" => FuncKind::Neq,
            "gt" => FuncKind::Gt,
            "gte" => FuncKind::Gte,
            "lt" => FuncKind::Lt,
            "lte" => FuncKind::Lte,
            "and" => FuncKind::And,
            "or" => FuncKind::Or,
            "not" => FuncKind::Not,
            "in" => FuncKind::In,
            "add" => FuncKind::Add,
            "sub" => FuncKind::Sub,
            "mul" => FuncKind::Mul,
            "div" => FuncKind::Div,
            "concat" => FuncKind::Concat,
            "upper" => FuncKind::Upper,
            "lower" => FuncKind::Lower,
            "length" => FuncKind::Length,
            "coalesce" => FuncKind::Coalesce,
            _ => return None,
        })
    }

    /// `Some(n)` for fixed arity, `None` for variadic (at least one).
    fn arity(self) -> Option<usize> {
        match self {
            FuncKind::Not | FuncKind::Upper | FuncKind::Lower | FuncKind::Length => Some(1),
            FuncKind::Eq
            | FuncKind::Neq
            | FuncKind::Gt
            | FuncKind::Gte
            | FuncKind::Lt
            | FuncKind::Lte
            | FuncKind::In
            | FuncKind::Add
            | FuncKind::Sub
            | FuncKind::Mul
            | FuncKind::Div => Some(2),
            FuncKind::And | FuncKind::Or | FuncKind::Concat | FuncKind::Coalesce => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            FuncKind::Eq => "eq",
            FuncKind::Neq => "neq",
            FuncKind::Gt => "gt",
            FuncKind::Gte => "gte",
            FuncKind::Lt => "lt",
            FuncKind::Lte => "lte",
            FuncKind::And => "and",
            FuncKind::Or => "or",
            FuncKind::Not => "not",
            FuncKind::In => "in",
            FuncKind::Add => "add",
            FuncKind::Sub => "sub",
            FuncKind::Mul => "mul",
            FuncKind::Div => "div",
            FuncKind::Concat => "concat",
            FuncKind::Upper => "upper",
            FuncKind::Lower => "lower",
            FuncKind::Length => "length",
            FuncKind::Coalesce => "coalesce",
        }
    }
}

/// An expression compiled against an alias scope, ready to evaluate
/// against namespaced rows.
#[derive(Clone, Debug)]
pub struct CompiledExpr {
    kind: ExprKind,
}

#[derive(Clone, Debug)]
enum ExprKind {
    Const(RillValue),
    Ref { alias: SmolStr, path: Path },
    Func { func: FuncKind, args: Vec<CompiledExpr> },
}

impl CompiledExpr {
    pub fn compile(expr: &Expr, scope: &AliasScope) -> Result<Self, EvalError> {
        let kind = match expr {
            Expr::Val { value } => ExprKind::Const(RillValue::from(value.clone())),
            Expr::Ref { path } => {
                let first = path.first().ok_or(EvalError::EmptyReferencePath)?;
                let alias = scope
                    .resolve(first)
                    .ok_or_else(|| EvalError::UnknownAlias(first.clone()))?
                    .clone();
                ExprKind::Ref {
                    alias,
                    path: Path::from_segments(path[1..].iter().cloned()),
                }
            }
            Expr::Func { name, args } => {
                let func = FuncKind::parse(name)
                    .ok_or_else(|| EvalError::UnknownFunction(name.clone()))?;
                match func.arity() {
                    Some(n) if args.len() != n => {
                        return Err(EvalError::WrongArity {
                            func: name.clone(),
                            expected: n,
                        })
                    }
                    None if args.is_empty() => {
                        return Err(EvalError::WrongArity {
                            func: name.clone(),
                            expected: 1,
                        })
                    }
                    _ => {}
                }
                let args = args
                    .iter()
                    .map(|a| CompiledExpr::compile(a, scope))
                    .collect::<Result<Vec<_>, _>>()?;
                ExprKind::Func { func, args }
            }
        };
        Ok(Self { kind })
    }

    /// Evaluate against a namespaced row (an object keyed by alias).
    pub fn eval(&self, row: &RillValue) -> Result<RillValue, EvalError> {
        match &self.kind {
            ExprKind::Const(v) => Ok(v.clone()),
            ExprKind::Ref { alias, path } => {
                let obj = row.as_object().ok_or(EvalError::NotAnObject)?;
                // An absent outer-join side is an explicit null binding;
                // both resolve to null here.
                let root = obj.get(alias);
                Ok(resolve_path(root, path).cloned().unwrap_or(RillValue::Null))
            }
            ExprKind::Func { func, args } => self.eval_func(*func, args, row),
        }
    }

    /// Evaluate as a predicate.
    pub fn eval_truth(&self, row: &RillValue) -> Result<Truth, EvalError> {
        truth_of(&self.eval(row)?, "where")
    }

    fn eval_func(
        &self,
        func: FuncKind,
        args: &[CompiledExpr],
        row: &RillValue,
    ) -> Result<RillValue, EvalError> {
        match func {
            FuncKind::Eq | FuncKind::Neq | FuncKind::Gt | FuncKind::Gte | FuncKind::Lt
            | FuncKind::Lte => {
                let a = args[0].eval(row)?;
                let b = args[1].eval(row)?;
                if a.is_null() || b.is_null() {
                    return Ok(RillValue::Null);
                }
                let ord = compare_values(Some(&a), Some(&b));
                let result = match func {
                    FuncKind::Eq => ord == Ordering::Equal,
                    FuncKind::Neq => ord != Ordering::Equal,
                    FuncKind::Gt => ord == Ordering::Greater,
                    FuncKind::Gte => ord != Ordering::Less,
                    FuncKind::Lt => ord == Ordering::Less,
                    FuncKind::Lte => ord != Ordering::Greater,
                    _ => unreachable!(),
                };
                Ok(RillValue::Bool(result))
            }
            FuncKind::And => {
                let mut acc = Truth::True;
                for arg in args {
                    acc = acc.and(truth_of(&arg.eval(row)?, "and")?);
                }
                Ok(acc.into_value())
            }
            FuncKind::Or => {
                let mut acc = Truth::False;
                for arg in args {
                    acc = acc.or(truth_of(&arg.eval(row)?, "or")?);
                }
                Ok(acc.into_value())
            }
            FuncKind::Not => Ok(truth_of(&args[0].eval(row)?, "not")?.not().into_value()),
            FuncKind::In => {
                let needle = args[0].eval(row)?;
                if needle.is_null() {
                    return Ok(RillValue::Null);
                }
                let haystack = args[1].eval(row)?;
                let items = match &haystack {
                    RillValue::Null => return Ok(RillValue::Null),
                    RillValue::Array(items) => items,
                    _ => {
                        return Err(EvalError::KindMismatch {
                            func: SmolStr::new("in"),
                        })
                    }
                };
                let mut saw_null = false;
                for item in items {
                    if item.is_null() {
                        saw_null = true;
                    } else if compare_values(Some(item), Some(&needle)) == Ordering::Equal {
                        return Ok(RillValue::Bool(true));
                    }
                }
                // A null member means the membership test is undecided.
                if saw_null {
                    Ok(RillValue::Null)
                } else {
                    Ok(RillValue::Bool(false))
                }
            }
            FuncKind::Add | FuncKind::Sub | FuncKind::Mul | FuncKind::Div => {
                let a = args[0].eval(row)?;
                let b = args[1].eval(row)?;
                if a.is_null() || b.is_null() {
                    return Ok(RillValue::Null);
                }
                let (x, y) = match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) => (x, y),
                    _ => {
                        return Err(EvalError::KindMismatch {
                            func: SmolStr::new(func.name()),
                        })
                    }
                };
                let out = match func {
                    FuncKind::Add => x + y,
                    FuncKind::Sub => x - y,
                    FuncKind::Mul => x * y,
                    FuncKind::Div => x / y,
                    _ => unreachable!(),
                };
                Ok(RillValue::Number(out))
            }
            FuncKind::Concat => {
                let mut out = String::new();
                for arg in args {
                    let v = arg.eval(row)?;
                    match v {
                        RillValue::Null => return Ok(RillValue::Null),
                        RillValue::Str(s) => out.push_str(&s),
                        _ => {
                            return Err(EvalError::KindMismatch {
                                func: SmolStr::new("concat"),
                            })
                        }
                    }
                }
                Ok(RillValue::Str(SmolStr::new(out)))
            }
            FuncKind::Upper | FuncKind::Lower => {
                let v = args[0].eval(row)?;
                match v {
                    RillValue::Null => Ok(RillValue::Null),
                    RillValue::Str(s) => {
                        let s = if func == FuncKind::Upper {
                            s.to_uppercase()
                        } else {
                            s.to_lowercase()
                        };
                        Ok(RillValue::Str(SmolStr::new(s)))
                    }
                    _ => Err(EvalError::KindMismatch {
                        func: SmolStr::new(func.name()),
                    }),
                }
            }
            FuncKind::Length => {
                let v = args[0].eval(row)?;
                match v {
                    RillValue::Null => Ok(RillValue::Null),
                    RillValue::Str(s) => Ok(RillValue::Number(s.chars().count() as f64)),
                    RillValue::Array(items) => Ok(RillValue::Number(items.len() as f64)),
                    _ => Err(EvalError::KindMismatch {
                        func: SmolStr::new("length"),
                    }),
                }
            }
            FuncKind::Coalesce => {
                for arg in args {
                    let v = arg.eval(row)?;
                    if !v.is_null() {
                        return Ok(v);
                    }
                }
                Ok(RillValue::Null)
            }
        }
    }
}

fn truth_of(v: &RillValue, func: &str) -> Result<Truth, EvalError> {
    match v {
        RillValue::Null => Ok(Truth::Unknown),
        RillValue::Bool(b) => Ok(Truth::from_bool(*b)),
        _ => Err(EvalError::KindMismatch {
            func: SmolStr::new(func),
        }),
    }
}
