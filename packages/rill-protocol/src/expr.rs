use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;

/// A scalar expression in the query IR.
///
/// The first segment of a `Ref` path names a source alias; the remaining
/// segments walk into the row bound to that alias.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Expr {
    Val { value: Value },
    Ref { path: Vec<SmolStr> },
    Func { name: SmolStr, args: Vec<Expr> },
}

impl Expr {
    pub fn val(value: impl Into<Value>) -> Self {
        Expr::Val {
            value: value.into(),
        }
    }

    /// A reference to `alias.field`.
    pub fn field(alias: impl Into<SmolStr>, field: impl Into<SmolStr>) -> Self {
        Expr::Ref {
            path: vec![alias.into(), field.into()],
        }
    }

    pub fn func(name: impl Into<SmolStr>, args: Vec<Expr>) -> Self {
        Expr::Func {
            name: name.into(),
            args,
        }
    }

    /// The alias this expression references, if it references exactly one.
    ///
    /// Returns `None` for literal expressions and for expressions mixing
    /// several aliases; join planning treats both as unresolvable.
    pub fn single_alias(&self) -> Option<&str> {
        let mut found: Option<&str> = None;
        let mut mixed = false;
        self.visit_refs(&mut |path| {
            if let Some(first) = path.first() {
                match found {
                    None => found = Some(first.as_str()),
                    Some(seen) if seen != first.as_str() => mixed = true,
                    Some(_) => {}
                }
            }
        });
        if mixed {
            None
        } else {
            found
        }
    }

    /// If this is a plain field reference, yields `(alias, field path)`.
    ///
    /// Function applications are computed expressions and return `None`
    /// even when every argument is a reference.
    pub fn as_field_ref(&self) -> Option<(&str, &[SmolStr])> {
        match self {
            Expr::Ref { path } if path.len() >= 2 => Some((path[0].as_str(), &path[1..])),
            _ => None,
        }
    }

    fn visit_refs<'a>(&'a self, f: &mut impl FnMut(&'a [SmolStr])) {
        match self {
            Expr::Val { .. } => {}
            Expr::Ref { path } => f(path),
            Expr::Func { args, .. } => {
                for arg in args {
                    arg.visit_refs(f);
                }
            }
        }
    }
}
