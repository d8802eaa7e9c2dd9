mod expr;
mod ops;

pub use expr::{AliasScope, CompiledExpr, EvalError, Truth};
pub use ops::{compare_values, hash_value, resolve_path};
