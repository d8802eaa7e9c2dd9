mod multiset;
mod path;
mod value;

pub use multiset::{DeltaBatch, FastMap, FastSet, MultisetEntry, RowKey, Weight};
pub use path::Path;
pub use value::RillValue;
