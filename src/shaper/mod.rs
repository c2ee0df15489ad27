pub mod value_binding;
pub use value_binding::*;

pub mod shaped_query;
pub use shaped_query::*;

pub mod include_tree;
pub use include_tree::*;
