pub mod structural_projection;
pub use structural_projection::*;

pub mod json_query;
pub use json_query::*;
