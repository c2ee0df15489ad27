pub mod alias_allocator;
pub use alias_allocator::*;

pub mod sql_value;
pub use sql_value::*;

pub mod operators;
pub use operators::*;

pub mod sql_expr;
pub use sql_expr::*;

pub mod ordering;
pub use ordering::*;

pub mod projection;
pub use projection::*;

pub mod table_expr;
pub use table_expr::*;

pub mod select_expression;
pub use select_expression::*;

pub mod expr_visitor;
pub use expr_visitor::*;
