pub mod projection_value;
pub use projection_value::*;

pub mod identifier;
pub use identifier::*;

pub mod select_builder;
pub use select_builder::*;

pub mod pushdown;
pub use pushdown::*;
pub(crate) use pushdown::{alias_hint_of, unique_alias};

pub mod joins;
pub use joins::*;

pub mod set_operations;
pub use set_operations::*;

pub mod grouping;
pub use grouping::*;

pub mod finalize;
pub use finalize::*;
