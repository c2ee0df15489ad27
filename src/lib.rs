pub mod error;
pub use error::*;

pub mod config;
pub use config::*;

pub mod metadata;
pub use metadata::{Model, EntityType, Property, Navigation, ComplexProperty, TypeMapping, ValueKind, ValueComparer};

pub mod sql;
pub mod select;
pub mod structural;
pub mod shaper;

pub mod translation;
pub use translation::{Query, QueryRoot, QueryOp, ClientExpr, Lambda, CompiledQuery, QueryCompilationContext, compile_query};

#[cfg(test)]
mod _tests;
