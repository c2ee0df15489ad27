pub mod query_tree;
pub use query_tree::*;

pub mod compilation_context;
pub use compilation_context::*;

pub mod root_builder;
pub use root_builder::*;

pub mod translated;
pub use translated::*;

pub mod correlation;

pub mod navigations;

pub mod aggregates;
pub use aggregates::*;

pub mod sql_translator;
pub use sql_translator::*;

pub mod queryable_translator;
pub use queryable_translator::*;

pub mod include_expander;
pub use include_expander::*;

pub mod query_finalizer;
pub use query_finalizer::*;
