use serde::{Deserialize, Serialize};

use crate::sql::{SqlExpr, SqlExprRef};

/// How collection projections are loaded.
///
/// - `SingleQuery`: collections are APPLY-joined into the main result set.
/// - `SplitQuery`: every collection becomes a separate follow-up query
///   correlated by the parent identifier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum QuerySplittingBehavior {
    #[default]
    SingleQuery,
    SplitQuery,
}

/// Equality semantics applied when both operands may be null.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum NullSemantics {
    /// `null == null` is true; nullable equality is expanded to a null-safe comparison.
    #[default]
    CSharp,
    /// Plain SQL three-valued comparison.
    Relational,
}

impl NullSemantics {
    /// `NOT predicate`. Under `CSharp` a comparison reading a null is false,
    /// so its negation must be true.
    pub fn negate(&self, predicate: SqlExprRef) -> SqlExprRef {
        match self {
            NullSemantics::CSharp => SqlExpr::null_safe_not(predicate),
            NullSemantics::Relational => SqlExpr::not(predicate),
        }
    }
}

/// Options of one query compilation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TranslationOptions {
    /// Default loading of collection projections
    pub query_splitting: QuerySplittingBehavior,
    pub null_semantics: NullSemantics,
    /// Try to turn CROSS/OUTER APPLY into ordinary joins
    pub rewrite_apply_to_join: bool,
}

impl Default for TranslationOptions {
    fn default() -> Self {
        Self {
            query_splitting: QuerySplittingBehavior::SingleQuery,
            null_semantics: NullSemantics::CSharp,
            rewrite_apply_to_join: true,
        }
    }
}

impl TranslationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn split_query() -> Self {
        Self { query_splitting: QuerySplittingBehavior::SplitQuery, ..Self::default() }
    }

    pub fn relational_nulls(mut self) -> Self {
        self.null_semantics = NullSemantics::Relational;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_deserialize_with_defaults() {
        let opts: TranslationOptions = serde_json::from_str(r#"{ "query_splitting": "SplitQuery" }"#).unwrap();
        assert_eq!(opts.query_splitting, QuerySplittingBehavior::SplitQuery);
        assert_eq!(opts.null_semantics, NullSemantics::CSharp);
        assert!(opts.rewrite_apply_to_join);
    }

    #[test]
    fn empty_object_is_default() {
        let opts: TranslationOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts, TranslationOptions::default());
    }
}
