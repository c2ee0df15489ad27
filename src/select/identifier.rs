use crate::{
    metadata::ValueComparer,
    sql::{ExprRewriter, Replacer, SqlExpr, SqlExprRef}
};

/// Projected value that takes part in identifying a row, with the comparer
/// its values must be compared with.
#[derive(Debug, Clone, PartialEq)]
pub struct Identifier {
    pub expr: SqlExprRef,
    pub comparer: ValueComparer,
}

impl Identifier {
    pub fn new(expr: SqlExprRef, comparer: ValueComparer) -> Self {
        Self { expr, comparer }
    }

    /// Identifier of a scalar, using the comparer of its type mapping.
    pub fn of(expr: SqlExprRef) -> Self {
        let comparer = expr.type_mapping().map(|m| m.comparer).unwrap_or_default();
        Self { expr, comparer }
    }

    pub fn make_nullable(&self) -> Self {
        Self { expr: SqlExpr::make_nullable(&self.expr), comparer: self.comparer }
    }

    pub fn remap(&self, f: &mut Replacer<'_>) -> Self {
        Self { expr: ExprRewriter::rewrite(&self.expr, f), comparer: self.comparer }
    }
}
