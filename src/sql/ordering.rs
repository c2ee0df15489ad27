use std::fmt;

use crate::sql::SqlExprRef;

/// One `ORDER BY` term.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub expr: SqlExprRef,
    pub ascending: bool,
}

impl OrderBy {
    pub fn new(expr: SqlExprRef, ascending: bool) -> Self {
        Self { expr, ascending }
    }

    pub fn asc(expr: SqlExprRef) -> Self {
        Self::new(expr, true)
    }

    pub fn reversed(&self) -> Self {
        Self { expr: self.expr.clone(), ascending: !self.ascending }
    }

    pub fn with_expr(&self, expr: SqlExprRef) -> Self {
        Self { expr, ascending: self.ascending }
    }
}

impl fmt::Display for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.expr, if self.ascending { "ASC" } else { "DESC" })
    }
}
