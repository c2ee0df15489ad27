use std::fmt;

use crate::sql::{OrderBy, ProjectionExpr, SqlExprRef, TableExpr, TableId, TableSource};

/// A finalized `SELECT`: positional projection, no member paths.
///
/// Only `SelectBuilder::finalize` produces one. Every nested subquery inside
/// it is frozen too.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectExpression {
    pub tables: Vec<TableSource>,
    pub predicate: Option<SqlExprRef>,
    pub group_by: Vec<SqlExprRef>,
    pub having: Option<SqlExprRef>,
    pub orderings: Vec<OrderBy>,
    pub limit: Option<SqlExprRef>,
    pub offset: Option<SqlExprRef>,
    pub distinct: bool,
    pub projection: Vec<ProjectionExpr>,
}

impl SelectExpression {
    pub fn column_names(&self) -> Vec<String> {
        self.projection.iter().map(|p| p.alias.clone()).collect()
    }

    pub fn table(&self, id: TableId) -> Option<&TableSource> {
        self.tables.iter().find(|t| t.id == id)
    }

    pub fn projection_index(&self, alias: &str) -> Option<usize> {
        self.projection.iter().position(|p| p.alias == alias)
    }

    /// Number of derived tables (subqueries) in this select's FROM chain, recursively.
    pub fn subquery_count(&self) -> usize {
        self.tables.iter().map(|t| match &t.table {
            TableExpr::Subquery(s) => 1 + s.subquery_count(),
            _ => 0,
        }).sum()
    }

    /// Table handles declared in this select and in every nested FROM chain.
    pub fn declared_tables(&self) -> Vec<TableId> {
        let mut out = Vec::new();
        for t in &self.tables {
            out.push(t.id);
            match &t.table {
                TableExpr::Subquery(s) => out.extend(s.declared_tables()),
                TableExpr::SetOperation { left, right, .. } => {
                    out.extend(left.declared_tables());
                    out.extend(right.declared_tables());
                }
                TableExpr::TpcTables { subselects, .. } => {
                    for s in subselects {
                        out.extend(s.select.declared_tables());
                    }
                }
                _ => {}
            }
        }
        out
    }
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 { write!(f, ", ")?; }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for SelectExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT ")?;
        if self.distinct { write!(f, "DISTINCT ")?; }
        if self.projection.is_empty() {
            write!(f, "1")?;
        } else {
            write_list(f, &self.projection)?;
        }
        if !self.tables.is_empty() {
            write!(f, " FROM ")?;
            for (i, t) in self.tables.iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{}", t)?;
            }
        }
        if let Some(p) = &self.predicate { write!(f, " WHERE {}", p)?; }
        if !self.group_by.is_empty() {
            write!(f, " GROUP BY ")?;
            write_list(f, &self.group_by)?;
        }
        if let Some(h) = &self.having { write!(f, " HAVING {}", h)?; }
        if !self.orderings.is_empty() {
            write!(f, " ORDER BY ")?;
            write_list(f, &self.orderings)?;
        }
        if let Some(l) = &self.limit { write!(f, " LIMIT {}", l)?; }
        if let Some(o) = &self.offset { write!(f, " OFFSET {}", o)?; }
        Ok(())
    }
}
