use std::fmt;

use crate::{
    metadata::TypeMapping,
    sql::{SelectExpression, SqlExprRef, TableId}
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinKind {
    Inner,
    Left,
    Cross,
    CrossApply,
    OuterApply,
}

impl JoinKind {
    pub fn is_apply(&self) -> bool {
        matches!(self, JoinKind::CrossApply | JoinKind::OuterApply)
    }

    /// Whether the joined side may produce no row (its columns become nullable).
    pub fn is_outer(&self) -> bool {
        matches!(self, JoinKind::Left | JoinKind::OuterApply)
    }

    /// Ordinary join equivalent of an APPLY.
    pub fn as_join(&self) -> JoinKind {
        match self {
            JoinKind::CrossApply => JoinKind::Inner,
            JoinKind::OuterApply => JoinKind::Left,
            other => *other,
        }
    }
}

impl fmt::Display for JoinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Cross => "CROSS JOIN",
            JoinKind::CrossApply => "CROSS APPLY",
            JoinKind::OuterApply => "OUTER APPLY",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub predicate: Option<SqlExprRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetOperationKind {
    Union,
    Intersect,
    Except,
}

impl SetOperationKind {
    pub fn alias_hint(&self) -> &'static str {
        match self {
            SetOperationKind::Union => "u",
            SetOperationKind::Intersect => "i",
            SetOperationKind::Except => "e",
        }
    }
}

impl fmt::Display for SetOperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetOperationKind::Union => write!(f, "UNION"),
            SetOperationKind::Intersect => write!(f, "INTERSECT"),
            SetOperationKind::Except => write!(f, "EXCEPT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValuesSource {
    Rows(Vec<Vec<SqlExprRef>>),
    /// Rows come from a collection-valued parameter
    Parameter { name: String, element: Option<TypeMapping> },
}

/// Concrete table of a table-per-concrete-type hierarchy, as a sub-select
/// projecting every hierarchy column plus a constant discriminator.
#[derive(Debug, Clone, PartialEq)]
pub struct TpcSubselect {
    pub discriminator: String,
    pub select: SelectExpression,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableExpr {
    Table { name: String, schema: Option<String> },
    Subquery(Box<SelectExpression>),
    SetOperation {
        kind: SetOperationKind,
        distinct: bool,
        left: Box<SelectExpression>,
        right: Box<SelectExpression>,
    },
    TableValuedFunction { name: String, args: Vec<SqlExprRef> },
    FromSql { sql: String, args: Vec<SqlExprRef> },
    Values { rows: ValuesSource, column_names: Vec<String> },
    /// `UNION ALL` of the concrete tables, restricted to `discriminator_values`
    TpcTables {
        subselects: Vec<TpcSubselect>,
        discriminator_column: String,
        discriminator_values: Vec<String>,
    },
}

impl TableExpr {
    pub fn table(name: &str, schema: Option<&str>) -> Self {
        TableExpr::Table { name: name.to_string(), schema: schema.map(|s| s.to_string()) }
    }

    /// Name used to derive an alias for this table.
    pub fn alias_hint(&self) -> &str {
        match self {
            TableExpr::Table { name, .. } | TableExpr::TableValuedFunction { name, .. } => name,
            TableExpr::Subquery(_) => "s",
            TableExpr::SetOperation { kind, .. } => kind.alias_hint(),
            TableExpr::FromSql { .. } => "m",
            TableExpr::Values { .. } => "v",
            TableExpr::TpcTables { subselects, .. } => subselects.first()
                .and_then(|s| s.select.tables.first())
                .map(|t| t.table.alias_hint())
                .unwrap_or("t"),
        }
    }

    /// Names of the columns a reference to this table can read, when known.
    pub fn column_names(&self) -> Option<Vec<String>> {
        match self {
            TableExpr::Subquery(s) => Some(s.column_names()),
            TableExpr::SetOperation { left, .. } => Some(left.column_names()),
            TableExpr::Values { column_names, .. } => Some(column_names.clone()),
            TableExpr::TpcTables { subselects, .. } => subselects.first().map(|s| s.select.column_names()),
            _ => None,
        }
    }
}

impl fmt::Display for TableExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableExpr::Table { name, schema: Some(schema) } => write!(f, "{}.{}", schema, name),
            TableExpr::Table { name, schema: None } => write!(f, "{}", name),
            TableExpr::Subquery(s) => write!(f, "({})", s),
            TableExpr::SetOperation { kind, distinct, left, right } => {
                write!(f, "({} {}{} {})", left, kind, if *distinct { "" } else { " ALL" }, right)
            }
            TableExpr::TableValuedFunction { name, args } => {
                write!(f, "{}(", name)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            TableExpr::FromSql { sql, .. } => write!(f, "({})", sql),
            TableExpr::Values { rows: ValuesSource::Parameter { name, .. }, .. } => write!(f, "@{}", name),
            TableExpr::Values { rows: ValuesSource::Rows(rows), .. } => {
                write!(f, "(VALUES ")?;
                for (i, row) in rows.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "(")?;
                    for (j, v) in row.iter().enumerate() {
                        if j > 0 { write!(f, ", ")?; }
                        write!(f, "{}", v)?;
                    }
                    write!(f, ")")?;
                }
                write!(f, ")")
            }
            TableExpr::TpcTables { subselects, .. } => {
                write!(f, "(")?;
                for (i, s) in subselects.iter().enumerate() {
                    if i > 0 { write!(f, " UNION ALL ")?; }
                    write!(f, "{}", s.select)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// One entry of a FROM chain. The first source of a select has no `join`.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSource {
    pub id: TableId,
    pub alias: String,
    pub table: TableExpr,
    pub join: Option<Join>,
}

impl TableSource {
    pub fn new(id: TableId, alias: String, table: TableExpr) -> Self {
        Self { id, alias, table, join: None }
    }

    pub fn joined(mut self, kind: JoinKind, predicate: Option<SqlExprRef>) -> Self {
        self.join = Some(Join { kind, predicate });
        self
    }

    pub fn join_kind(&self) -> Option<JoinKind> {
        self.join.as_ref().map(|j| j.kind)
    }
}

impl fmt::Display for TableSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.join {
            None => write!(f, "{} AS {}", self.table, self.alias),
            Some(Join { kind, predicate: Some(p) }) => write!(f, "{} {} AS {} ON {}", kind, self.table, self.alias, p),
            Some(Join { kind, predicate: None }) => write!(f, "{} {} AS {}", kind, self.table, self.alias),
        }
    }
}
