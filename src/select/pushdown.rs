use std::{collections::BTreeSet, rc::Rc};
use tracing::debug;

use crate::{
    error::{QueryError, QueryResult},
    metadata::TypeMapping,
    select::{Identifier, ProjectionValue, SelectBuilder},
    sql::{
        AliasAllocator, ExprCollector, ExprRewriter, JsonPathSegment, ProjectionExpr, SelectExpression,
        SqlExpr, SqlExprRef, TableExpr, TableId, TableSource
    }
};

/// Column alias unique among `taken`: `Name`, `Name0`, `Name1`, ...
pub(crate) fn unique_alias(taken: &[ProjectionExpr], hint: &str) -> String {
    let hint = if hint.is_empty() { "c" } else { hint };
    if !taken.iter().any(|p| p.alias == hint) {
        return hint.to_string();
    }
    (0..).map(|i| format!("{hint}{i}"))
        .find(|candidate| !taken.iter().any(|p| &p.alias == candidate))
        .unwrap_or_else(|| hint.to_string())
}

pub(crate) fn alias_hint_of(expr: &SqlExprRef) -> String {
    match expr.as_ref() {
        SqlExpr::Column(c) => c.name.clone(),
        SqlExpr::JsonScalar { path, .. } => path.iter().rev()
            .find_map(|p| match p {
                JsonPathSegment::Property(name) => Some(name.clone()),
                JsonPathSegment::Index(_) => None,
            })
            .unwrap_or_else(|| "c".to_string()),
        _ => "c".to_string(),
    }
}

/// Builds the projection of a pushed-down subquery and maps inner expressions
/// to the outer columns reading them.
///
/// Lookups go by `Rc` identity first; bare columns also match structurally,
/// since the same column is rebuilt from metadata in several places.
pub(crate) struct ColumnLifter {
    table: TableId,
    inner_tables: BTreeSet<TableId>,
    grouped: bool,
    /// No new columns may be added (the inner select is DISTINCT)
    frozen: bool,
    projection: Vec<ProjectionExpr>,
    lifted: Vec<(SqlExprRef, SqlExprRef)>,
}

impl ColumnLifter {
    pub(crate) fn new(table: TableId, inner_tables: BTreeSet<TableId>, grouped: bool) -> Self {
        Self { table, inner_tables, grouped, frozen: false, projection: Vec::new(), lifted: Vec::new() }
    }

    fn find(&self, expr: &SqlExprRef) -> Option<SqlExprRef> {
        if let Some((_, outer)) = self.lifted.iter().find(|(inner, _)| Rc::ptr_eq(inner, expr)) {
            return Some(outer.clone());
        }
        // one column, whatever nullability the reference carries
        let column = expr.as_column()?;
        let (_, outer) = self.lifted.iter().find(|(inner, _)| {
            inner.as_column().is_some_and(|c| c.table == column.table && c.name == column.name)
        })?;
        Some(if column.nullable { SqlExpr::make_nullable(outer) } else { outer.clone() })
    }

    /// Project `expr` as a whole and return the outer column reading it.
    pub(crate) fn lift(&mut self, expr: &SqlExprRef, hint: &str) -> QueryResult<SqlExprRef> {
        if let Some(found) = self.find(expr) {
            return Ok(found);
        }
        if self.frozen {
            return QueryError::not_translated(format!(
                "'{}' is not part of the projection of a DISTINCT subquery", expr
            )).err();
        }
        let alias = unique_alias(&self.projection, hint);
        let type_mapping = expr.type_mapping().cloned().unwrap_or_else(TypeMapping::string);
        let outer = SqlExpr::column(&alias, self.table, type_mapping, expr.is_nullable());
        self.projection.push(ProjectionExpr::new(expr.clone(), alias));
        self.lifted.push((expr.clone(), outer.clone()));
        Ok(outer)
    }

    fn lift_value(&mut self, value: &ProjectionValue, hint: &str) -> QueryResult<ProjectionValue> {
        let mut failure = None;
        let lifted = match value {
            ProjectionValue::Scalar(e) => ProjectionValue::Scalar(self.lift(e, hint)?),
            other => other.remap(&mut |e: &SqlExprRef| match self.lift(e, &alias_hint_of(e)) {
                Ok(outer) => Some(outer),
                Err(err) => {
                    failure.get_or_insert(err);
                    Some(e.clone())
                }
            }),
        };
        match failure {
            Some(err) => Err(err),
            None => Ok(lifted),
        }
    }

    /// Rewrite `expr` for the outer scope, projecting only the pieces that
    /// read the inner tables: columns, and aggregates of a grouped select.
    pub(crate) fn remap(&mut self, expr: &SqlExprRef) -> QueryResult<SqlExprRef> {
        let mut failure = None;
        let out = ExprRewriter::rewrite(expr, &mut |e: &SqlExprRef| {
            if failure.is_some() {
                return None;
            }
            if let Some(found) = self.find(e) {
                return Some(found);
            }
            let liftable = match e.as_ref() {
                SqlExpr::Column(c) => self.inner_tables.contains(&c.table),
                SqlExpr::Function { aggregate: true, .. } => {
                    self.grouped && ExprCollector::referenced_tables(e).iter().all(|t| self.inner_tables.contains(t))
                }
                SqlExpr::RowNumber { .. } => true,
                _ => false,
            };
            if !liftable {
                return None;
            }
            match self.lift(e, &alias_hint_of(e)) {
                Ok(outer) => Some(outer),
                Err(err) => {
                    failure = Some(err);
                    None
                }
            }
        });
        match failure {
            Some(err) => Err(err),
            None => Ok(out),
        }
    }
}

enum Extras {
    Remap(Vec<SqlExprRef>),
    Lift(Vec<SqlExprRef>),
}

impl SelectBuilder {
    /// Wrap the current state into a subquery and read it from a fresh outer select.
    pub fn pushdown_into_subquery(self, aliases: &mut AliasAllocator) -> QueryResult<Self> {
        Ok(self.pushdown(aliases, Extras::Remap(Vec::new()))?.0)
    }

    /// Pushdown that also carries `extras` (expressions over the current tables)
    /// to the outer scope, projecting only what they read.
    pub fn pushdown_with_extras(self, aliases: &mut AliasAllocator, extras: Vec<SqlExprRef>) -> QueryResult<(Self, Vec<SqlExprRef>)> {
        self.pushdown(aliases, Extras::Remap(extras))
    }

    /// Pushdown that projects each of `exprs` whole as a new inner column.
    pub fn pushdown_lifting(self, aliases: &mut AliasAllocator, exprs: Vec<SqlExprRef>) -> QueryResult<(Self, Vec<SqlExprRef>)> {
        self.pushdown(aliases, Extras::Lift(exprs))
    }

    pub(crate) fn pushdown_remapping(self, aliases: &mut AliasAllocator, expr: SqlExprRef) -> QueryResult<(Self, SqlExprRef)> {
        let (select, mut remapped) = self.pushdown_with_extras(aliases, vec![expr])?;
        let expr = remapped.pop().ok_or_else(|| QueryError::invalid("pushdown dropped a carried expression"))?;
        Ok((select, expr))
    }

    fn pushdown(self, aliases: &mut AliasAllocator, extras: Extras) -> QueryResult<(Self, Vec<SqlExprRef>)> {
        let alias = aliases.generate_table_alias("s");
        let mut lifter = ColumnLifter::new(alias.id, self.table_ids(), self.is_grouped());

        let mut mapping = indexmap::IndexMap::new();
        for (member, value) in &self.mapping {
            mapping.insert(member.clone(), lifter.lift_value(value, member.alias_hint())?);
        }
        let mut client_projections = Vec::new();
        for value in &self.client_projections {
            client_projections.push(lifter.lift_value(value, "c")?);
        }

        // A DISTINCT inner cannot grow without changing its rows
        lifter.frozen = self.distinct;

        let mut identifier = Vec::new();
        for id in &self.identifier {
            match lifter.lift(&id.expr, &alias_hint_of(&id.expr)) {
                Ok(e) => identifier.push(Identifier::new(e, id.comparer)),
                Err(_) => {
                    identifier.clear();
                    break;
                }
            }
        }
        let mut child_identifiers = Vec::new();
        for id in &self.child_identifiers {
            if let Ok(e) = lifter.lift(&id.expr, &alias_hint_of(&id.expr)) {
                child_identifiers.push(Identifier::new(e, id.comparer));
            }
        }

        let mut orderings = Vec::new();
        for o in &self.orderings {
            match lifter.remap(&o.expr) {
                Ok(e) => orderings.push(o.with_expr(e)),
                Err(_) if self.distinct => {}
                Err(e) => return Err(e),
            }
        }

        let extras = match extras {
            Extras::Remap(list) => list.iter().map(|e| lifter.remap(e)).collect::<QueryResult<Vec<_>>>()?,
            Extras::Lift(list) => list.iter().map(|e| lifter.lift(e, &alias_hint_of(e))).collect::<QueryResult<Vec<_>>>()?,
        };

        let mut projection = lifter.projection;
        if projection.is_empty() {
            projection.push(ProjectionExpr::new(SqlExpr::int(1), "empty"));
        }
        let keep_orderings = self.is_limited();
        let inner = SelectExpression {
            tables: self.tables,
            predicate: self.predicate,
            group_by: self.group_by,
            having: self.having,
            orderings: if keep_orderings { self.orderings } else { Vec::new() },
            limit: self.limit,
            offset: self.offset,
            distinct: self.distinct,
            projection,
        };
        debug!(alias = %alias.name, columns = inner.projection.len(), "pushed select down into subquery");

        let select = SelectBuilder {
            tables: vec![TableSource::new(alias.id, alias.name, TableExpr::Subquery(Box::new(inner)))],
            mapping,
            client_projections,
            identifier,
            child_identifiers,
            orderings,
            ..SelectBuilder::default()
        };
        Ok((select, extras))
    }
}
