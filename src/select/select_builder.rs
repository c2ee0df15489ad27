use indexmap::IndexMap;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::{
    error::QueryResult,
    metadata::Model,
    select::{Identifier, ProjectionValue},
    sql::{
        AliasAllocator, BinaryOp, ExprCollector, ExprRewriter, InValues, Join, OrderBy, ProjectionMember,
        Replacer, SqlExpr, SqlExprRef, SqlValue, TableExpr, TableId, TableRenamer, TableSource
    }
};

/// A `SELECT` under construction.
///
/// The projection is a member-path mapping until `finalize` turns the builder
/// into a positional `SelectExpression`. Every composition operation consumes
/// the builder and returns the next one, pushing the current state down into a
/// subquery when the requested clause cannot be added to it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectBuilder {
    pub tables: Vec<TableSource>,
    pub predicate: Option<SqlExprRef>,
    pub group_by: Vec<SqlExprRef>,
    pub having: Option<SqlExprRef>,
    pub orderings: Vec<OrderBy>,
    pub limit: Option<SqlExprRef>,
    pub offset: Option<SqlExprRef>,
    pub distinct: bool,
    pub mapping: IndexMap<ProjectionMember, ProjectionValue>,
    /// Values the shaper addresses by ordinal, projected after the mapping
    pub client_projections: Vec<ProjectionValue>,
    pub identifier: Vec<Identifier>,
    pub child_identifiers: Vec<Identifier>,
    pub pre_group_by_identifier: Option<Vec<Identifier>>,
    /// Element mapping of a grouped select, kept for enumerating whole groups
    pub group_element_mapping: Option<IndexMap<ProjectionMember, ProjectionValue>>,
}

impl SelectBuilder {
    /// Select over one table expression; returns the handle of that table.
    pub fn from_table(aliases: &mut AliasAllocator, table: TableExpr) -> (Self, TableId) {
        let alias = aliases.generate_table_alias(table.alias_hint());
        let source = TableSource::new(alias.id, alias.name, table);
        let select = Self { tables: vec![source], ..Self::default() };
        (select, alias.id)
    }

    pub fn with_mapping(mut self, mapping: IndexMap<ProjectionMember, ProjectionValue>) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn with_identifier(mut self, identifier: Vec<Identifier>) -> Self {
        self.identifier = identifier;
        self
    }

    /// Replace the member-path projection (a `Select` operator).
    pub fn replace_projection(mut self, mapping: IndexMap<ProjectionMember, ProjectionValue>) -> Self {
        self.mapping = mapping;
        self.client_projections.clear();
        self
    }

    pub fn push_client_projection(&mut self, value: ProjectionValue) -> usize {
        self.client_projections.push(value);
        self.client_projections.len() - 1
    }

    pub fn projection(&self, member: &ProjectionMember) -> Option<&ProjectionValue> {
        self.mapping.get(member)
    }

    pub fn table_ids(&self) -> BTreeSet<TableId> {
        self.tables.iter().map(|t| t.id).collect()
    }

    pub fn table(&self, id: TableId) -> Option<&TableSource> {
        self.tables.iter().find(|t| t.id == id)
    }

    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty()
    }

    /// Whether row selection is already constrained by LIMIT/OFFSET.
    pub fn is_limited(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }

    /// One table, no clause that needs its own scope. Such a select joins its
    /// table directly instead of being wrapped as a subquery.
    pub fn is_simple_source(&self) -> bool {
        self.tables.len() == 1
            && !self.is_limited()
            && !self.distinct
            && !self.is_grouped()
            && self.having.is_none()
    }

    pub fn apply_predicate(self, aliases: &mut AliasAllocator, predicate: SqlExprRef) -> QueryResult<Self> {
        if predicate.is_true() {
            return Ok(self);
        }
        let (mut select, predicate) = if self.is_limited() || self.distinct {
            self.pushdown_remapping(aliases, predicate)?
        } else {
            (self, predicate)
        };

        if select.is_grouped() {
            select.having = Some(match select.having.take() {
                Some(h) => SqlExpr::and(h, predicate),
                None => predicate,
            });
            return Ok(select);
        }

        let mut remaining = Vec::new();
        for term in SqlExpr::conjuncts(&predicate) {
            if !select.try_narrow_tpc(&term) {
                remaining.push(term);
            }
        }
        if let Some(p) = SqlExpr::and_all(remaining) {
            select.predicate = Some(match select.predicate.take() {
                Some(existing) => SqlExpr::and(existing, p),
                None => p,
            });
        }
        Ok(select)
    }

    /// Intersect the discriminator set of a table-per-concrete-type source
    /// with the values `term` allows, pruning the concrete tables left out.
    fn try_narrow_tpc(&mut self, term: &SqlExprRef) -> bool {
        let Some((table, values)) = Self::discriminator_test(term) else {
            return false;
        };
        let Some(source) = self.tables.iter_mut().find(|t| t.id == table) else {
            return false;
        };
        if source.join.as_ref().map(|j| j.kind.is_outer()).unwrap_or(false) {
            return false;
        }
        let TableExpr::TpcTables { subselects, discriminator_column, discriminator_values } = &mut source.table else {
            return false;
        };
        if values.0 != *discriminator_column {
            return false;
        }
        discriminator_values.retain(|v| values.1.contains(v));
        subselects.retain(|s| discriminator_values.contains(&s.discriminator));
        debug!(table = %source.alias, remaining = ?discriminator_values, "pruned concrete tables by discriminator");
        if subselects.is_empty() {
            self.predicate = Some(match self.predicate.take() {
                Some(p) => SqlExpr::and(p, SqlExpr::bool_const(false)),
                None => SqlExpr::bool_const(false),
            });
        }
        true
    }

    /// `(table, (column, values))` when `term` only tests a column against string constants.
    fn discriminator_test(term: &SqlExprRef) -> Option<(TableId, (String, Vec<String>))> {
        let string_of = |e: &SqlExprRef| match e.as_ref() {
            SqlExpr::Constant { value: SqlValue::String(s), .. } => Some(s.clone()),
            _ => None,
        };
        match term.as_ref() {
            SqlExpr::Binary { op: BinaryOp::Equal, left, right, .. } => {
                let (column, value) = match (left.as_column(), right.as_column()) {
                    (Some(c), None) => (c, string_of(right)?),
                    (None, Some(c)) => (c, string_of(left)?),
                    _ => return None,
                };
                Some((column.table, (column.name.clone(), vec![value])))
            }
            SqlExpr::In { item, values: InValues::List(list), negated: false } => {
                let column = item.as_column()?;
                let values = list.iter().map(string_of).collect::<Option<Vec<_>>>()?;
                Some((column.table, (column.name.clone(), values)))
            }
            SqlExpr::Binary { op: BinaryOp::Or, left, right, .. } => {
                let (lt, (lc, mut lv)) = Self::discriminator_test(left)?;
                let (rt, (rc, rv)) = Self::discriminator_test(right)?;
                if lt != rt || lc != rc {
                    return None;
                }
                lv.extend(rv);
                Some((lt, (lc, lv)))
            }
            _ => None,
        }
    }

    pub fn apply_ordering(self, aliases: &mut AliasAllocator, ordering: OrderBy) -> QueryResult<Self> {
        let (mut select, expr) = if self.distinct || self.is_limited() {
            self.pushdown_remapping(aliases, ordering.expr.clone())?
        } else {
            (self, ordering.expr.clone())
        };
        select.orderings = vec![ordering.with_expr(expr)];
        Ok(select)
    }

    /// `ThenBy`: adds a term unless the expression is already ordered on.
    pub fn append_ordering(self, aliases: &mut AliasAllocator, ordering: OrderBy) -> QueryResult<Self> {
        let (mut select, expr) = if self.distinct || self.is_limited() {
            self.pushdown_remapping(aliases, ordering.expr.clone())?
        } else {
            (self, ordering.expr.clone())
        };
        if !select.orderings.iter().any(|o| o.expr == expr) {
            select.orderings.push(ordering.with_expr(expr));
        }
        Ok(select)
    }

    pub fn reverse_orderings(self, aliases: &mut AliasAllocator) -> QueryResult<Self> {
        let mut select = if self.is_limited() { self.pushdown_into_subquery(aliases)? } else { self };
        select.orderings = select.orderings.iter().map(OrderBy::reversed).collect();
        Ok(select)
    }

    pub fn clear_ordering(mut self) -> Self {
        self.orderings.clear();
        self
    }

    pub fn apply_limit(self, aliases: &mut AliasAllocator, limit: SqlExprRef) -> QueryResult<Self> {
        let mut select = if self.limit.is_some() { self.pushdown_into_subquery(aliases)? } else { self };
        select.limit = Some(limit);
        Ok(select)
    }

    pub fn apply_offset(self, aliases: &mut AliasAllocator, offset: SqlExprRef) -> QueryResult<Self> {
        let mut select = if self.is_limited() { self.pushdown_into_subquery(aliases)? } else { self };
        select.offset = Some(offset);
        Ok(select)
    }

    /// `DISTINCT`, recomputing which projected columns identify a row.
    pub fn apply_distinct(self, aliases: &mut AliasAllocator, model: &Model) -> QueryResult<Self> {
        let mut select = if self.is_limited() { self.pushdown_into_subquery(aliases)? } else { self };
        select.distinct = true;
        select.orderings.clear();
        select.identifier = select.distinct_identifier(model)?;
        Ok(select)
    }

    fn distinct_identifier(&self, model: &Model) -> QueryResult<Vec<Identifier>> {
        let mut out = Vec::new();
        for value in self.mapping.values().chain(self.client_projections.iter()) {
            match value {
                ProjectionValue::Scalar(e) => out.push(Identifier::of(e.clone())),
                ProjectionValue::Structural(s) => out.extend(
                    s.identifying_columns(model)?.into_iter().map(|(e, c)| Identifier::new(e, c))
                ),
                ProjectionValue::Json(j) => out.push(Identifier::of(j.json_column.clone())),
            }
        }
        Ok(out)
    }

    /// Apply `f` to every expression the builder holds.
    pub fn rewrite_all(&self, f: &mut Replacer<'_>) -> Self {
        Self {
            tables: self.tables.iter().map(|t| TableSource {
                id: t.id,
                alias: t.alias.clone(),
                table: ExprRewriter::rewrite_table(&t.table, f),
                join: t.join.as_ref().map(|j| Join {
                    kind: j.kind,
                    predicate: j.predicate.as_ref().map(|p| ExprRewriter::rewrite(p, f)),
                }),
            }).collect(),
            predicate: self.predicate.as_ref().map(|p| ExprRewriter::rewrite(p, f)),
            group_by: self.group_by.iter().map(|g| ExprRewriter::rewrite(g, f)).collect(),
            having: self.having.as_ref().map(|h| ExprRewriter::rewrite(h, f)),
            orderings: self.orderings.iter().map(|o| ExprRewriter::rewrite_ordering(o, f)).collect(),
            limit: self.limit.as_ref().map(|l| ExprRewriter::rewrite(l, f)),
            offset: self.offset.as_ref().map(|o| ExprRewriter::rewrite(o, f)),
            distinct: self.distinct,
            mapping: self.mapping.iter().map(|(k, v)| (k.clone(), v.remap(f))).collect(),
            client_projections: self.client_projections.iter().map(|v| v.remap(f)).collect(),
            identifier: self.identifier.iter().map(|i| i.remap(f)).collect(),
            child_identifiers: self.child_identifiers.iter().map(|i| i.remap(f)).collect(),
            pre_group_by_identifier: self.pre_group_by_identifier.as_ref()
                .map(|ids| ids.iter().map(|i| i.remap(f)).collect()),
            group_element_mapping: self.group_element_mapping.as_ref()
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.remap(f))).collect()),
        }
    }

    /// Visit every expression the builder holds, subqueries included.
    pub fn visit_all(&self, f: &mut dyn FnMut(&SqlExprRef)) {
        for t in &self.tables {
            ExprCollector::visit_table(&t.table, f);
            if let Some(p) = t.join.as_ref().and_then(|j| j.predicate.as_ref()) {
                ExprCollector::visit(p, f);
            }
        }
        let mut scalars: Vec<SqlExprRef> = Vec::new();
        scalars.extend(self.predicate.iter().cloned());
        scalars.extend(self.group_by.iter().cloned());
        scalars.extend(self.having.iter().cloned());
        scalars.extend(self.orderings.iter().map(|o| o.expr.clone()));
        scalars.extend(self.limit.iter().cloned());
        scalars.extend(self.offset.iter().cloned());
        for value in self.mapping.values().chain(self.client_projections.iter()) {
            scalars.extend(value.expressions());
        }
        scalars.extend(self.identifier.iter().map(|i| i.expr.clone()));
        for e in &scalars {
            ExprCollector::visit(e, f);
        }
    }

    /// Tables outside this select that its expressions reference (correlation).
    pub fn outer_references(&self, outer: &BTreeSet<TableId>) -> BTreeSet<TableId> {
        let mut out = BTreeSet::new();
        self.visit_all(&mut |e| {
            if let SqlExpr::Column(c) = e.as_ref() {
                if outer.contains(&c.table) {
                    out.insert(c.table);
                }
            }
        });
        out
    }

    /// Every table source declared by this select, nested selects included.
    pub fn visit_sources(&self, f: &mut dyn FnMut(&TableSource)) {
        ExprCollector::chain_sources(&self.tables, f);
        self.visit_all(&mut |e| ExprCollector::subquery_sources(e, f));
    }

    /// Copy in which every table source, including those of nested selects,
    /// has a fresh alias. Returns the old to new handle of each.
    pub fn fresh_copy(&self, aliases: &mut AliasAllocator) -> (Self, HashMap<TableId, TableId>) {
        let mut renames = HashMap::new();
        self.visit_sources(&mut |t| {
            renames.entry(t.id).or_insert_with(|| aliases.generate_table_alias(t.table.alias_hint()));
        });
        let renamer = TableRenamer::new(renames);

        let mut copy = self.rewrite_all(&mut |e: &SqlExprRef| renamer.replace(e));
        copy.tables = self.tables.iter().map(|t| renamer.source(t)).collect();
        for value in copy.mapping.values_mut()
            .chain(copy.client_projections.iter_mut())
            .chain(copy.group_element_mapping.iter_mut().flat_map(|m| m.values_mut()))
        {
            if let ProjectionValue::Structural(s) = value {
                s.table_map = s.table_map.iter()
                    .map(|(id, name)| (renamer.handle(*id), name.clone()))
                    .collect();
            }
        }
        (copy, renamer.handles())
    }
}
