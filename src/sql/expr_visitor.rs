use std::{collections::{BTreeSet, HashMap}, rc::Rc};

use crate::sql::{
    CaseWhen, InValues, Join, OrderBy, ProjectionExpr, SelectExpression, SqlExpr, SqlExprRef,
    TableAlias, TableExpr, TableId, TableSource, TpcSubselect, ValuesSource
};

/// Replacement callback: `Some(new)` replaces the node and skips its children.
pub type Replacer<'a> = dyn FnMut(&SqlExprRef) -> Option<SqlExprRef> + 'a;

/// Rebuilds expression trees bottom-up, keeping `Rc` identity for every
/// subtree that did not change.
pub struct ExprRewriter;

impl ExprRewriter {
    pub fn rewrite(expr: &SqlExprRef, f: &mut Replacer<'_>) -> SqlExprRef {
        Self::rw(expr, f).unwrap_or_else(|| expr.clone())
    }

    pub fn rewrite_select(select: &SelectExpression, f: &mut Replacer<'_>) -> SelectExpression {
        Self::rw_select(select, f).unwrap_or_else(|| select.clone())
    }

    pub fn rewrite_ordering(ordering: &OrderBy, f: &mut Replacer<'_>) -> OrderBy {
        ordering.with_expr(Self::rewrite(&ordering.expr, f))
    }

    /// Repoint every column of `from` to `to`.
    pub fn retarget(expr: &SqlExprRef, from: TableId, to: TableId) -> SqlExprRef {
        Self::rewrite(expr, &mut |e: &SqlExprRef| match e.as_ref() {
            SqlExpr::Column(c) if c.table == from => {
                Some(SqlExpr::column(&c.name, to, c.type_mapping.clone(), c.nullable))
            }
            _ => None,
        })
    }

    fn rw_opt(expr: &Option<SqlExprRef>, f: &mut Replacer<'_>) -> Option<Option<SqlExprRef>> {
        match expr {
            Some(e) => Self::rw(e, f).map(Some),
            None => None,
        }
    }

    fn rw_list(list: &[SqlExprRef], f: &mut Replacer<'_>) -> Option<Vec<SqlExprRef>> {
        let mut changed = false;
        let out: Vec<SqlExprRef> = list.iter().map(|e| match Self::rw(e, f) {
            Some(n) => { changed = true; n }
            None => e.clone(),
        }).collect();
        changed.then_some(out)
    }

    fn rw_orderings(list: &[OrderBy], f: &mut Replacer<'_>) -> Option<Vec<OrderBy>> {
        let mut changed = false;
        let out: Vec<OrderBy> = list.iter().map(|o| match Self::rw(&o.expr, f) {
            Some(n) => { changed = true; o.with_expr(n) }
            None => o.clone(),
        }).collect();
        changed.then_some(out)
    }

    fn rw(expr: &SqlExprRef, f: &mut Replacer<'_>) -> Option<SqlExprRef> {
        if let Some(replacement) = f(expr) {
            return Some(replacement);
        }
        match expr.as_ref() {
            SqlExpr::Column(_) | SqlExpr::Constant { .. } | SqlExpr::Parameter { .. } | SqlExpr::Fragment(_) => None,
            SqlExpr::Unary { op, operand, type_mapping } => Self::rw(operand, f).map(|o| {
                Rc::new(SqlExpr::Unary { op: *op, operand: o, type_mapping: type_mapping.clone() })
            }),
            SqlExpr::Binary { op, left, right, type_mapping } => {
                let l = Self::rw(left, f);
                let r = Self::rw(right, f);
                if l.is_none() && r.is_none() {
                    return None;
                }
                Some(Rc::new(SqlExpr::Binary {
                    op: *op,
                    left: l.unwrap_or_else(|| left.clone()),
                    right: r.unwrap_or_else(|| right.clone()),
                    type_mapping: type_mapping.clone(),
                }))
            }
            SqlExpr::Function { name, args, nullable, aggregate, type_mapping } => Self::rw_list(args, f).map(|args| {
                Rc::new(SqlExpr::Function {
                    name: name.clone(),
                    args,
                    nullable: *nullable,
                    aggregate: *aggregate,
                    type_mapping: type_mapping.clone(),
                })
            }),
            SqlExpr::Distinct(inner) => Self::rw(inner, f).map(|i| Rc::new(SqlExpr::Distinct(i))),
            SqlExpr::Case { operand, when_clauses, else_result, type_mapping } => {
                let o = Self::rw_opt(operand, f);
                let mut changed = o.is_some();
                let whens: Vec<CaseWhen> = when_clauses.iter().map(|w| {
                    let t = Self::rw(&w.test, f);
                    let r = Self::rw(&w.result, f);
                    changed |= t.is_some() || r.is_some();
                    CaseWhen {
                        test: t.unwrap_or_else(|| w.test.clone()),
                        result: r.unwrap_or_else(|| w.result.clone()),
                    }
                }).collect();
                let e = Self::rw_opt(else_result, f);
                changed |= e.is_some();
                changed.then(|| Rc::new(SqlExpr::Case {
                    operand: o.unwrap_or_else(|| operand.clone()),
                    when_clauses: whens,
                    else_result: e.unwrap_or_else(|| else_result.clone()),
                    type_mapping: type_mapping.clone(),
                }))
            }
            SqlExpr::Like { item, pattern, escape } => {
                let i = Self::rw(item, f);
                let p = Self::rw(pattern, f);
                if i.is_none() && p.is_none() {
                    return None;
                }
                Some(Rc::new(SqlExpr::Like {
                    item: i.unwrap_or_else(|| item.clone()),
                    pattern: p.unwrap_or_else(|| pattern.clone()),
                    escape: *escape,
                }))
            }
            SqlExpr::Exists { subquery, negated } => Self::rw_select(subquery, f)
                .map(|s| Rc::new(SqlExpr::Exists { subquery: Rc::new(s), negated: *negated })),
            SqlExpr::In { item, values, negated } => {
                let i = Self::rw(item, f);
                let v = match values {
                    InValues::List(list) => Self::rw_list(list, f).map(InValues::List),
                    InValues::Parameter { .. } => None,
                    InValues::Subquery(s) => Self::rw_select(s, f).map(|s| InValues::Subquery(Rc::new(s))),
                };
                if i.is_none() && v.is_none() {
                    return None;
                }
                Some(Rc::new(SqlExpr::In {
                    item: i.unwrap_or_else(|| item.clone()),
                    values: v.unwrap_or_else(|| values.clone()),
                    negated: *negated,
                }))
            }
            SqlExpr::ScalarSubquery { subquery, type_mapping } => Self::rw_select(subquery, f)
                .map(|s| Rc::new(SqlExpr::ScalarSubquery { subquery: Rc::new(s), type_mapping: type_mapping.clone() })),
            SqlExpr::RowNumber { partition_by, orderings } => {
                let p = Self::rw_list(partition_by, f);
                let o = Self::rw_orderings(orderings, f);
                if p.is_none() && o.is_none() {
                    return None;
                }
                Some(Rc::new(SqlExpr::RowNumber {
                    partition_by: p.unwrap_or_else(|| partition_by.clone()),
                    orderings: o.unwrap_or_else(|| orderings.clone()),
                }))
            }
            SqlExpr::JsonScalar { json, path, type_mapping, nullable } => Self::rw(json, f).map(|j| {
                Rc::new(SqlExpr::JsonScalar { json: j, path: path.clone(), type_mapping: type_mapping.clone(), nullable: *nullable })
            }),
        }
    }

    pub fn rewrite_table(table: &TableExpr, f: &mut Replacer<'_>) -> TableExpr {
        Self::rw_table(table, f).unwrap_or_else(|| table.clone())
    }

    fn rw_table(table: &TableExpr, f: &mut Replacer<'_>) -> Option<TableExpr> {
        match table {
            TableExpr::Table { .. } => None,
            TableExpr::Subquery(s) => Self::rw_select(s, f).map(|s| TableExpr::Subquery(Box::new(s))),
            TableExpr::SetOperation { kind, distinct, left, right } => {
                let l = Self::rw_select(left, f);
                let r = Self::rw_select(right, f);
                if l.is_none() && r.is_none() {
                    return None;
                }
                Some(TableExpr::SetOperation {
                    kind: *kind,
                    distinct: *distinct,
                    left: Box::new(l.unwrap_or_else(|| left.as_ref().clone())),
                    right: Box::new(r.unwrap_or_else(|| right.as_ref().clone())),
                })
            }
            TableExpr::TableValuedFunction { name, args } => Self::rw_list(args, f)
                .map(|args| TableExpr::TableValuedFunction { name: name.clone(), args }),
            TableExpr::FromSql { sql, args } => Self::rw_list(args, f)
                .map(|args| TableExpr::FromSql { sql: sql.clone(), args }),
            TableExpr::Values { rows: ValuesSource::Rows(rows), column_names } => {
                let mut changed = false;
                let new_rows: Vec<Vec<SqlExprRef>> = rows.iter().map(|row| match Self::rw_list(row, f) {
                    Some(r) => { changed = true; r }
                    None => row.clone(),
                }).collect();
                changed.then(|| TableExpr::Values { rows: ValuesSource::Rows(new_rows), column_names: column_names.clone() })
            }
            TableExpr::Values { .. } => None,
            TableExpr::TpcTables { subselects, discriminator_column, discriminator_values } => {
                let mut changed = false;
                let subs: Vec<TpcSubselect> = subselects.iter().map(|s| match Self::rw_select(&s.select, f) {
                    Some(sel) => { changed = true; TpcSubselect { discriminator: s.discriminator.clone(), select: sel } }
                    None => s.clone(),
                }).collect();
                changed.then(|| TableExpr::TpcTables {
                    subselects: subs,
                    discriminator_column: discriminator_column.clone(),
                    discriminator_values: discriminator_values.clone(),
                })
            }
        }
    }

    fn rw_select(select: &SelectExpression, f: &mut Replacer<'_>) -> Option<SelectExpression> {
        let mut changed = false;
        let tables: Vec<TableSource> = select.tables.iter().map(|t| {
            let table = Self::rw_table(&t.table, f);
            let join = t.join.as_ref().and_then(|j| Self::rw_opt(&j.predicate, f).map(|p| Join { kind: j.kind, predicate: p }));
            if table.is_none() && join.is_none() {
                return t.clone();
            }
            changed = true;
            TableSource {
                id: t.id,
                alias: t.alias.clone(),
                table: table.unwrap_or_else(|| t.table.clone()),
                join: join.or_else(|| t.join.clone()),
            }
        }).collect();

        let predicate = Self::rw_opt(&select.predicate, f);
        let group_by = Self::rw_list(&select.group_by, f);
        let having = Self::rw_opt(&select.having, f);
        let orderings = Self::rw_orderings(&select.orderings, f);
        let limit = Self::rw_opt(&select.limit, f);
        let offset = Self::rw_opt(&select.offset, f);
        let mut projection_changed = false;
        let projection: Vec<ProjectionExpr> = select.projection.iter().map(|p| match Self::rw(&p.expr, f) {
            Some(e) => { projection_changed = true; ProjectionExpr::new(e, p.alias.clone()) }
            None => p.clone(),
        }).collect();

        changed |= predicate.is_some() || group_by.is_some() || having.is_some() || orderings.is_some()
            || limit.is_some() || offset.is_some() || projection_changed;
        changed.then(|| SelectExpression {
            tables,
            predicate: predicate.unwrap_or_else(|| select.predicate.clone()),
            group_by: group_by.unwrap_or_else(|| select.group_by.clone()),
            having: having.unwrap_or_else(|| select.having.clone()),
            orderings: orderings.unwrap_or_else(|| select.orderings.clone()),
            limit: limit.unwrap_or_else(|| select.limit.clone()),
            offset: offset.unwrap_or_else(|| select.offset.clone()),
            distinct: select.distinct,
            projection,
        })
    }
}

/// Moves table sources to new handles and aliases, nested selects
/// included, and repoints every column reading them.
pub struct TableRenamer {
    renames: HashMap<TableId, TableAlias>,
}

impl TableRenamer {
    pub fn new(renames: HashMap<TableId, TableAlias>) -> Self {
        Self { renames }
    }

    /// Old handle to new handle.
    pub fn handles(&self) -> HashMap<TableId, TableId> {
        self.renames.iter().map(|(from, to)| (*from, to.id)).collect()
    }

    pub fn handle(&self, id: TableId) -> TableId {
        self.renames.get(&id).map(|a| a.id).unwrap_or(id)
    }

    /// Replacement callback for `ExprRewriter`.
    pub fn replace(&self, expr: &SqlExprRef) -> Option<SqlExprRef> {
        match expr.as_ref() {
            SqlExpr::Column(c) => self.renames.get(&c.table)
                .map(|to| SqlExpr::column(&c.name, to.id, c.type_mapping.clone(), c.nullable)),
            SqlExpr::Exists { subquery, negated } => Some(Rc::new(SqlExpr::Exists {
                subquery: Rc::new(self.select(subquery)),
                negated: *negated,
            })),
            SqlExpr::ScalarSubquery { subquery, type_mapping } => Some(Rc::new(SqlExpr::ScalarSubquery {
                subquery: Rc::new(self.select(subquery)),
                type_mapping: type_mapping.clone(),
            })),
            SqlExpr::In { item, values: InValues::Subquery(s), negated } => Some(Rc::new(SqlExpr::In {
                item: self.expr(item),
                values: InValues::Subquery(Rc::new(self.select(s))),
                negated: *negated,
            })),
            _ => None,
        }
    }

    pub fn expr(&self, expr: &SqlExprRef) -> SqlExprRef {
        ExprRewriter::rewrite(expr, &mut |e: &SqlExprRef| self.replace(e))
    }

    pub fn source(&self, source: &TableSource) -> TableSource {
        let (id, alias) = match self.renames.get(&source.id) {
            Some(to) => (to.id, to.name.clone()),
            None => (source.id, source.alias.clone()),
        };
        TableSource {
            id,
            alias,
            table: self.table(&source.table),
            join: source.join.as_ref().map(|j| Join {
                kind: j.kind,
                predicate: j.predicate.as_ref().map(|p| self.expr(p)),
            }),
        }
    }

    pub fn table(&self, table: &TableExpr) -> TableExpr {
        match table {
            TableExpr::Subquery(s) => TableExpr::Subquery(Box::new(self.select(s))),
            TableExpr::SetOperation { kind, distinct, left, right } => TableExpr::SetOperation {
                kind: *kind,
                distinct: *distinct,
                left: Box::new(self.select(left)),
                right: Box::new(self.select(right)),
            },
            TableExpr::TpcTables { subselects, discriminator_column, discriminator_values } => TableExpr::TpcTables {
                subselects: subselects.iter()
                    .map(|s| TpcSubselect { discriminator: s.discriminator.clone(), select: self.select(&s.select) })
                    .collect(),
                discriminator_column: discriminator_column.clone(),
                discriminator_values: discriminator_values.clone(),
            },
            other => ExprRewriter::rewrite_table(other, &mut |e: &SqlExprRef| self.replace(e)),
        }
    }

    pub fn select(&self, select: &SelectExpression) -> SelectExpression {
        SelectExpression {
            tables: select.tables.iter().map(|t| self.source(t)).collect(),
            predicate: select.predicate.as_ref().map(|p| self.expr(p)),
            group_by: select.group_by.iter().map(|g| self.expr(g)).collect(),
            having: select.having.as_ref().map(|h| self.expr(h)),
            orderings: select.orderings.iter().map(|o| o.with_expr(self.expr(&o.expr))).collect(),
            limit: select.limit.as_ref().map(|l| self.expr(l)),
            offset: select.offset.as_ref().map(|o| self.expr(o)),
            distinct: select.distinct,
            projection: select.projection.iter()
                .map(|p| ProjectionExpr::new(self.expr(&p.expr), p.alias.clone()))
                .collect(),
        }
    }
}

/// Read-only walks over expression trees.
pub struct ExprCollector;

impl ExprCollector {
    /// Tables referenced by columns anywhere in `expr`, subqueries included.
    pub fn referenced_tables(expr: &SqlExprRef) -> BTreeSet<TableId> {
        let mut out = BTreeSet::new();
        Self::visit(expr, &mut |e| {
            if let SqlExpr::Column(c) = e.as_ref() {
                out.insert(c.table);
            }
        });
        out
    }

    pub fn select_referenced_tables(select: &SelectExpression) -> BTreeSet<TableId> {
        let mut out = BTreeSet::new();
        Self::visit_select(select, &mut |e| {
            if let SqlExpr::Column(c) = e.as_ref() {
                out.insert(c.table);
            }
        });
        out
    }

    pub fn references_any(expr: &SqlExprRef, tables: &BTreeSet<TableId>) -> bool {
        Self::referenced_tables(expr).iter().any(|t| tables.contains(t))
    }

    /// Whether any node of `expr` (subqueries included) satisfies `pred`.
    pub fn any(expr: &SqlExprRef, pred: &dyn Fn(&SqlExpr) -> bool) -> bool {
        let mut found = false;
        Self::visit(expr, &mut |e| found |= pred(e));
        found
    }

    pub fn contains_aggregate(expr: &SqlExprRef) -> bool {
        Self::any(expr, &|e| e.is_aggregate())
    }

    /// Distinct column nodes of `expr` outside subqueries, first occurrence order.
    pub fn columns(expr: &SqlExprRef) -> Vec<SqlExprRef> {
        let mut out: Vec<SqlExprRef> = Vec::new();
        Self::visit_shallow(expr, &mut |e| {
            if e.is_column() && !out.iter().any(|o| o == e) {
                out.push(e.clone());
            }
        });
        out
    }

    fn visit_shallow(expr: &SqlExprRef, f: &mut dyn FnMut(&SqlExprRef)) {
        f(expr);
        match expr.as_ref() {
            SqlExpr::Exists { .. } | SqlExpr::ScalarSubquery { .. } => {}
            SqlExpr::In { item, values, .. } => {
                Self::visit_shallow(item, f);
                if let InValues::List(list) = values {
                    for v in list {
                        Self::visit_shallow(v, f);
                    }
                }
            }
            _ => {
                for c in Self::children(expr) {
                    Self::visit_shallow(&c, f);
                }
            }
        }
    }

    pub fn visit(expr: &SqlExprRef, f: &mut dyn FnMut(&SqlExprRef)) {
        f(expr);
        match expr.as_ref() {
            SqlExpr::Exists { subquery, .. } | SqlExpr::ScalarSubquery { subquery, .. } => Self::visit_select(subquery, f),
            SqlExpr::In { item, values, .. } => {
                Self::visit(item, f);
                match values {
                    InValues::List(list) => {
                        for v in list {
                            Self::visit(v, f);
                        }
                    }
                    InValues::Subquery(s) => Self::visit_select(s, f),
                    InValues::Parameter { .. } => {}
                }
            }
            _ => {
                for c in Self::children(expr) {
                    Self::visit(&c, f);
                }
            }
        }
    }

    pub fn visit_select(select: &SelectExpression, f: &mut dyn FnMut(&SqlExprRef)) {
        for t in &select.tables {
            Self::visit_table(&t.table, f);
            if let Some(p) = t.join.as_ref().and_then(|j| j.predicate.as_ref()) {
                Self::visit(p, f);
            }
        }
        let scalars = select.predicate.iter()
            .chain(select.group_by.iter())
            .chain(select.having.iter())
            .chain(select.orderings.iter().map(|o| &o.expr))
            .chain(select.limit.iter())
            .chain(select.offset.iter())
            .chain(select.projection.iter().map(|p| &p.expr));
        for e in scalars {
            Self::visit(e, f);
        }
    }

    pub fn visit_table(table: &TableExpr, f: &mut dyn FnMut(&SqlExprRef)) {
        match table {
            TableExpr::Subquery(s) => Self::visit_select(s, f),
            TableExpr::SetOperation { left, right, .. } => {
                Self::visit_select(left, f);
                Self::visit_select(right, f);
            }
            TableExpr::TableValuedFunction { args, .. } | TableExpr::FromSql { args, .. } => {
                for a in args {
                    Self::visit(a, f);
                }
            }
            TableExpr::Values { rows: ValuesSource::Rows(rows), .. } => {
                for v in rows.iter().flatten() {
                    Self::visit(v, f);
                }
            }
            TableExpr::TpcTables { subselects, .. } => {
                for s in subselects {
                    Self::visit_select(&s.select, f);
                }
            }
            TableExpr::Table { .. } | TableExpr::Values { .. } => {}
        }
    }

    /// Every table source declared anywhere in `select`.
    pub fn visit_sources(select: &SelectExpression, f: &mut dyn FnMut(&TableSource)) {
        Self::chain_sources(&select.tables, f);
        Self::visit_select(select, &mut |e| Self::subquery_sources(e, f));
    }

    /// Sources of a FROM chain and of the selects nested in its table expressions.
    pub fn chain_sources(tables: &[TableSource], f: &mut dyn FnMut(&TableSource)) {
        for t in tables {
            f(t);
            match &t.table {
                TableExpr::Subquery(s) => Self::chain_sources(&s.tables, f),
                TableExpr::SetOperation { left, right, .. } => {
                    Self::chain_sources(&left.tables, f);
                    Self::chain_sources(&right.tables, f);
                }
                TableExpr::TpcTables { subselects, .. } => {
                    for s in subselects {
                        Self::chain_sources(&s.select.tables, f);
                    }
                }
                _ => {}
            }
        }
    }

    /// FROM chain of the subquery `expr` holds directly, if any. Combined with
    /// `visit` this reaches the sources of every subquery expression.
    pub fn subquery_sources(expr: &SqlExprRef, f: &mut dyn FnMut(&TableSource)) {
        match expr.as_ref() {
            SqlExpr::Exists { subquery, .. } | SqlExpr::ScalarSubquery { subquery, .. } => {
                Self::chain_sources(&subquery.tables, f)
            }
            SqlExpr::In { values: InValues::Subquery(s), .. } => Self::chain_sources(&s.tables, f),
            _ => {}
        }
    }

    /// Direct scalar children, subqueries excluded.
    fn children(expr: &SqlExprRef) -> Vec<SqlExprRef> {
        match expr.as_ref() {
            SqlExpr::Unary { operand, .. } => vec![operand.clone()],
            SqlExpr::Binary { left, right, .. } => vec![left.clone(), right.clone()],
            SqlExpr::Function { args, .. } => args.clone(),
            SqlExpr::Distinct(inner) => vec![inner.clone()],
            SqlExpr::Case { operand, when_clauses, else_result, .. } => {
                let mut out: Vec<SqlExprRef> = operand.iter().cloned().collect();
                for w in when_clauses {
                    out.push(w.test.clone());
                    out.push(w.result.clone());
                }
                out.extend(else_result.iter().cloned());
                out
            }
            SqlExpr::Like { item, pattern, .. } => vec![item.clone(), pattern.clone()],
            SqlExpr::RowNumber { partition_by, orderings } => {
                let mut out = partition_by.clone();
                out.extend(orderings.iter().map(|o| o.expr.clone()));
                out
            }
            SqlExpr::JsonScalar { json, .. } => vec![json.clone()],
            _ => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metadata::TypeMapping, sql::{AliasAllocator, BinaryOp}};

    #[test]
    fn unchanged_subtrees_keep_identity() {
        let mut a = AliasAllocator::new();
        let t = a.generate_table_alias("t").id;
        let u = a.generate_table_alias("u").id;
        let left = SqlExpr::column("A", t, TypeMapping::int(), false);
        let right = SqlExpr::column("B", u, TypeMapping::int(), false);
        let expr = SqlExpr::binary(BinaryOp::Add, left.clone(), right.clone());

        let same = ExprRewriter::rewrite(&expr, &mut |_| None);
        assert!(Rc::ptr_eq(&same, &expr));

        let moved = ExprRewriter::retarget(&expr, u, t);
        assert!(!Rc::ptr_eq(&moved, &expr));
        assert_eq!(ExprCollector::referenced_tables(&moved), BTreeSet::from([t]));
        match moved.as_ref() {
            SqlExpr::Binary { left: l, .. } => assert!(Rc::ptr_eq(l, &left)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn collects_columns_once() {
        let mut a = AliasAllocator::new();
        let t = a.generate_table_alias("t").id;
        let c = SqlExpr::column("A", t, TypeMapping::int(), false);
        let expr = SqlExpr::binary(BinaryOp::Multiply, c.clone(), SqlExpr::column("A", t, TypeMapping::int(), false));
        assert_eq!(ExprCollector::columns(&expr).len(), 1);
        assert!(!ExprCollector::contains_aggregate(&expr));
        assert!(ExprCollector::contains_aggregate(&SqlExpr::count_star()));
    }
}
