use indexmap::IndexMap;
use std::collections::BTreeSet;
use tracing::debug;

use crate::{
    error::{QueryError, QueryResult},
    select::{Identifier, ProjectionValue, SelectBuilder},
    sql::{
        AliasAllocator, BinaryOp, ExprCollector, ExprRewriter, Join, JoinKind, OrderBy, ProjectionMember,
        SqlExpr, SqlExprRef, TableId, UnaryOp
    }
};

/// Outcome of adding a table to the FROM chain.
///
/// `inner` is the joined side's projection as readable from the combined
/// select; `client_offset` is where the joined side's client projections start.
/// `orderings` are the joined side's orderings, which a join does not keep.
#[derive(Debug, Clone)]
pub struct JoinResult {
    pub select: SelectBuilder,
    pub inner: IndexMap<ProjectionMember, ProjectionValue>,
    pub client_offset: usize,
    pub orderings: Vec<OrderBy>,
}

fn and_opt(left: Option<SqlExprRef>, right: Option<SqlExprRef>) -> Option<SqlExprRef> {
    match (left, right) {
        (Some(l), Some(r)) => Some(SqlExpr::and(l, r)),
        (l, r) => l.or(r),
    }
}

fn contains_case(expr: &SqlExprRef) -> bool {
    ExprCollector::any(expr, &|e| matches!(e, SqlExpr::Case { .. }))
}

/// Which scope an expression reads from.
#[derive(Debug, PartialEq, Eq)]
enum Side {
    Outer,
    Inner,
    Mixed,
    Neither,
}

fn side_of(expr: &SqlExprRef, outer: &BTreeSet<TableId>) -> Side {
    let tables = ExprCollector::referenced_tables(expr);
    let outer_count = tables.iter().filter(|t| outer.contains(t)).count();
    match (outer_count, tables.len() - outer_count) {
        (0, 0) => Side::Neither,
        (_, 0) => Side::Outer,
        (0, _) => Side::Inner,
        _ => Side::Mixed,
    }
}

/// Replace columns structurally equal to one of `from` by the matching entry of `to`.
fn substitute_columns(expr: &SqlExprRef, from: &[SqlExprRef], to: &[SqlExprRef]) -> SqlExprRef {
    ExprRewriter::rewrite(expr, &mut |e: &SqlExprRef| {
        if !e.is_column() {
            return None;
        }
        from.iter().position(|f| f == e).and_then(|i| to.get(i).cloned())
    })
}

impl SelectBuilder {
    pub fn add_inner_join(self, aliases: &mut AliasAllocator, inner: SelectBuilder, predicate: SqlExprRef) -> QueryResult<JoinResult> {
        self.add_join(aliases, JoinKind::Inner, inner, Some(predicate))
    }

    pub fn add_left_join(self, aliases: &mut AliasAllocator, inner: SelectBuilder, predicate: SqlExprRef) -> QueryResult<JoinResult> {
        self.add_join(aliases, JoinKind::Left, inner, Some(predicate))
    }

    pub fn add_cross_join(self, aliases: &mut AliasAllocator, inner: SelectBuilder) -> QueryResult<JoinResult> {
        self.add_join(aliases, JoinKind::Cross, inner, None)
    }

    pub fn add_cross_apply(self, aliases: &mut AliasAllocator, inner: SelectBuilder) -> QueryResult<JoinResult> {
        self.add_join(aliases, JoinKind::CrossApply, inner, None)
    }

    pub fn add_outer_apply(self, aliases: &mut AliasAllocator, inner: SelectBuilder) -> QueryResult<JoinResult> {
        self.add_join(aliases, JoinKind::OuterApply, inner, None)
    }

    pub fn add_join(self, aliases: &mut AliasAllocator, kind: JoinKind, inner: SelectBuilder, predicate: Option<SqlExprRef>) -> QueryResult<JoinResult> {
        self.add_join_with(aliases, kind, inner, predicate, true)
    }

    /// Join whose result projection pairs both sides: the outer mapping moves
    /// under `Outer`, the inner one under `Inner`.
    pub fn add_join_paired(self, aliases: &mut AliasAllocator, kind: JoinKind, inner: SelectBuilder, predicate: Option<SqlExprRef>) -> QueryResult<SelectBuilder> {
        let JoinResult { mut select, inner, .. } = self.add_join(aliases, kind, inner, predicate)?;
        let outer = std::mem::take(&mut select.mapping);
        select.mapping = outer.into_iter()
            .map(|(m, v)| (m.prepend("Outer"), v))
            .chain(inner.into_iter().map(|(m, v)| (m.prepend("Inner"), v)))
            .collect();
        Ok(select)
    }

    /// Add `inner` to the FROM chain.
    ///
    /// `predicate` may read both sides. An outer select whose rows are already
    /// limited, distinct or grouped is pushed down first. APPLY joins are
    /// turned into ordinary joins when `rewrite_apply` is set and the
    /// correlation allows it.
    pub fn add_join_with(
        self,
        aliases: &mut AliasAllocator,
        kind: JoinKind,
        inner: SelectBuilder,
        predicate: Option<SqlExprRef>,
        rewrite_apply: bool,
    ) -> QueryResult<JoinResult> {
        let (outer, inner, predicate) = self.make_room_for_join(aliases, inner, predicate)?;
        let outer_ids = outer.table_ids();

        let (kind, inner, predicate) = if kind.is_apply() && rewrite_apply {
            match Self::try_apply_to_join(aliases, &outer_ids, kind, inner.clone())? {
                Some((join_kind, rewritten, join_predicate)) => {
                    debug!(from = %kind, to = %join_kind, "rewrote APPLY as a join");
                    (join_kind, rewritten, and_opt(predicate, join_predicate))
                }
                None => (kind, inner, predicate),
            }
        } else {
            (kind, inner, predicate)
        };

        outer.attach(aliases, kind, inner, predicate)
    }

    /// Push the outer select down when its clauses would change meaning under
    /// a join, remapping the inner side's correlated references.
    fn make_room_for_join(
        self,
        aliases: &mut AliasAllocator,
        inner: SelectBuilder,
        predicate: Option<SqlExprRef>,
    ) -> QueryResult<(SelectBuilder, SelectBuilder, Option<SqlExprRef>)> {
        if !(self.is_limited() || self.distinct || self.is_grouped()) {
            return Ok((self, inner, predicate));
        }
        let outer_ids = self.table_ids();
        let mut refs: Vec<SqlExprRef> = Vec::new();
        let mut collect = |e: &SqlExprRef| {
            if let SqlExpr::Column(c) = e.as_ref() {
                if outer_ids.contains(&c.table) && !refs.contains(e) {
                    refs.push(e.clone());
                }
            }
        };
        inner.visit_all(&mut collect);
        if let Some(p) = &predicate {
            ExprCollector::visit(p, &mut collect);
        }
        let (outer, remapped) = self.pushdown_with_extras(aliases, refs.clone())?;
        let inner = inner.rewrite_all(&mut |e: &SqlExprRef| {
            if !e.is_column() {
                return None;
            }
            refs.iter().position(|r| r == e).and_then(|i| remapped.get(i).cloned())
        });
        let predicate = predicate.map(|p| substitute_columns(&p, &refs, &remapped));
        Ok((outer, inner, predicate))
    }

    /// Normalized join term `outer <op> inner` for a correlation conjunct,
    /// plus the inner-side key. Terms that wrap either side in a CASE are not
    /// extracted.
    fn correlation_term(term: &SqlExprRef, outer: &BTreeSet<TableId>, limited: bool) -> Option<(SqlExprRef, SqlExprRef)> {
        if contains_case(term) {
            return None;
        }
        match term.as_ref() {
            SqlExpr::Binary { op, left, right, .. } if op.is_comparison() => {
                if limited && *op != BinaryOp::Equal {
                    return None;
                }
                match (side_of(left, outer), side_of(right, outer)) {
                    (Side::Outer, Side::Inner) => Some((SqlExpr::binary(*op, left.clone(), right.clone()), right.clone())),
                    (Side::Inner, Side::Outer) => {
                        let mirrored = op.mirror()?;
                        Some((SqlExpr::binary(mirrored, right.clone(), left.clone()), left.clone()))
                    }
                    _ => None,
                }
            }
            // (a = b) OR (a IS NULL AND b IS NULL)
            SqlExpr::Binary { op: BinaryOp::Or, left, right, .. } => {
                let SqlExpr::Binary { op: BinaryOp::Equal, left: a, right: b, .. } = left.as_ref() else { return None };
                let SqlExpr::Binary { op: BinaryOp::And, left: x, right: y, .. } = right.as_ref() else { return None };
                let null_tested = |e: &SqlExprRef| match e.as_ref() {
                    SqlExpr::Unary { op: UnaryOp::IsNull, operand, .. } => Some(operand.clone()),
                    _ => None,
                };
                let (x, y) = (null_tested(x)?, null_tested(y)?);
                if !((&x == a && &y == b) || (&x == b && &y == a)) {
                    return None;
                }
                match (side_of(a, outer), side_of(b, outer)) {
                    (Side::Outer, Side::Inner) => Some((term.clone(), b.clone())),
                    (Side::Inner, Side::Outer) => Some((term.clone(), a.clone())),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Try to express an APPLY of `inner` as an ordinary join.
    fn try_apply_to_join(
        aliases: &mut AliasAllocator,
        outer: &BTreeSet<TableId>,
        kind: JoinKind,
        inner: SelectBuilder,
    ) -> QueryResult<Option<(JoinKind, SelectBuilder, Option<SqlExprRef>)>> {
        if inner.is_grouped() || inner.distinct {
            return Ok(None);
        }
        if inner.outer_references(outer).is_empty() {
            return Ok(Some(match kind {
                JoinKind::OuterApply => (JoinKind::Left, inner, Some(SqlExpr::bool_const(true))),
                _ => (JoinKind::Cross, inner, None),
            }));
        }
        let Some(predicate) = inner.predicate.clone() else {
            return Ok(None);
        };

        let limited = inner.is_limited();
        let mut join_terms = Vec::new();
        let mut inner_keys = Vec::new();
        let mut rest = Vec::new();
        for term in SqlExpr::conjuncts(&predicate) {
            if !ExprCollector::references_any(&term, outer) {
                rest.push(term);
                continue;
            }
            match Self::correlation_term(&term, outer, limited) {
                Some((join_term, key)) => {
                    join_terms.push(join_term);
                    inner_keys.push(key);
                }
                None => return Ok(None),
            }
        }

        let mut candidate = inner;
        candidate.predicate = SqlExpr::and_all(rest);
        if !candidate.outer_references(outer).is_empty() {
            return Ok(None);
        }

        if limited {
            let (rewritten, join_terms) = candidate.row_number_rewrite(aliases, inner_keys, join_terms)?;
            return Ok(Some((kind.as_join(), rewritten, SqlExpr::and_all(join_terms))));
        }
        Ok(Some((kind.as_join(), candidate, SqlExpr::and_all(join_terms))))
    }

    /// Top-N-per-group: number the rows of each partition and keep the
    /// LIMIT/OFFSET window as a predicate on that number.
    fn row_number_rewrite(
        mut self,
        aliases: &mut AliasAllocator,
        partition: Vec<SqlExprRef>,
        join_terms: Vec<SqlExprRef>,
    ) -> QueryResult<(SelectBuilder, Vec<SqlExprRef>)> {
        let orderings = if !self.orderings.is_empty() {
            self.orderings.clone()
        } else if !self.identifier.is_empty() {
            self.identifier.iter().map(|i| OrderBy::asc(i.expr.clone())).collect()
        } else {
            vec![OrderBy::asc(SqlExpr::int(1))]
        };
        let limit = self.limit.take();
        let offset = self.offset.take();
        let row_number = SqlExpr::row_number(partition, orderings);

        let mut extras = vec![row_number];
        extras.extend(join_terms);
        let (select, mut remapped) = self.pushdown_with_extras(aliases, extras)?;
        if remapped.is_empty() {
            return QueryError::invalid("row number was not projected").err();
        }
        let join_terms = remapped.split_off(1);
        let row = remapped.remove(0);

        let window = match (offset, limit) {
            (Some(o), Some(l)) => SqlExpr::and(
                SqlExpr::binary(BinaryOp::LessThan, o.clone(), row.clone()),
                SqlExpr::binary(BinaryOp::LessThanOrEqual, row, SqlExpr::binary(BinaryOp::Add, o, l)),
            ),
            (Some(o), None) => SqlExpr::binary(BinaryOp::LessThan, o, row),
            (None, Some(l)) => SqlExpr::binary(BinaryOp::LessThanOrEqual, row, l),
            (None, None) => SqlExpr::bool_const(true),
        };
        debug!("rewrote limited APPLY with ROW_NUMBER()");
        let select = select.apply_predicate(aliases, window)?;
        Ok((select, join_terms))
    }

    /// Append `inner` to the FROM chain and merge projections and identifiers.
    fn attach(
        mut self,
        aliases: &mut AliasAllocator,
        kind: JoinKind,
        inner: SelectBuilder,
        predicate: Option<SqlExprRef>,
    ) -> QueryResult<JoinResult> {
        let (source, inner) = if inner.is_simple_source() && !kind.is_apply() {
            let mut inner = inner;
            let predicate = and_opt(predicate, inner.predicate.take());
            let kind = match (kind, &predicate) {
                (JoinKind::Cross, Some(_)) => JoinKind::Inner,
                (k, _) => k,
            };
            let mut tables = std::mem::take(&mut inner.tables);
            let mut source = tables.pop().ok_or_else(|| QueryError::invalid("joined select has no table"))?;
            source.join = Some(Join { kind, predicate });
            (source, inner)
        } else {
            let inner_ids = inner.table_ids();
            let refs: Vec<SqlExprRef> = predicate.as_ref()
                .map(|p| ExprCollector::columns(p).into_iter()
                    .filter(|c| c.as_column().map(|c| inner_ids.contains(&c.table)).unwrap_or(false))
                    .collect())
                .unwrap_or_default();
            let (mut pushed, remapped) = inner.pushdown_with_extras(aliases, refs.clone())?;
            let predicate = predicate.map(|p| substitute_columns(&p, &refs, &remapped));
            let mut source = pushed.tables.pop().ok_or_else(|| QueryError::invalid("pushed select has no table"))?;
            source.join = Some(Join { kind, predicate });
            (source, pushed)
        };

        let nullable = kind.is_outer();
        let adjust = |v: ProjectionValue| if nullable { v.make_nullable() } else { v };
        let adjust_id = |i: Identifier| if nullable { i.make_nullable() } else { i };

        if self.identifier.is_empty() || inner.identifier.is_empty() {
            self.identifier.clear();
        } else {
            self.identifier.extend(inner.identifier.into_iter().map(adjust_id));
        }
        self.child_identifiers.extend(inner.child_identifiers.into_iter().map(adjust_id));

        let client_offset = self.client_projections.len();
        self.client_projections.extend(inner.client_projections.into_iter().map(adjust));
        let inner_mapping: IndexMap<ProjectionMember, ProjectionValue> = inner.mapping.into_iter()
            .map(|(m, v)| (m, adjust(v)))
            .collect();

        let orderings = inner.orderings.into_iter()
            .map(|o| if nullable { o.with_expr(SqlExpr::make_nullable(&o.expr)) } else { o })
            .collect();
        self.tables.push(source);
        Ok(JoinResult { select: self, inner: inner_mapping, client_offset, orderings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::{TypeMapping, ValueComparer},
        sql::{TableExpr, TableSource}
    };

    struct Fixture {
        aliases: AliasAllocator,
        customers: SelectBuilder,
        customer_id: SqlExprRef,
    }

    fn fixture() -> Fixture {
        let mut aliases = AliasAllocator::new();
        let (customers, c) = SelectBuilder::from_table(&mut aliases, TableExpr::table("Customers", None));
        let customer_id = SqlExpr::column("Id", c, TypeMapping::int(), false);
        let mut mapping = IndexMap::new();
        mapping.insert(ProjectionMember::root(), ProjectionValue::Scalar(customer_id.clone()));
        let customers = customers.with_mapping(mapping).with_identifier(vec![Identifier::new(customer_id.clone(), ValueComparer::Default)]);
        Fixture { aliases, customers, customer_id }
    }

    fn orders_of(f: &mut Fixture, correlate: impl Fn(SqlExprRef, SqlExprRef) -> SqlExprRef) -> (SelectBuilder, SqlExprRef) {
        let (orders, o) = SelectBuilder::from_table(&mut f.aliases, TableExpr::table("Orders", None));
        let order_id = SqlExpr::column("Id", o, TypeMapping::int(), false);
        let fk = SqlExpr::column("CustomerId", o, TypeMapping::int(), false);
        let mut mapping = IndexMap::new();
        mapping.insert(ProjectionMember::root(), ProjectionValue::Scalar(order_id.clone()));
        let orders = orders.with_mapping(mapping).with_identifier(vec![Identifier::new(order_id, ValueComparer::Default)]);
        let predicate = correlate(fk.clone(), f.customer_id.clone());
        let orders = orders.apply_predicate(&mut f.aliases, predicate).unwrap();
        (orders, fk)
    }

    fn join_of(source: &TableSource) -> &Join {
        source.join.as_ref().unwrap()
    }

    #[test]
    fn outer_apply_on_equality_becomes_left_join() {
        let mut f = fixture();
        let (orders, fk) = orders_of(&mut f, SqlExpr::equal);
        let result = f.customers.clone().add_outer_apply(&mut f.aliases, orders).unwrap();

        let joined = &result.select.tables[1];
        assert!(matches!(joined.table, TableExpr::Table { .. }));
        let join = join_of(joined);
        assert_eq!(join.kind, JoinKind::Left);
        let expected = SqlExpr::equal(f.customer_id.clone(), fk);
        assert_eq!(join.predicate.as_ref(), Some(&expected));
    }

    #[test]
    fn apply_identifiers_concatenate_and_become_nullable() {
        let mut f = fixture();
        let (orders, _) = orders_of(&mut f, SqlExpr::equal);
        let result = f.customers.clone().add_outer_apply(&mut f.aliases, orders).unwrap();
        assert_eq!(result.select.identifier.len(), 2);
        assert!(!result.select.identifier[0].expr.is_nullable());
        assert!(result.select.identifier[1].expr.is_nullable());
        assert!(result.inner[&ProjectionMember::root()].as_scalar().unwrap().is_nullable());
    }

    #[test]
    fn joining_a_select_without_identifier_clears_it() {
        let mut f = fixture();
        let (mut orders, _) = orders_of(&mut f, SqlExpr::equal);
        orders.identifier.clear();
        let result = f.customers.clone().add_cross_apply(&mut f.aliases, orders).unwrap();
        assert_eq!(join_of(&result.select.tables[1]).kind, JoinKind::Inner);
        assert!(result.select.identifier.is_empty());
    }

    #[test]
    fn case_wrapped_correlation_stays_apply() {
        let mut f = fixture();
        let (orders, _) = orders_of(&mut f, |fk, id| {
            let guarded = SqlExpr::case(None, vec![crate::sql::CaseWhen { test: SqlExpr::is_not_null(id.clone()), result: id }], None);
            SqlExpr::equal(fk, guarded)
        });
        let result = f.customers.clone().add_outer_apply(&mut f.aliases, orders).unwrap();
        let joined = &result.select.tables[1];
        assert_eq!(join_of(joined).kind, JoinKind::OuterApply);
        assert!(matches!(joined.table, TableExpr::Subquery(_)));
    }

    #[test]
    fn inequality_with_limit_stays_apply() {
        let mut f = fixture();
        let (orders, _) = orders_of(&mut f, |fk, id| SqlExpr::binary(BinaryOp::GreaterThan, fk, id));
        let orders = orders.apply_limit(&mut f.aliases, SqlExpr::int(1)).unwrap();
        let result = f.customers.clone().add_cross_apply(&mut f.aliases, orders).unwrap();
        assert_eq!(join_of(&result.select.tables[1]).kind, JoinKind::CrossApply);
    }

    #[test]
    fn inequality_without_limit_becomes_join() {
        let mut f = fixture();
        let (orders, _) = orders_of(&mut f, |fk, id| SqlExpr::binary(BinaryOp::GreaterThan, fk, id));
        let result = f.customers.clone().add_cross_apply(&mut f.aliases, orders).unwrap();
        let join = join_of(&result.select.tables[1]);
        assert_eq!(join.kind, JoinKind::Inner);
        match join.predicate.as_deref() {
            Some(SqlExpr::Binary { op, left, .. }) => {
                assert_eq!(*op, BinaryOp::LessThan);
                assert_eq!(left, &f.customer_id);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn limited_apply_uses_row_number() {
        let mut f = fixture();
        let (orders, _) = orders_of(&mut f, SqlExpr::equal);
        let orders = orders.apply_limit(&mut f.aliases, SqlExpr::int(2)).unwrap();
        let result = f.customers.clone().add_outer_apply(&mut f.aliases, orders).unwrap();

        let joined = &result.select.tables[1];
        let join = join_of(joined);
        assert_eq!(join.kind, JoinKind::Left);
        let TableExpr::Subquery(inner) = &joined.table else { panic!("expected subquery") };
        assert!(inner.limit.is_none());
        assert!(inner.projection.iter().any(|p| matches!(p.expr.as_ref(), SqlExpr::RowNumber { .. })));
        let on = join.predicate.as_ref().unwrap();
        assert_eq!(SqlExpr::conjuncts(on).len(), 2);
        assert!(ExprCollector::references_any(on, &BTreeSet::from([joined.id])));
    }

    #[test]
    fn limited_outer_is_pushed_down_before_join() {
        let mut f = fixture();
        let (orders, _) = orders_of(&mut f, SqlExpr::equal);
        let customers = f.customers.clone().apply_limit(&mut f.aliases, SqlExpr::int(10)).unwrap();
        let result = customers.add_outer_apply(&mut f.aliases, orders).unwrap();

        let outer = &result.select.tables[0];
        assert!(matches!(outer.table, TableExpr::Subquery(_)));
        let on = join_of(&result.select.tables[1]).predicate.as_ref().unwrap();
        let referenced = ExprCollector::referenced_tables(on);
        assert!(referenced.contains(&outer.id));
        assert_eq!(referenced.len(), 2);
    }

    #[test]
    fn paired_join_prefixes_members() {
        let mut f = fixture();
        let (orders, fk) = orders_of(&mut f, SqlExpr::equal);
        let mut orders = orders;
        orders.predicate = None;
        let on = SqlExpr::equal(f.customer_id.clone(), fk);
        let select = f.customers.clone().add_join_paired(&mut f.aliases, JoinKind::Inner, orders, Some(on)).unwrap();
        let members: Vec<String> = select.mapping.keys().map(|m| m.to_string()).collect();
        assert_eq!(members, vec!["Outer", "Inner"]);
    }
}
