//! Correlation of nested queries with the select enclosing them.
//!
//! A nested query is built against the enclosing select's columns. Those
//! columns are also pushed as client projections of the enclosing select so
//! that they stay readable whatever happens to it later; when the nested query
//! is finally combined, its references are replaced by the clients' current
//! expressions.

use crate::{
    error::{QueryError, QueryResult},
    select::{ProjectionValue, SelectBuilder},
    shaper::{OuterRef, ShapedQuery, Shaper},
    sql::{ExprRewriter, Replacer, SqlExpr, SqlExprRef}
};

fn pending_queries<'s>(shaper: &'s Shaper, out: &mut Vec<&'s ShapedQuery>) {
    match shaper {
        Shaper::Subquery { query, .. } => out.push(query),
        Shaper::Object(fields) => fields.values().for_each(|f| pending_queries(f, out)),
        Shaper::Include { entity, included, .. } => {
            pending_queries(entity, out);
            pending_queries(included, out);
        }
        Shaper::CollectionResult { element, .. } | Shaper::SingleResult { element, .. } => pending_queries(element, out),
        Shaper::Grouping { key, element, .. } => {
            pending_queries(key, out);
            pending_queries(element, out);
        }
        Shaper::Value(_) | Shaper::Constant(_) | Shaper::SplitCollection { .. } => {}
    }
}

/// Visit every expression of `query` and of the queries nested in its shaper.
pub fn visit_query(query: &ShapedQuery, f: &mut dyn FnMut(&SqlExprRef)) {
    query.select.visit_all(f);
    let mut nested = Vec::new();
    pending_queries(&query.shaper, &mut nested);
    for q in nested {
        visit_query(q, f);
    }
}

fn rewrite_shaper(shaper: &Shaper, f: &mut Replacer<'_>) -> Shaper {
    match shaper {
        Shaper::Subquery { query, kind, outer_refs } => Shaper::Subquery {
            query: Box::new(rewrite_query(query, f)),
            kind: kind.clone(),
            outer_refs: outer_refs.iter()
                .map(|r| OuterRef { expr: ExprRewriter::rewrite(&r.expr, f), client: r.client })
                .collect(),
        },
        Shaper::Object(fields) => Shaper::Object(fields.iter().map(|(k, v)| (k.clone(), rewrite_shaper(v, f))).collect()),
        Shaper::Include { entity, navigation, included } => Shaper::Include {
            entity: Box::new(rewrite_shaper(entity, f)),
            navigation: navigation.clone(),
            included: Box::new(rewrite_shaper(included, f)),
        },
        Shaper::CollectionResult { parent_identifier, self_identifier, element, navigation } => Shaper::CollectionResult {
            parent_identifier: parent_identifier.clone(),
            self_identifier: self_identifier.clone(),
            element: Box::new(rewrite_shaper(element, f)),
            navigation: navigation.clone(),
        },
        Shaper::SingleResult { sentinel, element } => Shaper::SingleResult {
            sentinel: sentinel.clone(),
            element: Box::new(rewrite_shaper(element, f)),
        },
        Shaper::Grouping { key, element, key_identifier } => Shaper::Grouping {
            key: Box::new(rewrite_shaper(key, f)),
            element: Box::new(rewrite_shaper(element, f)),
            key_identifier: key_identifier.clone(),
        },
        other => other.clone(),
    }
}

/// Apply `f` to the select of `query` and to every query nested in it.
pub fn rewrite_query(query: &ShapedQuery, f: &mut Replacer<'_>) -> ShapedQuery {
    ShapedQuery {
        select: query.select.rewrite_all(f),
        shaper: rewrite_shaper(&query.shaper, f),
        cardinality: query.cardinality,
    }
}

fn same_value(a: &SqlExprRef, b: &SqlExprRef) -> bool {
    match (a.as_column(), b.as_column()) {
        (Some(x), Some(y)) => x.table == y.table && x.name == y.name,
        _ => a == b,
    }
}

/// Columns of `outer`'s tables read by `inner`, each pushed once as a client
/// projection of `outer`.
pub fn correlate(outer: &mut SelectBuilder, inner: &ShapedQuery) -> Vec<OuterRef> {
    let outer_ids = outer.table_ids();
    let mut refs: Vec<SqlExprRef> = Vec::new();
    visit_query(inner, &mut |e| {
        if let SqlExpr::Column(c) = e.as_ref() {
            if outer_ids.contains(&c.table) && !refs.iter().any(|r| same_value(r, e)) {
                refs.push(e.clone());
            }
        }
    });
    refs.into_iter()
        .map(|expr| {
            let client = outer.push_client_projection(ProjectionValue::Scalar(expr.clone()));
            OuterRef { expr, client }
        })
        .collect()
}

/// Replace the outer references of `query` by the current value of their
/// client projections in `outer`.
pub fn substitute_outer(outer: &SelectBuilder, query: &ShapedQuery, refs: &[OuterRef]) -> QueryResult<ShapedQuery> {
    let mut from = Vec::with_capacity(refs.len());
    let mut to = Vec::with_capacity(refs.len());
    for r in refs {
        let current = outer.client_projections.get(r.client)
            .and_then(ProjectionValue::as_scalar)
            .ok_or_else(|| QueryError::invalid(format!("outer reference {} lost its client projection", r.expr)))?;
        from.push(r.expr.clone());
        to.push(current.clone());
    }
    if from.is_empty() {
        return Ok(query.clone());
    }
    Ok(rewrite_query(query, &mut |e: &SqlExprRef| {
        from.iter().position(|f| same_value(f, e)).map(|i| to[i].clone())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::TypeMapping,
        sql::{AliasAllocator, TableExpr}
    };

    #[test]
    fn outer_columns_become_clients_once() {
        let mut a = AliasAllocator::new();
        let (mut customers, c) = SelectBuilder::from_table(&mut a, TableExpr::table("Customers", None));
        let (orders, o) = SelectBuilder::from_table(&mut a, TableExpr::table("Orders", None));
        let id = SqlExpr::column("Id", c, TypeMapping::int(), false);
        let fk = SqlExpr::column("CustomerId", o, TypeMapping::int(), false);
        let orders = orders.apply_predicate(&mut a, SqlExpr::and(
            SqlExpr::equal(fk.clone(), id.clone()),
            SqlExpr::binary(crate::sql::BinaryOp::GreaterThan, id.clone(), SqlExpr::int(0)),
        )).unwrap();
        let inner = ShapedQuery::new(orders, Shaper::Constant(crate::sql::SqlValue::Int(1)));

        let refs = correlate(&mut customers, &inner);
        assert_eq!(refs.len(), 1);
        assert_eq!(customers.client_projections.len(), 1);

        let pushed = customers.pushdown_into_subquery(&mut a).unwrap();
        let rewritten = substitute_outer(&pushed, &inner, &refs).unwrap();
        let mut reads_old = false;
        rewritten.select.visit_all(&mut |e| reads_old |= e.as_column().map(|col| col.table == c).unwrap_or(false));
        assert!(!reads_old);
    }
}
