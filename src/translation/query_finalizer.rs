use indexmap::IndexMap;
use tracing::debug;

use crate::{
    error::{QueryError, QueryResult},
    select::{Identifier, JoinResult, ProjectionValue, SelectBuilder},
    shaper::{IdentifierBinding, ResultCardinality, ShapedQuery, Shaper, SubqueryKind, ValueBinding},
    sql::{JoinKind, OrderBy, ProjectionMember, SelectExpression, SqlExpr, SqlExprRef},
    translation::{Query, QueryCompilationContext, QueryableTranslator, Scope, correlation::substitute_outer}
};

/// A query ready for execution: the main select, the follow-up selects of
/// split collections and the shaper turning rows into results.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub select: SelectExpression,
    pub shaper: Shaper,
    /// Selects loading `Shaper::SplitCollection`s, addressed by index
    pub related_queries: Vec<SelectExpression>,
    pub cardinality: ResultCardinality,
}

/// Translate `query` and combine everything it projects into executable selects.
pub fn compile_query(ctx: &mut QueryCompilationContext, query: &Query) -> QueryResult<CompiledQuery> {
    let shaped = QueryableTranslator::new(ctx, Scope::new())
        .translate(query)?
        .into_shaped()?;
    let ShapedQuery { select, shaper, cardinality } = shaped;
    let (mut select, shaper) = ungroup_result(select, shaper)?;

    let mut related = Vec::new();
    let shaper = resolve(ctx, &mut select, &shaper, &mut related)?;

    let (select, index) = select.finalize()?;
    let shaper = shaper.map_bindings(&mut |b| index.resolve(b))?;
    debug!(columns = select.projection.len(), related = related.len(), "compiled query");
    Ok(CompiledQuery { select, shaper, related_queries: related, cardinality })
}

/// A query ending with `GroupBy` returns whole groups: read the element rows
/// ordered by key instead of grouping in SQL.
fn ungroup_result(mut select: SelectBuilder, shaper: Shaper) -> QueryResult<(SelectBuilder, Shaper)> {
    let (key, element) = match shaper {
        Shaper::Grouping { key, element, .. } => (key, element),
        other => return Ok((select, other)),
    };
    if !select.is_grouped() {
        return Ok((select, Shaper::Grouping { key, element, key_identifier: Vec::new() }));
    }
    let key = key.map_bindings(&mut |b| match b {
        ValueBinding::Member(m) => {
            let value = select.mapping.get(m).cloned()
                .ok_or_else(|| QueryError::invalid(format!("grouping key {m} is not projected")))?;
            Ok(ValueBinding::Client(select.push_client_projection(value)))
        }
        other => Ok(other.clone()),
    })?;
    let terms = select.group_by.clone();
    let key_identifier = terms.into_iter()
        .map(|t| {
            let comparer = Identifier::of(t.clone()).comparer;
            let client = select.push_client_projection(ProjectionValue::Scalar(t));
            IdentifierBinding::new(ValueBinding::Client(client), comparer)
        })
        .collect();
    let (select, _) = select.ungroup_for_enumeration()?;
    Ok((select, Shaper::Grouping { key: Box::new(key), element, key_identifier }))
}

/// Combine every pending subquery of `shaper` with `select`.
fn resolve(
    ctx: &mut QueryCompilationContext,
    select: &mut SelectBuilder,
    shaper: &Shaper,
    related: &mut Vec<SelectExpression>,
) -> QueryResult<Shaper> {
    Ok(match shaper {
        Shaper::Subquery { query, kind, outer_refs } => {
            let inner = substitute_outer(select, query, outer_refs)?;
            match kind {
                SubqueryKind::Single => single(ctx, select, inner, related)?,
                SubqueryKind::Collection { navigation } if ctx.is_split_query() => {
                    split_collection(ctx, select, inner, navigation.clone(), related)?
                }
                SubqueryKind::Collection { navigation } => collection(ctx, select, inner, navigation.clone(), related)?,
            }
        }
        Shaper::Object(fields) => {
            let mut out = IndexMap::new();
            for (name, field) in fields {
                out.insert(name.clone(), resolve(ctx, select, field, related)?);
            }
            Shaper::Object(out)
        }
        Shaper::Include { entity, navigation, included } => Shaper::Include {
            entity: Box::new(resolve(ctx, select, entity, related)?),
            navigation: navigation.clone(),
            included: Box::new(resolve(ctx, select, included, related)?),
        },
        Shaper::Grouping { key, element, key_identifier } => Shaper::Grouping {
            key: Box::new(resolve(ctx, select, key, related)?),
            element: Box::new(resolve(ctx, select, element, related)?),
            key_identifier: key_identifier.clone(),
        },
        other => other.clone(),
    })
}

/// Rebind a joined shaper: inner members become client projections of the
/// combined select, inner clients shift by the join's offset.
fn absorb(select: &mut SelectBuilder, inner: &IndexMap<ProjectionMember, ProjectionValue>, offset: usize, shaper: &Shaper) -> QueryResult<Shaper> {
    shaper.map_bindings(&mut |b| match b {
        ValueBinding::Member(m) => {
            let value = inner.get(m).cloned()
                .ok_or_else(|| QueryError::invalid(format!("nested member {m} is not projected")))?;
            Ok(ValueBinding::Client(select.push_client_projection(value)))
        }
        ValueBinding::Client(i) => Ok(ValueBinding::Client(i + offset)),
        other => Ok(other.clone()),
    })
}

fn client_expr(select: &SelectBuilder, client: usize) -> QueryResult<SqlExprRef> {
    select.client_projections.get(client)
        .and_then(ProjectionValue::as_scalar)
        .cloned()
        .ok_or_else(|| QueryError::invalid(format!("client projection {client} is not a scalar")))
}

/// Push `ids` as client projections; returns their slots and comparers.
fn push_identifiers(select: &mut SelectBuilder, ids: &[Identifier]) -> Vec<(usize, Identifier)> {
    ids.iter()
        .map(|id| (select.push_client_projection(ProjectionValue::Scalar(id.expr.clone())), id.clone()))
        .collect()
}

fn bindings(slots: &[(usize, Identifier)], offset: usize) -> Vec<IdentifierBinding> {
    slots.iter()
        .map(|(slot, id)| IdentifierBinding::new(ValueBinding::Client(slot + offset), id.comparer))
        .collect()
}

fn push_ordering(orderings: &mut Vec<OrderBy>, expr: SqlExprRef) {
    if !orderings.iter().any(|o| o.expr == expr) {
        orderings.push(OrderBy::asc(expr));
    }
}

/// Row order keeping each parent's elements together: the existing
/// orderings, the parent key, the nested query's own orderings, the element key.
fn collection_orderings(
    select: &SelectBuilder,
    existing: Vec<OrderBy>,
    parent: &[IdentifierBinding],
    nested: Vec<OrderBy>,
    elements: &[IdentifierBinding],
) -> QueryResult<Vec<OrderBy>> {
    let mut orderings = existing;
    for id in parent {
        if let ValueBinding::Client(i) = id.binding {
            push_ordering(&mut orderings, client_expr(select, i)?);
        }
    }
    for o in nested {
        if !orderings.iter().any(|existing| existing.expr == o.expr) {
            orderings.push(o);
        }
    }
    for id in elements {
        if let ValueBinding::Client(i) = id.binding {
            push_ordering(&mut orderings, client_expr(select, i)?);
        }
    }
    Ok(orderings)
}

fn single(
    ctx: &mut QueryCompilationContext,
    select: &mut SelectBuilder,
    mut inner: ShapedQuery,
    related: &mut Vec<SelectExpression>,
) -> QueryResult<Shaper> {
    let sentinel = inner.select.push_client_projection(ProjectionValue::Scalar(SqlExpr::int(1)));
    if inner.select.identifier.is_empty() {
        inner.select.identifier.push(Identifier::of(SqlExpr::int(1)));
    }
    let kept = select.identifier.len();
    let rewrite = ctx.options.rewrite_apply_to_join;
    let JoinResult { select: mut joined, inner: inner_mapping, client_offset, .. } =
        std::mem::take(select).add_join_with(&mut ctx.aliases, JoinKind::OuterApply, inner.select, None, rewrite)?;
    joined.identifier.truncate(kept);
    let element = absorb(&mut joined, &inner_mapping, client_offset, &inner.shaper)?;
    *select = joined;
    let element = resolve(ctx, select, &element, related)?;
    Ok(Shaper::SingleResult { sentinel: ValueBinding::Client(sentinel + client_offset), element: Box::new(element) })
}

fn require_identifiers(outer: &SelectBuilder, inner: &SelectBuilder) -> QueryResult<()> {
    if outer.identifier.is_empty() {
        return QueryError::not_translated("a collection projected from rows that cannot be identified").err();
    }
    if inner.identifier.is_empty() {
        return QueryError::not_translated("a collection whose elements cannot be identified").err();
    }
    Ok(())
}

fn collection(
    ctx: &mut QueryCompilationContext,
    select: &mut SelectBuilder,
    mut inner: ShapedQuery,
    navigation: Option<String>,
    related: &mut Vec<SelectExpression>,
) -> QueryResult<Shaper> {
    require_identifiers(select, &inner.select)?;
    let parent_ids = select.identifier.clone();
    let parent_slots = push_identifiers(select, &parent_ids);
    let inner_ids = inner.select.identifier.clone();
    let self_slots = push_identifiers(&mut inner.select, &inner_ids);

    let kept = select.identifier.len();
    let rewrite = ctx.options.rewrite_apply_to_join;
    let JoinResult { select: mut joined, inner: inner_mapping, client_offset, orderings } =
        std::mem::take(select).add_join_with(&mut ctx.aliases, JoinKind::OuterApply, inner.select, None, rewrite)?;
    joined.identifier.truncate(kept);

    let parent_identifier = bindings(&parent_slots, 0);
    let self_identifier = bindings(&self_slots, client_offset);
    let existing = std::mem::take(&mut joined.orderings);
    joined.orderings = collection_orderings(&joined, existing, &parent_identifier, orderings, &self_identifier)?;
    for id in &self_identifier {
        if let ValueBinding::Client(i) = id.binding {
            let expr = client_expr(&joined, i)?;
            joined.child_identifiers.push(Identifier::new(expr, id.comparer));
        }
    }

    let element = absorb(&mut joined, &inner_mapping, client_offset, &inner.shaper)?;
    *select = joined;
    let element = resolve(ctx, select, &element, related)?;
    Ok(Shaper::CollectionResult { parent_identifier, self_identifier, element: Box::new(element), navigation })
}

fn split_collection(
    ctx: &mut QueryCompilationContext,
    select: &mut SelectBuilder,
    mut inner: ShapedQuery,
    navigation: Option<String>,
    related: &mut Vec<SelectExpression>,
) -> QueryResult<Shaper> {
    require_identifiers(select, &inner.select)?;
    let parent_ids = select.identifier.clone();

    // the main query returns parents in key order so children can be matched as they stream
    let parent_slots = push_identifiers(select, &parent_ids);
    let parent_identifier = bindings(&parent_slots, 0);
    for (slot, _) in &parent_slots {
        let expr = client_expr(select, *slot)?;
        push_ordering(&mut select.orderings, expr);
    }

    let mut parent = select.clone();
    parent.mapping.clear();
    parent.client_projections.clear();
    parent.child_identifiers.clear();
    let child_slots = push_identifiers(&mut parent, &parent_ids);
    let inner_ids = inner.select.identifier.clone();
    let self_slots = push_identifiers(&mut inner.select, &inner_ids);

    let rewrite = ctx.options.rewrite_apply_to_join;
    let JoinResult { select: mut joined, inner: inner_mapping, client_offset, orderings } =
        parent.add_join_with(&mut ctx.aliases, JoinKind::CrossApply, inner.select, None, rewrite)?;
    let child_identifier = bindings(&child_slots, 0);
    let self_identifier = bindings(&self_slots, client_offset);
    let existing = std::mem::take(&mut joined.orderings);
    joined.orderings = collection_orderings(&joined, existing, &child_identifier, orderings, &self_identifier)?;

    let element = absorb(&mut joined, &inner_mapping, client_offset, &inner.shaper)?;
    let element = resolve(ctx, &mut joined, &element, related)?;
    let (expr, index) = joined.finalize()?;
    let element = element.map_bindings(&mut |b| index.resolve(b))?;
    let resolve_ids = |ids: Vec<IdentifierBinding>| -> QueryResult<Vec<IdentifierBinding>> {
        ids.into_iter().map(|id| Ok(IdentifierBinding::new(index.resolve(&id.binding)?, id.comparer))).collect()
    };
    let child_identifier = resolve_ids(child_identifier)?;
    let self_identifier = resolve_ids(self_identifier)?;

    let query = related.len();
    debug!(query, navigation = ?navigation, "split collection into a related query");
    related.push(expr);
    Ok(Shaper::SplitCollection {
        query,
        parent_identifier,
        child_identifier,
        self_identifier,
        element: Box::new(element),
        navigation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        _tests::fixtures,
        sql::{ExprCollector, TableExpr},
        translation::{ClientExpr, Lambda, QueryOp}
    };
    use std::collections::HashSet;

    fn customers_with_orders() -> Query {
        Query::entity("Customer").select("c", ClientExpr::new_object(vec![
            ("Name", ClientExpr::path("c", &["Name"])),
            ("Orders", ClientExpr::path("c", &["Orders"])),
        ]))
    }

    #[test]
    fn single_query_collection_is_joined_and_ordered_by_parent() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let compiled = compile_query(&mut ctx, &customers_with_orders()).unwrap();

        assert!(compiled.related_queries.is_empty());
        assert_eq!(compiled.select.tables.len(), 2);
        assert!(compiled.select.orderings[0].expr.to_string().ends_with("Id"));
        let Shaper::Object(fields) = &compiled.shaper else { panic!("expected object") };
        let Shaper::CollectionResult { parent_identifier, self_identifier, navigation, .. } = &fields["Orders"] else {
            panic!("expected collection result")
        };
        assert_eq!(parent_identifier.len(), 1);
        assert_eq!(self_identifier.len(), 1);
        assert_eq!(navigation.as_deref(), Some("Orders"));
        assert!(parent_identifier.iter().all(|id| id.binding.is_positional()));
        assert!(!compiled.shaper.has_pending());
    }

    #[test]
    fn split_query_collection_becomes_related_query() {
        let model = fixtures::model();
        let mut ctx = fixtures::split_context(&model);
        let compiled = compile_query(&mut ctx, &customers_with_orders()).unwrap();

        assert_eq!(compiled.select.tables.len(), 1);
        assert_eq!(compiled.related_queries.len(), 1);
        assert!(!compiled.related_queries[0].orderings.is_empty());
        let Shaper::Object(fields) = &compiled.shaper else { panic!("expected object") };
        let Shaper::SplitCollection { query, parent_identifier, child_identifier, .. } = &fields["Orders"] else {
            panic!("expected split collection")
        };
        assert_eq!(*query, 0);
        assert_eq!(parent_identifier.len(), child_identifier.len());
    }

    #[test]
    fn as_split_query_overrides_the_option() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let query = Query::entity("Customer").include(&["Orders"]).then(QueryOp::AsSplitQuery);
        let compiled = compile_query(&mut ctx, &query).unwrap();
        assert_eq!(compiled.related_queries.len(), 1);
        let Shaper::Include { included, .. } = &compiled.shaper else { panic!("expected include") };
        assert!(matches!(included.as_ref(), Shaper::SplitCollection { .. }));
    }

    #[test]
    fn included_collection_in_single_query() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let query = Query::entity("Customer").include(&["Orders"]);
        let compiled = compile_query(&mut ctx, &query).unwrap();
        let Shaper::Include { navigation, included, .. } = &compiled.shaper else { panic!("expected include") };
        assert_eq!(navigation, "Orders");
        assert!(matches!(included.as_ref(), Shaper::CollectionResult { .. }));
    }

    #[test]
    fn trailing_group_by_enumerates_rows_by_key() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let query = Query::entity("Product").then(QueryOp::GroupBy {
            key: Lambda::new(&["p"], ClientExpr::path("p", &["CategoryId"])),
            element: None,
        });
        let compiled = compile_query(&mut ctx, &query).unwrap();
        assert!(compiled.select.group_by.is_empty());
        assert!(compiled.select.orderings[0].expr.to_string().ends_with("CategoryId"));
        let Shaper::Grouping { key_identifier, .. } = &compiled.shaper else { panic!("expected grouping") };
        assert_eq!(key_identifier.len(), 1);
    }

    #[test]
    fn group_subqueries_never_share_a_source() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let group_rows = |n| ClientExpr::subquery(Query::grouping(ClientExpr::var("g")).take(n).then(QueryOp::Count(None)));
        let query = Query::entity("Product")
            .then(QueryOp::GroupBy {
                key: Lambda::new(&["p"], ClientExpr::path("p", &["CategoryId"]).add(ClientExpr::constant(1))),
                element: None,
            })
            .select("g", ClientExpr::new_object(vec![
                ("Key", ClientExpr::path("g", &["Key"])),
                ("FirstTwo", group_rows(2)),
                ("FirstThree", group_rows(3)),
            ]));
        let compiled = compile_query(&mut ctx, &query).unwrap();

        let mut sources = Vec::new();
        ExprCollector::visit_sources(&compiled.select, &mut |t| sources.push((t.id, t.alias.clone())));
        let ids: HashSet<_> = sources.iter().map(|(id, _)| *id).collect();
        let aliases: HashSet<_> = sources.iter().map(|(_, alias)| alias.clone()).collect();
        // grouped select over the lifted key, plus a limited copy of the rows per count
        assert!(sources.len() >= 6, "{sources:?}");
        assert_eq!(ids.len(), sources.len(), "{sources:?}");
        assert_eq!(aliases.len(), sources.len(), "{sources:?}");
    }

    #[test]
    fn projected_single_reads_one_row_per_parent() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let order = Query::navigation(ClientExpr::var("c"), "Orders")
            .then(QueryOp::Single { predicate: None, or_default: true });
        let query = Query::entity("Customer").select("c", ClientExpr::new_object(vec![
            ("Name", ClientExpr::path("c", &["Name"])),
            ("Order", ClientExpr::subquery(order)),
        ]));
        let compiled = compile_query(&mut ctx, &query).unwrap();

        assert_eq!(compiled.select.tables.len(), 2);
        let joined = &compiled.select.tables[1];
        assert_eq!(joined.join_kind(), Some(JoinKind::Left));
        let predicate = joined.join.as_ref().and_then(|j| j.predicate.clone()).unwrap();
        let window_limit = |limit: &str| ExprCollector::any(&predicate, &|e| matches!(
            e,
            SqlExpr::Binary { op: crate::sql::BinaryOp::LessThanOrEqual, right, .. } if right.to_string() == limit
        ));
        assert!(window_limit("1"), "{predicate}");
        assert!(!window_limit("2"), "{predicate}");
        let Shaper::Object(fields) = &compiled.shaper else { panic!("expected object") };
        assert!(matches!(fields["Order"], Shaper::SingleResult { .. }));
    }

    #[test]
    fn top_level_single_reads_a_second_row() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let query = Query::entity("Order").then(QueryOp::Single { predicate: None, or_default: false });
        let compiled = compile_query(&mut ctx, &query).unwrap();
        assert_eq!(compiled.select.limit.as_ref().map(|l| l.to_string()), Some("2".to_string()));
        assert_eq!(compiled.cardinality, ResultCardinality::Single);
    }

    #[test]
    fn count_compiles_to_single_scalar() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let compiled = compile_query(&mut ctx, &Query::entity("Order").then(QueryOp::Count(None))).unwrap();
        assert_eq!(compiled.cardinality, ResultCardinality::Single);
        assert_eq!(compiled.select.projection.len(), 1);
        assert_eq!(compiled.select.projection[0].expr.to_string(), "COUNT(*)");
        assert!(matches!(compiled.select.tables[0].table, TableExpr::Table { .. }));
    }
}
