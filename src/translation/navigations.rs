use tracing::debug;

use crate::{
    error::{QueryError, QueryResult},
    metadata::{Model, Navigation},
    select::{JoinResult, ProjectionValue, SelectBuilder},
    shaper::ShapedQuery,
    sql::{JoinKind, ProjectionMember, SqlExpr, SqlExprRef},
    structural::{NestedProjection, StructuralProjection},
    translation::{NavOrigin, QueryCompilationContext, RootBuilder}
};

/// Navigation `name` of `entity_type` or of one of its derived types.
pub fn find_navigation<'m>(model: &'m Model, entity_type: &str, name: &str) -> QueryResult<Option<&'m Navigation>> {
    for candidate in model.type_and_descendants(entity_type)? {
        if let Some(nav) = model.find_navigation(&candidate.name, name)? {
            return Ok(Some(nav));
        }
    }
    Ok(None)
}

/// `source.fk = target.pk` (or the reverse) over every key pair of `nav`.
pub fn join_predicate(source: &StructuralProjection, target: &StructuralProjection, nav: &Navigation) -> QueryResult<SqlExprRef> {
    let pairs = nav.key_pairs();
    let terms = pairs.iter()
        .map(|(own, other)| Ok(SqlExpr::equal(source.bind_property(own)?, target.bind_property(other)?)))
        .collect::<QueryResult<Vec<_>>>()?;
    SqlExpr::and_all(terms)
        .ok_or_else(|| QueryError::invalid(format!("navigation '{}' has no foreign key", nav.name)))
}

fn root_projection(query: &ShapedQuery) -> QueryResult<StructuralProjection> {
    query.select.mapping.get(&ProjectionMember::root())
        .and_then(ProjectionValue::as_structural)
        .cloned()
        .ok_or_else(|| QueryError::invalid("entity root does not project a structural value"))
}

/// Join the target of a to-one navigation into `select`.
///
/// The join is INNER only when the target must exist: a required reference
/// read from a row that is itself always present.
pub fn expand_reference(
    ctx: &mut QueryCompilationContext,
    select: SelectBuilder,
    source: &StructuralProjection,
    nav: &Navigation,
) -> QueryResult<(SelectBuilder, StructuralProjection)> {
    if nav.is_collection {
        return QueryError::invalid(format!("'{}' is a collection navigation", nav.name)).err();
    }
    let target_query = RootBuilder::entity(ctx.model, &mut ctx.aliases, &nav.target)?;
    let target = root_projection(&target_query)?;
    let predicate = join_predicate(source, &target, nav)?;
    let kind = if nav.is_required_reference() && !source.nullable { JoinKind::Inner } else { JoinKind::Left };

    let JoinResult { select, inner, .. } = select.add_join(&mut ctx.aliases, kind, target_query.select, Some(predicate))?;
    let target = inner.get(&ProjectionMember::root())
        .and_then(ProjectionValue::as_structural)
        .cloned()
        .ok_or_else(|| QueryError::invalid("joined navigation target lost its projection"))?;
    debug!(navigation = %nav.name, join = %kind, "expanded reference navigation");
    Ok((select, target))
}

/// Entities reached through a collection navigation of `source`, as a query
/// correlated on the foreign key.
pub fn navigation_query(ctx: &mut QueryCompilationContext, source: &StructuralProjection, nav: &Navigation) -> QueryResult<ShapedQuery> {
    if nav.owned && nav.is_json_mapped() {
        return QueryError::not_translated(format!("querying the JSON collection '{}'", nav.name)).err();
    }
    let mut query = RootBuilder::entity(ctx.model, &mut ctx.aliases, &nav.target)?;
    let target = root_projection(&query)?;
    let predicate = join_predicate(source, &target, nav)?;
    query.select = query.select.apply_predicate(&mut ctx.aliases, predicate)?;
    Ok(query)
}

/// Record an expanded navigation in the mapping entry `origin` points to,
/// so later accesses reuse the join.
pub fn persist_navigation(select: &mut SelectBuilder, origin: &NavOrigin, name: &str, target: &StructuralProjection) {
    let Some(ProjectionValue::Structural(root)) = select.mapping.get_mut(&origin.member) else { return };
    let mut current = root;
    for segment in &origin.path {
        let next = if current.navigations.contains_key(segment) {
            current.navigations.get_mut(segment)
        } else {
            current.complex.get_mut(segment)
        };
        match next {
            Some(NestedProjection::Structural(s)) => current = s.as_mut(),
            _ => return,
        }
    }
    current.navigations.insert(name.to_string(), NestedProjection::Structural(Box::new(target.clone())));
}

/// Current value of the structural projection `origin` points to.
pub fn lookup_origin(select: &SelectBuilder, origin: &NavOrigin) -> Option<StructuralProjection> {
    let mut current = select.mapping.get(&origin.member)?.as_structural()?;
    for segment in &origin.path {
        current = match current.navigations.get(segment).or_else(|| current.complex.get(segment))? {
            NestedProjection::Structural(s) => s.as_ref(),
            NestedProjection::Json(_) => return None,
        };
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{_tests::fixtures, sql::TableExpr};

    #[test]
    fn required_reference_joins_inner() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let orders = RootBuilder::entity(&model, &mut ctx.aliases, "Order").unwrap();
        let source = root_projection(&orders).unwrap();
        let nav = model.find_navigation("Order", "Customer").unwrap().unwrap().clone();

        let (select, customer) = expand_reference(&mut ctx, orders.select, &source, &nav).unwrap();
        assert_eq!(select.tables.len(), 2);
        assert_eq!(select.tables[1].join_kind(), Some(JoinKind::Inner));
        assert!(!customer.properties["Name"].is_nullable());
    }

    #[test]
    fn optional_reference_joins_left_and_nulls_target() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let lines = RootBuilder::entity(&model, &mut ctx.aliases, "OrderLine").unwrap();
        let source = root_projection(&lines).unwrap();
        let nav = model.find_navigation("OrderLine", "Product").unwrap().unwrap().clone();

        let (select, product) = expand_reference(&mut ctx, lines.select, &source, &nav).unwrap();
        assert_eq!(select.tables[1].join_kind(), Some(JoinKind::Left));
        assert!(product.properties["Name"].is_nullable());
    }

    #[test]
    fn collection_navigation_filters_on_foreign_key() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let customers = RootBuilder::entity(&model, &mut ctx.aliases, "Customer").unwrap();
        let source = root_projection(&customers).unwrap();
        let nav = model.find_navigation("Customer", "Orders").unwrap().unwrap().clone();

        let orders = navigation_query(&mut ctx, &source, &nav).unwrap();
        assert!(matches!(&orders.select.tables[0].table, TableExpr::Table { name, .. } if name == "Orders"));
        assert!(orders.select.predicate.is_some());

        let phones = model.find_navigation("Customer", "Phones").unwrap().unwrap().clone();
        assert!(navigation_query(&mut ctx, &source, &phones).unwrap_err().is_translation_failure());
    }

    #[test]
    fn persisted_navigation_is_found_again() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let orders = RootBuilder::entity(&model, &mut ctx.aliases, "Order").unwrap();
        let source = root_projection(&orders).unwrap();
        let nav = model.find_navigation("Order", "Customer").unwrap().unwrap().clone();
        let (mut select, customer) = expand_reference(&mut ctx, orders.select, &source, &nav).unwrap();

        let origin = NavOrigin::of(ProjectionMember::root());
        persist_navigation(&mut select, &origin, "Customer", &customer);
        let found = lookup_origin(&select, &origin.child("Customer")).unwrap();
        assert_eq!(found.entity_type, "Customer");
    }
}
