use indexmap::IndexMap;
use tracing::debug;

use crate::{
    error::{QueryError, QueryResult},
    select::{ProjectionValue, SelectBuilder},
    shaper::{IncludeNode, IncludeTree, ShapedQuery, Shaper, SubqueryKind, ValueBinding},
    sql::ProjectionMember,
    structural::{NestedProjection, StructuralProjection},
    translation::{
        NavOrigin, QueryCompilationContext, QueryableTranslator, Scope, TranslatedQuery,
        correlation::correlate,
        navigations::{expand_reference, navigation_query, persist_navigation}
    }
};

fn entity_at(select: &SelectBuilder, member: &ProjectionMember) -> Option<StructuralProjection> {
    select.mapping.get(member).and_then(ProjectionValue::as_structural).cloned()
}

/// Load the included navigations of every entity `query` returns.
///
/// `trees` holds one include tree per entity type named by `Include`; an
/// entity projected anywhere in the result gets the tree of a type it is
/// related to by inheritance.
pub fn expand_includes(ctx: &mut QueryCompilationContext, mut query: ShapedQuery, trees: &[(String, IncludeTree)]) -> QueryResult<ShapedQuery> {
    let shaper = query.shaper.clone();
    query.shaper = expand_shaper(ctx, &mut query.select, &shaper, trees)?;
    Ok(query)
}

fn expand_shaper(ctx: &mut QueryCompilationContext, select: &mut SelectBuilder, shaper: &Shaper, trees: &[(String, IncludeTree)]) -> QueryResult<Shaper> {
    match shaper {
        Shaper::Value(ValueBinding::Member(member)) => {
            let Some(entity) = entity_at(select, member) else { return Ok(shaper.clone()) };
            let model = ctx.model;
            let tree = trees.iter().find(|(t, _)| {
                model.is_assignable(t, &entity.entity_type) || model.is_assignable(&entity.entity_type, t)
            });
            match tree {
                Some((_, tree)) => expand_tree(ctx, select, member, shaper.clone(), tree),
                None => Ok(shaper.clone()),
            }
        }
        Shaper::Object(fields) => {
            let mut out = IndexMap::new();
            for (name, field) in fields {
                out.insert(name.clone(), expand_shaper(ctx, select, field, trees)?);
            }
            Ok(Shaper::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn expand_tree(
    ctx: &mut QueryCompilationContext,
    select: &mut SelectBuilder,
    member: &ProjectionMember,
    shaper: Shaper,
    tree: &IncludeTree,
) -> QueryResult<Shaper> {
    let mut shaper = shaper;
    for node in tree.expansion_order() {
        // already part of the owner's row
        if node.is_embedded() {
            continue;
        }
        // a join may have pushed the select down, so read the entity again
        let entity = entity_at(select, member)
            .ok_or_else(|| QueryError::invalid(format!("included entity at {member} is no longer projected")))?;
        let included = if node.is_collection() {
            include_collection(ctx, select, &entity, node)?
        } else {
            include_reference(ctx, select, member, &entity, node)?
        };
        debug!(navigation = %node.navigation.name, collection = node.is_collection(), "expanded include");
        shaper = Shaper::Include {
            entity: Box::new(shaper),
            navigation: node.navigation.name.clone(),
            included: Box::new(included),
        };
    }
    Ok(shaper)
}

fn include_reference(
    ctx: &mut QueryCompilationContext,
    select: &mut SelectBuilder,
    member: &ProjectionMember,
    entity: &StructuralProjection,
    node: &IncludeNode,
) -> QueryResult<Shaper> {
    let nav = &node.navigation;
    let target = match entity.bind_navigation(&nav.name) {
        Some(NestedProjection::Structural(expanded)) => (**expanded).clone(),
        Some(NestedProjection::Json(_)) => return QueryError::invalid(format!("'{}' is mapped to JSON", nav.name)).err(),
        None => {
            let (joined, target) = expand_reference(ctx, std::mem::take(select), entity, nav)?;
            *select = joined;
            persist_navigation(select, &NavOrigin::of(member.clone()), &nav.name, &target);
            target
        }
    };
    let target_member = member.append(&nav.name);
    select.mapping.insert(target_member.clone(), ProjectionValue::Structural(target));
    expand_tree(ctx, select, &target_member, Shaper::member(target_member.clone()), &node.children)
}

fn include_collection(
    ctx: &mut QueryCompilationContext,
    select: &mut SelectBuilder,
    entity: &StructuralProjection,
    node: &IncludeNode,
) -> QueryResult<Shaper> {
    let nav = &node.navigation;
    let source = navigation_query(ctx, entity, nav)?;
    let inner = match QueryableTranslator::new(ctx, Scope::new()).translate_from(source, &node.filter)? {
        TranslatedQuery::Sequence(q) => q,
        TranslatedQuery::Terminal(_) => {
            return QueryError::invalid(format!("filter of included '{}' ends with a single-value operator", nav.name)).err();
        }
    };
    let inner = if node.children.is_empty() {
        inner
    } else {
        expand_includes(ctx, inner, &[(nav.target.clone(), node.children.clone())])?
    };
    let outer_refs = correlate(select, &inner);
    Ok(Shaper::Subquery {
        query: Box::new(inner),
        kind: SubqueryKind::Collection { navigation: Some(nav.name.clone()) },
        outer_refs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        _tests::fixtures,
        shaper::IncludeTreeBuilder,
        sql::JoinKind,
        translation::RootBuilder
    };

    fn tree(model: &crate::metadata::Model, entity_type: &str, paths: &[&[&str]]) -> Vec<(String, IncludeTree)> {
        let mut builder = IncludeTreeBuilder::new();
        for path in paths {
            builder.include(&path.iter().map(|s| s.to_string()).collect::<Vec<_>>(), vec![]).unwrap();
        }
        vec![(entity_type.to_string(), builder.build(model, entity_type).unwrap())]
    }

    #[test]
    fn reference_include_joins_and_wraps_shaper() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let orders = RootBuilder::entity(&model, &mut ctx.aliases, "Order").unwrap();
        let trees = tree(&model, "Order", &[&["Customer"]]);

        let expanded = expand_includes(&mut ctx, orders, &trees).unwrap();
        assert_eq!(expanded.select.tables.len(), 2);
        assert_eq!(expanded.select.tables[1].join_kind(), Some(JoinKind::Inner));
        let Shaper::Include { navigation, included, .. } = &expanded.shaper else { panic!("expected include") };
        assert_eq!(navigation, "Customer");
        assert_eq!(**included, Shaper::member(ProjectionMember::root().append("Customer")));
    }

    #[test]
    fn collection_include_stays_pending_and_nests() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let customers = RootBuilder::entity(&model, &mut ctx.aliases, "Customer").unwrap();
        let trees = tree(&model, "Customer", &[&["Orders", "Lines"]]);

        let expanded = expand_includes(&mut ctx, customers, &trees).unwrap();
        assert_eq!(expanded.select.tables.len(), 1);
        assert!(!expanded.select.client_projections.is_empty());
        let Shaper::Include { included, .. } = &expanded.shaper else { panic!("expected include") };
        let Shaper::Subquery { query, kind, .. } = included.as_ref() else { panic!("expected subquery") };
        assert_eq!(*kind, SubqueryKind::Collection { navigation: Some("Orders".into()) });
        assert!(matches!(query.shaper, Shaper::Include { ref navigation, .. } if navigation == "Lines"));
    }

    #[test]
    fn json_owned_navigations_need_no_expansion() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let customers = RootBuilder::entity(&model, &mut ctx.aliases, "Customer").unwrap();
        let before = customers.clone();
        let trees = tree(&model, "Customer", &[&["Address"], &["Phones"]]);

        let expanded = expand_includes(&mut ctx, customers, &trees).unwrap();
        assert_eq!(expanded, before);
    }
}
