use indexmap::IndexMap;
use std::collections::HashMap;
use tracing::debug;

use crate::{
    error::{QueryError, QueryResult},
    select::{Identifier, ProjectionValue, SelectBuilder},
    sql::{AliasAllocator, ExprCollector, ExprRewriter, OrderBy, ProjectionMember, SqlExpr, SqlExprRef, TableId}
};

/// A grouped select and the correlated select enumerating one group's elements.
#[derive(Debug, Clone)]
pub struct GroupingResult {
    /// Projects the key terms under `Key`
    pub select: SelectBuilder,
    /// Key terms as readable from `select`
    pub keys: IndexMap<ProjectionMember, SqlExprRef>,
    /// Ungrouped rows whose keys equal the outer group's keys (null-safe)
    pub elements: SelectBuilder,
}

fn retarget_all(expr: &SqlExprRef, ids: &HashMap<TableId, TableId>) -> SqlExprRef {
    ExprRewriter::rewrite(expr, &mut |e: &SqlExprRef| match e.as_ref() {
        SqlExpr::Column(c) => ids.get(&c.table)
            .map(|to| SqlExpr::column(&c.name, *to, c.type_mapping.clone(), c.nullable)),
        _ => None,
    })
}

impl SelectBuilder {
    /// `GROUP BY` the given key terms.
    ///
    /// Key terms that are not bare columns are first projected by a subquery
    /// and grouped on through the column reading them.
    pub fn apply_grouping(self, aliases: &mut AliasAllocator, keys: IndexMap<ProjectionMember, SqlExprRef>) -> QueryResult<GroupingResult> {
        if keys.is_empty() {
            return QueryError::invalid("grouping requires at least one key term").err();
        }
        if let Some(bad) = keys.values().find(|k| ExprCollector::contains_aggregate(k) || matches!(k.as_ref(), SqlExpr::Fragment(_))) {
            return QueryError::invalid(format!("'{bad}' cannot be used as a grouping key")).err();
        }
        if !self.client_projections.is_empty() {
            return QueryError::not_translated("grouping over values computed on the client").err();
        }

        let members: Vec<ProjectionMember> = keys.keys().cloned().collect();
        let terms: Vec<SqlExprRef> = keys.into_values().collect();

        let (select, terms) = if self.distinct || self.is_limited() || self.is_grouped() {
            self.pushdown_with_extras(aliases, terms)?
        } else {
            (self, terms)
        };
        let (mut select, terms) = if terms.iter().any(|t| !t.is_column()) {
            debug!(keys = terms.len(), "lifting grouping keys into a subquery");
            select.pushdown_lifting(aliases, terms)?
        } else {
            (select, terms)
        };

        let ungrouped = select.clone();
        select.pre_group_by_identifier = Some(std::mem::take(&mut select.identifier));
        select.group_element_mapping = Some(std::mem::take(&mut select.mapping));
        select.group_by = terms.clone();
        select.orderings.clear();
        select.child_identifiers.clear();
        select.identifier = terms.iter().map(|t| Identifier::of(t.clone())).collect();
        select.mapping = members.iter()
            .zip(terms.iter())
            .map(|(m, t)| (m.prepend("Key"), ProjectionValue::Scalar(t.clone())))
            .collect();

        let (elements, ids) = ungrouped.fresh_copy(aliases);
        let correlation = terms.iter()
            .map(|t| SqlExpr::null_safe_equal(t.clone(), retarget_all(t, &ids)))
            .reduce(SqlExpr::and)
            .ok_or_else(|| QueryError::invalid("grouping lost its key terms"))?;
        let elements = elements.apply_predicate(aliases, correlation)?;

        let keys = members.into_iter().zip(terms).collect();
        Ok(GroupingResult { select, keys, elements })
    }

    /// Undo the grouping of a select so that its element rows can be read
    /// whole, ordered by the key terms (a `GroupBy` that ends the query).
    /// Returns the key terms.
    pub fn ungroup_for_enumeration(mut self) -> QueryResult<(Self, Vec<SqlExprRef>)> {
        if !self.is_grouped() {
            return QueryError::invalid("select is not grouped").err();
        }
        if self.having.is_some() {
            return QueryError::not_translated("a filtered grouping cannot be enumerated").err();
        }
        let elements = self.group_element_mapping.take()
            .ok_or_else(|| QueryError::invalid("grouped select lost its element mapping"))?;
        let keys = std::mem::take(&mut self.group_by);
        self.mapping = elements;
        self.identifier = self.pre_group_by_identifier.take().unwrap_or_default();

        let mut orderings: Vec<OrderBy> = keys.iter().map(|k| OrderBy::asc(k.clone())).collect();
        for o in std::mem::take(&mut self.orderings) {
            if !orderings.iter().any(|existing| existing.expr == o.expr) {
                orderings.push(o);
            }
        }
        self.orderings = orderings;
        Ok((self, keys))
    }
}
