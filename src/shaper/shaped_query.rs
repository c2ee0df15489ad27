use indexmap::IndexMap;

use crate::{
    error::{QueryError, QueryResult},
    select::SelectBuilder,
    shaper::{IdentifierBinding, ValueBinding},
    sql::{ProjectionMember, SqlExprRef, SqlValue}
};

type BindingMap<'a> = dyn FnMut(&ValueBinding) -> QueryResult<ValueBinding> + 'a;

fn map_ids(ids: &[IdentifierBinding], f: &mut BindingMap<'_>) -> QueryResult<Vec<IdentifierBinding>> {
    ids.iter()
        .map(|i| Ok(IdentifierBinding::new(f(&i.binding)?, i.comparer)))
        .collect()
}

/// How many rows a query produces for its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResultCardinality {
    #[default]
    Enumerable,
    /// Exactly one row; none is an error at execution time
    Single,
    /// At most one row; none yields the default value
    SingleOrDefault,
}

/// A value of the outer select a pending subquery is correlated on.
///
/// The value is held as a client projection of the outer select so that any
/// later pushdown keeps it readable; `expr` is the expression the subquery
/// was built against.
#[derive(Debug, Clone, PartialEq)]
pub struct OuterRef {
    pub expr: SqlExprRef,
    pub client: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubqueryKind {
    /// Nested collection, optionally the value of a navigation
    Collection { navigation: Option<String> },
    /// At most one row, e.g. `FirstOrDefault` over a navigation
    Single,
}

/// Describes how a result row becomes a client value.
#[derive(Debug, Clone, PartialEq)]
pub enum Shaper {
    Value(ValueBinding),
    /// Anonymous object with named members
    Object(IndexMap<String, Shaper>),
    Constant(SqlValue),
    /// `entity` with a navigation populated from `included`
    Include { entity: Box<Shaper>, navigation: String, included: Box<Shaper> },
    /// Nested query not yet combined with the outer select
    Subquery { query: Box<ShapedQuery>, kind: SubqueryKind, outer_refs: Vec<OuterRef> },
    /// Nested collection read from the same rows (single-query mode).
    /// Consecutive rows with equal `parent_identifier` belong to one parent;
    /// `self_identifier` tells elements apart.
    CollectionResult {
        parent_identifier: Vec<IdentifierBinding>,
        self_identifier: Vec<IdentifierBinding>,
        element: Box<Shaper>,
        navigation: Option<String>,
    },
    /// Nested collection read from `related_queries[query]`, matched to its
    /// parent by comparing `parent_identifier` with `child_identifier`.
    SplitCollection {
        query: usize,
        parent_identifier: Vec<IdentifierBinding>,
        child_identifier: Vec<IdentifierBinding>,
        self_identifier: Vec<IdentifierBinding>,
        element: Box<Shaper>,
        navigation: Option<String>,
    },
    /// Single-row subquery joined by OUTER APPLY; a null `sentinel` means no row.
    SingleResult { sentinel: ValueBinding, element: Box<Shaper> },
    /// `IGrouping` rows ordered by key; `key_identifier` detects group boundaries.
    Grouping { key: Box<Shaper>, element: Box<Shaper>, key_identifier: Vec<IdentifierBinding> },
}

impl Shaper {
    pub fn member(member: ProjectionMember) -> Self {
        Shaper::Value(ValueBinding::Member(member))
    }

    /// Rewrite every binding of this shaper (not of pending subqueries, which
    /// bind to their own select).
    pub fn map_bindings(&self, f: &mut BindingMap<'_>) -> QueryResult<Shaper> {
        Ok(match self {
            Shaper::Value(b) => Shaper::Value(f(b)?),
            Shaper::Object(members) => {
                let mut out = IndexMap::new();
                for (name, shaper) in members {
                    out.insert(name.clone(), shaper.map_bindings(f)?);
                }
                Shaper::Object(out)
            }
            Shaper::Constant(v) => Shaper::Constant(v.clone()),
            Shaper::Include { entity, navigation, included } => Shaper::Include {
                entity: Box::new(entity.map_bindings(f)?),
                navigation: navigation.clone(),
                included: Box::new(included.map_bindings(f)?),
            },
            Shaper::Subquery { query, kind, outer_refs } => {
                let mut refs = Vec::new();
                for r in outer_refs {
                    match f(&ValueBinding::Client(r.client))? {
                        ValueBinding::Client(client) => refs.push(OuterRef { expr: r.expr.clone(), client }),
                        other => {
                            return QueryError::invalid(format!("correlated value rebound to {other:?}")).err();
                        }
                    }
                }
                Shaper::Subquery { query: query.clone(), kind: kind.clone(), outer_refs: refs }
            }
            Shaper::CollectionResult { parent_identifier, self_identifier, element, navigation } => Shaper::CollectionResult {
                parent_identifier: map_ids(parent_identifier, f)?,
                self_identifier: map_ids(self_identifier, f)?,
                element: Box::new(element.map_bindings(f)?),
                navigation: navigation.clone(),
            },
            Shaper::SplitCollection { query, parent_identifier, child_identifier, self_identifier, element, navigation } => {
                // child-side bindings live in the related query
                Shaper::SplitCollection {
                    query: *query,
                    parent_identifier: map_ids(parent_identifier, f)?,
                    child_identifier: child_identifier.clone(),
                    self_identifier: self_identifier.clone(),
                    element: element.clone(),
                    navigation: navigation.clone(),
                }
            }
            Shaper::SingleResult { sentinel, element } => Shaper::SingleResult {
                sentinel: f(sentinel)?,
                element: Box::new(element.map_bindings(f)?),
            },
            Shaper::Grouping { key, element, key_identifier } => Shaper::Grouping {
                key: Box::new(key.map_bindings(f)?),
                element: Box::new(element.map_bindings(f)?),
                key_identifier: map_ids(key_identifier, f)?,
            },
        })
    }

    /// Same shaper reading its members under `prefix` (transparent pairing of a join).
    pub fn prefix_members(&self, prefix: &str) -> Shaper {
        self.rebind(&mut |b| match b {
            ValueBinding::Member(m) => ValueBinding::Member(m.prepend(prefix)),
            other => other.clone(),
        })
    }

    /// Same shaper with client slots shifted by `offset`.
    pub fn offset_clients(&self, offset: usize) -> Shaper {
        if offset == 0 {
            return self.clone();
        }
        self.rebind(&mut |b| match b {
            ValueBinding::Client(i) => ValueBinding::Client(i + offset),
            other => other.clone(),
        })
    }

    fn rebind(&self, f: &mut dyn FnMut(&ValueBinding) -> ValueBinding) -> Shaper {
        match self.map_bindings(&mut |b| Ok(f(b))) {
            Ok(shaper) => shaper,
            Err(_) => self.clone(),
        }
    }

    /// Whether a nested query still has to be combined with the outer select.
    pub fn has_pending(&self) -> bool {
        match self {
            Shaper::Subquery { .. } => true,
            Shaper::Value(_) | Shaper::Constant(_) | Shaper::SplitCollection { .. } => false,
            Shaper::Object(members) => members.values().any(Shaper::has_pending),
            Shaper::Include { entity, included, .. } => entity.has_pending() || included.has_pending(),
            Shaper::CollectionResult { element, .. } | Shaper::SingleResult { element, .. } => element.has_pending(),
            Shaper::Grouping { key, element, .. } => key.has_pending() || element.has_pending(),
        }
    }
}

/// A select paired with the shaper reading its rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapedQuery {
    pub select: SelectBuilder,
    pub shaper: Shaper,
    pub cardinality: ResultCardinality,
}

impl ShapedQuery {
    pub fn new(select: SelectBuilder, shaper: Shaper) -> Self {
        Self { select, shaper, cardinality: ResultCardinality::Enumerable }
    }

    pub fn with_cardinality(mut self, cardinality: ResultCardinality) -> Self {
        self.cardinality = cardinality;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_prefixes_every_member() {
        let shaper = Shaper::Object(IndexMap::from([
            ("Name".to_string(), Shaper::member(ProjectionMember::of("Name"))),
            ("Count".to_string(), Shaper::Value(ValueBinding::Client(0))),
        ]));
        let paired = shaper.prefix_members("Outer");
        let Shaper::Object(members) = &paired else { panic!("expected object") };
        assert_eq!(members["Name"], Shaper::member(ProjectionMember::of("Name").prepend("Outer")));
        assert_eq!(members["Count"], Shaper::Value(ValueBinding::Client(0)));
    }

    #[test]
    fn offset_moves_client_slots_and_outer_refs() {
        let pending = Shaper::Subquery {
            query: Box::new(ShapedQuery::new(SelectBuilder::default(), Shaper::Constant(SqlValue::Int(1)))),
            kind: SubqueryKind::Single,
            outer_refs: vec![OuterRef { expr: crate::sql::SqlExpr::int(1), client: 2 }],
        };
        let shaper = Shaper::Object(IndexMap::from([
            ("A".to_string(), Shaper::Value(ValueBinding::Client(1))),
            ("B".to_string(), pending),
        ]));
        assert!(shaper.has_pending());
        let moved = shaper.offset_clients(3);
        let Shaper::Object(members) = &moved else { panic!("expected object") };
        assert_eq!(members["A"], Shaper::Value(ValueBinding::Client(4)));
        let Shaper::Subquery { outer_refs, .. } = &members["B"] else { panic!("expected subquery") };
        assert_eq!(outer_refs[0].client, 5);
    }
}
