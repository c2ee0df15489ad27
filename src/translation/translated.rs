use indexmap::IndexMap;

use crate::{
    error::{QueryError, QueryResult},
    select::ProjectionValue,
    shaper::{ShapedQuery, Shaper, SubqueryKind, ValueBinding},
    sql::{ProjectionMember, SqlExpr, SqlExprRef},
    structural::{JsonQuery, NestedProjection, StructuralProjection}
};

/// Where a structural value sits in the select's member mapping, so that a
/// navigation expanded through it can be recorded there.
#[derive(Debug, Clone, PartialEq)]
pub struct NavOrigin {
    pub member: ProjectionMember,
    /// Navigations and complex properties walked from the member's value
    pub path: Vec<String>,
}

impl NavOrigin {
    pub fn of(member: ProjectionMember) -> Self {
        Self { member, path: Vec::new() }
    }

    pub fn child(&self, name: &str) -> Self {
        let mut path = self.path.clone();
        path.push(name.to_string());
        Self { member: self.member.clone(), path }
    }
}

/// Result of translating one client expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Translated {
    Sql(SqlExprRef),
    Structural { projection: StructuralProjection, origin: Option<NavOrigin> },
    Json(JsonQuery),
    Object(IndexMap<String, Translated>),
    /// Nested query not yet combined with the enclosing select
    Query { query: Box<ShapedQuery>, kind: SubqueryKind },
    /// A group produced by `GroupBy`. `element` binds to the grouped select's
    /// element mapping; `elements` enumerates one group's rows when present.
    Grouping { key: Box<Translated>, element: Shaper, elements: Option<Box<ShapedQuery>> },
    /// Value already shaped by an earlier operator (nested results)
    Shaped(Shaper),
}

impl Translated {
    pub fn structural(projection: StructuralProjection) -> Self {
        Translated::Structural { projection, origin: None }
    }

    pub(crate) fn nested(nested: &NestedProjection, origin: Option<NavOrigin>) -> Self {
        match nested {
            NestedProjection::Structural(s) => Translated::Structural { projection: (**s).clone(), origin },
            NestedProjection::Json(j) => Translated::Json(j.clone()),
        }
    }

    pub fn as_sql(&self) -> Option<&SqlExprRef> {
        match self {
            Translated::Sql(e) => Some(e),
            _ => None,
        }
    }

    /// The scalar this value translates to, or a translation failure.
    pub fn into_sql(self) -> QueryResult<SqlExprRef> {
        match self {
            Translated::Sql(e) => Ok(e),
            other => QueryError::not_translated(format!("{} used where a scalar value is required", other.describe())).err(),
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Translated::Sql(_) => "scalar",
            Translated::Structural { .. } => "entity",
            Translated::Json(_) => "JSON document",
            Translated::Object(_) => "anonymous object",
            Translated::Query { .. } => "subquery",
            Translated::Grouping { .. } => "grouping",
            Translated::Shaped(_) => "nested result",
        }
    }

    /// Same value without mapping origins, for use from a nested query.
    pub fn detached(&self) -> Translated {
        match self {
            Translated::Structural { projection, .. } => Translated::structural(projection.clone()),
            Translated::Object(fields) => Translated::Object(fields.iter().map(|(k, v)| (k.clone(), v.detached())).collect()),
            Translated::Grouping { key, element, elements } => Translated::Grouping {
                key: Box::new(key.detached()),
                element: element.clone(),
                elements: elements.clone(),
            },
            other => other.clone(),
        }
    }
}

/// Lambda parameters and range variables visible to an expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scope {
    vars: Vec<(String, Translated)>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, name: &str, value: Translated) {
        self.vars.push((name.to_string(), value));
    }

    pub fn unbind(&mut self) {
        self.vars.pop();
    }

    /// Innermost binding of `name`.
    pub fn lookup(&self, name: &str) -> Option<&Translated> {
        self.vars.iter().rev().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn detached(&self) -> Scope {
        Scope { vars: self.vars.iter().map(|(n, v)| (n.clone(), v.detached())).collect() }
    }
}

fn from_projection(value: &ProjectionValue, origin: Option<NavOrigin>) -> Translated {
    match value {
        ProjectionValue::Scalar(e) => Translated::Sql(e.clone()),
        ProjectionValue::Structural(s) => Translated::Structural { projection: s.clone(), origin },
        ProjectionValue::Json(j) => Translated::Json(j.clone()),
    }
}

/// Value a lambda parameter takes when it ranges over rows shaped by `shaper`.
///
/// Plain bindings read the member mapping and client projections directly;
/// nested results stay shaped.
pub fn materialize(
    mapping: &IndexMap<ProjectionMember, ProjectionValue>,
    clients: &[ProjectionValue],
    shaper: &Shaper,
    group_elements: Option<&ShapedQuery>,
) -> QueryResult<Translated> {
    Ok(match shaper {
        Shaper::Value(ValueBinding::Member(m)) => {
            let value = mapping.get(m)
                .ok_or_else(|| QueryError::invalid(format!("member {m} is not projected")))?;
            from_projection(value, Some(NavOrigin::of(m.clone())))
        }
        Shaper::Value(ValueBinding::Client(i)) => {
            let value = clients.get(*i)
                .ok_or_else(|| QueryError::invalid(format!("client projection {i} does not exist")))?;
            from_projection(value, None)
        }
        Shaper::Value(other) => {
            return QueryError::invalid(format!("positional binding {other:?} reached translation")).err();
        }
        Shaper::Object(fields) => {
            let mut out = IndexMap::new();
            for (name, field) in fields {
                out.insert(name.clone(), materialize(mapping, clients, field, group_elements)?);
            }
            Translated::Object(out)
        }
        Shaper::Constant(v) => Translated::Sql(SqlExpr::constant(v.clone(), None)),
        Shaper::Include { entity, .. } => materialize(mapping, clients, entity, group_elements)?,
        Shaper::Grouping { key, element, .. } => Translated::Grouping {
            key: Box::new(materialize(mapping, clients, key, group_elements)?),
            element: (**element).clone(),
            elements: group_elements.map(|q| Box::new(q.clone())),
        },
        pending => Translated::Shaped(pending.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metadata::TypeMapping, sql::AliasAllocator};

    #[test]
    fn members_materialize_with_their_origin() {
        let mut a = AliasAllocator::new();
        let t = a.generate_table_alias("Customers").id;
        let name = SqlExpr::column("Name", t, TypeMapping::string(), false);
        let mut mapping = IndexMap::new();
        mapping.insert(ProjectionMember::of("Name"), ProjectionValue::Scalar(name.clone()));

        let shaper = Shaper::Object(IndexMap::from([
            ("N".to_string(), Shaper::member(ProjectionMember::of("Name"))),
        ]));
        let Translated::Object(fields) = materialize(&mapping, &[], &shaper, None).unwrap() else { panic!("expected object") };
        assert_eq!(fields["N"], Translated::Sql(name));

        let missing = materialize(&mapping, &[], &Shaper::member(ProjectionMember::of("Nope")), None).unwrap_err();
        assert!(!missing.is_translation_failure());
    }

    #[test]
    fn scope_lookup_prefers_innermost() {
        let mut scope = Scope::new();
        scope.bind("x", Translated::Sql(SqlExpr::int(1)));
        scope.bind("x", Translated::Sql(SqlExpr::int(2)));
        assert_eq!(scope.lookup("x"), Some(&Translated::Sql(SqlExpr::int(2))));
        scope.unbind();
        assert_eq!(scope.lookup("x"), Some(&Translated::Sql(SqlExpr::int(1))));
        assert!(scope.lookup("y").is_none());
    }
}
