use indexmap::IndexMap;

use crate::{
    error::{QueryError, QueryResult},
    select::{ProjectionValue, SelectBuilder, alias_hint_of, unique_alias},
    shaper::{JsonBinding, StructuralBinding, ValueBinding},
    sql::{ProjectionExpr, ProjectionMember, SelectExpression, SqlExpr, SqlExprRef},
    structural::{JsonQuery, NestedProjection, StructuralProjection}
};

/// Where each member path and client slot of a finalized select ended up.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProjectionIndex {
    pub members: IndexMap<ProjectionMember, ValueBinding>,
    pub clients: Vec<ValueBinding>,
}

impl ProjectionIndex {
    /// Positional binding for `binding`; positional bindings pass through.
    pub fn resolve(&self, binding: &ValueBinding) -> QueryResult<ValueBinding> {
        match binding {
            ValueBinding::Member(m) => self.members.get(m).cloned()
                .ok_or_else(|| QueryError::invalid(format!("member {m} is not projected"))),
            ValueBinding::Client(i) => self.clients.get(*i).cloned()
                .ok_or_else(|| QueryError::invalid(format!("client projection {i} does not exist"))),
            other => Ok(other.clone()),
        }
    }
}

/// Appends columns to a positional projection, reusing equal ones.
struct Flattener {
    projection: Vec<ProjectionExpr>,
}

impl Flattener {
    fn place(&mut self, expr: &SqlExprRef, hint: &str) -> usize {
        if let Some(existing) = self.projection.iter().position(|p| &p.expr == expr) {
            return existing;
        }
        let alias = unique_alias(&self.projection, hint);
        self.projection.push(ProjectionExpr::new(expr.clone(), alias));
        self.projection.len() - 1
    }

    fn scalar(&mut self, expr: &SqlExprRef, hint: &str) -> ValueBinding {
        let index = self.place(expr, hint);
        ValueBinding::Index { index, nullable: expr.is_nullable() }
    }

    fn structural(&mut self, s: &StructuralProjection) -> StructuralBinding {
        let properties = s.properties.iter()
            .map(|(name, expr)| (name.clone(), self.place(expr, &alias_hint_of(expr))))
            .collect();
        let nested = s.complex.iter()
            .chain(s.navigations.iter())
            .map(|(name, value)| {
                let binding = match value {
                    NestedProjection::Structural(inner) => ValueBinding::Structural(self.structural(inner)),
                    NestedProjection::Json(j) => ValueBinding::Json(self.json(j)),
                };
                (name.clone(), binding)
            })
            .collect();
        let discriminator = s.discriminator.as_ref().map(|d| self.place(d, "Discriminator"));
        StructuralBinding {
            entity_type: s.entity_type.clone(),
            kind: s.kind,
            properties,
            nested,
            discriminator,
            nullable: s.nullable,
        }
    }

    fn json(&mut self, j: &JsonQuery) -> JsonBinding {
        JsonBinding {
            column: self.place(&j.json_column, &alias_hint_of(&j.json_column)),
            entity_type: j.entity_type.clone(),
            path: j.path.clone(),
            is_collection: j.is_collection,
            nullable: j.nullable,
            keys: j.key_property_map.iter()
                .map(|(name, expr)| (name.clone(), self.place(expr, &alias_hint_of(expr))))
                .collect(),
        }
    }

    fn value(&mut self, value: &ProjectionValue, hint: &str) -> ValueBinding {
        match value {
            ProjectionValue::Scalar(e) => self.scalar(e, hint),
            ProjectionValue::Structural(s) => ValueBinding::Structural(self.structural(s)),
            ProjectionValue::Json(j) => ValueBinding::Json(self.json(j)),
        }
    }
}

impl SelectBuilder {
    /// Freeze the builder: flatten member paths and client projections into
    /// positional columns. Equal expressions share one column.
    pub fn finalize(self) -> QueryResult<(SelectExpression, ProjectionIndex)> {
        let mut flattener = Flattener { projection: Vec::new() };
        let mut index = ProjectionIndex::default();
        for (member, value) in &self.mapping {
            index.members.insert(member.clone(), flattener.value(value, member.alias_hint()));
        }
        for value in &self.client_projections {
            index.clients.push(flattener.value(value, "c"));
        }
        let mut projection = flattener.projection;
        if projection.is_empty() {
            projection.push(ProjectionExpr::new(SqlExpr::int(1), "empty"));
        }

        let select = SelectExpression {
            tables: self.tables,
            predicate: self.predicate,
            group_by: self.group_by,
            having: self.having,
            orderings: self.orderings,
            limit: self.limit,
            offset: self.offset,
            distinct: self.distinct,
            projection,
        };
        Ok((select, index))
    }

    /// Freeze a select projecting exactly one scalar, for use as a subquery.
    pub fn finalize_scalar(self) -> QueryResult<SelectExpression> {
        if !self.client_projections.is_empty() || self.mapping.len() != 1 {
            return QueryError::not_translated("subquery does not project a single value").err();
        }
        if !matches!(self.mapping.values().next(), Some(ProjectionValue::Scalar(_))) {
            return QueryError::not_translated("subquery projects a structured value where a scalar is required").err();
        }
        Ok(self.finalize()?.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        _tests::fixtures,
        metadata::TypeMapping,
        sql::{AliasAllocator, TableExpr},
        structural::StructuralKind
    };

    #[test]
    fn members_and_clients_get_positions() {
        let mut a = AliasAllocator::new();
        let (mut select, t) = SelectBuilder::from_table(&mut a, TableExpr::table("Orders", None));
        let id = SqlExpr::column("Id", t, TypeMapping::int(), false);
        let note = SqlExpr::column("Note", t, TypeMapping::string(), true);
        select.mapping.insert(ProjectionMember::of("Id"), ProjectionValue::Scalar(id.clone()));
        select.mapping.insert(ProjectionMember::of("Note"), ProjectionValue::Scalar(note));
        let client = select.push_client_projection(ProjectionValue::Scalar(id));

        let (expr, index) = select.finalize().unwrap();
        assert_eq!(expr.column_names(), vec!["Id", "Note"]);
        assert_eq!(index.members[&ProjectionMember::of("Note")], ValueBinding::Index { index: 1, nullable: true });
        assert_eq!(index.resolve(&ValueBinding::Client(client)).unwrap().as_index(), Some(0));
        assert!(index.resolve(&ValueBinding::Member(ProjectionMember::of("Total"))).is_err());
    }

    #[test]
    fn structural_values_flatten_with_nested_bindings() {
        let model = fixtures::model();
        let mut a = AliasAllocator::new();
        let (mut select, t) = SelectBuilder::from_table(&mut a, TableExpr::table("Customers", None));
        let mut contact = StructuralProjection::new("ContactInfo", StructuralKind::Complex);
        contact.properties.insert("Email".into(), SqlExpr::column("Contact_Email", t, TypeMapping::string(), true));
        let mut customer = StructuralProjection::new("Customer", StructuralKind::Entity);
        for p in model.properties("Customer").unwrap() {
            customer.properties.insert(p.name.clone(), SqlExpr::column(p.column_name(), t, p.type_mapping(), p.nullable));
        }
        customer.complex.insert("Contact".into(), NestedProjection::Structural(Box::new(contact)));
        select.mapping.insert(ProjectionMember::root(), ProjectionValue::Structural(customer));

        let (expr, index) = select.finalize().unwrap();
        assert_eq!(expr.projection.len(), 5);
        let ValueBinding::Structural(binding) = &index.members[&ProjectionMember::root()] else { panic!("expected structural") };
        assert_eq!(binding.properties["Name"], 1);
        let ValueBinding::Structural(nested) = &binding.nested["Contact"] else { panic!("expected nested") };
        assert_eq!(nested.properties["Email"], 4);
    }

    #[test]
    fn empty_projection_selects_a_constant() {
        let mut a = AliasAllocator::new();
        let (select, _) = SelectBuilder::from_table(&mut a, TableExpr::table("Orders", None));
        let (expr, _) = select.finalize().unwrap();
        assert_eq!(expr.column_names(), vec!["empty"]);
    }
}
