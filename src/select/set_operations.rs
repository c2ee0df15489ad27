use indexmap::IndexMap;
use std::rc::Rc;
use tracing::debug;

use crate::{
    error::{QueryError, QueryResult},
    metadata::{Model, TypeMapping},
    select::{Identifier, ProjectionValue, SelectBuilder, unique_alias},
    sql::{
        AliasAllocator, ProjectionExpr, SelectExpression, SetOperationKind, SqlExpr, SqlExprRef, TableExpr,
        TableId, TableSource
    },
    structural::{JsonQuery, StructuralKind, StructuralProjection}
};

/// Column pairs of the two operands, aligned by position.
struct OperandColumns {
    table: TableId,
    left: Vec<ProjectionExpr>,
    right: Vec<ProjectionExpr>,
    /// Operand expressions as they were before type inference, for identifier matching
    sources: Vec<(SqlExprRef, SqlExprRef)>,
    outers: Vec<SqlExprRef>,
}

fn same_expr(a: &SqlExprRef, b: &SqlExprRef) -> bool {
    Rc::ptr_eq(a, b) || (a.is_column() && a == b)
}

impl OperandColumns {
    fn new(table: TableId) -> Self {
        Self { table, left: Vec::new(), right: Vec::new(), sources: Vec::new(), outers: Vec::new() }
    }

    /// Project `left` and `right` under one alias; returns the outer column.
    fn push(&mut self, left: &SqlExprRef, right: &SqlExprRef, hint: &str) -> SqlExprRef {
        let typed_left = SqlExpr::with_inferred_mapping(left, right.type_mapping());
        let typed_right = SqlExpr::with_inferred_mapping(right, typed_left.type_mapping());
        let alias = unique_alias(&self.left, hint);
        let type_mapping = typed_left.type_mapping()
            .or(typed_right.type_mapping())
            .cloned()
            .unwrap_or_else(TypeMapping::string);
        let outer = SqlExpr::column(&alias, self.table, type_mapping, typed_left.is_nullable() || typed_right.is_nullable());
        self.left.push(ProjectionExpr::new(typed_left, alias.clone()));
        self.right.push(ProjectionExpr::new(typed_right, alias));
        self.sources.push((left.clone(), right.clone()));
        self.outers.push(outer.clone());
        outer
    }

    fn outer_of_left(&self, expr: &SqlExprRef) -> Option<SqlExprRef> {
        self.sources.iter().position(|(l, _)| same_expr(l, expr)).map(|i| self.outers[i].clone())
    }
}

/// Most derived type both `a` and `b` inherit from.
fn common_base_type(model: &Model, a: &str, b: &str) -> QueryResult<String> {
    let left = model.lineage(a)?;
    let right = model.lineage(b)?;
    left.iter()
        .zip(right.iter())
        .take_while(|(l, r)| l.name == r.name)
        .last()
        .map(|(l, _)| l.name.clone())
        .ok_or_else(|| QueryError::invalid(format!("'{a}' and '{b}' share no base type")))
}

fn member_hint(flattened_name: &str) -> &str {
    match flattened_name {
        "$discriminator" => "Discriminator",
        name => name.rsplit('.').next().unwrap_or(name),
    }
}

impl SelectBuilder {
    pub fn apply_union(self, aliases: &mut AliasAllocator, model: &Model, other: SelectBuilder) -> QueryResult<Self> {
        self.apply_set_operation(aliases, model, SetOperationKind::Union, true, other)
    }

    /// `UNION ALL`
    pub fn apply_concat(self, aliases: &mut AliasAllocator, model: &Model, other: SelectBuilder) -> QueryResult<Self> {
        self.apply_set_operation(aliases, model, SetOperationKind::Union, false, other)
    }

    pub fn apply_intersect(self, aliases: &mut AliasAllocator, model: &Model, other: SelectBuilder) -> QueryResult<Self> {
        self.apply_set_operation(aliases, model, SetOperationKind::Intersect, true, other)
    }

    pub fn apply_except(self, aliases: &mut AliasAllocator, model: &Model, other: SelectBuilder) -> QueryResult<Self> {
        self.apply_set_operation(aliases, model, SetOperationKind::Except, true, other)
    }

    /// Combine two selects projecting the same members.
    ///
    /// Both operands project their members in the same column order. Entity
    /// projections of different types in one hierarchy are widened to their
    /// common base type; columns only one side has are filled with typed NULLs.
    pub fn apply_set_operation(
        self,
        aliases: &mut AliasAllocator,
        model: &Model,
        kind: SetOperationKind,
        distinct: bool,
        other: SelectBuilder,
    ) -> QueryResult<Self> {
        if !self.client_projections.is_empty() || !other.client_projections.is_empty() {
            return QueryError::not_translated(format!("{kind} over values computed on the client")).err();
        }
        if self.mapping.len() != other.mapping.len() || self.mapping.keys().any(|m| !other.mapping.contains_key(m)) {
            return QueryError::invalid(format!("operands of {kind} project different members")).err();
        }

        let alias = aliases.generate_table_alias(kind.alias_hint());
        let mut columns = OperandColumns::new(alias.id);
        let mut mapping = IndexMap::new();
        for (member, left) in &self.mapping {
            let right = other.mapping.get(member)
                .ok_or_else(|| QueryError::invalid(format!("member '{member}' is missing on one operand")))?;
            let value = match (left, right) {
                (ProjectionValue::Scalar(l), ProjectionValue::Scalar(r)) => {
                    ProjectionValue::Scalar(columns.push(l, r, member.alias_hint()))
                }
                (ProjectionValue::Structural(l), ProjectionValue::Structural(r)) => {
                    ProjectionValue::Structural(Self::combine_structural(model, &mut columns, l, r)?)
                }
                (ProjectionValue::Json(l), ProjectionValue::Json(r)) if l.entity_type == r.entity_type => {
                    ProjectionValue::Json(Self::combine_json(&mut columns, l, r, member.alias_hint()))
                }
                _ => {
                    return QueryError::invalid(format!("operands of {kind} project '{member}' with different shapes")).err();
                }
            };
            mapping.insert(member.clone(), value);
        }
        if columns.left.is_empty() {
            columns.push(&SqlExpr::int(1), &SqlExpr::int(1), "empty");
        }

        let identifier = if distinct {
            Self::matched_identifier(&self.identifier, &other.identifier, &columns)
                .unwrap_or_else(|| columns.outers.iter().map(|o| Identifier::of(o.clone())).collect())
        } else {
            Vec::new()
        };

        let OperandColumns { left, right, .. } = columns;
        let table = TableExpr::SetOperation {
            kind,
            distinct,
            left: Box::new(self.into_operand(left)),
            right: Box::new(other.into_operand(right)),
        };
        debug!(alias = %alias.name, operation = %kind, distinct, "combined selects");
        Ok(SelectBuilder {
            tables: vec![TableSource::new(alias.id, alias.name, table)],
            mapping,
            identifier,
            ..SelectBuilder::default()
        })
    }

    fn combine_structural(
        model: &Model,
        columns: &mut OperandColumns,
        left: &StructuralProjection,
        right: &StructuralProjection,
    ) -> QueryResult<StructuralProjection> {
        let entity_type = match (left.kind, right.kind) {
            (StructuralKind::Entity, StructuralKind::Entity) => common_base_type(model, &left.entity_type, &right.entity_type)?,
            (StructuralKind::Complex, StructuralKind::Complex) if left.entity_type == right.entity_type => left.entity_type.clone(),
            _ => {
                return QueryError::invalid(format!(
                    "'{}' and '{}' cannot be combined", left.entity_type, right.entity_type
                )).err();
            }
        };

        let mut merged = left.clone();
        merged.entity_type = entity_type;
        for (name, expr) in &right.properties {
            if !merged.properties.contains_key(name) {
                merged.properties.insert(name.clone(), SqlExpr::null(expr.type_mapping().cloned()));
            }
        }

        let right_items: IndexMap<String, SqlExprRef> = right.flatten().into_iter().collect();
        for (name, l) in merged.flatten() {
            let r = right_items.get(&name).cloned().unwrap_or_else(|| SqlExpr::null(l.type_mapping().cloned()));
            columns.push(&l, &r, member_hint(&name));
        }

        let mut combined = merged.remap(&mut |e: &SqlExprRef| columns.outer_of_left(e));
        combined.table_map.clear();
        combined.nullable = left.nullable || right.nullable;
        Ok(combined)
    }

    fn combine_json(columns: &mut OperandColumns, left: &JsonQuery, right: &JsonQuery, hint: &str) -> JsonQuery {
        let json_column = columns.push(&left.json_column, &right.json_column, hint);
        let mut key_property_map = IndexMap::new();
        for (name, l) in &left.key_property_map {
            if let Some(r) = right.key_property_map.get(name) {
                key_property_map.insert(name.clone(), columns.push(l, r, name));
            }
        }
        JsonQuery {
            json_column,
            key_property_map,
            nullable: left.nullable || right.nullable,
            ..left.clone()
        }
    }

    /// Outer identifier when both operands are identified by columns at the same positions.
    fn matched_identifier(left: &[Identifier], right: &[Identifier], columns: &OperandColumns) -> Option<Vec<Identifier>> {
        if left.is_empty() || left.len() != right.len() {
            return None;
        }
        left.iter()
            .zip(right.iter())
            .map(|(l, r)| {
                let position = columns.sources.iter()
                    .position(|(ls, rs)| same_expr(ls, &l.expr) && same_expr(rs, &r.expr))?;
                Some(Identifier::new(columns.outers[position].clone(), l.comparer))
            })
            .collect()
    }

    /// Freeze an operand with an explicit projection.
    fn into_operand(self, projection: Vec<ProjectionExpr>) -> SelectExpression {
        let keep_orderings = self.is_limited();
        SelectExpression {
            tables: self.tables,
            predicate: self.predicate,
            group_by: self.group_by,
            having: self.having,
            orderings: if keep_orderings { self.orderings } else { Vec::new() },
            limit: self.limit,
            offset: self.offset,
            distinct: self.distinct,
            projection,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        _tests::fixtures,
        sql::{OrderBy, ProjectionMember}
    };

    fn names(a: &mut AliasAllocator, table: &str, column: &str, nullable: bool) -> SelectBuilder {
        let (select, t) = SelectBuilder::from_table(a, TableExpr::table(table, None));
        let expr = SqlExpr::column(column, t, TypeMapping::string(), nullable);
        let mut mapping = IndexMap::new();
        mapping.insert(ProjectionMember::of("Name"), ProjectionValue::Scalar(expr.clone()));
        select.with_mapping(mapping).with_identifier(vec![Identifier::of(expr)])
    }

    fn typed(model: &Model, a: &mut AliasAllocator, entity: &str) -> SelectBuilder {
        let (select, t) = SelectBuilder::from_table(a, TableExpr::table("Animals", None));
        let mut p = StructuralProjection::new("Animal", StructuralKind::Entity);
        for (_, prop) in model.hierarchy_properties("Animal").unwrap() {
            p.properties.insert(prop.name.clone(), SqlExpr::column(prop.column_name(), t, prop.type_mapping(), prop.nullable));
        }
        p.discriminator = Some(p.properties["Discriminator"].clone());
        let p = p.update_entity_type(model, entity).unwrap();
        let mut mapping = IndexMap::new();
        mapping.insert(ProjectionMember::root(), ProjectionValue::Structural(p));
        select.with_mapping(mapping)
    }

    #[test]
    fn union_reads_combined_columns() {
        let model = fixtures::model();
        let mut a = AliasAllocator::new();
        let customers = names(&mut a, "Customers", "Name", false);
        let cities = names(&mut a, "Customers", "City", true);
        let union = customers.apply_union(&mut a, &model, cities).unwrap();

        let source = &union.tables[0];
        assert_eq!(source.alias, "u");
        let TableExpr::SetOperation { left, right, distinct, .. } = &source.table else { panic!("expected set operation") };
        assert!(*distinct);
        assert_eq!(left.column_names(), right.column_names());

        let outer = union.mapping[&ProjectionMember::of("Name")].as_scalar().unwrap();
        assert_eq!(outer.as_column().unwrap().table, source.id);
        assert!(outer.is_nullable());
        assert_eq!(union.identifier.len(), 1);
        assert!(Rc::ptr_eq(&union.identifier[0].expr, outer));
    }

    #[test]
    fn concat_has_no_identifier() {
        let model = fixtures::model();
        let mut a = AliasAllocator::new();
        let left = names(&mut a, "Customers", "Name", false);
        let right = names(&mut a, "Customers", "Name", false);
        let all = left.apply_concat(&mut a, &model, right).unwrap();
        assert!(all.identifier.is_empty());
    }

    #[test]
    fn mismatched_members_are_invalid() {
        let model = fixtures::model();
        let mut a = AliasAllocator::new();
        let left = names(&mut a, "Customers", "Name", false);
        let mut right = names(&mut a, "Customers", "Name", false);
        let value = right.mapping.shift_remove(&ProjectionMember::of("Name")).unwrap();
        right.mapping.insert(ProjectionMember::of("Title"), value);
        let err = left.apply_union(&mut a, &model, right).unwrap_err();
        assert!(matches!(err, QueryError::InvalidOperation(_)));
    }

    #[test]
    fn scalar_against_entity_is_invalid() {
        let model = fixtures::model();
        let mut a = AliasAllocator::new();
        let mut left = names(&mut a, "Customers", "Name", false);
        let value = left.mapping.shift_remove(&ProjectionMember::of("Name")).unwrap();
        left.mapping.insert(ProjectionMember::root(), value);
        let right = typed(&model, &mut a, "Cat");
        let err = left.apply_except(&mut a, &model, right).unwrap_err();
        assert!(!err.is_translation_failure());
    }

    #[test]
    fn client_projections_are_not_translated() {
        let model = fixtures::model();
        let mut a = AliasAllocator::new();
        let mut left = names(&mut a, "Customers", "Name", false);
        left.push_client_projection(ProjectionValue::Scalar(SqlExpr::int(1)));
        let right = names(&mut a, "Customers", "Name", false);
        let err = left.apply_intersect(&mut a, &model, right).unwrap_err();
        assert!(err.is_translation_failure());
    }

    #[test]
    fn sibling_types_widen_to_common_base() {
        let model = fixtures::model();
        let mut a = AliasAllocator::new();
        let cats = typed(&model, &mut a, "Cat");
        let dogs = typed(&model, &mut a, "Dog");
        let pets = cats.apply_concat(&mut a, &model, dogs).unwrap();

        let p = pets.mapping[&ProjectionMember::root()].as_structural().unwrap();
        assert_eq!(p.entity_type, "Pet");
        assert!(p.properties.contains_key("Lives"));
        assert!(p.properties.contains_key("Barks"));
        let set = pets.tables[0].id;
        assert!(p.properties.values().all(|e| e.as_column().map(|c| c.table == set).unwrap_or(false)));

        let TableExpr::SetOperation { left, right, .. } = &pets.tables[0].table else { panic!("expected set operation") };
        let barks = left.projection_index("Barks").unwrap();
        assert!(left.projection[barks].expr.is_null_constant());
        let lives = right.projection_index("Lives").unwrap();
        assert!(right.projection[lives].expr.is_null_constant());
        assert!(!right.projection[barks].expr.is_null_constant());
    }

    #[test]
    fn different_hierarchies_do_not_combine() {
        let model = fixtures::model();
        let mut a = AliasAllocator::new();
        let cats = typed(&model, &mut a, "Cat");
        let (cars, t) = SelectBuilder::from_table(&mut a, TableExpr::table("Cars", None));
        let mut car = StructuralProjection::new("Car", StructuralKind::Entity);
        car.properties.insert("Id".into(), SqlExpr::column("Id", t, TypeMapping::int(), false));
        let mut mapping = IndexMap::new();
        mapping.insert(ProjectionMember::root(), ProjectionValue::Structural(car));
        let err = cats.apply_union(&mut a, &model, cars.with_mapping(mapping)).unwrap_err();
        assert!(matches!(err, QueryError::InvalidOperation(_)));
    }

    #[test]
    fn operand_orderings_survive_only_with_limit() {
        let model = fixtures::model();
        let mut a = AliasAllocator::new();
        let left = names(&mut a, "Customers", "Name", false);
        let key = left.mapping[&ProjectionMember::of("Name")].as_scalar().unwrap().clone();
        let left = left.apply_ordering(&mut a, OrderBy::asc(key.clone())).unwrap();
        let right = names(&mut a, "Customers", "Name", false)
            .apply_ordering(&mut a, OrderBy::asc(key)).unwrap()
            .apply_limit(&mut a, SqlExpr::int(3)).unwrap();
        let union = left.apply_union(&mut a, &model, right).unwrap();
        let TableExpr::SetOperation { left, right, .. } = &union.tables[0].table else { panic!("expected set operation") };
        assert!(left.orderings.is_empty());
        assert_eq!(right.orderings.len(), 1);
        assert!(union.orderings.is_empty());
    }
}
