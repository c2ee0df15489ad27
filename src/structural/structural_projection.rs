use indexmap::IndexMap;
use std::collections::HashSet;

use crate::{
    error::{QueryError, QueryResult},
    metadata::{Model, Property, ValueComparer},
    sql::{CaseWhen, ExprRewriter, Replacer, SqlExpr, SqlExprRef, SqlValue, TableId},
    structural::JsonQuery
};

/// Whether a structural projection describes an entity or a complex type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StructuralKind {
    Entity,
    Complex,
}

/// Value of a complex property or of an owned / joined navigation.
#[derive(Debug, Clone, PartialEq)]
pub enum NestedProjection {
    Structural(Box<StructuralProjection>),
    Json(JsonQuery),
}

impl NestedProjection {
    pub fn make_nullable(&self) -> NestedProjection {
        match self {
            NestedProjection::Structural(s) => NestedProjection::Structural(Box::new(s.make_nullable())),
            NestedProjection::Json(j) => NestedProjection::Json(j.make_nullable()),
        }
    }

    pub fn remap(&self, f: &mut Replacer<'_>) -> NestedProjection {
        match self {
            NestedProjection::Structural(s) => NestedProjection::Structural(Box::new(s.remap(f))),
            NestedProjection::Json(j) => NestedProjection::Json(j.remap(f)),
        }
    }
}

/// Maps a structural type (entity or complex type) onto columns.
///
/// `properties` covers the whole hierarchy below `entity_type`, so that a
/// later narrowing (`OfType`) or a property access on a derived type can still
/// bind. For hierarchies spread over several tables `table_map` records which
/// source holds which physical table, and `discriminator` yields the concrete
/// type of a row (a column for one-table hierarchies, a `CASE` otherwise).
#[derive(Debug, Clone, PartialEq)]
pub struct StructuralProjection {
    pub entity_type: String,
    pub kind: StructuralKind,
    pub properties: IndexMap<String, SqlExprRef>,
    pub complex: IndexMap<String, NestedProjection>,
    /// Owned navigations and to-one navigations already expanded by a join
    pub navigations: IndexMap<String, NestedProjection>,
    pub discriminator: Option<SqlExprRef>,
    pub table_map: IndexMap<TableId, String>,
    pub nullable: bool,
}

impl StructuralProjection {
    pub fn new(entity_type: &str, kind: StructuralKind) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            kind,
            properties: IndexMap::new(),
            complex: IndexMap::new(),
            navigations: IndexMap::new(),
            discriminator: None,
            table_map: IndexMap::new(),
            nullable: false,
        }
    }

    /// Column holding `property`.
    ///
    /// Binding a property the projected hierarchy does not declare is an
    /// invalid operation, not a translation failure.
    pub fn bind_property(&self, property: &str) -> QueryResult<SqlExprRef> {
        self.properties.get(property).cloned().ok_or_else(|| {
            QueryError::invalid(format!("property '{}' is not declared on '{}'", property, self.entity_type))
        })
    }

    pub fn bind_complex_property(&self, name: &str) -> QueryResult<&NestedProjection> {
        self.complex.get(name).ok_or_else(|| {
            QueryError::invalid(format!("complex property '{}' is not declared on '{}'", name, self.entity_type))
        })
    }

    /// Projection of an owned navigation, or of a to-one navigation expanded earlier.
    pub fn bind_navigation(&self, name: &str) -> Option<&NestedProjection> {
        self.navigations.get(name)
    }

    pub fn add_navigation_binding(mut self, name: &str, target: NestedProjection) -> Self {
        let target = if self.nullable { target.make_nullable() } else { target };
        self.navigations.insert(name.to_string(), target);
        self
    }

    /// Copy whose every column may be null, e.g. after a LEFT JOIN.
    pub fn make_nullable(&self) -> Self {
        Self {
            entity_type: self.entity_type.clone(),
            kind: self.kind,
            properties: self.properties.iter().map(|(k, v)| (k.clone(), SqlExpr::make_nullable(v))).collect(),
            complex: self.complex.iter().map(|(k, v)| (k.clone(), v.make_nullable())).collect(),
            navigations: self.navigations.iter().map(|(k, v)| (k.clone(), v.make_nullable())).collect(),
            discriminator: self.discriminator.as_ref().map(SqlExpr::make_nullable),
            table_map: self.table_map.clone(),
            nullable: true,
        }
    }

    /// Narrow (or widen) the projection to `target`.
    ///
    /// Narrowing drops the properties and navigations no type under `target`
    /// declares and prunes discriminator `CASE` branches of other types.
    pub fn update_entity_type(&self, model: &Model, target: &str) -> QueryResult<Self> {
        if self.kind != StructuralKind::Entity {
            return QueryError::invalid(format!("'{}' is not an entity type", self.entity_type)).err();
        }
        if target == self.entity_type {
            return Ok(self.clone());
        }
        if model.is_assignable(target, &self.entity_type) {
            let mut widened = self.clone();
            widened.entity_type = target.to_string();
            return Ok(widened);
        }
        if !model.is_assignable(&self.entity_type, target) {
            return QueryError::invalid(format!(
                "'{}' is not a type in the hierarchy of '{}'", target, self.entity_type
            )).err();
        }

        let property_names: HashSet<String> = model.hierarchy_properties(target)?
            .into_iter()
            .map(|(_, p)| p.name.clone())
            .collect();
        let lineage = model.lineage(target)?;
        let descendants = model.type_and_descendants(target)?;
        let visible_types: Vec<&str> = lineage.iter().chain(descendants.iter()).map(|e| e.name.as_str()).collect();
        let navigation_names: HashSet<String> = visible_types.iter()
            .filter_map(|t| model.entity_type(t).ok())
            .flat_map(|e| e.navigations.iter().map(|n| n.name.clone()).chain(e.complex_properties.iter().map(|c| c.name.clone())))
            .collect();
        let mut table_names = HashSet::new();
        for t in &visible_types {
            if let Some(table) = model.table_of(t)? {
                table_names.insert(table.name);
            }
        }
        let allowed = model.discriminator_values(target)?;

        let mut narrowed = self.clone();
        narrowed.entity_type = target.to_string();
        narrowed.properties.retain(|k, _| property_names.contains(k));
        narrowed.complex.retain(|k, _| navigation_names.contains(k));
        narrowed.navigations.retain(|k, _| navigation_names.contains(k));
        if !narrowed.table_map.is_empty() && !table_names.is_empty() {
            narrowed.table_map.retain(|_, name| table_names.contains(name));
        }
        narrowed.discriminator = self.discriminator.as_ref().map(|d| Self::narrow_discriminator(d, &allowed));
        Ok(narrowed)
    }

    fn narrow_discriminator(discriminator: &SqlExprRef, allowed: &[String]) -> SqlExprRef {
        let SqlExpr::Case { operand, when_clauses, else_result, .. } = discriminator.as_ref() else {
            return discriminator.clone();
        };
        let is_allowed = |e: &SqlExprRef| match e.as_ref() {
            SqlExpr::Constant { value: SqlValue::String(s), .. } => allowed.contains(s),
            _ => true,
        };
        let whens: Vec<CaseWhen> = when_clauses.iter().filter(|w| is_allowed(&w.result)).cloned().collect();
        let else_result = else_result.clone().filter(|e| is_allowed(e));
        match (whens.len(), &else_result) {
            (0, Some(e)) => e.clone(),
            _ => SqlExpr::case(operand.clone(), whens, else_result),
        }
    }

    /// Apply `f` to every bound expression.
    pub fn remap(&self, f: &mut Replacer<'_>) -> Self {
        Self {
            entity_type: self.entity_type.clone(),
            kind: self.kind,
            properties: self.properties.iter().map(|(k, v)| (k.clone(), ExprRewriter::rewrite(v, f))).collect(),
            complex: self.complex.iter().map(|(k, v)| (k.clone(), v.remap(f))).collect(),
            navigations: self.navigations.iter().map(|(k, v)| (k.clone(), v.remap(f))).collect(),
            discriminator: self.discriminator.as_ref().map(|d| ExprRewriter::rewrite(d, f)),
            table_map: self.table_map.clone(),
            nullable: self.nullable,
        }
    }

    /// Repoint columns of `from` to `to`, including the per-table map.
    pub fn retarget(&self, from: TableId, to: TableId) -> Self {
        let mut out = self.remap(&mut |e: &SqlExprRef| match e.as_ref() {
            SqlExpr::Column(c) if c.table == from => Some(SqlExpr::column(&c.name, to, c.type_mapping.clone(), c.nullable)),
            _ => None,
        });
        if let Some(name) = out.table_map.shift_remove(&from) {
            out.table_map.insert(to, name);
        }
        out
    }

    /// Every scalar the projection reads, in flattening order, named by member.
    ///
    /// Nested projections contribute with a `Name.` prefix. The discriminator
    /// comes last unless it is already one of the property columns.
    pub fn flatten(&self) -> Vec<(String, SqlExprRef)> {
        let mut out: Vec<(String, SqlExprRef)> = self.properties.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (name, nested) in self.complex.iter().chain(self.navigations.iter()) {
            match nested {
                NestedProjection::Structural(s) => {
                    out.extend(s.flatten().into_iter().map(|(k, v)| (format!("{name}.{k}"), v)));
                }
                NestedProjection::Json(j) => out.push((name.clone(), j.json_column.clone())),
            }
        }
        if let Some(d) = &self.discriminator {
            if !out.iter().any(|(_, v)| v == d) {
                out.push(("$discriminator".to_string(), d.clone()));
            }
        }
        out
    }

    /// Columns proving row identity, in key declaration order.
    ///
    /// Entities with a key use it; complex types and keyless or owned types
    /// use every non-key property.
    pub fn identifying_columns(&self, model: &Model) -> QueryResult<Vec<(SqlExprRef, ValueComparer)>> {
        let key: Vec<Property> = match self.kind {
            StructuralKind::Entity if !model.entity_type(&self.entity_type)?.owned => {
                model.key_properties(&self.entity_type)?.into_iter().cloned().collect()
            }
            _ => Vec::new(),
        };
        if !key.is_empty() {
            return key.iter()
                .map(|p| Ok((self.bind_property(&p.name)?, p.comparer)))
                .collect();
        }
        let comparers = self.property_comparers(model)?;
        Ok(self.properties.iter()
            .map(|(name, expr)| (expr.clone(), comparers.get(name).copied().unwrap_or_default()))
            .collect())
    }

    fn property_comparers(&self, model: &Model) -> QueryResult<IndexMap<String, ValueComparer>> {
        Ok(match self.kind {
            StructuralKind::Entity => model.hierarchy_properties(&self.entity_type)?
                .into_iter()
                .map(|(_, p)| (p.name.clone(), p.comparer))
                .collect(),
            StructuralKind::Complex => model.complex_type(&self.entity_type)?
                .properties.iter()
                .map(|p| (p.name.clone(), p.comparer))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{_tests::fixtures, sql::AliasAllocator};

    fn animal_projection(model: &Model, t: TableId) -> StructuralProjection {
        let mut p = StructuralProjection::new("Animal", StructuralKind::Entity);
        for (_, prop) in model.hierarchy_properties("Animal").unwrap() {
            p.properties.insert(prop.name.clone(), SqlExpr::column(prop.column_name(), t, prop.type_mapping(), prop.nullable));
        }
        p.discriminator = Some(p.properties["Discriminator"].clone());
        p
    }

    #[test]
    fn bind_unknown_property_is_invalid() {
        let model = fixtures::model();
        let mut a = AliasAllocator::new();
        let p = animal_projection(&model, a.generate_table_alias("Animals").id);
        assert!(p.bind_property("Name").is_ok());
        let err = p.bind_property("Salary").unwrap_err();
        assert!(!err.is_translation_failure());
    }

    #[test]
    fn narrowing_drops_sibling_properties() {
        let model = fixtures::model();
        let mut a = AliasAllocator::new();
        let p = animal_projection(&model, a.generate_table_alias("Animals").id);
        assert!(p.properties.contains_key("WingSpan"));

        let cat = p.update_entity_type(&model, "Cat").unwrap();
        assert_eq!(cat.entity_type, "Cat");
        assert!(cat.properties.contains_key("Name"));
        assert!(cat.properties.contains_key("Lives"));
        assert!(!cat.properties.contains_key("WingSpan"));
        assert!(!cat.properties.contains_key("Barks"));

        let back = cat.update_entity_type(&model, "Animal").unwrap();
        assert_eq!(back.entity_type, "Animal");
    }

    #[test]
    fn narrowing_to_unrelated_type_fails() {
        let model = fixtures::model();
        let mut a = AliasAllocator::new();
        let p = animal_projection(&model, a.generate_table_alias("Animals").id);
        let cat = p.update_entity_type(&model, "Cat").unwrap();
        let err = cat.update_entity_type(&model, "Bird").unwrap_err();
        assert!(matches!(err, QueryError::InvalidOperation(_)));
        assert!(p.update_entity_type(&model, "Customer").is_err());
    }

    #[test]
    fn case_discriminator_is_pruned() {
        let disc = SqlExpr::case(
            None,
            vec![
                CaseWhen { test: SqlExpr::bool_const(true), result: SqlExpr::constant(SqlValue::String("Cat".into()), None) },
                CaseWhen { test: SqlExpr::bool_const(true), result: SqlExpr::constant(SqlValue::String("Dog".into()), None) },
            ],
            Some(SqlExpr::constant(SqlValue::String("Animal".into()), None)),
        );
        let narrowed = StructuralProjection::narrow_discriminator(&disc, &["Cat".to_string()]);
        match narrowed.as_ref() {
            SqlExpr::Case { when_clauses, else_result, .. } => {
                assert_eq!(when_clauses.len(), 1);
                assert!(else_result.is_none());
            }
            other => panic!("expected CASE, got {other:?}"),
        }
    }

    #[test]
    fn make_nullable_reaches_every_column() {
        let model = fixtures::model();
        let mut a = AliasAllocator::new();
        let p = animal_projection(&model, a.generate_table_alias("Animals").id);
        let n = p.make_nullable();
        assert!(n.nullable);
        assert!(n.properties.values().all(|e| e.is_nullable()));
        assert!(n.discriminator.as_ref().unwrap().is_nullable());
        assert!(!p.properties["Id"].is_nullable());
    }

    #[test]
    fn entity_identity_uses_key() {
        let model = fixtures::model();
        let mut a = AliasAllocator::new();
        let p = animal_projection(&model, a.generate_table_alias("Animals").id);
        let ids = p.identifying_columns(&model).unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].0.as_column().unwrap().name, "Id");
    }
}
