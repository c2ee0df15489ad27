use indexmap::IndexMap;
use serde_json::Value;
use tracing::trace;

use crate::{
    error::{QueryError, QueryResult},
    metadata::{ComplexProperty, EntityType, InheritanceStrategy, Model, Navigation, TypeMapping, ValueKind},
    select::{Identifier, ProjectionValue, SelectBuilder},
    shaper::{ShapedQuery, Shaper},
    sql::{
        AliasAllocator, CaseWhen, InValues, JoinKind, ProjectionExpr, ProjectionMember, SelectExpression, SqlExpr,
        SqlExprRef, SqlValue, TableExpr, TableId, TableSource, TpcSubselect, ValuesSource
    },
    structural::{JsonQuery, NestedProjection, StructuralKind, StructuralProjection}
};

const TPC_DISCRIMINATOR: &str = "Discriminator";

/// Builds the select a query starts from.
pub struct RootBuilder;

impl RootBuilder {
    /// Every row of `entity_type`, derived types included, projected as one
    /// structural value at the root member.
    pub fn entity(model: &Model, aliases: &mut AliasAllocator, entity_type: &str) -> QueryResult<ShapedQuery> {
        let entity = model.entity_type(entity_type)?;
        if entity.owned {
            return QueryError::not_translated(format!("owned type '{entity_type}' can only be queried through its owner")).err();
        }
        let (select, projection) = match model.strategy(entity_type)? {
            InheritanceStrategy::Tph => Self::tph(model, aliases, entity)?,
            InheritanceStrategy::Tpt => Self::tpt(model, aliases, entity)?,
            InheritanceStrategy::Tpc => Self::tpc(model, aliases, entity)?,
        };
        trace!(entity = entity_type, tables = select.tables.len(), "built entity root");
        Self::finish(model, select, projection)
    }

    /// Raw SQL returning the columns of `entity_type`.
    pub fn from_sql(model: &Model, aliases: &mut AliasAllocator, entity_type: &str, sql: &str, args: Vec<SqlExprRef>) -> QueryResult<ShapedQuery> {
        let entity = model.entity_type(entity_type)?;
        if model.has_hierarchy(entity_type)? && model.strategy(entity_type)? != InheritanceStrategy::Tph {
            return QueryError::not_translated(format!(
                "raw SQL over '{entity_type}', whose hierarchy spans several tables"
            )).err();
        }
        let (select, t) = SelectBuilder::from_table(aliases, TableExpr::FromSql { sql: sql.to_string(), args });
        let projection = Self::single_table_projection(model, entity, t, "m")?;
        Self::finish(model, select, projection)
    }

    /// Inline rows of one scalar column.
    pub fn values(aliases: &mut AliasAllocator, rows: &[Value]) -> QueryResult<ShapedQuery> {
        let kind = rows.iter().find_map(ValueKind::of_value).unwrap_or(ValueKind::Int);
        let mapping = TypeMapping::for_kind(kind);
        let nullable = rows.iter().any(Value::is_null);
        let values = rows.iter()
            .map(|v| Ok(vec![SqlExpr::constant(SqlValue::from_json(v)?, Some(mapping.clone()))]))
            .collect::<QueryResult<Vec<_>>>()?;
        let (select, t) = SelectBuilder::from_table(aliases, TableExpr::Values {
            rows: ValuesSource::Rows(values),
            column_names: vec!["Value".to_string()],
        });
        Ok(Self::scalar_root(select, SqlExpr::column("Value", t, mapping, nullable)))
    }

    /// Elements of a collection-valued parameter.
    pub fn parameter_collection(aliases: &mut AliasAllocator, name: &str, element: ValueKind) -> ShapedQuery {
        let mapping = TypeMapping::for_kind(element);
        let (select, t) = SelectBuilder::from_table(aliases, TableExpr::Values {
            rows: ValuesSource::Parameter { name: name.to_string(), element: Some(mapping.clone()) },
            column_names: vec!["value".to_string()],
        });
        let nullable = matches!(element, ValueKind::String | ValueKind::Json | ValueKind::Binary);
        Self::scalar_root(select, SqlExpr::column("value", t, mapping, nullable))
    }

    fn scalar_root(select: SelectBuilder, value: SqlExprRef) -> ShapedQuery {
        let mut mapping = IndexMap::new();
        mapping.insert(ProjectionMember::root(), ProjectionValue::Scalar(value));
        ShapedQuery::new(select.with_mapping(mapping), Shaper::member(ProjectionMember::root()))
    }

    fn finish(model: &Model, select: SelectBuilder, projection: StructuralProjection) -> QueryResult<ShapedQuery> {
        let identifier = projection.identifying_columns(model)?
            .into_iter()
            .map(|(e, c)| Identifier::new(e, c))
            .collect();
        let mut mapping = IndexMap::new();
        mapping.insert(ProjectionMember::root(), ProjectionValue::Structural(projection));
        let select = select.with_mapping(mapping).with_identifier(identifier);
        Ok(ShapedQuery::new(select, Shaper::member(ProjectionMember::root())))
    }

    /// Types whose members a projection of `entity` carries: lineage then descendants.
    fn visible_types<'m>(model: &'m Model, entity: &EntityType) -> QueryResult<Vec<(&'m EntityType, bool)>> {
        let mut out: Vec<(&EntityType, bool)> = model.lineage(&entity.name)?.into_iter().map(|e| (e, false)).collect();
        out.extend(model.type_and_descendants(&entity.name)?.into_iter().skip(1).map(|e| (e, true)));
        Ok(out)
    }

    fn tph(model: &Model, aliases: &mut AliasAllocator, entity: &EntityType) -> QueryResult<(SelectBuilder, StructuralProjection)> {
        let table = model.table_of(&entity.name)?
            .ok_or_else(|| QueryError::invalid(format!("'{}' is not mapped to a table", entity.name)))?;
        let (mut select, t) = SelectBuilder::from_table(aliases, TableExpr::table(&table.name, table.schema.as_deref()));
        let projection = Self::single_table_projection(model, entity, t, &table.name)?;

        if model.has_hierarchy(&entity.name)? {
            if let Some(discriminator) = &projection.discriminator {
                let all = model.discriminator_values(&model.root_type(&entity.name)?.name)?;
                let allowed = model.discriminator_values(&entity.name)?;
                if allowed.len() < all.len() {
                    select.predicate = Some(Self::discriminator_filter(discriminator, &allowed));
                }
            }
        }
        Ok((select, projection))
    }

    /// Projection of a hierarchy stored in the single table `t`.
    fn single_table_projection(model: &Model, entity: &EntityType, t: TableId, table_name: &str) -> QueryResult<StructuralProjection> {
        let mut projection = StructuralProjection::new(&entity.name, StructuralKind::Entity);
        projection.table_map.insert(t, table_name.to_string());
        for (declaring, derived) in Self::visible_types(model, entity)? {
            for p in &declaring.properties {
                let column = SqlExpr::column(p.column_name(), t, p.type_mapping(), p.nullable || derived);
                projection.properties.insert(p.name.clone(), column);
            }
            Self::bind_owned_members(model, &mut projection, declaring, t, derived)?;
        }
        if let Some(d) = model.discriminator_property(&entity.name)? {
            projection.discriminator = Some(projection.bind_property(&d.name)?);
        }
        Ok(projection)
    }

    pub(crate) fn discriminator_filter(discriminator: &SqlExprRef, allowed: &[String]) -> SqlExprRef {
        let value = |v: &String| SqlExpr::constant(SqlValue::String(v.clone()), discriminator.type_mapping().cloned());
        match allowed {
            [] => SqlExpr::bool_const(false),
            [single] => SqlExpr::equal(discriminator.clone(), value(single)),
            many => SqlExpr::in_values(discriminator.clone(), InValues::List(many.iter().map(value).collect()), false),
        }
    }

    fn tpt(model: &Model, aliases: &mut AliasAllocator, entity: &EntityType) -> QueryResult<(SelectBuilder, StructuralProjection)> {
        let key = model.key_properties(&entity.name)?;
        let mut select: Option<SelectBuilder> = None;
        let mut root_table: Option<TableId> = None;
        let mut projection = StructuralProjection::new(&entity.name, StructuralKind::Entity);
        let mut derived_tables: Vec<(TableId, String)> = Vec::new();

        for (declaring, derived) in Self::visible_types(model, entity)? {
            let table = declaring.table.clone()
                .ok_or_else(|| QueryError::invalid(format!("'{}' is not mapped to a table", declaring.name)))?;
            let source = TableExpr::table(&table.name, table.schema.as_deref());
            let t = if let (Some(s), Some(root)) = (select.as_mut(), root_table) {
                let alias = aliases.generate_table_alias(&table.name);
                let on = SqlExpr::and_all(key.iter().map(|k| SqlExpr::equal(
                    SqlExpr::column(k.column_name(), root, k.type_mapping(), false),
                    SqlExpr::column(k.column_name(), alias.id, k.type_mapping(), false),
                )));
                let kind = if derived { JoinKind::Left } else { JoinKind::Inner };
                s.tables.push(TableSource::new(alias.id, alias.name, source).joined(kind, on));
                alias.id
            } else {
                let (s, t) = SelectBuilder::from_table(aliases, source);
                select = Some(s);
                root_table = Some(t);
                t
            };
            projection.table_map.insert(t, table.name.clone());
            for p in &declaring.properties {
                let column = SqlExpr::column(p.column_name(), t, p.type_mapping(), p.nullable || derived);
                projection.properties.insert(p.name.clone(), column);
            }
            Self::bind_owned_members(model, &mut projection, declaring, t, derived)?;
            if derived {
                derived_tables.push((t, declaring.name.clone()));
            }
        }

        let select = select.ok_or_else(|| QueryError::invalid(format!("'{}' has no tables", entity.name)))?;
        let first_key = key.first()
            .ok_or_else(|| QueryError::invalid(format!("'{}' has no key", entity.name)))?;
        // deepest types first so that the most derived table wins
        let whens = derived_tables.iter().rev()
            .map(|(t, name)| {
                let value = model.entity_type(name)?.discriminator_value.clone().unwrap_or_else(|| name.clone());
                Ok(CaseWhen {
                    test: SqlExpr::is_not_null(SqlExpr::column(first_key.column_name(), *t, first_key.type_mapping(), true)),
                    result: SqlExpr::constant(SqlValue::String(value), Some(TypeMapping::string())),
                })
            })
            .collect::<QueryResult<Vec<_>>>()?;
        let own = (!entity.is_abstract).then(|| {
            let value = entity.discriminator_value.clone().unwrap_or_else(|| entity.name.clone());
            SqlExpr::constant(SqlValue::String(value), Some(TypeMapping::string()))
        });
        projection.discriminator = Some(match (whens.is_empty(), own) {
            (true, Some(value)) => value,
            (_, own) => SqlExpr::case(None, whens, Some(own.unwrap_or_else(|| SqlExpr::null(Some(TypeMapping::string()))))),
        });
        Ok((select, projection))
    }

    fn tpc(model: &Model, aliases: &mut AliasAllocator, entity: &EntityType) -> QueryResult<(SelectBuilder, StructuralProjection)> {
        let visible = Self::visible_types(model, entity)?;
        let columns: Vec<(&EntityType, bool, &crate::metadata::Property)> = visible.iter()
            .flat_map(|(e, derived)| e.properties.iter().map(move |p| (*e, *derived, p)))
            .collect();

        let mut subselects = Vec::new();
        let mut values = Vec::new();
        for concrete in model.type_and_descendants(&entity.name)?.into_iter().filter(|e| !e.is_abstract) {
            let table = concrete.table.clone()
                .ok_or_else(|| QueryError::invalid(format!("concrete type '{}' is not mapped to a table", concrete.name)))?;
            let alias = aliases.generate_table_alias(&table.name);
            let mut projection = Vec::new();
            for (declaring, _, p) in &columns {
                let expr = if model.is_assignable(&declaring.name, &concrete.name) {
                    SqlExpr::column(p.column_name(), alias.id, p.type_mapping(), p.nullable)
                } else {
                    SqlExpr::null(Some(p.type_mapping()))
                };
                projection.push(ProjectionExpr::new(expr, p.column_name()));
            }
            let discriminator = concrete.discriminator_value.clone().unwrap_or_else(|| concrete.name.clone());
            projection.push(ProjectionExpr::new(
                SqlExpr::constant(SqlValue::String(discriminator.clone()), Some(TypeMapping::string())),
                TPC_DISCRIMINATOR,
            ));
            subselects.push(TpcSubselect {
                discriminator: discriminator.clone(),
                select: SelectExpression {
                    tables: vec![TableSource::new(alias.id, alias.name, TableExpr::table(&table.name, table.schema.as_deref()))],
                    projection,
                    ..SelectExpression::default()
                },
            });
            values.push(discriminator);
        }
        if subselects.is_empty() {
            return QueryError::invalid(format!("'{}' has no concrete type", entity.name)).err();
        }

        let (select, t) = SelectBuilder::from_table(aliases, TableExpr::TpcTables {
            subselects,
            discriminator_column: TPC_DISCRIMINATOR.to_string(),
            discriminator_values: values,
        });
        let mut projection = StructuralProjection::new(&entity.name, StructuralKind::Entity);
        for (declaring, derived, p) in &columns {
            // a column missing from some concrete table reads NULL for its rows
            let partial = *derived || model.type_and_descendants(&entity.name)?.iter()
                .any(|c| !c.is_abstract && !model.is_assignable(&declaring.name, &c.name));
            projection.properties.insert(p.name.clone(), SqlExpr::column(p.column_name(), t, p.type_mapping(), p.nullable || partial));
        }
        for (declaring, derived) in &visible {
            Self::bind_owned_members(model, &mut projection, declaring, t, *derived)?;
        }
        projection.discriminator = Some(SqlExpr::column(TPC_DISCRIMINATOR, t, TypeMapping::string(), false));
        Ok((select, projection))
    }

    /// Complex properties, JSON-mapped owned navigations and table-split owned
    /// references declared on `declaring`, stored in table `t`.
    fn bind_owned_members(
        model: &Model,
        projection: &mut StructuralProjection,
        declaring: &EntityType,
        t: TableId,
        nullable: bool,
    ) -> QueryResult<()> {
        for cp in &declaring.complex_properties {
            let nested = Self::complex(model, cp, t, "", nullable)?;
            projection.complex.insert(cp.name.clone(), NestedProjection::Structural(Box::new(nested)));
        }
        for nav in &declaring.navigations {
            if !nav.owned {
                continue;
            }
            if nav.is_json_mapped() {
                let keys = Self::owner_keys(model, projection)?;
                let json = JsonQuery::new(
                    SqlExpr::column(nav.json_property_name(), t, TypeMapping::json(), true),
                    &nav.target,
                    nav.is_collection,
                    true,
                ).with_keys(keys);
                projection.navigations.insert(nav.name.clone(), NestedProjection::Json(json));
            } else if !nav.is_collection && model.entity_type(&nav.target)?.table.is_none() {
                let owned = Self::table_split_owned(model, nav, t, &format!("{}_", nav.name))?;
                projection.navigations.insert(nav.name.clone(), NestedProjection::Structural(Box::new(owned)));
            }
        }
        Ok(())
    }

    fn owner_keys(model: &Model, projection: &StructuralProjection) -> QueryResult<IndexMap<String, SqlExprRef>> {
        model.key_properties(&projection.entity_type)?
            .into_iter()
            .map(|k| Ok((k.name.clone(), projection.bind_property(&k.name)?)))
            .collect()
    }

    fn complex(model: &Model, cp: &ComplexProperty, t: TableId, prefix: &str, nullable: bool) -> QueryResult<StructuralProjection> {
        if cp.json_column.is_some() {
            return QueryError::not_translated(format!("complex property '{}' mapped to a JSON column", cp.name)).err();
        }
        let complex_type = model.complex_type(&cp.complex_type)?;
        let prefix = format!("{prefix}{}", cp.prefix());
        let nullable = nullable || cp.nullable;
        let mut projection = StructuralProjection::new(&complex_type.name, StructuralKind::Complex);
        projection.nullable = nullable;
        for p in &complex_type.properties {
            let column = SqlExpr::column(&format!("{prefix}{}", p.column_name()), t, p.type_mapping(), p.nullable || nullable);
            projection.properties.insert(p.name.clone(), column);
        }
        for nested in &complex_type.complex_properties {
            let inner = Self::complex(model, nested, t, &prefix, nullable)?;
            projection.complex.insert(nested.name.clone(), NestedProjection::Structural(Box::new(inner)));
        }
        Ok(projection)
    }

    /// Owned reference sharing its owner's table, columns prefixed by the navigation name.
    fn table_split_owned(model: &Model, nav: &Navigation, t: TableId, prefix: &str) -> QueryResult<StructuralProjection> {
        let target = model.entity_type(&nav.target)?;
        let mut projection = StructuralProjection::new(&target.name, StructuralKind::Entity);
        projection.nullable = true;
        for p in &target.properties {
            let column = SqlExpr::column(&format!("{prefix}{}", p.column_name()), t, p.type_mapping(), true);
            projection.properties.insert(p.name.clone(), column);
        }
        for cp in &target.complex_properties {
            let nested = Self::complex(model, cp, t, prefix, true)?;
            projection.complex.insert(cp.name.clone(), NestedProjection::Structural(Box::new(nested)));
        }
        for inner in target.navigations.iter().filter(|n| n.owned) {
            if inner.is_json_mapped() {
                return QueryError::not_translated(format!(
                    "JSON-mapped '{}' inside the table-split owned type '{}'", inner.name, target.name
                )).err();
            }
            if !inner.is_collection {
                let nested = Self::table_split_owned(model, inner, t, &format!("{prefix}{}_", inner.name))?;
                projection.navigations.insert(inner.name.clone(), NestedProjection::Structural(Box::new(nested)));
            }
        }
        Ok(projection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{_tests::fixtures, sql::BinaryOp};

    fn root(query: &ShapedQuery) -> &StructuralProjection {
        query.select.mapping[&ProjectionMember::root()].as_structural().unwrap()
    }

    #[test]
    fn plain_entity_binds_columns_complex_and_json() {
        let model = fixtures::model();
        let mut a = AliasAllocator::new();
        let q = RootBuilder::entity(&model, &mut a, "Customer").unwrap();
        let p = root(&q);
        assert_eq!(p.properties.len(), 4);
        assert!(q.select.predicate.is_none());
        let NestedProjection::Structural(contact) = &p.complex["Contact"] else { panic!("expected complex") };
        assert_eq!(contact.properties["Email"].as_column().unwrap().name, "Contact_Email");
        let NestedProjection::Json(phones) = &p.navigations["Phones"] else { panic!("expected json") };
        assert!(phones.is_collection);
        assert_eq!(phones.key_property_map.len(), 1);
        assert_eq!(q.select.identifier.len(), 1);
    }

    #[test]
    fn tph_derived_type_filters_on_discriminator() {
        let model = fixtures::model();
        let mut a = AliasAllocator::new();
        let animals = RootBuilder::entity(&model, &mut a, "Animal").unwrap();
        assert!(animals.select.predicate.is_none());
        assert!(root(&animals).properties.contains_key("Barks"));

        let pets = RootBuilder::entity(&model, &mut a, "Pet").unwrap();
        match pets.select.predicate.as_deref() {
            Some(SqlExpr::In { values: InValues::List(values), .. }) => assert_eq!(values.len(), 2),
            other => panic!("unexpected predicate {other:?}"),
        }
        assert!(!root(&pets).properties.contains_key("WingSpan"));

        let dogs = RootBuilder::entity(&model, &mut a, "Dog").unwrap();
        assert!(matches!(dogs.select.predicate.as_deref(), Some(SqlExpr::Binary { op: BinaryOp::Equal, .. })));
    }

    #[test]
    fn tpt_joins_lineage_inner_and_descendants_left() {
        let model = fixtures::model();
        let mut a = AliasAllocator::new();
        let q = RootBuilder::entity(&model, &mut a, "Employee").unwrap();
        let kinds: Vec<Option<JoinKind>> = q.select.tables.iter().map(|t| t.join_kind()).collect();
        assert_eq!(kinds, vec![None, Some(JoinKind::Inner), Some(JoinKind::Left)]);
        let p = root(&q);
        assert_eq!(p.table_map.len(), 3);
        assert!(p.properties["Level"].is_nullable());
        assert!(!p.properties["Salary"].is_nullable());
        assert!(matches!(p.discriminator.as_deref(), Some(SqlExpr::Case { .. })));
    }

    #[test]
    fn tpc_unions_concrete_tables() {
        let model = fixtures::model();
        let mut a = AliasAllocator::new();
        let q = RootBuilder::entity(&model, &mut a, "Vehicle").unwrap();
        let TableExpr::TpcTables { subselects, discriminator_values, .. } = &q.select.tables[0].table else {
            panic!("expected concrete tables")
        };
        assert_eq!(discriminator_values, &vec!["Car".to_string(), "Truck".to_string()]);
        assert_eq!(subselects[0].select.column_names(), vec!["Id", "Make", "Seats", "Payload", "Discriminator"]);
        assert!(subselects[0].select.projection[3].expr.is_null_constant());
        assert!(root(&q).properties["Seats"].is_nullable());
    }

    #[test]
    fn owned_types_are_not_roots() {
        let model = fixtures::model();
        let mut a = AliasAllocator::new();
        let err = RootBuilder::entity(&model, &mut a, "Address").unwrap_err();
        assert!(err.is_translation_failure());
    }

    #[test]
    fn values_and_parameters_project_one_column() {
        let mut a = AliasAllocator::new();
        let q = RootBuilder::values(&mut a, &[serde_json::json!(1), serde_json::json!(null)]).unwrap();
        let value = q.select.mapping[&ProjectionMember::root()].as_scalar().unwrap();
        assert!(value.is_nullable());
        let p = RootBuilder::parameter_collection(&mut a, "ids", ValueKind::Int);
        assert_eq!(p.select.tables[0].table.column_names(), Some(vec!["value".to_string()]));
    }
}
