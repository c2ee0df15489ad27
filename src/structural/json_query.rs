use indexmap::IndexMap;

use crate::{
    error::{QueryError, QueryResult},
    metadata::Model,
    sql::{ExprRewriter, JsonPathSegment, Replacer, SqlExpr, SqlExprRef},
    structural::StructuralKind
};

/// A JSON-mapped owned entity (or collection of them) stored in one column.
///
/// Scalars inside the document bind to `JsonScalar` path accesses; nested
/// owned navigations extend the path.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonQuery {
    pub json_column: SqlExprRef,
    pub entity_type: String,
    pub kind: StructuralKind,
    pub path: Vec<JsonPathSegment>,
    pub nullable: bool,
    pub is_collection: bool,
    /// Owner key properties, which the document shares with its owner
    pub key_property_map: IndexMap<String, SqlExprRef>,
}

impl JsonQuery {
    pub fn new(json_column: SqlExprRef, entity_type: &str, is_collection: bool, nullable: bool) -> Self {
        Self {
            json_column,
            entity_type: entity_type.to_string(),
            kind: StructuralKind::Entity,
            path: Vec::new(),
            nullable,
            is_collection,
            key_property_map: IndexMap::new(),
        }
    }

    pub fn with_keys(mut self, keys: IndexMap<String, SqlExprRef>) -> Self {
        self.key_property_map = keys;
        self
    }

    pub fn bind_property(&self, model: &Model, name: &str) -> QueryResult<SqlExprRef> {
        if let Some(key) = self.key_property_map.get(name) {
            return Ok(key.clone());
        }
        if self.is_collection {
            return QueryError::not_translated(format!(
                "property '{}' accessed on the JSON collection '{}' without enumerating it", name, self.entity_type
            )).err();
        }
        let property = model.find_property(&self.entity_type, name)?.ok_or_else(|| {
            QueryError::invalid(format!("property '{}' is not declared on '{}'", name, self.entity_type))
        })?;
        let mut path = self.path.clone();
        path.push(JsonPathSegment::Property(property.json_property_name().to_string()));
        Ok(SqlExpr::json_scalar(
            self.json_column.clone(),
            path,
            Some(property.type_mapping()),
            self.nullable || property.nullable,
        ))
    }

    /// Nested owned navigation inside the same document.
    pub fn bind_navigation(&self, model: &Model, name: &str) -> QueryResult<JsonQuery> {
        let navigation = model.find_navigation(&self.entity_type, name)?.ok_or_else(|| {
            QueryError::invalid(format!("navigation '{}' is not declared on '{}'", name, self.entity_type))
        })?;
        if !navigation.owned || !navigation.is_json_mapped() {
            return QueryError::not_translated(format!(
                "navigation '{}' leaves the JSON document of '{}'", name, self.entity_type
            )).err();
        }
        if self.is_collection {
            return QueryError::not_translated(format!(
                "navigation '{}' accessed on the JSON collection '{}' without enumerating it", name, self.entity_type
            )).err();
        }
        let mut path = self.path.clone();
        path.push(JsonPathSegment::Property(navigation.json_property_name().to_string()));
        Ok(JsonQuery {
            json_column: self.json_column.clone(),
            entity_type: navigation.target.clone(),
            kind: StructuralKind::Entity,
            path,
            nullable: true,
            is_collection: navigation.is_collection,
            key_property_map: self.key_property_map.clone(),
        })
    }

    /// Single element of a JSON collection.
    pub fn element_at(&self, index: usize) -> QueryResult<JsonQuery> {
        if !self.is_collection {
            return QueryError::invalid(format!("'{}' is not a JSON collection", self.entity_type)).err();
        }
        let mut path = self.path.clone();
        path.push(JsonPathSegment::Index(index));
        Ok(JsonQuery { path, is_collection: false, nullable: true, ..self.clone() })
    }

    pub fn make_nullable(&self) -> Self {
        Self {
            json_column: SqlExpr::make_nullable(&self.json_column),
            nullable: true,
            key_property_map: self.key_property_map.iter().map(|(k, v)| (k.clone(), SqlExpr::make_nullable(v))).collect(),
            ..self.clone()
        }
    }

    pub fn remap(&self, f: &mut Replacer<'_>) -> Self {
        Self {
            json_column: ExprRewriter::rewrite(&self.json_column, f),
            key_property_map: self.key_property_map.iter().map(|(k, v)| (k.clone(), ExprRewriter::rewrite(v, f))).collect(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{_tests::fixtures, metadata::TypeMapping, sql::AliasAllocator};

    fn address(a: &mut AliasAllocator) -> JsonQuery {
        let t = a.generate_table_alias("Customers").id;
        JsonQuery::new(SqlExpr::column("Address", t, TypeMapping::json(), true), "Address", false, true)
    }

    #[test]
    fn binds_scalar_by_json_path() {
        let model = fixtures::model();
        let mut a = AliasAllocator::new();
        let city = address(&mut a).bind_property(&model, "City").unwrap();
        match city.as_ref() {
            SqlExpr::JsonScalar { path, nullable, .. } => {
                assert_eq!(path, &vec![JsonPathSegment::Property("city".into())]);
                assert!(*nullable);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn nested_navigation_extends_path() {
        let model = fixtures::model();
        let mut a = AliasAllocator::new();
        let geo = address(&mut a).bind_navigation(&model, "Geo").unwrap();
        assert_eq!(geo.path, vec![JsonPathSegment::Property("geo".into())]);
        let lat = geo.bind_property(&model, "Lat").unwrap();
        assert_eq!(lat.to_string().matches("geo").count(), 1);
    }

    #[test]
    fn collections_must_be_enumerated() {
        let model = fixtures::model();
        let mut a = AliasAllocator::new();
        let t = a.generate_table_alias("Customers").id;
        let phones = JsonQuery::new(SqlExpr::column("Phones", t, TypeMapping::json(), true), "Phone", true, true);
        let err = phones.bind_property(&model, "Number").unwrap_err();
        assert!(err.is_translation_failure());
        let first = phones.element_at(0).unwrap();
        assert!(first.bind_property(&model, "Number").is_ok());
    }
}
