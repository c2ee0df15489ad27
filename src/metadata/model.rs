use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{QueryError, QueryResult},
    metadata::{ComplexProperty, ComplexType, EntityType, InheritanceStrategy, Navigation, Property, TableMapping}
};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct ModelDefinition {
    #[serde(default)]
    entity_types: Vec<EntityType>,
    #[serde(default)]
    complex_types: Vec<ComplexType>,
}

impl From<ModelDefinition> for Model {
    fn from(def: ModelDefinition) -> Self {
        Model::new(def.entity_types, def.complex_types)
    }
}

impl From<Model> for ModelDefinition {
    fn from(model: Model) -> Self {
        ModelDefinition {
            entity_types: model.entity_types.into_values().collect(),
            complex_types: model.complex_types.into_values().collect(),
        }
    }
}

/// Read-only metadata consumed by the translator.
///
/// Types are kept in declaration order. Lookups of unknown names are invalid
/// operations: the front end only hands over names it got from the model.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(from = "ModelDefinition", into = "ModelDefinition")]
pub struct Model {
    entity_types: IndexMap<String, EntityType>,
    complex_types: IndexMap<String, ComplexType>,
}

impl Model {
    pub fn new(entity_types: Vec<EntityType>, complex_types: Vec<ComplexType>) -> Self {
        Self {
            entity_types: entity_types.into_iter().map(|e| (e.name.clone(), e)).collect(),
            complex_types: complex_types.into_iter().map(|c| (c.name.clone(), c)).collect(),
        }
    }

    pub fn from_json(value: Value) -> QueryResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| QueryError::invalid(format!("invalid model definition: {e}")))
    }

    pub fn entity_type(&self, name: &str) -> QueryResult<&EntityType> {
        self.entity_types.get(name)
            .ok_or_else(|| QueryError::invalid(format!("entity type '{name}' is not part of the model")))
    }

    pub fn complex_type(&self, name: &str) -> QueryResult<&ComplexType> {
        self.complex_types.get(name)
            .ok_or_else(|| QueryError::invalid(format!("complex type '{name}' is not part of the model")))
    }

    pub fn has_entity_type(&self, name: &str) -> bool {
        self.entity_types.contains_key(name)
    }

    /// Types from the hierarchy root down to `name`.
    pub fn lineage(&self, name: &str) -> QueryResult<Vec<&EntityType>> {
        let mut current = self.entity_type(name)?;
        let mut chain = vec![current];
        while let Some(base) = &current.base_type {
            if chain.len() > self.entity_types.len() {
                return QueryError::invalid(format!("inheritance cycle at '{name}'")).err();
            }
            current = self.entity_type(base)?;
            chain.push(current);
        }
        chain.reverse();
        Ok(chain)
    }

    pub fn root_type(&self, name: &str) -> QueryResult<&EntityType> {
        Ok(self.lineage(name)?[0])
    }

    pub fn direct_derived_types(&self, name: &str) -> Vec<&EntityType> {
        self.entity_types.values()
            .filter(|e| e.base_type.as_deref() == Some(name))
            .collect()
    }

    /// `name` followed by all its descendants, depth-first in declaration order.
    pub fn type_and_descendants(&self, name: &str) -> QueryResult<Vec<&EntityType>> {
        let mut out = vec![self.entity_type(name)?];
        let mut i = 0;
        while i < out.len() {
            let current = out[i].name.clone();
            let children = self.direct_derived_types(&current);
            for (offset, child) in children.into_iter().enumerate() {
                out.insert(i + 1 + offset, child);
            }
            i += 1;
        }
        Ok(out)
    }

    /// Whether `derived` is `base` or inherits from it.
    pub fn is_assignable(&self, base: &str, derived: &str) -> bool {
        match self.lineage(derived) {
            Ok(chain) => chain.iter().any(|e| e.name == base),
            Err(_) => false,
        }
    }

    pub fn strategy(&self, name: &str) -> QueryResult<InheritanceStrategy> {
        Ok(self.root_type(name)?.strategy)
    }

    /// Whether the type takes part in an inheritance hierarchy.
    pub fn has_hierarchy(&self, name: &str) -> QueryResult<bool> {
        let root = self.root_type(name)?;
        Ok(!self.direct_derived_types(&root.name).is_empty())
    }

    /// All scalar properties visible on `name`, inherited ones first.
    pub fn properties(&self, name: &str) -> QueryResult<Vec<&Property>> {
        Ok(self.lineage(name)?.into_iter().flat_map(|e| e.properties.iter()).collect())
    }

    /// Properties of the whole hierarchy under `name` (its own and every descendant's).
    pub fn hierarchy_properties(&self, name: &str) -> QueryResult<Vec<(&EntityType, &Property)>> {
        let mut out: Vec<(&EntityType, &Property)> = self.lineage(name)?
            .into_iter()
            .flat_map(|e| e.properties.iter().map(move |p| (e, p)))
            .collect();
        for derived in self.type_and_descendants(name)?.into_iter().skip(1) {
            out.extend(derived.properties.iter().map(|p| (derived, p)));
        }
        Ok(out)
    }

    pub fn find_property(&self, entity: &str, property: &str) -> QueryResult<Option<&Property>> {
        Ok(self.properties(entity)?.into_iter().find(|p| p.name == property))
    }

    pub fn navigations(&self, name: &str) -> QueryResult<Vec<&Navigation>> {
        Ok(self.lineage(name)?.into_iter().flat_map(|e| e.navigations.iter()).collect())
    }

    pub fn find_navigation(&self, entity: &str, navigation: &str) -> QueryResult<Option<&Navigation>> {
        Ok(self.navigations(entity)?.into_iter().find(|n| n.name == navigation))
    }

    pub fn complex_properties(&self, name: &str) -> QueryResult<Vec<&ComplexProperty>> {
        Ok(self.lineage(name)?.into_iter().flat_map(|e| e.complex_properties.iter()).collect())
    }

    pub fn find_complex_property(&self, entity: &str, name: &str) -> QueryResult<Option<&ComplexProperty>> {
        Ok(self.complex_properties(entity)?.into_iter().find(|c| c.name == name))
    }

    /// Primary key properties in key declaration order.
    pub fn key_properties(&self, name: &str) -> QueryResult<Vec<&Property>> {
        let root = self.root_type(name)?;
        let props = self.properties(&root.name)?;
        root.key.iter()
            .map(|k| props.iter().find(|p| &p.name == k).copied()
                .ok_or_else(|| QueryError::invalid(format!("key property '{k}' not declared on '{}'", root.name))))
            .collect()
    }

    /// Table holding the columns declared on `name`.
    pub fn table_of(&self, name: &str) -> QueryResult<Option<TableMapping>> {
        let entity = self.entity_type(name)?;
        if let Some(t) = &entity.table {
            return Ok(Some(t.clone()));
        }
        match self.strategy(name)? {
            InheritanceStrategy::Tph => Ok(self.root_type(name)?.table.clone()),
            _ => Ok(None),
        }
    }

    pub fn discriminator_property(&self, name: &str) -> QueryResult<Option<&Property>> {
        let root = self.root_type(name)?;
        match &root.discriminator_property {
            Some(d) => self.find_property(&root.name, d),
            None => Ok(None),
        }
    }

    /// Discriminator values of `name` and all its concrete descendants.
    pub fn discriminator_values(&self, name: &str) -> QueryResult<Vec<String>> {
        Ok(self.type_and_descendants(name)?
            .into_iter()
            .filter(|e| !e.is_abstract)
            .filter_map(|e| e.discriminator_value.clone())
            .collect())
    }

    /// Entity type whose discriminator value is `value` within the hierarchy of `name`.
    pub fn type_for_discriminator(&self, name: &str, value: &str) -> QueryResult<Option<&EntityType>> {
        let root = self.root_type(name)?;
        Ok(self.type_and_descendants(&root.name)?
            .into_iter()
            .find(|e| e.discriminator_value.as_deref() == Some(value)))
    }
}

#[cfg(test)]
mod tests {
    use crate::_tests::fixtures;

    #[test]
    fn lineage_and_descendants() {
        let model = fixtures::model();
        let lineage: Vec<_> = model.lineage("Cat").unwrap().iter().map(|e| e.name.clone()).collect();
        assert_eq!(lineage, vec!["Animal", "Pet", "Cat"]);

        let all: Vec<_> = model.type_and_descendants("Animal").unwrap().iter().map(|e| e.name.clone()).collect();
        assert_eq!(all, vec!["Animal", "Pet", "Cat", "Dog", "Bird"]);

        assert!(model.is_assignable("Animal", "Dog"));
        assert!(!model.is_assignable("Dog", "Animal"));
    }

    #[test]
    fn key_properties_follow_declaration_order() {
        let model = fixtures::model();
        let key: Vec<_> = model.key_properties("OrderLine").unwrap().iter().map(|p| p.name.clone()).collect();
        assert_eq!(key, vec!["OrderId", "LineNo"]);
    }

    #[test]
    fn discriminator_values_skip_abstract_types() {
        let model = fixtures::model();
        assert_eq!(model.discriminator_values("Pet").unwrap(), vec!["Cat".to_string(), "Dog".to_string()]);
        assert_eq!(model.type_for_discriminator("Cat", "Bird").unwrap().map(|e| e.name.as_str()), Some("Bird"));
    }

    #[test]
    fn unknown_types_are_invalid_operations() {
        let model = fixtures::model();
        let err = model.entity_type("Nope").unwrap_err();
        assert!(!err.is_translation_failure());
    }

    #[test]
    fn tph_derived_types_share_the_root_table() {
        let model = fixtures::model();
        assert_eq!(model.table_of("Dog").unwrap().map(|t| t.name), Some("Animals".to_string()));
    }
}
