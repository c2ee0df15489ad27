use serde::{Deserialize, Serialize};

use crate::metadata::{ComplexProperty, Navigation, Property};

/// How an inheritance hierarchy is spread over tables. Declared on the root type.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum InheritanceStrategy {
    /// Table per hierarchy: one table, discriminator column
    #[default]
    Tph,
    /// Table per type: one table per type, joined on the key
    Tpt,
    /// Table per concrete type: one full table per non-abstract type
    Tpc,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TableMapping {
    pub name: String,
    #[serde(default)]
    pub schema: Option<String>,
}

impl TableMapping {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), schema: None }
    }
}

/// An entity type as declared in the model. Only the declared members are
/// stored here; `Model` resolves inherited ones.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EntityType {
    pub name: String,
    #[serde(default)]
    pub base_type: Option<String>,
    #[serde(default)]
    pub table: Option<TableMapping>,
    #[serde(default)]
    pub is_abstract: bool,
    /// Primary key property names, declared on the hierarchy root
    #[serde(default)]
    pub key: Vec<String>,
    #[serde(default)]
    pub properties: Vec<Property>,
    #[serde(default)]
    pub navigations: Vec<Navigation>,
    #[serde(default)]
    pub complex_properties: Vec<ComplexProperty>,
    #[serde(default)]
    pub discriminator_property: Option<String>,
    #[serde(default)]
    pub discriminator_value: Option<String>,
    #[serde(default)]
    pub strategy: InheritanceStrategy,
    /// Owned types are only reachable through their owner
    #[serde(default)]
    pub owned: bool,
}

impl EntityType {
    pub fn find_declared_property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn find_declared_navigation(&self, name: &str) -> Option<&Navigation> {
        self.navigations.iter().find(|n| n.name == name)
    }

    pub fn find_declared_complex_property(&self, name: &str) -> Option<&ComplexProperty> {
        self.complex_properties.iter().find(|c| c.name == name)
    }
}
