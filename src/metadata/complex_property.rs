use serde::{Deserialize, Serialize};

use crate::metadata::Property;

/// A value object without identity, stored inline in its owner's table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ComplexType {
    pub name: String,
    #[serde(default)]
    pub properties: Vec<Property>,
    #[serde(default)]
    pub complex_properties: Vec<ComplexProperty>,
}

/// Property whose value is a complex type.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ComplexProperty {
    pub name: String,
    pub complex_type: String,
    #[serde(default)]
    pub nullable: bool,
    /// Column prefix of the inlined properties; defaults to `{name}_`
    #[serde(default)]
    pub column_prefix: Option<String>,
    #[serde(default)]
    pub json_column: Option<String>,
}

impl ComplexProperty {
    pub fn prefix(&self) -> String {
        self.column_prefix.clone().unwrap_or_else(|| format!("{}_", self.name))
    }
}
