use serde::{Deserialize, Serialize};

use crate::metadata::{TypeMapping, ValueComparer, ValueKind};

/// Scalar property of an entity or complex type.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Property {
    pub name: String,
    pub kind: ValueKind,
    /// Column name; defaults to the property name
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub store_type: Option<String>,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub comparer: ValueComparer,
    /// Name inside the JSON document when the declaring type is JSON-mapped
    #[serde(default)]
    pub json_name: Option<String>,
}

impl Property {
    pub fn new(name: &str, kind: ValueKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            column: None,
            store_type: None,
            nullable: false,
            comparer: ValueComparer::Default,
            json_name: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn column_name(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.name)
    }

    pub fn json_property_name(&self) -> &str {
        self.json_name.as_deref().unwrap_or(&self.name)
    }

    pub fn type_mapping(&self) -> TypeMapping {
        let store_type = self.store_type.clone()
            .unwrap_or_else(|| self.kind.default_store_type().to_string());
        TypeMapping { store_type, kind: self.kind, comparer: self.comparer }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn column_and_json_names_default_to_property_name() {
        let p: Property = serde_json::from_value(json!({ "name": "City", "kind": "String" })).unwrap();
        assert_eq!(p.column_name(), "City");
        assert_eq!(p.json_property_name(), "City");
        assert!(!p.nullable);
        assert_eq!(p.type_mapping().store_type, "text");
    }
}
