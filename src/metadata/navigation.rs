use serde::{Deserialize, Serialize};

/// Foreign key backing a navigation.
///
/// `dependent_properties` live on the dependent (referencing) entity,
/// `principal_properties` on the principal (referenced) entity, positionally paired.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ForeignKey {
    pub dependent_properties: Vec<String>,
    pub principal_properties: Vec<String>,
    /// A required FK can never be null, so a dependent always has a principal
    #[serde(default)]
    pub required: bool,
}

/// Relationship between two entity types as seen from one side.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Navigation {
    pub name: String,
    pub target: String,
    #[serde(default)]
    pub is_collection: bool,
    /// `true` when the declaring type holds the foreign key
    #[serde(default)]
    pub on_dependent: bool,
    #[serde(default)]
    pub foreign_key: Option<ForeignKey>,
    /// Target is owned by the declaring type and loaded with it
    #[serde(default)]
    pub owned: bool,
    /// Owned target stored as a JSON document in this column of the owner
    #[serde(default)]
    pub json_column: Option<String>,
}

impl Navigation {
    pub fn is_json_mapped(&self) -> bool {
        self.json_column.is_some()
    }

    /// JSON property name of a nested JSON navigation (defaults to the navigation name).
    pub fn json_property_name(&self) -> &str {
        self.json_column.as_deref().unwrap_or(&self.name)
    }

    /// Key pairs as (declaring side property, target side property).
    pub fn key_pairs(&self) -> Vec<(String, String)> {
        let Some(fk) = &self.foreign_key else { return vec![] };
        let pairs = fk.dependent_properties.iter().zip(fk.principal_properties.iter());
        if self.on_dependent {
            pairs.map(|(d, p)| (d.clone(), p.clone())).collect()
        } else {
            pairs.map(|(d, p)| (p.clone(), d.clone())).collect()
        }
    }

    /// Whether the target is guaranteed to exist (dependent → principal over a required FK).
    pub fn is_required_reference(&self) -> bool {
        !self.is_collection && self.on_dependent && self.foreign_key.as_ref().map(|fk| fk.required).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_pairs_follow_navigation_direction() {
        let nav: Navigation = serde_json::from_value(json!({
            "name": "Orders", "target": "Order", "is_collection": true,
            "foreign_key": { "dependent_properties": ["CustomerId"], "principal_properties": ["Id"] }
        })).unwrap();
        assert_eq!(nav.key_pairs(), vec![("Id".to_string(), "CustomerId".to_string())]);
        assert!(!nav.is_required_reference());

        let inverse = Navigation { name: "Customer".into(), target: "Customer".into(), on_dependent: true, is_collection: false, ..nav };
        assert_eq!(inverse.key_pairs(), vec![("CustomerId".to_string(), "Id".to_string())]);
    }
}
