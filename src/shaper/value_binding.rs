use indexmap::IndexMap;

use crate::{
    metadata::ValueComparer,
    sql::{JsonPathSegment, ProjectionMember},
    structural::StructuralKind
};

/// Where the shaper reads a value from.
///
/// `Member` and `Client` address the projection of a select still under
/// construction; finalization replaces them by positional bindings.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueBinding {
    Member(ProjectionMember),
    Client(usize),
    /// Column position in the finalized projection
    Index { index: usize, nullable: bool },
    Structural(StructuralBinding),
    Json(JsonBinding),
}

impl ValueBinding {
    pub fn is_positional(&self) -> bool {
        !matches!(self, ValueBinding::Member(_) | ValueBinding::Client(_))
    }

    pub fn as_index(&self) -> Option<usize> {
        match self {
            ValueBinding::Index { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// Column positions of an entity or complex-type instance.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuralBinding {
    pub entity_type: String,
    pub kind: StructuralKind,
    pub properties: IndexMap<String, usize>,
    /// Complex properties and navigations already part of the row
    pub nested: IndexMap<String, ValueBinding>,
    /// Column holding the concrete type's discriminator value
    pub discriminator: Option<usize>,
    pub nullable: bool,
}

/// Column position of a JSON document and the path to the mapped value inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonBinding {
    pub column: usize,
    pub entity_type: String,
    pub path: Vec<JsonPathSegment>,
    pub is_collection: bool,
    pub nullable: bool,
    pub keys: IndexMap<String, usize>,
}

/// One identifying value of a row and how to compare it.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifierBinding {
    pub binding: ValueBinding,
    pub comparer: ValueComparer,
}

impl IdentifierBinding {
    pub fn new(binding: ValueBinding, comparer: ValueComparer) -> Self {
        Self { binding, comparer }
    }
}
