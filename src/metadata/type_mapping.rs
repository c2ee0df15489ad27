use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coarse CLR-side classification of a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    Decimal,
    String,
    DateTime,
    Guid,
    Binary,
    /// A JSON document stored in a single column
    Json,
}

impl ValueKind {
    /// Classify a `serde_json::Value` constant.
    ///
    /// `Null` carries no kind; callers infer it from the other operand.
    pub fn of_value(v: &Value) -> Option<ValueKind> {
        match v {
            Value::Null => None,
            Value::Bool(_) => Some(ValueKind::Bool),
            Value::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    Some(ValueKind::Int)
                } else {
                    Some(ValueKind::Float)
                }
            }
            Value::String(_) => Some(ValueKind::String),
            Value::Array(_) | Value::Object(_) => Some(ValueKind::Json),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ValueKind::Int | ValueKind::Float | ValueKind::Decimal)
    }

    /// Store type used when the model does not name one.
    pub fn default_store_type(&self) -> &'static str {
        match self {
            ValueKind::Bool => "boolean",
            ValueKind::Int => "integer",
            ValueKind::Float => "real",
            ValueKind::Decimal => "decimal(18,2)",
            ValueKind::String => "text",
            ValueKind::DateTime => "timestamp",
            ValueKind::Guid => "uuid",
            ValueKind::Binary => "blob",
            ValueKind::Json => "json",
        }
    }
}

/// Equality semantics used when comparing values of a column.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ValueComparer {
    #[default]
    Default,
    CaseInsensitive,
    /// Byte-wise structural comparison (arrays, blobs)
    Bytes,
}

/// Physical type of a value plus the comparer used for equality and ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TypeMapping {
    pub store_type: String,
    pub kind: ValueKind,
    #[serde(default)]
    pub comparer: ValueComparer,
}

impl TypeMapping {
    pub fn new(store_type: impl Into<String>, kind: ValueKind) -> Self {
        Self { store_type: store_type.into(), kind, comparer: ValueComparer::Default }
    }

    pub fn for_kind(kind: ValueKind) -> Self {
        Self::new(kind.default_store_type(), kind)
    }

    pub fn bool() -> Self { Self::for_kind(ValueKind::Bool) }
    pub fn int() -> Self { Self::for_kind(ValueKind::Int) }
    pub fn float() -> Self { Self::for_kind(ValueKind::Float) }
    pub fn string() -> Self { Self::for_kind(ValueKind::String) }
    pub fn json() -> Self { Self::for_kind(ValueKind::Json) }

    pub fn with_comparer(mut self, comparer: ValueComparer) -> Self {
        self.comparer = comparer;
        self
    }
}
