use ordered_float::NotNan;
use serde_json::Value;
use std::fmt::{self, Display};

use crate::{error::{QueryError, QueryResult}, metadata::ValueKind};

/// Constant carried by a `SqlExpr::Constant`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(NotNan<f64>),
    String(String),
    /// Serialized JSON document
    Json(String),
}

impl SqlValue {
    pub fn from_json(value: &Value) -> QueryResult<SqlValue> {
        Ok(match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Int(i),
                None => {
                    let f = n.as_f64()
                        .ok_or_else(|| QueryError::not_translated(format!("numeric constant {n} is out of range")))?;
                    SqlValue::Float(NotNan::new(f)
                        .map_err(|_| QueryError::not_translated("NaN constant"))?)
                }
            },
            Value::String(s) => SqlValue::String(s.clone()),
            Value::Array(_) | Value::Object(_) => SqlValue::Json(value.to_string()),
        })
    }

    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(_) => Some(ValueKind::Bool),
            SqlValue::Int(_) => Some(ValueKind::Int),
            SqlValue::Float(_) => Some(ValueKind::Float),
            SqlValue::String(_) => Some(ValueKind::String),
            SqlValue::Json(_) => Some(ValueKind::Json),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Bool(b) => write!(f, "{}", b),
            SqlValue::Int(i) => write!(f, "{}", i),
            SqlValue::Float(n) => write!(f, "{}", n.into_inner()),
            SqlValue::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            SqlValue::Json(s) => write!(f, "'{}'", s),
        }
    }
}

impl fmt::Debug for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "Null"),
            SqlValue::Bool(_) => write!(f, "Bool({})", self),
            SqlValue::Int(_) => write!(f, "Int({})", self),
            SqlValue::Float(_) => write!(f, "Float({})", self),
            SqlValue::String(_) => write!(f, "String({})", self),
            SqlValue::Json(_) => write!(f, "Json({})", self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn converts_json_constants() {
        assert_eq!(SqlValue::from_json(&json!(3)).unwrap(), SqlValue::Int(3));
        assert_eq!(SqlValue::from_json(&json!(2.5)).unwrap(), SqlValue::Float(NotNan::new(2.5).unwrap()));
        assert_eq!(SqlValue::from_json(&json!("x")).unwrap().as_str(), Some("x"));
        assert_eq!(SqlValue::from_json(&json!({"a": 1})).unwrap(), SqlValue::Json("{\"a\":1}".into()));
        assert!(SqlValue::from_json(&Value::Null).unwrap().is_null());
    }

    #[test]
    fn strings_display_quoted() {
        assert_eq!(SqlValue::String("O'Neil".into()).to_string(), "'O''Neil'");
    }
}
