//! Failure classes of query translation.
//!
//! Two kinds of failure exist and they must never be confused:
//! - **Translation failures** (`NotTranslated`, `UnsupportedOperator`,
//!   `UnsupportedMember`, `UnsupportedMethod`): the requested operator or
//!   expression has no relational form. The caller decides whether to evaluate
//!   on the client or report the failure to the user.
//! - **Invalid operations** (`InvalidOperation`): the translator reached a state
//!   its invariants declare impossible. These are bugs in the caller or in the
//!   engine and are propagated as-is.

/// Error returned by every fallible operation of the engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    /// The expression could not be translated; `detail` explains why when known.
    #[error("the query could not be translated{}", .detail.as_ref().map(|d| format!(": {d}")).unwrap_or_default())]
    NotTranslated { detail: Option<String> },

    /// A query operator (or operator combination) has no translation.
    #[error("operator '{operator}' could not be translated{}", .detail.as_ref().map(|d| format!(": {d}")).unwrap_or_default())]
    UnsupportedOperator { operator: String, detail: Option<String> },

    /// Member access on a value that does not map to the store.
    #[error("member '{member}' on '{target}' could not be translated")]
    UnsupportedMember { member: String, target: String },

    /// Method call with no SQL equivalent.
    #[error("method '{method}' could not be translated")]
    UnsupportedMethod { method: String },

    /// Invariant violation. Never downgraded to a translation failure.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl QueryError {
    pub fn not_translated(detail: impl Into<String>) -> Self {
        QueryError::NotTranslated { detail: Some(detail.into()) }
    }

    pub fn unsupported_operator(operator: impl Into<String>, detail: Option<String>) -> Self {
        QueryError::UnsupportedOperator { operator: operator.into(), detail }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        QueryError::InvalidOperation(message.into())
    }

    /// Whether the caller may recover (e.g. by evaluating on the client).
    pub fn is_translation_failure(&self) -> bool {
        !matches!(self, QueryError::InvalidOperation(_))
    }

    pub fn err<T>(self) -> Result<T, QueryError> {
        Err(self)
    }
}

pub type QueryResult<T> = Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_failures_are_recoverable() {
        assert!(QueryError::not_translated("x").is_translation_failure());
        assert!(QueryError::UnsupportedMethod { method: "Foo".into() }.is_translation_failure());
        assert!(!QueryError::invalid("boom").is_translation_failure());
    }

    #[test]
    fn messages_carry_detail() {
        let e = QueryError::unsupported_operator("Last", Some("no ordering".into()));
        assert_eq!(e.to_string(), "operator 'Last' could not be translated: no ordering");

        let e = QueryError::NotTranslated { detail: None };
        assert_eq!(e.to_string(), "the query could not be translated");
    }
}
