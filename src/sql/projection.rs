use std::fmt;

use crate::sql::SqlExprRef;

/// One entry of a frozen, positional projection.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionExpr {
    pub expr: SqlExprRef,
    pub alias: String,
}

impl ProjectionExpr {
    pub fn new(expr: SqlExprRef, alias: impl Into<String>) -> Self {
        Self { expr, alias: alias.into() }
    }
}

impl fmt::Display for ProjectionExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} AS {}", self.expr, self.alias)
    }
}

/// Path through anonymous-object construction that names one projected value,
/// e.g. `["Outer", "Customer"]`. The empty path is the whole projection.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectionMember(Vec<String>);

impl ProjectionMember {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn of(name: &str) -> Self {
        Self(vec![name.to_string()])
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(|s| s.as_str())
    }

    pub fn append(&self, name: &str) -> Self {
        let mut v = self.0.clone();
        v.push(name.to_string());
        Self(v)
    }

    pub fn prepend(&self, name: &str) -> Self {
        let mut v = Vec::with_capacity(self.0.len() + 1);
        v.push(name.to_string());
        v.extend(self.0.iter().cloned());
        Self(v)
    }

    /// Whether `self` starts with `other`.
    pub fn starts_with(&self, other: &ProjectionMember) -> bool {
        self.0.starts_with(&other.0)
    }

    /// Name used for the column alias of this member.
    pub fn alias_hint(&self) -> &str {
        self.last().unwrap_or("c")
    }
}

impl fmt::Display for ProjectionMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "<root>")
        } else {
            write!(f, "{}", self.0.join("."))
        }
    }
}

impl fmt::Debug for ProjectionMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Member({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_paths() {
        let m = ProjectionMember::of("Name");
        assert_eq!(m.prepend("Outer").to_string(), "Outer.Name");
        assert_eq!(m.append("First").segments().len(), 2);
        assert!(m.prepend("Outer").starts_with(&ProjectionMember::of("Outer")));
        assert_eq!(ProjectionMember::root().alias_hint(), "c");
    }
}
