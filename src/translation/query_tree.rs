use serde_json::Value;

use crate::{metadata::ValueKind, sql::BinaryOp};

/// Anonymous function argument of an operator (`c => c.Name`).
#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    pub params: Vec<String>,
    pub body: ClientExpr,
}

impl Lambda {
    pub fn new(params: &[&str], body: ClientExpr) -> Self {
        Self { params: params.iter().map(|p| p.to_string()).collect(), body }
    }
}

/// Expression of the source language, already parsed and bound by the front end.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientExpr {
    Constant(Value),
    /// Query parameter (a captured client variable)
    Parameter(String),
    /// Lambda parameter or range variable
    Var(String),
    Member { target: Box<ClientExpr>, name: String },
    Binary { op: BinaryOp, left: Box<ClientExpr>, right: Box<ClientExpr> },
    Not(Box<ClientExpr>),
    Negate(Box<ClientExpr>),
    /// `left ?? right`
    Coalesce(Box<ClientExpr>, Box<ClientExpr>),
    Conditional { test: Box<ClientExpr>, if_true: Box<ClientExpr>, if_false: Box<ClientExpr> },
    /// Instance method when `target` is set, static function otherwise
    MethodCall { target: Option<Box<ClientExpr>>, method: String, args: Vec<ClientExpr> },
    /// Anonymous object construction
    New(Vec<(String, ClientExpr)>),
    /// `operand is T`
    TypeIs { operand: Box<ClientExpr>, entity_type: String },
    /// `operand as T` or `(T)operand` on an entity
    TypeAs { operand: Box<ClientExpr>, entity_type: String },
    /// Scalar conversion
    Convert { operand: Box<ClientExpr>, kind: ValueKind },
    Like { item: Box<ClientExpr>, pattern: Box<ClientExpr> },
    /// Nested query used as a value
    Subquery(Box<Query>),
}

impl ClientExpr {
    pub fn constant(value: impl Into<Value>) -> Self {
        ClientExpr::Constant(value.into())
    }

    pub fn null() -> Self {
        ClientExpr::Constant(Value::Null)
    }

    pub fn param(name: &str) -> Self {
        ClientExpr::Parameter(name.to_string())
    }

    pub fn var(name: &str) -> Self {
        ClientExpr::Var(name.to_string())
    }

    pub fn member(self, name: &str) -> Self {
        ClientExpr::Member { target: Box::new(self), name: name.to_string() }
    }

    /// `var.a.b.c`
    pub fn path(var: &str, members: &[&str]) -> Self {
        members.iter().fold(Self::var(var), |e, m| e.member(m))
    }

    pub fn binary(op: BinaryOp, left: ClientExpr, right: ClientExpr) -> Self {
        ClientExpr::Binary { op, left: Box::new(left), right: Box::new(right) }
    }

    pub fn eq(self, other: ClientExpr) -> Self {
        Self::binary(BinaryOp::Equal, self, other)
    }

    pub fn ne(self, other: ClientExpr) -> Self {
        Self::binary(BinaryOp::NotEqual, self, other)
    }

    pub fn gt(self, other: ClientExpr) -> Self {
        Self::binary(BinaryOp::GreaterThan, self, other)
    }

    pub fn lt(self, other: ClientExpr) -> Self {
        Self::binary(BinaryOp::LessThan, self, other)
    }

    pub fn and(self, other: ClientExpr) -> Self {
        Self::binary(BinaryOp::And, self, other)
    }

    pub fn or(self, other: ClientExpr) -> Self {
        Self::binary(BinaryOp::Or, self, other)
    }

    pub fn add(self, other: ClientExpr) -> Self {
        Self::binary(BinaryOp::Add, self, other)
    }

    pub fn not(self) -> Self {
        ClientExpr::Not(Box::new(self))
    }

    pub fn call(self, method: &str, args: Vec<ClientExpr>) -> Self {
        ClientExpr::MethodCall { target: Some(Box::new(self)), method: method.to_string(), args }
    }

    pub fn function(method: &str, args: Vec<ClientExpr>) -> Self {
        ClientExpr::MethodCall { target: None, method: method.to_string(), args }
    }

    pub fn new_object(members: Vec<(&str, ClientExpr)>) -> Self {
        ClientExpr::New(members.into_iter().map(|(n, e)| (n.to_string(), e)).collect())
    }

    pub fn subquery(query: Query) -> Self {
        ClientExpr::Subquery(Box::new(query))
    }
}

/// Source of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryRoot {
    /// All entities of a type (and its derived types)
    Entity(String),
    /// Raw SQL returning rows of an entity type
    FromSql { entity_type: String, sql: String, args: Vec<ClientExpr> },
    /// Inline scalar rows
    Values(Vec<Value>),
    /// Elements of a collection-valued query parameter
    ParameterCollection { name: String, element: ValueKind },
    /// Collection navigation of an enclosing query's value (`c.Orders`)
    Navigation { source: Box<ClientExpr>, navigation: String },
    /// Elements of a group produced by `GroupBy` (`g.Where(...)`)
    Grouping(Box<ClientExpr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOp {
    Where(Lambda),
    Select(Lambda),
    /// `collection` yields a nested query per element; `result` combines both
    SelectMany { collection: Lambda, result: Option<Lambda> },
    Join { inner: Box<Query>, outer_key: Lambda, inner_key: Lambda, result: Lambda },
    LeftJoin { inner: Box<Query>, outer_key: Lambda, inner_key: Lambda, result: Lambda },
    GroupBy { key: Lambda, element: Option<Lambda> },
    OrderBy { key: Lambda, descending: bool },
    ThenBy { key: Lambda, descending: bool },
    Reverse,
    Skip(ClientExpr),
    Take(ClientExpr),
    Distinct,
    Union(Box<Query>),
    Concat(Box<Query>),
    Intersect(Box<Query>),
    Except(Box<Query>),
    Any(Option<Lambda>),
    All(Lambda),
    Contains(ClientExpr),
    Count(Option<Lambda>),
    LongCount(Option<Lambda>),
    Sum(Option<Lambda>),
    Average(Option<Lambda>),
    Min(Option<Lambda>),
    Max(Option<Lambda>),
    First { predicate: Option<Lambda>, or_default: bool },
    Single { predicate: Option<Lambda>, or_default: bool },
    Last { predicate: Option<Lambda>, or_default: bool },
    ElementAt { index: ClientExpr, or_default: bool },
    DefaultIfEmpty,
    OfType(String),
    Cast(String),
    /// `Include` plus `ThenInclude` path; `filter` narrows the last navigation
    Include { path: Vec<String>, filter: Vec<QueryOp> },
    AsSplitQuery,
    AsSingleQuery,
}

impl QueryOp {
    pub fn name(&self) -> &'static str {
        match self {
            QueryOp::Where(_) => "Where",
            QueryOp::Select(_) => "Select",
            QueryOp::SelectMany { .. } => "SelectMany",
            QueryOp::Join { .. } => "Join",
            QueryOp::LeftJoin { .. } => "LeftJoin",
            QueryOp::GroupBy { .. } => "GroupBy",
            QueryOp::OrderBy { .. } => "OrderBy",
            QueryOp::ThenBy { .. } => "ThenBy",
            QueryOp::Reverse => "Reverse",
            QueryOp::Skip(_) => "Skip",
            QueryOp::Take(_) => "Take",
            QueryOp::Distinct => "Distinct",
            QueryOp::Union(_) => "Union",
            QueryOp::Concat(_) => "Concat",
            QueryOp::Intersect(_) => "Intersect",
            QueryOp::Except(_) => "Except",
            QueryOp::Any(_) => "Any",
            QueryOp::All(_) => "All",
            QueryOp::Contains(_) => "Contains",
            QueryOp::Count(_) => "Count",
            QueryOp::LongCount(_) => "LongCount",
            QueryOp::Sum(_) => "Sum",
            QueryOp::Average(_) => "Average",
            QueryOp::Min(_) => "Min",
            QueryOp::Max(_) => "Max",
            QueryOp::First { .. } => "First",
            QueryOp::Single { .. } => "Single",
            QueryOp::Last { .. } => "Last",
            QueryOp::ElementAt { .. } => "ElementAt",
            QueryOp::DefaultIfEmpty => "DefaultIfEmpty",
            QueryOp::OfType(_) => "OfType",
            QueryOp::Cast(_) => "Cast",
            QueryOp::Include { .. } => "Include",
            QueryOp::AsSplitQuery => "AsSplitQuery",
            QueryOp::AsSingleQuery => "AsSingleQuery",
        }
    }

    /// Operators allowed inside a filtered include.
    pub fn is_include_filter(&self) -> bool {
        matches!(
            self,
            QueryOp::Where(_) | QueryOp::OrderBy { .. } | QueryOp::ThenBy { .. } | QueryOp::Skip(_) | QueryOp::Take(_)
        )
    }

    /// Operators producing a single value; nothing may follow them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryOp::Any(_) | QueryOp::All(_) | QueryOp::Contains(_)
                | QueryOp::Count(_) | QueryOp::LongCount(_)
                | QueryOp::Sum(_) | QueryOp::Average(_) | QueryOp::Min(_) | QueryOp::Max(_)
                | QueryOp::First { .. } | QueryOp::Single { .. } | QueryOp::Last { .. }
                | QueryOp::ElementAt { .. }
        )
    }
}

/// A chain of operators applied to a root.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub root: QueryRoot,
    pub operators: Vec<QueryOp>,
}

impl Query {
    pub fn new(root: QueryRoot) -> Self {
        Self { root, operators: Vec::new() }
    }

    pub fn entity(name: &str) -> Self {
        Self::new(QueryRoot::Entity(name.to_string()))
    }

    /// Collection navigation of `source` as a nested query root.
    pub fn navigation(source: ClientExpr, navigation: &str) -> Self {
        Self::new(QueryRoot::Navigation { source: Box::new(source), navigation: navigation.to_string() })
    }

    pub fn grouping(source: ClientExpr) -> Self {
        Self::new(QueryRoot::Grouping(Box::new(source)))
    }

    pub fn then(mut self, op: QueryOp) -> Self {
        self.operators.push(op);
        self
    }

    pub fn filter(self, param: &str, body: ClientExpr) -> Self {
        self.then(QueryOp::Where(Lambda::new(&[param], body)))
    }

    pub fn select(self, param: &str, body: ClientExpr) -> Self {
        self.then(QueryOp::Select(Lambda::new(&[param], body)))
    }

    pub fn order_by(self, param: &str, key: ClientExpr) -> Self {
        self.then(QueryOp::OrderBy { key: Lambda::new(&[param], key), descending: false })
    }

    pub fn order_by_descending(self, param: &str, key: ClientExpr) -> Self {
        self.then(QueryOp::OrderBy { key: Lambda::new(&[param], key), descending: true })
    }

    pub fn skip(self, n: i64) -> Self {
        self.then(QueryOp::Skip(ClientExpr::constant(n)))
    }

    pub fn take(self, n: i64) -> Self {
        self.then(QueryOp::Take(ClientExpr::constant(n)))
    }

    pub fn include(self, path: &[&str]) -> Self {
        self.then(QueryOp::Include { path: path.iter().map(|p| p.to_string()).collect(), filter: Vec::new() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_compose_member_chains() {
        let e = ClientExpr::path("o", &["Customer", "Name"]);
        let ClientExpr::Member { target, name } = &e else { panic!("expected member") };
        assert_eq!(name, "Name");
        assert_eq!(**target, ClientExpr::var("o").member("Customer"));
    }

    #[test]
    fn terminal_and_filter_operators() {
        assert!(QueryOp::Count(None).is_terminal());
        assert!(!QueryOp::Distinct.is_terminal());
        assert!(QueryOp::Take(ClientExpr::constant(1)).is_include_filter());
        assert!(!QueryOp::Distinct.is_include_filter());
        assert_eq!(QueryOp::AsSplitQuery.name(), "AsSplitQuery");
    }
}
