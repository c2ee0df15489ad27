use once_cell::sync::Lazy;
use std::{fmt, rc::Rc};

use crate::{
    metadata::{TypeMapping, ValueKind},
    sql::{BinaryOp, OrderBy, SelectExpression, SqlValue, TableId, UnaryOp}
};

/// Shared, immutable handle of a scalar expression.
///
/// Identity (`Rc::ptr_eq`) is meaningful: pushdown substitution keys on it.
pub type SqlExprRef = Rc<SqlExpr>;

static BOOL_MAPPING: Lazy<TypeMapping> = Lazy::new(TypeMapping::bool);
static INT_MAPPING: Lazy<TypeMapping> = Lazy::new(TypeMapping::int);

/// Reference to a column of a table source, through its handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnExpr {
    pub name: String,
    pub table: TableId,
    pub type_mapping: TypeMapping,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseWhen {
    pub test: SqlExprRef,
    pub result: SqlExprRef,
}

/// Right-hand side of an `IN`.
#[derive(Debug, Clone, PartialEq)]
pub enum InValues {
    List(Vec<SqlExprRef>),
    /// A collection-valued query parameter
    Parameter { name: String, element: Option<TypeMapping> },
    Subquery(Rc<SelectExpression>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JsonPathSegment {
    Property(String),
    Index(usize),
}

impl fmt::Display for JsonPathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsonPathSegment::Property(p) => write!(f, ".{}", p),
            JsonPathSegment::Index(i) => write!(f, "[{}]", i),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    Column(ColumnExpr),
    Constant { value: SqlValue, type_mapping: Option<TypeMapping> },
    Parameter { name: String, type_mapping: Option<TypeMapping>, nullable: bool },
    Unary { op: UnaryOp, operand: SqlExprRef, type_mapping: Option<TypeMapping> },
    Binary { op: BinaryOp, left: SqlExprRef, right: SqlExprRef, type_mapping: Option<TypeMapping> },
    Function {
        name: String,
        args: Vec<SqlExprRef>,
        nullable: bool,
        aggregate: bool,
        type_mapping: Option<TypeMapping>,
    },
    /// `DISTINCT` marker on an aggregate argument
    Distinct(SqlExprRef),
    Case {
        operand: Option<SqlExprRef>,
        when_clauses: Vec<CaseWhen>,
        else_result: Option<SqlExprRef>,
        type_mapping: Option<TypeMapping>,
    },
    Like { item: SqlExprRef, pattern: SqlExprRef, escape: Option<char> },
    Exists { subquery: Rc<SelectExpression>, negated: bool },
    In { item: SqlExprRef, values: InValues, negated: bool },
    ScalarSubquery { subquery: Rc<SelectExpression>, type_mapping: Option<TypeMapping> },
    RowNumber { partition_by: Vec<SqlExprRef>, orderings: Vec<OrderBy> },
    JsonScalar {
        json: SqlExprRef,
        path: Vec<JsonPathSegment>,
        type_mapping: Option<TypeMapping>,
        nullable: bool,
    },
    /// Raw text, e.g. `*` in `COUNT(*)`
    Fragment(String),
}

impl SqlExpr {
    pub fn column(name: &str, table: TableId, type_mapping: TypeMapping, nullable: bool) -> SqlExprRef {
        Rc::new(SqlExpr::Column(ColumnExpr { name: name.to_string(), table, type_mapping, nullable }))
    }

    pub fn constant(value: SqlValue, type_mapping: Option<TypeMapping>) -> SqlExprRef {
        let type_mapping = type_mapping.or_else(|| value.kind().map(TypeMapping::for_kind));
        Rc::new(SqlExpr::Constant { value, type_mapping })
    }

    pub fn null(type_mapping: Option<TypeMapping>) -> SqlExprRef {
        Rc::new(SqlExpr::Constant { value: SqlValue::Null, type_mapping })
    }

    pub fn bool_const(b: bool) -> SqlExprRef {
        Self::constant(SqlValue::Bool(b), Some(TypeMapping::bool()))
    }

    pub fn int(i: i64) -> SqlExprRef {
        Self::constant(SqlValue::Int(i), Some(TypeMapping::int()))
    }

    pub fn parameter(name: &str, type_mapping: Option<TypeMapping>, nullable: bool) -> SqlExprRef {
        Rc::new(SqlExpr::Parameter { name: name.to_string(), type_mapping, nullable })
    }

    pub fn fragment(text: &str) -> SqlExprRef {
        Rc::new(SqlExpr::Fragment(text.to_string()))
    }

    pub fn binary(op: BinaryOp, left: SqlExprRef, right: SqlExprRef) -> SqlExprRef {
        let type_mapping = if op.is_comparison() || op.is_logical() {
            Some(TypeMapping::bool())
        } else if op == BinaryOp::Concat {
            Some(TypeMapping::string())
        } else {
            left.type_mapping().or(right.type_mapping()).cloned()
        };
        Rc::new(SqlExpr::Binary { op, left, right, type_mapping })
    }

    pub fn equal(left: SqlExprRef, right: SqlExprRef) -> SqlExprRef {
        Self::binary(BinaryOp::Equal, left, right)
    }

    /// Equality where two nulls compare equal.
    pub fn null_safe_equal(left: SqlExprRef, right: SqlExprRef) -> SqlExprRef {
        if !(left.is_nullable() && right.is_nullable()) {
            return Self::equal(left, right);
        }
        Self::or(
            Self::equal(left.clone(), right.clone()),
            Self::binary(BinaryOp::And, Self::is_null(left), Self::is_null(right)),
        )
    }

    /// Inequality that holds when exactly one side is null.
    pub fn null_safe_not_equal(left: SqlExprRef, right: SqlExprRef) -> SqlExprRef {
        let not_equal = Self::binary(BinaryOp::NotEqual, left.clone(), right.clone());
        match (left.is_nullable(), right.is_nullable()) {
            (true, true) => Self::and(
                Self::or(Self::or(not_equal, Self::is_null(left.clone())), Self::is_null(right.clone())),
                Self::or(Self::is_not_null(left), Self::is_not_null(right)),
            ),
            (true, false) => Self::or(not_equal, Self::is_null(left)),
            (false, true) => Self::or(not_equal, Self::is_null(right)),
            (false, false) => not_equal,
        }
    }

    /// Negation of a predicate whose comparisons count as false when they
    /// read a null, so that the negation is true for those rows.
    pub fn null_safe_not(operand: SqlExprRef) -> SqlExprRef {
        match operand.as_ref() {
            SqlExpr::Binary { op: BinaryOp::Equal, left, right, .. } => {
                Self::null_safe_not_equal(left.clone(), right.clone())
            }
            SqlExpr::Binary { op: BinaryOp::And, left, right, .. } => {
                Self::or(Self::null_safe_not(left.clone()), Self::null_safe_not(right.clone()))
            }
            SqlExpr::Binary { op: BinaryOp::Or, left, right, .. } => {
                Self::and(Self::null_safe_not(left.clone()), Self::null_safe_not(right.clone()))
            }
            SqlExpr::Unary { op: UnaryOp::Not, operand: inner, .. } => inner.clone(),
            _ if operand.is_nullable() => Self::or(Self::not(operand.clone()), Self::is_null(operand)),
            _ => Self::not(operand),
        }
    }

    /// `AND` that drops constant `TRUE` operands.
    pub fn and(left: SqlExprRef, right: SqlExprRef) -> SqlExprRef {
        if left.is_true() {
            return right;
        }
        if right.is_true() {
            return left;
        }
        Self::binary(BinaryOp::And, left, right)
    }

    pub fn or(left: SqlExprRef, right: SqlExprRef) -> SqlExprRef {
        Self::binary(BinaryOp::Or, left, right)
    }

    /// Top-level `AND` operands of `expr`.
    pub fn conjuncts(expr: &SqlExprRef) -> Vec<SqlExprRef> {
        match expr.as_ref() {
            SqlExpr::Binary { op: BinaryOp::And, left, right, .. } => {
                let mut out = Self::conjuncts(left);
                out.extend(Self::conjuncts(right));
                out
            }
            _ => vec![expr.clone()],
        }
    }

    pub fn and_all(terms: impl IntoIterator<Item = SqlExprRef>) -> Option<SqlExprRef> {
        terms.into_iter().reduce(Self::and)
    }

    pub fn unary(op: UnaryOp, operand: SqlExprRef, type_mapping: Option<TypeMapping>) -> SqlExprRef {
        let type_mapping = match op {
            UnaryOp::Not | UnaryOp::IsNull | UnaryOp::IsNotNull => Some(TypeMapping::bool()),
            UnaryOp::Negate => type_mapping.or_else(|| operand.type_mapping().cloned()),
            UnaryOp::Convert => type_mapping,
        };
        Rc::new(SqlExpr::Unary { op, operand, type_mapping })
    }

    pub fn not(operand: SqlExprRef) -> SqlExprRef {
        if let SqlExpr::Unary { op: UnaryOp::Not, operand: inner, .. } = operand.as_ref() {
            return inner.clone();
        }
        Self::unary(UnaryOp::Not, operand, None)
    }

    pub fn is_null(operand: SqlExprRef) -> SqlExprRef {
        Self::unary(UnaryOp::IsNull, operand, None)
    }

    pub fn is_not_null(operand: SqlExprRef) -> SqlExprRef {
        Self::unary(UnaryOp::IsNotNull, operand, None)
    }

    pub fn convert(operand: SqlExprRef, type_mapping: TypeMapping) -> SqlExprRef {
        Self::unary(UnaryOp::Convert, operand, Some(type_mapping))
    }

    pub fn function(name: &str, args: Vec<SqlExprRef>, nullable: bool, type_mapping: Option<TypeMapping>) -> SqlExprRef {
        Rc::new(SqlExpr::Function { name: name.to_string(), args, nullable, aggregate: false, type_mapping })
    }

    pub fn aggregate(name: &str, args: Vec<SqlExprRef>, nullable: bool, type_mapping: Option<TypeMapping>) -> SqlExprRef {
        Rc::new(SqlExpr::Function { name: name.to_string(), args, nullable, aggregate: true, type_mapping })
    }

    pub fn count_star() -> SqlExprRef {
        Self::aggregate("COUNT", vec![Self::fragment("*")], false, Some(TypeMapping::int()))
    }

    pub fn case(
        operand: Option<SqlExprRef>,
        when_clauses: Vec<CaseWhen>,
        else_result: Option<SqlExprRef>,
    ) -> SqlExprRef {
        let type_mapping = when_clauses.iter()
            .find_map(|w| w.result.type_mapping().cloned())
            .or_else(|| else_result.as_ref().and_then(|e| e.type_mapping().cloned()));
        Rc::new(SqlExpr::Case { operand, when_clauses, else_result, type_mapping })
    }

    pub fn like(item: SqlExprRef, pattern: SqlExprRef, escape: Option<char>) -> SqlExprRef {
        Rc::new(SqlExpr::Like { item, pattern, escape })
    }

    pub fn exists(subquery: SelectExpression, negated: bool) -> SqlExprRef {
        Rc::new(SqlExpr::Exists { subquery: Rc::new(subquery), negated })
    }

    /// `item IN (values)`; an empty list matches no row.
    pub fn in_values(item: SqlExprRef, values: InValues, negated: bool) -> SqlExprRef {
        if matches!(&values, InValues::List(list) if list.is_empty()) {
            return Self::bool_const(negated);
        }
        Rc::new(SqlExpr::In { item, values, negated })
    }

    pub fn scalar_subquery(subquery: SelectExpression) -> SqlExprRef {
        let type_mapping = subquery.projection.first().and_then(|p| p.expr.type_mapping().cloned());
        Rc::new(SqlExpr::ScalarSubquery { subquery: Rc::new(subquery), type_mapping })
    }

    pub fn row_number(partition_by: Vec<SqlExprRef>, orderings: Vec<OrderBy>) -> SqlExprRef {
        Rc::new(SqlExpr::RowNumber { partition_by, orderings })
    }

    pub fn json_scalar(json: SqlExprRef, path: Vec<JsonPathSegment>, type_mapping: Option<TypeMapping>, nullable: bool) -> SqlExprRef {
        Rc::new(SqlExpr::JsonScalar { json, path, type_mapping, nullable })
    }

    pub fn type_mapping(&self) -> Option<&TypeMapping> {
        match self {
            SqlExpr::Column(c) => Some(&c.type_mapping),
            SqlExpr::Constant { type_mapping, .. }
            | SqlExpr::Parameter { type_mapping, .. }
            | SqlExpr::Unary { type_mapping, .. }
            | SqlExpr::Binary { type_mapping, .. }
            | SqlExpr::Function { type_mapping, .. }
            | SqlExpr::Case { type_mapping, .. }
            | SqlExpr::ScalarSubquery { type_mapping, .. }
            | SqlExpr::JsonScalar { type_mapping, .. } => type_mapping.as_ref(),
            SqlExpr::Distinct(inner) => inner.type_mapping(),
            SqlExpr::Like { .. } | SqlExpr::Exists { .. } | SqlExpr::In { .. } => Some(&BOOL_MAPPING),
            SqlExpr::RowNumber { .. } => Some(&INT_MAPPING),
            SqlExpr::Fragment(_) => None,
        }
    }

    pub fn kind(&self) -> Option<ValueKind> {
        self.type_mapping().map(|m| m.kind)
    }

    pub fn is_nullable(&self) -> bool {
        match self {
            SqlExpr::Column(c) => c.nullable,
            SqlExpr::Constant { value, .. } => value.is_null(),
            SqlExpr::Parameter { nullable, .. } => *nullable,
            SqlExpr::Unary { op, operand, .. } => match op {
                UnaryOp::IsNull | UnaryOp::IsNotNull => false,
                _ => operand.is_nullable(),
            },
            SqlExpr::Binary { left, right, .. } => left.is_nullable() || right.is_nullable(),
            SqlExpr::Function { nullable, .. } => *nullable,
            SqlExpr::Distinct(inner) => inner.is_nullable(),
            SqlExpr::Case { when_clauses, else_result, .. } => {
                when_clauses.iter().any(|w| w.result.is_nullable())
                    || else_result.as_ref().map(|e| e.is_nullable()).unwrap_or(true)
            }
            SqlExpr::Like { item, pattern, .. } => item.is_nullable() || pattern.is_nullable(),
            SqlExpr::Exists { .. } => false,
            SqlExpr::In { item, .. } => item.is_nullable(),
            SqlExpr::ScalarSubquery { .. } => true,
            SqlExpr::RowNumber { .. } => false,
            SqlExpr::JsonScalar { nullable, .. } => *nullable,
            SqlExpr::Fragment(_) => false,
        }
    }

    pub fn as_column(&self) -> Option<&ColumnExpr> {
        match self {
            SqlExpr::Column(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_column(&self) -> bool {
        matches!(self, SqlExpr::Column(_))
    }

    pub fn is_true(&self) -> bool {
        matches!(self, SqlExpr::Constant { value: SqlValue::Bool(true), .. })
    }

    pub fn is_null_constant(&self) -> bool {
        matches!(self, SqlExpr::Constant { value: SqlValue::Null, .. })
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, SqlExpr::Function { aggregate: true, .. })
    }

    /// Copy with the expression's own value marked nullable (outer-joined columns).
    pub fn make_nullable(expr: &SqlExprRef) -> SqlExprRef {
        match expr.as_ref() {
            SqlExpr::Column(c) if !c.nullable => Rc::new(SqlExpr::Column(ColumnExpr { nullable: true, ..c.clone() })),
            SqlExpr::JsonScalar { json, path, type_mapping, nullable: false } => Rc::new(SqlExpr::JsonScalar {
                json: Self::make_nullable(json),
                path: path.clone(),
                type_mapping: type_mapping.clone(),
                nullable: true,
            }),
            _ => expr.clone(),
        }
    }

    /// Same expression with `type_mapping` applied when it has none (constants and parameters).
    pub fn with_inferred_mapping(expr: &SqlExprRef, type_mapping: Option<&TypeMapping>) -> SqlExprRef {
        let Some(tm) = type_mapping else { return expr.clone() };
        match expr.as_ref() {
            SqlExpr::Constant { value, type_mapping: None } =>
                Rc::new(SqlExpr::Constant { value: value.clone(), type_mapping: Some(tm.clone()) }),
            SqlExpr::Constant { value, type_mapping: Some(existing) } if existing.kind == tm.kind && existing != tm =>
                Rc::new(SqlExpr::Constant { value: value.clone(), type_mapping: Some(tm.clone()) }),
            SqlExpr::Parameter { name, type_mapping: None, nullable } =>
                Rc::new(SqlExpr::Parameter { name: name.clone(), type_mapping: Some(tm.clone()), nullable: *nullable }),
            _ => expr.clone(),
        }
    }
}

impl fmt::Display for SqlExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlExpr::Column(c) => write!(f, "{}.{}", c.table, c.name),
            SqlExpr::Constant { value, .. } => write!(f, "{}", value),
            SqlExpr::Parameter { name, .. } => write!(f, "@{}", name),
            SqlExpr::Unary { op, operand, type_mapping } => match op {
                UnaryOp::Not => write!(f, "NOT ({})", operand),
                UnaryOp::Negate => write!(f, "-({})", operand),
                UnaryOp::IsNull => write!(f, "{} IS NULL", operand),
                UnaryOp::IsNotNull => write!(f, "{} IS NOT NULL", operand),
                UnaryOp::Convert => write!(
                    f,
                    "CAST({} AS {})",
                    operand,
                    type_mapping.as_ref().map(|t| t.store_type.as_str()).unwrap_or("?")
                ),
            },
            SqlExpr::Binary { op, left, right, .. } => write!(f, "({} {} {})", left, op, right),
            SqlExpr::Function { name, args, .. } => {
                write!(f, "{}(", name)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            SqlExpr::Distinct(inner) => write!(f, "DISTINCT {}", inner),
            SqlExpr::Case { operand, when_clauses, else_result, .. } => {
                write!(f, "CASE")?;
                if let Some(o) = operand { write!(f, " {}", o)?; }
                for w in when_clauses {
                    write!(f, " WHEN {} THEN {}", w.test, w.result)?;
                }
                if let Some(e) = else_result { write!(f, " ELSE {}", e)?; }
                write!(f, " END")
            }
            SqlExpr::Like { item, pattern, escape } => {
                write!(f, "{} LIKE {}", item, pattern)?;
                if let Some(e) = escape { write!(f, " ESCAPE '{}'", e)?; }
                Ok(())
            }
            SqlExpr::Exists { negated, .. } => write!(f, "{}EXISTS (<subquery>)", if *negated { "NOT " } else { "" }),
            SqlExpr::In { item, values, negated } => {
                write!(f, "{} {}IN ", item, if *negated { "NOT " } else { "" })?;
                match values {
                    InValues::List(list) => {
                        write!(f, "(")?;
                        for (i, v) in list.iter().enumerate() {
                            if i > 0 { write!(f, ", ")?; }
                            write!(f, "{}", v)?;
                        }
                        write!(f, ")")
                    }
                    InValues::Parameter { name, .. } => write!(f, "(@{})", name),
                    InValues::Subquery(_) => write!(f, "(<subquery>)"),
                }
            }
            SqlExpr::ScalarSubquery { .. } => write!(f, "(<scalar subquery>)"),
            SqlExpr::RowNumber { partition_by, orderings } => {
                write!(f, "ROW_NUMBER() OVER(")?;
                if !partition_by.is_empty() {
                    write!(f, "PARTITION BY ")?;
                    for (i, p) in partition_by.iter().enumerate() {
                        if i > 0 { write!(f, ", ")?; }
                        write!(f, "{}", p)?;
                    }
                }
                if !orderings.is_empty() {
                    write!(f, " ORDER BY ")?;
                    for (i, o) in orderings.iter().enumerate() {
                        if i > 0 { write!(f, ", ")?; }
                        write!(f, "{}", o)?;
                    }
                }
                write!(f, ")")
            }
            SqlExpr::JsonScalar { json, path, .. } => {
                write!(f, "JSON_VALUE({}, '$", json)?;
                for p in path { write!(f, "{}", p)?; }
                write!(f, "')")
            }
            SqlExpr::Fragment(text) => write!(f, "{}", text),
        }
    }
}
