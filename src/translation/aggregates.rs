use crate::{
    error::{QueryError, QueryResult},
    metadata::{TypeMapping, ValueKind},
    sql::{CaseWhen, SqlExpr, SqlExprRef, SqlValue},
    translation::{Lambda, QueryOp}
};

/// Aggregate operators with a SQL aggregate function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Count,
    LongCount,
    Sum,
    Average,
    Min,
    Max,
}

impl AggregateKind {
    /// The aggregate `op` applies, with its lambda (predicate for counts, selector otherwise).
    pub fn of(op: &QueryOp) -> Option<(AggregateKind, Option<&Lambda>)> {
        Some(match op {
            QueryOp::Count(l) => (AggregateKind::Count, l.as_ref()),
            QueryOp::LongCount(l) => (AggregateKind::LongCount, l.as_ref()),
            QueryOp::Sum(l) => (AggregateKind::Sum, l.as_ref()),
            QueryOp::Average(l) => (AggregateKind::Average, l.as_ref()),
            QueryOp::Min(l) => (AggregateKind::Min, l.as_ref()),
            QueryOp::Max(l) => (AggregateKind::Max, l.as_ref()),
            _ => return None,
        })
    }

    pub fn is_count(&self) -> bool {
        matches!(self, AggregateKind::Count | AggregateKind::LongCount)
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggregateKind::Count => "Count",
            AggregateKind::LongCount => "LongCount",
            AggregateKind::Sum => "Sum",
            AggregateKind::Average => "Average",
            AggregateKind::Min => "Min",
            AggregateKind::Max => "Max",
        }
    }

    /// Aggregate over `arg`; `None` counts rows.
    pub fn build(&self, arg: Option<SqlExprRef>) -> QueryResult<SqlExprRef> {
        if self.is_count() {
            let arg = arg.unwrap_or_else(|| SqlExpr::fragment("*"));
            return Ok(SqlExpr::aggregate("COUNT", vec![arg], false, Some(TypeMapping::int())));
        }
        let arg = arg.ok_or_else(|| QueryError::invalid(format!("{} needs a value to aggregate", self.name())))?;
        let mapping = arg.type_mapping().cloned();
        Ok(match self {
            // SUM over no rows is NULL; the client expects zero
            AggregateKind::Sum => {
                let zero = SqlExpr::constant(SqlValue::Int(0), mapping.clone());
                let sum = SqlExpr::aggregate("SUM", vec![arg], true, mapping.clone());
                SqlExpr::function("COALESCE", vec![sum, zero], false, mapping)
            }
            AggregateKind::Average => {
                let arg = match arg.kind() {
                    Some(ValueKind::Int) => SqlExpr::convert(arg, TypeMapping::float()),
                    _ => arg,
                };
                let mapping = arg.type_mapping().cloned();
                SqlExpr::aggregate("AVG", vec![arg], true, mapping)
            }
            AggregateKind::Min => SqlExpr::aggregate("MIN", vec![arg], true, mapping),
            AggregateKind::Max => SqlExpr::aggregate("MAX", vec![arg], true, mapping),
            AggregateKind::Count | AggregateKind::LongCount => {
                return QueryError::invalid("count aggregates take no value argument").err();
            }
        })
    }

    /// Aggregate over the rows of a group that pass `predicate`, optionally distinct.
    pub fn build_filtered(&self, value: Option<SqlExprRef>, predicate: Option<SqlExprRef>, distinct: bool) -> QueryResult<SqlExprRef> {
        let value = match (value, predicate) {
            (value, Some(p)) => {
                let result = match value {
                    Some(v) => v,
                    None => SqlExpr::int(1),
                };
                Some(SqlExpr::case(None, vec![CaseWhen { test: p, result }], None))
            }
            (value, None) => value,
        };
        let value = match value {
            Some(v) if distinct => Some(std::rc::Rc::new(SqlExpr::Distinct(v))),
            Some(v) => Some(v),
            None if distinct => return QueryError::not_translated("distinct count over whole rows").err(),
            None => None,
        };
        self.build(value)
    }
}
