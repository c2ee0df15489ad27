use crate::{
    sql::{ExprRewriter, Replacer, SqlExpr, SqlExprRef},
    structural::{JsonQuery, NestedProjection, StructuralProjection}
};

/// Value bound to a projection member while the select is still mutable.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionValue {
    Scalar(SqlExprRef),
    Structural(StructuralProjection),
    Json(JsonQuery),
}

impl ProjectionValue {
    pub fn as_scalar(&self) -> Option<&SqlExprRef> {
        match self {
            ProjectionValue::Scalar(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_structural(&self) -> Option<&StructuralProjection> {
        match self {
            ProjectionValue::Structural(s) => Some(s),
            _ => None,
        }
    }

    pub fn make_nullable(&self) -> Self {
        match self {
            ProjectionValue::Scalar(e) => ProjectionValue::Scalar(SqlExpr::make_nullable(e)),
            ProjectionValue::Structural(s) => ProjectionValue::Structural(s.make_nullable()),
            ProjectionValue::Json(j) => ProjectionValue::Json(j.make_nullable()),
        }
    }

    pub fn remap(&self, f: &mut Replacer<'_>) -> Self {
        match self {
            ProjectionValue::Scalar(e) => ProjectionValue::Scalar(ExprRewriter::rewrite(e, f)),
            ProjectionValue::Structural(s) => ProjectionValue::Structural(s.remap(f)),
            ProjectionValue::Json(j) => ProjectionValue::Json(j.remap(f)),
        }
    }

    /// Scalars read by this value.
    pub fn expressions(&self) -> Vec<SqlExprRef> {
        match self {
            ProjectionValue::Scalar(e) => vec![e.clone()],
            ProjectionValue::Structural(s) => s.flatten().into_iter().map(|(_, e)| e).collect(),
            ProjectionValue::Json(j) => {
                let mut out = vec![j.json_column.clone()];
                out.extend(j.key_property_map.values().cloned());
                out
            }
        }
    }
}

impl From<NestedProjection> for ProjectionValue {
    fn from(nested: NestedProjection) -> Self {
        match nested {
            NestedProjection::Structural(s) => ProjectionValue::Structural(*s),
            NestedProjection::Json(j) => ProjectionValue::Json(j),
        }
    }
}
