use indexmap::IndexMap;
use serde_json::Value;
use std::rc::Rc;
use tracing::trace;

use crate::{
    config::NullSemantics,
    error::{QueryError, QueryResult},
    metadata::{TypeMapping, ValueKind},
    select::{ProjectionValue, SelectBuilder},
    shaper::{ShapedQuery, Shaper, SubqueryKind, ValueBinding},
    sql::{BinaryOp, CaseWhen, InValues, ProjectionMember, SqlExpr, SqlExprRef, SqlValue, UnaryOp},
    structural::{StructuralKind, StructuralProjection},
    translation::{
        AggregateKind, ClientExpr, Lambda, NavOrigin, Query, QueryCompilationContext, QueryOp, QueryRoot,
        QueryableTranslator, RootBuilder, Scope, Terminal, Translated, TranslatedQuery, materialize,
        navigations::{expand_reference, find_navigation, lookup_origin, navigation_query, persist_navigation}
    }
};

fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn string_constant(text: String) -> SqlExprRef {
    SqlExpr::constant(SqlValue::String(text), Some(TypeMapping::string()))
}

fn any_nullable(args: &[SqlExprRef]) -> bool {
    args.iter().any(|a| a.is_nullable())
}

/// Translates client expressions into SQL against one select.
///
/// Member access on a to-one navigation joins its target into `select`; when
/// the select can no longer take a join (limited, distinct or grouped) the
/// translation fails with `pushdown_requested` set so the caller can push the
/// select down and try again.
pub struct SqlTranslator<'a, 'm> {
    ctx: &'a mut QueryCompilationContext<'m>,
    select: &'a mut SelectBuilder,
    scope: Scope,
    pub(crate) pushdown_requested: bool,
}

impl<'a, 'm> SqlTranslator<'a, 'm> {
    pub fn new(ctx: &'a mut QueryCompilationContext<'m>, select: &'a mut SelectBuilder, scope: Scope) -> Self {
        Self { ctx, select, scope, pushdown_requested: false }
    }

    /// Translate the body of `lambda` with its parameters bound to `args`.
    pub fn translate_lambda(&mut self, lambda: &Lambda, args: Vec<Translated>) -> QueryResult<Translated> {
        if lambda.params.len() != args.len() {
            return QueryError::invalid(format!(
                "lambda takes {} parameters but {} were supplied", lambda.params.len(), args.len()
            )).err();
        }
        for (param, value) in lambda.params.iter().zip(args) {
            self.scope.bind(param, value);
        }
        let result = self.translate(&lambda.body);
        for _ in &lambda.params {
            self.scope.unbind();
        }
        result
    }

    pub fn translate(&mut self, expr: &ClientExpr) -> QueryResult<Translated> {
        Ok(match expr {
            ClientExpr::Constant(value) => Translated::Sql(SqlExpr::constant(SqlValue::from_json(value)?, None)),
            ClientExpr::Parameter(name) => Translated::Sql(SqlExpr::parameter(name, None, true)),
            ClientExpr::Var(name) => self.scope.lookup(name)
                .cloned()
                .ok_or_else(|| QueryError::invalid(format!("variable '{name}' is not in scope")))?,
            ClientExpr::Member { target, name } => {
                let target = self.translate(target)?;
                self.member_of(target, name)?
            }
            ClientExpr::Binary { op, left, right } => {
                let left = self.translate(left)?;
                let right = self.translate(right)?;
                let is_entity = |t: &Translated| matches!(t, Translated::Structural { .. });
                if matches!(op, BinaryOp::Equal | BinaryOp::NotEqual) && (is_entity(&left) || is_entity(&right)) {
                    Translated::Sql(self.entity_equality(*op, left, right)?)
                } else {
                    Translated::Sql(self.sql_binary(*op, left.into_sql()?, right.into_sql()?))
                }
            }
            ClientExpr::Not(operand) => {
                let operand = self.scalar(operand)?;
                Translated::Sql(self.ctx.options.null_semantics.negate(operand))
            }
            ClientExpr::Negate(operand) => Translated::Sql(SqlExpr::unary(UnaryOp::Negate, self.scalar(operand)?, None)),
            ClientExpr::Coalesce(left, right) => {
                let left = self.scalar(left)?;
                let right = SqlExpr::with_inferred_mapping(&self.scalar(right)?, left.type_mapping());
                let mapping = left.type_mapping().or(right.type_mapping()).cloned();
                let nullable = right.is_nullable();
                Translated::Sql(SqlExpr::function("COALESCE", vec![left, right], nullable, mapping))
            }
            ClientExpr::Conditional { test, if_true, if_false } => {
                let test = self.scalar(test)?;
                let (if_true, if_false) = match (self.translate(if_true)?, self.translate(if_false)?) {
                    (Translated::Sql(t), Translated::Sql(f)) => (t, f),
                    (t, f) => {
                        return QueryError::not_translated(format!(
                            "conditional choosing between {} and {}", t.describe(), f.describe()
                        )).err();
                    }
                };
                let if_true = SqlExpr::with_inferred_mapping(&if_true, if_false.type_mapping());
                let if_false = SqlExpr::with_inferred_mapping(&if_false, if_true.type_mapping());
                Translated::Sql(SqlExpr::case(None, vec![CaseWhen { test, result: if_true }], Some(if_false)))
            }
            ClientExpr::MethodCall { target, method, args } => self.method_call(target.as_deref(), method, args)?,
            ClientExpr::New(members) => {
                let mut fields = IndexMap::new();
                for (name, value) in members {
                    fields.insert(name.clone(), self.translate(value)?);
                }
                Translated::Object(fields)
            }
            ClientExpr::TypeIs { operand, entity_type } => Translated::Sql(self.type_test(operand, entity_type)?),
            ClientExpr::TypeAs { operand, entity_type } => match self.translate(operand)? {
                Translated::Structural { projection, origin } => Translated::Structural {
                    projection: projection.update_entity_type(self.ctx.model, entity_type)?,
                    origin,
                },
                other => {
                    return QueryError::not_translated(format!("type cast of a {} to '{entity_type}'", other.describe())).err();
                }
            },
            ClientExpr::Convert { operand, kind } => {
                let operand = self.scalar(operand)?;
                if operand.kind() == Some(*kind) {
                    Translated::Sql(operand)
                } else {
                    Translated::Sql(SqlExpr::convert(operand, TypeMapping::for_kind(*kind)))
                }
            }
            ClientExpr::Like { item, pattern } => {
                let item = self.scalar(item)?;
                let pattern = SqlExpr::with_inferred_mapping(&self.scalar(pattern)?, item.type_mapping());
                Translated::Sql(SqlExpr::like(item, pattern, None))
            }
            ClientExpr::Subquery(query) => self.subquery(query)?,
        })
    }

    fn scalar(&mut self, expr: &ClientExpr) -> QueryResult<SqlExprRef> {
        self.translate(expr)?.into_sql()
    }

    fn member_of(&mut self, target: Translated, name: &str) -> QueryResult<Translated> {
        let unsupported = |target: &str| QueryError::UnsupportedMember { member: name.to_string(), target: target.to_string() };
        match target {
            Translated::Object(mut fields) => fields.shift_remove(name).ok_or_else(|| unsupported("anonymous object")),
            Translated::Structural { projection, origin } => self.structural_member(projection, origin, name),
            Translated::Json(json) => {
                let model = self.ctx.model;
                if json.key_property_map.contains_key(name) || model.find_property(&json.entity_type, name)?.is_some() {
                    Ok(Translated::Sql(json.bind_property(model, name)?))
                } else {
                    Ok(Translated::Json(json.bind_navigation(model, name)?))
                }
            }
            Translated::Sql(e) => match name {
                "Length" => {
                    let nullable = e.is_nullable();
                    Ok(Translated::Sql(SqlExpr::function("LENGTH", vec![e], nullable, Some(TypeMapping::int()))))
                }
                "HasValue" => Ok(Translated::Sql(SqlExpr::is_not_null(e))),
                "Value" => Ok(Translated::Sql(e)),
                _ => Err(unsupported("scalar")),
            },
            Translated::Grouping { key, .. } if name == "Key" => Ok(*key),
            Translated::Query { query, kind: SubqueryKind::Collection { .. } } if name == "Count" => {
                self.nested_operators(*query, &[QueryOp::Count(None)])
            }
            other => Err(unsupported(other.describe())),
        }
    }

    fn structural_member(&mut self, projection: StructuralProjection, origin: Option<NavOrigin>, name: &str) -> QueryResult<Translated> {
        // an earlier access may have expanded navigations into the mapping
        let projection = origin.as_ref()
            .and_then(|o| lookup_origin(self.select, o))
            .unwrap_or(projection);
        if let Some(column) = projection.properties.get(name) {
            return Ok(Translated::Sql(column.clone()));
        }
        let child = origin.as_ref().map(|o| o.child(name));
        if let Some(nested) = projection.complex.get(name).or_else(|| projection.navigations.get(name)) {
            return Ok(Translated::nested(nested, child));
        }
        if projection.kind == StructuralKind::Complex {
            return Err(QueryError::UnsupportedMember { member: name.to_string(), target: projection.entity_type.clone() });
        }

        let model = self.ctx.model;
        let nav = find_navigation(model, &projection.entity_type, name)?
            .ok_or_else(|| QueryError::UnsupportedMember { member: name.to_string(), target: projection.entity_type.clone() })?;
        if nav.is_collection {
            let query = navigation_query(self.ctx, &projection, nav)?;
            return Ok(Translated::Query { query: Box::new(query), kind: SubqueryKind::Collection { navigation: None } });
        }
        if nav.owned {
            return QueryError::not_translated(format!("owned navigation '{name}' is not mapped to the owner's row")).err();
        }
        if self.select.is_limited() || self.select.distinct || self.select.is_grouped() {
            self.pushdown_requested = true;
            return QueryError::not_translated(format!("navigation '{name}' cannot be joined to a limited, distinct or grouped select")).err();
        }

        let select = std::mem::take(self.select);
        let (select, target) = expand_reference(self.ctx, select, &projection, nav)?;
        *self.select = select;
        if let Some(origin) = &origin {
            persist_navigation(self.select, origin, name, &target);
        }
        Ok(Translated::Structural { projection: target, origin: child })
    }

    fn sql_binary(&self, op: BinaryOp, left: SqlExprRef, right: SqlExprRef) -> SqlExprRef {
        let left = SqlExpr::with_inferred_mapping(&left, right.type_mapping());
        let right = SqlExpr::with_inferred_mapping(&right, left.type_mapping());
        let csharp = self.ctx.options.null_semantics == NullSemantics::CSharp;
        match op {
            BinaryOp::Equal | BinaryOp::NotEqual if left.is_null_constant() || right.is_null_constant() => {
                if left.is_null_constant() && right.is_null_constant() {
                    return SqlExpr::bool_const(op == BinaryOp::Equal);
                }
                let operand = if left.is_null_constant() { right } else { left };
                if op == BinaryOp::Equal { SqlExpr::is_null(operand) } else { SqlExpr::is_not_null(operand) }
            }
            BinaryOp::Equal if csharp => SqlExpr::null_safe_equal(left, right),
            BinaryOp::NotEqual if csharp => SqlExpr::null_safe_not_equal(left, right),
            BinaryOp::Add if left.kind() == Some(ValueKind::String) || right.kind() == Some(ValueKind::String) => {
                SqlExpr::binary(BinaryOp::Concat, left, right)
            }
            _ => SqlExpr::binary(op, left, right),
        }
    }

    fn key_columns(&self, projection: &StructuralProjection) -> QueryResult<Vec<SqlExprRef>> {
        if projection.kind != StructuralKind::Entity {
            return QueryError::not_translated(format!("comparison of complex values of '{}'", projection.entity_type)).err();
        }
        let keys = self.ctx.model.key_properties(&projection.entity_type)?;
        if keys.is_empty() {
            return QueryError::not_translated(format!("comparison of keyless entities of '{}'", projection.entity_type)).err();
        }
        keys.iter().map(|p| projection.bind_property(&p.name)).collect()
    }

    /// Entities compare through their keys; `e == null` tests the key for null.
    fn entity_equality(&self, op: BinaryOp, left: Translated, right: Translated) -> QueryResult<SqlExprRef> {
        let combine = |terms: Vec<SqlExprRef>| -> QueryResult<SqlExprRef> {
            let combined = if op == BinaryOp::Equal {
                SqlExpr::and_all(terms)
            } else {
                terms.into_iter().reduce(SqlExpr::or)
            };
            combined.ok_or_else(|| QueryError::invalid("entity comparison without key columns"))
        };
        match (left, right) {
            (Translated::Structural { projection: l, .. }, Translated::Structural { projection: r, .. }) => {
                let (lk, rk) = (self.key_columns(&l)?, self.key_columns(&r)?);
                if lk.len() != rk.len() {
                    return QueryError::not_translated(format!("comparison of '{}' with '{}'", l.entity_type, r.entity_type)).err();
                }
                combine(lk.into_iter().zip(rk).map(|(a, b)| self.sql_binary(op, a, b)).collect())
            }
            (Translated::Structural { projection, .. }, Translated::Sql(e))
            | (Translated::Sql(e), Translated::Structural { projection, .. }) if e.is_null_constant() => {
                let keys = self.key_columns(&projection)?;
                let test = if op == BinaryOp::Equal { SqlExpr::is_null } else { SqlExpr::is_not_null };
                let first = keys.into_iter().next()
                    .ok_or_else(|| QueryError::invalid("entity comparison without key columns"))?;
                Ok(test(first))
            }
            (l, r) => QueryError::not_translated(format!("comparison of a {} with a {}", l.describe(), r.describe())).err(),
        }
    }

    fn type_test(&mut self, operand: &ClientExpr, entity_type: &str) -> QueryResult<SqlExprRef> {
        let Translated::Structural { projection, .. } = self.translate(operand)? else {
            return QueryError::not_translated(format!("type test against '{entity_type}' on a non-entity value")).err();
        };
        let model = self.ctx.model;
        if model.is_assignable(entity_type, &projection.entity_type) {
            return Ok(SqlExpr::bool_const(true));
        }
        if !model.is_assignable(&projection.entity_type, entity_type) {
            return Ok(SqlExpr::bool_const(false));
        }
        let discriminator = projection.discriminator.as_ref().ok_or_else(|| {
            QueryError::not_translated(format!("'{}' has no discriminator to test against", projection.entity_type))
        })?;
        Ok(RootBuilder::discriminator_filter(discriminator, &model.discriminator_values(entity_type)?))
    }

    fn method_call(&mut self, target: Option<&ClientExpr>, method: &str, args: &[ClientExpr]) -> QueryResult<Translated> {
        let Some(target) = target else {
            return self.static_function(method, args).map(Translated::Sql);
        };
        if method == "Contains" && args.len() == 1 {
            match target {
                ClientExpr::Parameter(name) => {
                    let item = self.scalar(&args[0])?;
                    let element = item.type_mapping().cloned();
                    return Ok(Translated::Sql(SqlExpr::in_values(item, InValues::Parameter { name: name.clone(), element }, false)));
                }
                ClientExpr::Constant(Value::Array(items)) => {
                    let item = self.scalar(&args[0])?;
                    let values = items.iter()
                        .map(|v| Ok(SqlExpr::with_inferred_mapping(&SqlExpr::constant(SqlValue::from_json(v)?, None), item.type_mapping())))
                        .collect::<QueryResult<Vec<_>>>()?;
                    return Ok(Translated::Sql(SqlExpr::in_values(item, InValues::List(values), false)));
                }
                _ => {}
            }
        }

        match self.translate(target)? {
            Translated::Sql(item) => self.string_method(item, method, args).map(Translated::Sql),
            Translated::Query { query, kind: SubqueryKind::Collection { .. } } => {
                let op = match (method, args) {
                    ("Any", []) => QueryOp::Any(None),
                    ("Count", []) => QueryOp::Count(None),
                    ("Contains", [item]) => QueryOp::Contains(item.clone()),
                    _ => return Err(QueryError::UnsupportedMethod { method: method.to_string() }),
                };
                self.nested_operators(*query, &[op])
            }
            _ => Err(QueryError::UnsupportedMethod { method: method.to_string() }),
        }
    }

    fn string_method(&mut self, item: SqlExprRef, method: &str, args: &[ClientExpr]) -> QueryResult<SqlExprRef> {
        let mut translated = Vec::with_capacity(args.len());
        for arg in args {
            translated.push(SqlExpr::with_inferred_mapping(&self.scalar(arg)?, item.type_mapping()));
        }
        let string = Some(TypeMapping::string());
        Ok(match (method, translated.as_slice()) {
            ("Contains" | "StartsWith" | "EndsWith", [pattern]) => Self::like_method(method, item, pattern.clone())?,
            ("ToUpper", []) => SqlExpr::function("UPPER", vec![item.clone()], item.is_nullable(), string),
            ("ToLower", []) => SqlExpr::function("LOWER", vec![item.clone()], item.is_nullable(), string),
            ("Trim" | "TrimStart" | "TrimEnd", rest) => {
                let name = match method {
                    "Trim" => "TRIM",
                    "TrimStart" => "LTRIM",
                    _ => "RTRIM",
                };
                let mut fn_args = vec![item.clone()];
                fn_args.extend(rest.iter().cloned());
                SqlExpr::function(name, fn_args, item.is_nullable(), string)
            }
            ("Substring", [start, rest @ ..]) if rest.len() <= 1 => {
                let start = SqlExpr::binary(BinaryOp::Add, start.clone(), SqlExpr::int(1));
                let mut fn_args = vec![item.clone(), start];
                fn_args.extend(rest.iter().cloned());
                let nullable = any_nullable(&fn_args);
                SqlExpr::function("SUBSTR", fn_args, nullable, string)
            }
            ("Replace", [from, to]) => {
                let fn_args = vec![item.clone(), from.clone(), to.clone()];
                let nullable = any_nullable(&fn_args);
                SqlExpr::function("REPLACE", fn_args, nullable, string)
            }
            ("IndexOf", [needle]) => {
                let fn_args = vec![item.clone(), needle.clone()];
                let nullable = any_nullable(&fn_args);
                let instr = SqlExpr::function("INSTR", fn_args, nullable, Some(TypeMapping::int()));
                SqlExpr::binary(BinaryOp::Subtract, instr, SqlExpr::int(1))
            }
            ("Equals", [other]) => self.sql_binary(BinaryOp::Equal, item, other.clone()),
            _ => return Err(QueryError::UnsupportedMethod { method: method.to_string() }),
        })
    }

    /// `Contains`, `StartsWith` and `EndsWith` as `LIKE`. Constant patterns are
    /// escaped; other patterns are concatenated with the wildcard.
    fn like_method(method: &str, item: SqlExprRef, pattern: SqlExprRef) -> QueryResult<SqlExprRef> {
        if pattern.is_null_constant() {
            return QueryError::not_translated(format!("{method} with a null argument")).err();
        }
        if let SqlExpr::Constant { value: SqlValue::String(text), .. } = pattern.as_ref() {
            let escaped = escape_like(text);
            let escape = (escaped.len() != text.len()).then_some('\\');
            let text = match method {
                "Contains" => format!("%{escaped}%"),
                "StartsWith" => format!("{escaped}%"),
                _ => format!("%{escaped}"),
            };
            return Ok(SqlExpr::like(item, string_constant(text), escape));
        }
        let wildcard = || string_constant("%".to_string());
        Ok(match method {
            "Contains" => {
                let nullable = item.is_nullable() || pattern.is_nullable();
                let instr = SqlExpr::function("INSTR", vec![item, pattern], nullable, Some(TypeMapping::int()));
                SqlExpr::binary(BinaryOp::GreaterThan, instr, SqlExpr::int(0))
            }
            "StartsWith" => SqlExpr::like(item, SqlExpr::binary(BinaryOp::Concat, pattern, wildcard()), None),
            _ => SqlExpr::like(item, SqlExpr::binary(BinaryOp::Concat, wildcard(), pattern), None),
        })
    }

    fn static_function(&mut self, method: &str, args: &[ClientExpr]) -> QueryResult<SqlExprRef> {
        let mut translated = Vec::with_capacity(args.len());
        for arg in args {
            translated.push(self.scalar(arg)?);
        }
        let nullable = any_nullable(&translated);
        let mapping = translated.first().and_then(|a| a.type_mapping().cloned());
        Ok(match (method, translated.len()) {
            ("Abs", 1) => SqlExpr::function("ABS", translated, nullable, mapping),
            ("Round", 1 | 2) => SqlExpr::function("ROUND", translated, nullable, mapping),
            ("Floor", 1) => SqlExpr::function("FLOOR", translated, nullable, mapping),
            ("Ceiling", 1) => SqlExpr::function("CEILING", translated, nullable, mapping),
            ("Sqrt", 1) => SqlExpr::function("SQRT", translated, nullable, Some(TypeMapping::float())),
            ("Power", 2) => SqlExpr::function("POWER", translated, nullable, Some(TypeMapping::float())),
            ("IsNullOrEmpty", 1) => {
                let value = translated.remove(0);
                SqlExpr::or(
                    SqlExpr::is_null(value.clone()),
                    SqlExpr::equal(value, string_constant(String::new())),
                )
            }
            ("Concat", n) if n >= 1 => translated.into_iter()
                .reduce(|acc, next| SqlExpr::binary(BinaryOp::Concat, acc, next))
                .ok_or_else(|| QueryError::invalid("Concat without arguments"))?,
            _ => return Err(QueryError::UnsupportedMethod { method: method.to_string() }),
        })
    }

    fn subquery(&mut self, query: &Query) -> QueryResult<Translated> {
        trace!(operators = query.operators.len(), "translating nested query");
        let source = match &query.root {
            QueryRoot::Navigation { source, navigation } => {
                let source = self.translate(source)?;
                match self.member_of(source, navigation)? {
                    Translated::Query { query, kind: SubqueryKind::Collection { .. } } => Some(*query),
                    other => {
                        return QueryError::not_translated(format!("'{navigation}' is a {} and cannot be queried", other.describe())).err();
                    }
                }
            }
            QueryRoot::Grouping(group) => match self.translate(group)? {
                Translated::Grouping { element, elements, .. } => {
                    if let Some(folded) = self.fold_group_aggregate(&element, &query.operators)? {
                        return Ok(Translated::Sql(folded));
                    }
                    match elements {
                        // each use of the group reads its rows through its own aliases
                        Some(elements) => {
                            let (select, _) = elements.select.fresh_copy(&mut self.ctx.aliases);
                            Some(ShapedQuery { select, ..*elements })
                        }
                        None => return QueryError::not_translated("querying the elements of a group that was pushed down").err(),
                    }
                }
                other => return QueryError::invalid(format!("grouping root bound to a {}", other.describe())).err(),
            },
            _ => None,
        };

        let scope = self.scope.detached();
        let mut nested = QueryableTranslator::new(self.ctx, scope).nested();
        let result = match source {
            Some(source) => nested.translate_from(source, &query.operators)?,
            None => nested.translate(query)?,
        };
        self.absorb(result)
    }

    fn nested_operators(&mut self, source: ShapedQuery, operators: &[QueryOp]) -> QueryResult<Translated> {
        let scope = self.scope.detached();
        let result = QueryableTranslator::new(self.ctx, scope).nested().translate_from(source, operators)?;
        self.absorb(result)
    }

    fn absorb(&mut self, result: TranslatedQuery) -> QueryResult<Translated> {
        Ok(match result {
            TranslatedQuery::Sequence(query) => Translated::Query {
                query: Box::new(query),
                kind: SubqueryKind::Collection { navigation: None },
            },
            TranslatedQuery::Terminal(Terminal::Exists { select, negated }) => {
                Translated::Sql(SqlExpr::exists(select.finalize()?.0, negated))
            }
            TranslatedQuery::Terminal(Terminal::In { item, select }) => {
                let values = InValues::Subquery(Rc::new(select.finalize_scalar()?));
                Translated::Sql(SqlExpr::in_values(item, values, false))
            }
            TranslatedQuery::Terminal(Terminal::Scalar(query)) => {
                Translated::Sql(SqlExpr::scalar_subquery(query.select.finalize_scalar()?))
            }
            TranslatedQuery::Terminal(Terminal::Element(query)) => {
                let scalar_root = query.select.client_projections.is_empty()
                    && query.select.mapping.len() == 1
                    && matches!(query.select.mapping.get(&ProjectionMember::root()), Some(ProjectionValue::Scalar(_)))
                    && query.shaper == Shaper::Value(ValueBinding::Member(ProjectionMember::root()));
                if scalar_root {
                    Translated::Sql(SqlExpr::scalar_subquery(query.select.finalize_scalar()?))
                } else {
                    Translated::Query { query: Box::new(query), kind: SubqueryKind::Single }
                }
            }
        })
    }

    /// Aggregate over the rows of the current group, computed in the grouped
    /// select itself. `Where`, `Select` and `Distinct` before the aggregate are
    /// folded into its argument; any other shape returns `None`.
    fn fold_group_aggregate(&mut self, element: &Shaper, operators: &[QueryOp]) -> QueryResult<Option<SqlExprRef>> {
        let Some((last, prefix)) = operators.split_last() else { return Ok(None) };
        let Some((kind, lambda)) = AggregateKind::of(last) else { return Ok(None) };
        let Some(elements) = self.select.group_element_mapping.clone() else { return Ok(None) };

        let mut value = materialize(&elements, &[], element, None)?.detached();
        let mut predicate: Option<SqlExprRef> = None;
        let mut distinct = false;
        for op in prefix {
            match op {
                QueryOp::Where(l) => {
                    let p = self.translate_lambda(l, vec![value.clone()])?.into_sql()?;
                    predicate = Some(match predicate {
                        Some(existing) => SqlExpr::and(existing, p),
                        None => p,
                    });
                }
                QueryOp::Select(l) if !distinct => value = self.translate_lambda(l, vec![value])?,
                QueryOp::Distinct => distinct = true,
                _ => return Ok(None),
            }
        }

        let arg = match lambda {
            Some(l) if kind.is_count() => {
                let p = self.translate_lambda(l, vec![value.clone()])?.into_sql()?;
                predicate = Some(match predicate {
                    Some(existing) => SqlExpr::and(existing, p),
                    None => p,
                });
                distinct.then(|| value.into_sql()).transpose()?
            }
            Some(l) => Some(self.translate_lambda(l, vec![value])?.into_sql()?),
            None if kind.is_count() => distinct.then(|| value.into_sql()).transpose()?,
            None => Some(value.into_sql()?),
        };
        trace!(aggregate = kind.name(), distinct, filtered = predicate.is_some(), "folded aggregate into grouping");
        kind.build_filtered(arg, predicate, distinct).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{_tests::fixtures, config::TranslationOptions, metadata::Model, sql::JoinKind};

    fn customers(model: &Model, ctx: &mut QueryCompilationContext) -> (SelectBuilder, Translated) {
        let query = RootBuilder::entity(model, &mut ctx.aliases, "Customer").unwrap();
        let value = materialize(&query.select.mapping, &[], &query.shaper, None).unwrap();
        (query.select, value)
    }

    fn translate_with(ctx: &mut QueryCompilationContext, select: &mut SelectBuilder, var: Translated, expr: ClientExpr) -> QueryResult<Translated> {
        let mut scope = Scope::new();
        scope.bind("c", var);
        SqlTranslator::new(ctx, select, scope).translate(&expr)
    }

    #[test]
    fn nullable_equality_is_null_safe_by_default() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let (mut select, c) = customers(&model, &mut ctx);
        let expr = ClientExpr::path("c", &["City"]).eq(ClientExpr::param("city"));
        let sql = translate_with(&mut ctx, &mut select, c.clone(), expr.clone()).unwrap().into_sql().unwrap();
        assert!(sql.to_string().contains("IS NULL"));

        let mut relational = QueryCompilationContext::new(&model, TranslationOptions::new().relational_nulls());
        let sql = translate_with(&mut relational, &mut select, c, expr).unwrap().into_sql().unwrap();
        assert!(!sql.to_string().contains("IS NULL"));
    }

    #[test]
    fn negated_equality_matches_inequality() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let (mut select, c) = customers(&model, &mut ctx);
        let city = || ClientExpr::path("c", &["City"]);
        let london = || ClientExpr::constant("London");
        let not_equal = translate_with(&mut ctx, &mut select, c.clone(), city().ne(london()))
            .unwrap().into_sql().unwrap();
        let negated = translate_with(&mut ctx, &mut select, c.clone(), city().eq(london()).not())
            .unwrap().into_sql().unwrap();
        assert_eq!(negated.to_string(), not_equal.to_string());
        assert!(negated.to_string().contains("IS NULL"));

        let active = translate_with(&mut ctx, &mut select, c.clone(), ClientExpr::path("c", &["IsActive"]).not())
            .unwrap().into_sql().unwrap();
        assert!(matches!(active.as_ref(), SqlExpr::Unary { op: UnaryOp::Not, .. }));

        let mut relational = QueryCompilationContext::new(&model, TranslationOptions::new().relational_nulls());
        let sql = translate_with(&mut relational, &mut select, c, city().eq(london()).not()).unwrap().into_sql().unwrap();
        assert!(matches!(sql.as_ref(), SqlExpr::Unary { op: UnaryOp::Not, .. }));
    }

    #[test]
    fn contains_over_empty_constant_matches_nothing() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let (mut select, c) = customers(&model, &mut ctx);
        let empty = ClientExpr::Constant(Value::Array(vec![])).call("Contains", vec![ClientExpr::path("c", &["Id"])]);
        let sql = translate_with(&mut ctx, &mut select, c.clone(), empty).unwrap().into_sql().unwrap();
        assert_eq!(sql, SqlExpr::bool_const(false));

        let listed = ClientExpr::constant(serde_json::json!([1, 2])).call("Contains", vec![ClientExpr::path("c", &["Id"])]);
        let sql = translate_with(&mut ctx, &mut select, c, listed).unwrap().into_sql().unwrap();
        assert!(matches!(sql.as_ref(), SqlExpr::In { values: InValues::List(v), .. } if v.len() == 2));
    }

    #[test]
    fn comparison_with_null_becomes_is_null() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let (mut select, c) = customers(&model, &mut ctx);
        let sql = translate_with(&mut ctx, &mut select, c, ClientExpr::path("c", &["City"]).ne(ClientExpr::null()))
            .unwrap().into_sql().unwrap();
        assert!(matches!(sql.as_ref(), SqlExpr::Unary { op: UnaryOp::IsNotNull, .. }));
    }

    #[test]
    fn constant_like_patterns_are_escaped() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let (mut select, c) = customers(&model, &mut ctx);
        let expr = ClientExpr::path("c", &["Name"]).call("StartsWith", vec![ClientExpr::constant("50%_off")]);
        let sql = translate_with(&mut ctx, &mut select, c, expr).unwrap().into_sql().unwrap();
        let SqlExpr::Like { pattern, escape, .. } = sql.as_ref() else { panic!("expected LIKE, got {sql}") };
        assert_eq!(pattern.to_string(), "'50\\%\\_off%'");
        assert_eq!(*escape, Some('\\'));
    }

    #[test]
    fn reference_navigation_joins_once() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let query = RootBuilder::entity(&model, &mut ctx.aliases, "Order").unwrap();
        let o = materialize(&query.select.mapping, &[], &query.shaper, None).unwrap();
        let mut select = query.select;

        let mut scope = Scope::new();
        scope.bind("o", o);
        let mut translator = SqlTranslator::new(&mut ctx, &mut select, scope);
        translator.translate(&ClientExpr::path("o", &["Customer", "Name"])).unwrap();
        translator.translate(&ClientExpr::path("o", &["Customer", "City"])).unwrap();
        drop(translator);

        assert_eq!(select.tables.len(), 2);
        assert_eq!(select.tables[1].join_kind(), Some(JoinKind::Inner));
    }

    #[test]
    fn navigation_on_limited_select_requests_pushdown() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let query = RootBuilder::entity(&model, &mut ctx.aliases, "Order").unwrap();
        let o = materialize(&query.select.mapping, &[], &query.shaper, None).unwrap();
        let mut select = query.select.apply_limit(&mut ctx.aliases, SqlExpr::int(3)).unwrap();

        let mut scope = Scope::new();
        scope.bind("o", o);
        let mut translator = SqlTranslator::new(&mut ctx, &mut select, scope);
        let err = translator.translate(&ClientExpr::path("o", &["Customer", "Name"])).unwrap_err();
        assert!(err.is_translation_failure());
        assert!(translator.pushdown_requested);
    }

    #[test]
    fn json_members_and_type_tests() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let (mut select, c) = customers(&model, &mut ctx);
        let street = translate_with(&mut ctx, &mut select, c.clone(), ClientExpr::path("c", &["Address", "Street"]))
            .unwrap().into_sql().unwrap();
        assert!(matches!(street.as_ref(), SqlExpr::JsonScalar { .. }));

        let query = RootBuilder::entity(&model, &mut ctx.aliases, "Animal").unwrap();
        let a = materialize(&query.select.mapping, &[], &query.shaper, None).unwrap();
        let mut animals = query.select;
        let is_pet = translate_with(&mut ctx, &mut animals, a, ClientExpr::TypeIs {
            operand: Box::new(ClientExpr::var("c")),
            entity_type: "Pet".into(),
        }).unwrap().into_sql().unwrap();
        assert!(matches!(is_pet.as_ref(), SqlExpr::In { .. }));
    }

    #[test]
    fn unknown_methods_are_translation_failures() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let (mut select, c) = customers(&model, &mut ctx);
        let err = translate_with(&mut ctx, &mut select, c, ClientExpr::path("c", &["Name"]).call("Normalize", vec![]))
            .unwrap_err();
        assert_eq!(err, QueryError::UnsupportedMethod { method: "Normalize".into() });
    }

    #[test]
    fn collection_count_becomes_scalar_subquery() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let (mut select, c) = customers(&model, &mut ctx);
        let count = translate_with(&mut ctx, &mut select, c, ClientExpr::path("c", &["Orders"]).call("Count", vec![]))
            .unwrap().into_sql().unwrap();
        assert!(matches!(count.as_ref(), SqlExpr::ScalarSubquery { .. }));
    }
}
