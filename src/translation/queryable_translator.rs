use indexmap::IndexMap;
use std::rc::Rc;
use tracing::{debug, trace};

use crate::{
    error::{QueryError, QueryResult},
    select::{GroupingResult, JoinResult, ProjectionValue, SelectBuilder},
    shaper::{IncludeTreeBuilder, ResultCardinality, ShapedQuery, Shaper, SubqueryKind, ValueBinding},
    sql::{InValues, JoinKind, OrderBy, ProjectionMember, SqlExpr, SqlExprRef, TableExpr, ValuesSource},
    structural::StructuralProjection,
    translation::{
        AggregateKind, ClientExpr, Lambda, Query, QueryCompilationContext, QueryOp, QueryRoot, RootBuilder, Scope,
        SqlTranslator, Translated, correlation::correlate, expand_includes, materialize,
        navigations::lookup_origin
    }
};

/// A query that ended with a single-value operator.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    /// `Any`/`All`: rows of `select` exist (or not)
    Exists { select: SelectBuilder, negated: bool },
    /// `Contains`: `item` is among the single projected column of `select`
    In { item: SqlExprRef, select: SelectBuilder },
    /// Aggregate projected at the root member
    Scalar(ShapedQuery),
    /// `First`, `Single`, `Last` or `ElementAt`
    Element(ShapedQuery),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TranslatedQuery {
    Sequence(ShapedQuery),
    Terminal(Terminal),
}

fn scalar_query(expr: SqlExprRef) -> ShapedQuery {
    let mapping = IndexMap::from([(ProjectionMember::root(), ProjectionValue::Scalar(expr))]);
    ShapedQuery::new(SelectBuilder::default().with_mapping(mapping), Shaper::member(ProjectionMember::root()))
        .with_cardinality(ResultCardinality::Single)
}

impl TranslatedQuery {
    /// The query as something a caller can execute; `Any`/`All`/`Contains`
    /// become a table-less select of one boolean.
    pub fn into_shaped(self) -> QueryResult<ShapedQuery> {
        Ok(match self {
            TranslatedQuery::Sequence(query) => query,
            TranslatedQuery::Terminal(Terminal::Scalar(query) | Terminal::Element(query)) => query,
            TranslatedQuery::Terminal(Terminal::Exists { select, negated }) => {
                scalar_query(SqlExpr::exists(select.finalize()?.0, negated))
            }
            TranslatedQuery::Terminal(Terminal::In { item, select }) => {
                let values = InValues::Subquery(Rc::new(select.finalize_scalar()?));
                scalar_query(SqlExpr::in_values(item, values, false))
            }
        })
    }

    fn into_sequence(self, operator: &str) -> QueryResult<ShapedQuery> {
        match self {
            TranslatedQuery::Sequence(query) => Ok(query),
            TranslatedQuery::Terminal(_) => {
                QueryError::invalid(format!("the source of '{operator}' ends with a single-value operator")).err()
            }
        }
    }
}

/// Member path layout of a projected value; nested queries stay pending and
/// are correlated through client projections of `select`.
fn shape_value(
    select: &mut SelectBuilder,
    old_clients: &[ProjectionValue],
    mapping: &mut IndexMap<ProjectionMember, ProjectionValue>,
    member: ProjectionMember,
    value: Translated,
) -> QueryResult<Shaper> {
    Ok(match value {
        Translated::Sql(e) => {
            mapping.insert(member.clone(), ProjectionValue::Scalar(e));
            Shaper::member(member)
        }
        Translated::Structural { projection, origin } => {
            let projection = origin.and_then(|o| lookup_origin(select, &o)).unwrap_or(projection);
            mapping.insert(member.clone(), ProjectionValue::Structural(projection));
            Shaper::member(member)
        }
        Translated::Json(json) => {
            mapping.insert(member.clone(), ProjectionValue::Json(json));
            Shaper::member(member)
        }
        Translated::Object(fields) => {
            let mut shaped = IndexMap::new();
            for (name, field) in fields {
                let child = member.append(&name);
                shaped.insert(name, shape_value(select, old_clients, mapping, child, field)?);
            }
            Shaper::Object(shaped)
        }
        Translated::Query { query, kind } => {
            let outer_refs = correlate(select, &query);
            Shaper::Subquery { query, kind, outer_refs }
        }
        Translated::Shaped(shaper) => shaper.map_bindings(&mut |binding| match binding {
            ValueBinding::Member(m) => {
                let value = select.mapping.get(m).cloned()
                    .ok_or_else(|| QueryError::invalid(format!("member {m} is not projected")))?;
                Ok(ValueBinding::Client(select.push_client_projection(value)))
            }
            ValueBinding::Client(i) => {
                let value = old_clients.get(*i).cloned()
                    .ok_or_else(|| QueryError::invalid(format!("client projection {i} does not exist")))?;
                Ok(ValueBinding::Client(select.push_client_projection(value)))
            }
            other => Ok(other.clone()),
        })?,
        Translated::Grouping { .. } => return QueryError::not_translated("projecting a whole group").err(),
    })
}

/// Key terms of a grouping key, one member per scalar.
fn flatten_key(value: Translated, member: ProjectionMember, keys: &mut IndexMap<ProjectionMember, SqlExprRef>) -> QueryResult<Shaper> {
    Ok(match value {
        Translated::Sql(e) => {
            keys.insert(member.clone(), e);
            Shaper::member(member)
        }
        Translated::Object(fields) => {
            let mut shaped = IndexMap::new();
            for (name, field) in fields {
                let child = member.append(&name);
                shaped.insert(name, flatten_key(field, child, keys)?);
            }
            Shaper::Object(shaped)
        }
        other => return QueryError::not_translated(format!("grouping by a {}", other.describe())).err(),
    })
}

/// A `SelectMany` collection selector without its trailing `DefaultIfEmpty`,
/// and whether it had one.
fn strip_default_if_empty(lambda: &Lambda) -> (Lambda, bool) {
    if let ClientExpr::Subquery(query) = &lambda.body {
        if matches!(query.operators.last(), Some(QueryOp::DefaultIfEmpty)) {
            let mut query = (**query).clone();
            query.operators.pop();
            return (Lambda { params: lambda.params.clone(), body: ClientExpr::Subquery(Box::new(query)) }, true);
        }
    }
    (lambda.clone(), false)
}

fn root_structural(query: &ShapedQuery) -> Option<&StructuralProjection> {
    if query.shaper != Shaper::member(ProjectionMember::root()) {
        return None;
    }
    query.select.mapping.get(&ProjectionMember::root()).and_then(ProjectionValue::as_structural)
}

/// Translates query operators into select composition.
pub struct QueryableTranslator<'a, 'm> {
    ctx: &'a mut QueryCompilationContext<'m>,
    /// Variables of enclosing queries
    outer: Scope,
    includes: Vec<(String, IncludeTreeBuilder)>,
    /// Rows of one group when the current select is grouped
    group_elements: Option<ShapedQuery>,
    /// Translating a query used as a value of an enclosing query
    nested: bool,
}

impl<'a, 'm> QueryableTranslator<'a, 'm> {
    pub fn new(ctx: &'a mut QueryCompilationContext<'m>, outer: Scope) -> Self {
        Self { ctx, outer, includes: Vec::new(), group_elements: None, nested: false }
    }

    /// Translator for a query whose result becomes a value of each outer row.
    /// A single element of such a query is read as one row per outer row.
    pub fn nested(mut self) -> Self {
        self.nested = true;
        self
    }

    pub fn translate(&mut self, query: &Query) -> QueryResult<TranslatedQuery> {
        let source = self.root(&query.root)?;
        self.translate_from(source, &query.operators)
    }

    /// Apply `operators` to an already translated source.
    pub fn translate_from(&mut self, source: ShapedQuery, operators: &[QueryOp]) -> QueryResult<TranslatedQuery> {
        let mut query = source;
        for (i, op) in operators.iter().enumerate() {
            trace!(operator = op.name(), "translating operator");
            if op.is_terminal() {
                if i + 1 != operators.len() {
                    return QueryError::invalid(format!("'{}' must be the last operator", op.name())).err();
                }
                return self.terminal(query, op).map(TranslatedQuery::Terminal);
            }
            query = self.operator(query, op)?;
        }
        let query = self.expand_includes(query)?;
        Ok(TranslatedQuery::Sequence(query))
    }

    fn root(&mut self, root: &QueryRoot) -> QueryResult<ShapedQuery> {
        let model = self.ctx.model;
        match root {
            QueryRoot::Entity(name) => RootBuilder::entity(model, &mut self.ctx.aliases, name),
            QueryRoot::FromSql { entity_type, sql, args } => {
                let mut scratch = SelectBuilder::default();
                let mut translator = SqlTranslator::new(self.ctx, &mut scratch, self.outer.detached());
                let args = args.iter()
                    .map(|a| translator.translate(a).and_then(Translated::into_sql))
                    .collect::<QueryResult<Vec<_>>>()?;
                RootBuilder::from_sql(model, &mut self.ctx.aliases, entity_type, sql, args)
            }
            QueryRoot::Values(rows) => RootBuilder::values(&mut self.ctx.aliases, rows),
            QueryRoot::ParameterCollection { name, element } => {
                Ok(RootBuilder::parameter_collection(&mut self.ctx.aliases, name, *element))
            }
            QueryRoot::Navigation { navigation, .. } => QueryError::invalid(format!(
                "navigation '{navigation}' can only be queried from an enclosing query"
            )).err(),
            QueryRoot::Grouping(_) => QueryError::invalid("group elements can only be queried from an enclosing query").err(),
        }
    }

    /// Translate `lambda` with its parameters ranging over `shapers`.
    ///
    /// A navigation that cannot be joined to the current select makes the
    /// select be pushed down once before translating again.
    fn translate_lambda(&mut self, query: &mut ShapedQuery, shapers: &[Shaper], lambda: &Lambda) -> QueryResult<Translated> {
        if !query.select.is_grouped() {
            self.group_elements = None;
        }
        let mut retried = false;
        loop {
            let args = shapers.iter()
                .map(|s| materialize(&query.select.mapping, &query.select.client_projections, s, self.group_elements.as_ref()))
                .collect::<QueryResult<Vec<_>>>()?;
            let mut translator = SqlTranslator::new(self.ctx, &mut query.select, self.outer.clone());
            match translator.translate_lambda(lambda, args) {
                Err(_) if !retried && translator.pushdown_requested => {
                    debug!("pushing select down to join a navigation");
                    query.select = std::mem::take(&mut query.select).pushdown_into_subquery(&mut self.ctx.aliases)?;
                    self.group_elements = None;
                    retried = true;
                }
                result => return result,
            }
        }
    }

    /// Translate a value that reads no lambda parameter (`Skip`, `Take` counts).
    fn translate_value(&mut self, query: &mut ShapedQuery, expr: &ClientExpr) -> QueryResult<SqlExprRef> {
        SqlTranslator::new(self.ctx, &mut query.select, self.outer.clone())
            .translate(expr)?
            .into_sql()
    }

    fn project(&mut self, mut query: ShapedQuery, value: Translated) -> QueryResult<ShapedQuery> {
        let old_clients = std::mem::take(&mut query.select.client_projections);
        let mut mapping = IndexMap::new();
        let shaper = shape_value(&mut query.select, &old_clients, &mut mapping, ProjectionMember::root(), value)?;
        query.select.mapping = mapping;
        query.shaper = shaper;
        Ok(query)
    }

    fn operator(&mut self, mut query: ShapedQuery, op: &QueryOp) -> QueryResult<ShapedQuery> {
        let shaper = query.shaper.clone();
        match op {
            QueryOp::Where(l) => {
                let predicate = self.translate_lambda(&mut query, &[shaper], l)?.into_sql()?;
                query.select = query.select.apply_predicate(&mut self.ctx.aliases, predicate)?;
                Ok(query)
            }
            QueryOp::Select(l) => {
                let value = self.translate_lambda(&mut query, &[shaper], l)?;
                self.project(query, value)
            }
            QueryOp::SelectMany { collection, result } => {
                let (collection, outer_apply) = strip_default_if_empty(collection);
                let inner = match self.translate_lambda(&mut query, &[shaper], &collection)? {
                    Translated::Query { query: inner, kind: SubqueryKind::Collection { .. } } => *inner,
                    other => {
                        return QueryError::not_translated(format!("SelectMany over a {}", other.describe())).err();
                    }
                };
                let kind = if outer_apply { JoinKind::OuterApply } else { JoinKind::CrossApply };
                self.join(query, kind, inner, None, result.as_ref())
            }
            QueryOp::Join { inner, outer_key, inner_key, result } | QueryOp::LeftJoin { inner, outer_key, inner_key, result } => {
                let kind = if matches!(op, QueryOp::Join { .. }) { JoinKind::Inner } else { JoinKind::Left };
                let outer_key = self.translate_lambda(&mut query, &[shaper], outer_key)?;
                let mut inner = QueryableTranslator::new(self.ctx, self.outer.clone())
                    .translate(inner)?
                    .into_sequence(op.name())?;
                let inner_shaper = inner.shaper.clone();
                // the outer grouping does not apply to the inner side
                self.group_elements = None;
                let inner_key = self.translate_lambda(&mut inner, &[inner_shaper], inner_key)?;

                let outer_terms = self.key_terms(outer_key)?;
                let inner_terms = self.key_terms(inner_key)?;
                if outer_terms.len() != inner_terms.len() {
                    return QueryError::invalid("join keys have different shapes").err();
                }
                let predicate = SqlExpr::and_all(outer_terms.into_iter().zip(inner_terms).map(|(o, i)| SqlExpr::equal(o, i)))
                    .ok_or_else(|| QueryError::invalid("join without key terms"))?;
                self.join(query, kind, inner, Some(predicate), Some(result))
            }
            QueryOp::GroupBy { key, element } => self.group_by(query, shaper, key, element.as_ref()),
            QueryOp::OrderBy { key, descending } | QueryOp::ThenBy { key, descending } => {
                if query.select.distinct || query.select.is_limited() {
                    query.select = query.select.pushdown_into_subquery(&mut self.ctx.aliases)?;
                }
                let key = self.translate_lambda(&mut query, &[shaper], key)?;
                let terms = self.key_terms(key)?;
                let mut replace = matches!(op, QueryOp::OrderBy { .. });
                for term in terms {
                    let ordering = OrderBy::new(term, !descending);
                    query.select = if replace {
                        query.select.apply_ordering(&mut self.ctx.aliases, ordering)?
                    } else {
                        query.select.append_ordering(&mut self.ctx.aliases, ordering)?
                    };
                    replace = false;
                }
                Ok(query)
            }
            QueryOp::Reverse => {
                if query.select.orderings.is_empty() {
                    return QueryError::unsupported_operator("Reverse", Some("the query has no ordering".into())).err();
                }
                query.select = query.select.reverse_orderings(&mut self.ctx.aliases)?;
                Ok(query)
            }
            QueryOp::Skip(count) => {
                let count = self.translate_value(&mut query, count)?;
                query.select = query.select.apply_offset(&mut self.ctx.aliases, count)?;
                Ok(query)
            }
            QueryOp::Take(count) => {
                let count = self.translate_value(&mut query, count)?;
                query.select = query.select.apply_limit(&mut self.ctx.aliases, count)?;
                Ok(query)
            }
            QueryOp::Distinct => {
                if shaper.has_pending() {
                    return QueryError::not_translated("Distinct over a projection containing a collection").err();
                }
                query.select = query.select.apply_distinct(&mut self.ctx.aliases, self.ctx.model)?;
                Ok(query)
            }
            QueryOp::Union(other) | QueryOp::Concat(other) | QueryOp::Intersect(other) | QueryOp::Except(other) => {
                let other = QueryableTranslator::new(self.ctx, self.outer.clone())
                    .translate(other)?
                    .into_sequence(op.name())?;
                if shaper.has_pending() || other.shaper.has_pending() {
                    return QueryError::not_translated(format!("{} over projections containing collections", op.name())).err();
                }
                let (aliases, model) = (&mut self.ctx.aliases, self.ctx.model);
                query.select = match op {
                    QueryOp::Union(_) => query.select.apply_union(aliases, model, other.select)?,
                    QueryOp::Concat(_) => query.select.apply_concat(aliases, model, other.select)?,
                    QueryOp::Intersect(_) => query.select.apply_intersect(aliases, model, other.select)?,
                    _ => query.select.apply_except(aliases, model, other.select)?,
                };
                self.group_elements = None;
                Ok(query)
            }
            QueryOp::OfType(entity_type) => self.of_type(query, entity_type),
            QueryOp::Cast(entity_type) => {
                let projection = root_structural(&query).cloned().ok_or_else(|| {
                    QueryError::not_translated(format!("Cast to '{entity_type}' of a non-entity sequence"))
                })?;
                let cast = projection.update_entity_type(self.ctx.model, entity_type)?;
                query.select.mapping.insert(ProjectionMember::root(), ProjectionValue::Structural(cast));
                Ok(query)
            }
            QueryOp::DefaultIfEmpty => {
                let table = TableExpr::Values {
                    rows: ValuesSource::Rows(vec![vec![SqlExpr::int(1)]]),
                    column_names: vec!["empty".to_string()],
                };
                let (empty, _) = SelectBuilder::from_table(&mut self.ctx.aliases, table);
                let JoinResult { mut select, inner, client_offset, .. } =
                    empty.add_join(&mut self.ctx.aliases, JoinKind::Left, query.select, Some(SqlExpr::bool_const(true)))?;
                select.mapping = inner;
                Ok(ShapedQuery::new(select, shaper.offset_clients(client_offset)))
            }
            QueryOp::Include { path, filter } => {
                let projection = root_structural(&query).ok_or_else(|| {
                    QueryError::invalid("Include applies to a sequence of entities")
                })?;
                let entity_type = projection.entity_type.clone();
                let position = match self.includes.iter().position(|(t, _)| *t == entity_type) {
                    Some(p) => p,
                    None => {
                        self.includes.push((entity_type, IncludeTreeBuilder::new()));
                        self.includes.len() - 1
                    }
                };
                self.includes[position].1.include(path, filter.clone())?;
                Ok(query)
            }
            QueryOp::AsSplitQuery => {
                self.ctx.splitting = crate::config::QuerySplittingBehavior::SplitQuery;
                Ok(query)
            }
            QueryOp::AsSingleQuery => {
                self.ctx.splitting = crate::config::QuerySplittingBehavior::SingleQuery;
                Ok(query)
            }
            terminal => QueryError::invalid(format!("'{}' ends the query", terminal.name())).err(),
        }
    }

    /// Scalars of a join or ordering key. Entities contribute their identifying columns.
    fn key_terms(&self, key: Translated) -> QueryResult<Vec<SqlExprRef>> {
        Ok(match key {
            Translated::Sql(e) => vec![e],
            Translated::Structural { projection, .. } => projection.identifying_columns(self.ctx.model)?
                .into_iter()
                .map(|(e, _)| e)
                .collect(),
            Translated::Object(fields) => {
                let mut terms = Vec::new();
                for field in fields.into_values() {
                    terms.extend(self.key_terms(field)?);
                }
                terms
            }
            other => return QueryError::not_translated(format!("a {} used as a key", other.describe())).err(),
        })
    }

    /// Join `inner` and pair both sides; `result` combines them, otherwise the
    /// inner side is the new element.
    fn join(
        &mut self,
        query: ShapedQuery,
        kind: JoinKind,
        inner: ShapedQuery,
        predicate: Option<SqlExprRef>,
        result: Option<&Lambda>,
    ) -> QueryResult<ShapedQuery> {
        if query.select.is_grouped() {
            self.group_elements = None;
        }
        let rewrite = self.ctx.options.rewrite_apply_to_join;
        let JoinResult { mut select, inner: inner_mapping, client_offset, .. } =
            query.select.add_join_with(&mut self.ctx.aliases, kind, inner.select, predicate, rewrite)?;
        let outer_mapping = std::mem::take(&mut select.mapping);
        select.mapping = outer_mapping.into_iter()
            .map(|(m, v)| (m.prepend("Outer"), v))
            .chain(inner_mapping.into_iter().map(|(m, v)| (m.prepend("Inner"), v)))
            .collect();
        let outer_shaper = query.shaper.prefix_members("Outer");
        let inner_shaper = inner.shaper.prefix_members("Inner").offset_clients(client_offset);

        let mut joined = ShapedQuery::new(select, inner_shaper.clone());
        match result {
            Some(l) => {
                let value = self.translate_lambda(&mut joined, &[outer_shaper, inner_shaper], l)?;
                self.project(joined, value)
            }
            None => Ok(joined),
        }
    }

    fn group_by(&mut self, mut query: ShapedQuery, shaper: Shaper, key: &Lambda, element: Option<&Lambda>) -> QueryResult<ShapedQuery> {
        let key = self.translate_lambda(&mut query, &[shaper.clone()], key)?;
        let mut keys = IndexMap::new();
        let key_shaper = flatten_key(key, ProjectionMember::root(), &mut keys)?;
        let query = match element {
            Some(l) => {
                let value = self.translate_lambda(&mut query, &[shaper], l)?;
                self.project(query, value)?
            }
            None => query,
        };
        if query.shaper.has_pending() {
            return QueryError::not_translated("grouping elements containing a collection").err();
        }
        let GroupingResult { select, elements, .. } = query.select.apply_grouping(&mut self.ctx.aliases, keys)?;
        self.group_elements = Some(ShapedQuery::new(elements, query.shaper.clone()));
        let shaper = Shaper::Grouping {
            key: Box::new(key_shaper.prefix_members("Key")),
            element: Box::new(query.shaper),
            key_identifier: Vec::new(),
        };
        Ok(ShapedQuery::new(select, shaper))
    }

    fn of_type(&mut self, mut query: ShapedQuery, entity_type: &str) -> QueryResult<ShapedQuery> {
        let model = self.ctx.model;
        let projection = root_structural(&query).cloned().ok_or_else(|| {
            QueryError::not_translated(format!("OfType '{entity_type}' of a non-entity sequence"))
        })?;
        if model.is_assignable(entity_type, &projection.entity_type) {
            return Ok(query);
        }
        if !model.is_assignable(&projection.entity_type, entity_type) {
            return QueryError::invalid(format!(
                "'{entity_type}' is not a type in the hierarchy of '{}'", projection.entity_type
            )).err();
        }
        let discriminator = projection.discriminator.as_ref().ok_or_else(|| {
            QueryError::not_translated(format!("'{}' has no discriminator", projection.entity_type))
        })?;
        let filter = RootBuilder::discriminator_filter(discriminator, &model.discriminator_values(entity_type)?);
        query.select = query.select.apply_predicate(&mut self.ctx.aliases, filter)?;

        let current = root_structural(&query).cloned().ok_or_else(|| {
            QueryError::invalid("entity projection lost while filtering by type")
        })?;
        let narrowed = current.update_entity_type(model, entity_type)?;
        query.select.mapping.insert(ProjectionMember::root(), ProjectionValue::Structural(narrowed));
        Ok(query)
    }

    fn terminal(&mut self, mut query: ShapedQuery, op: &QueryOp) -> QueryResult<Terminal> {
        if let Some((kind, lambda)) = AggregateKind::of(op) {
            return self.aggregate(query, kind, lambda);
        }
        let shaper = query.shaper.clone();
        let cardinality = |or_default: bool| if or_default { ResultCardinality::SingleOrDefault } else { ResultCardinality::Single };

        match op {
            QueryOp::Any(predicate) => {
                self.apply_filter(&mut query, predicate.as_ref())?;
                Ok(Terminal::Exists { select: query.select.replace_projection(IndexMap::new()), negated: false })
            }
            QueryOp::All(predicate) => {
                let p = self.translate_lambda(&mut query, &[shaper], predicate)?.into_sql()?;
                let negated = self.ctx.options.null_semantics.negate(p);
                query.select = query.select.apply_predicate(&mut self.ctx.aliases, negated)?;
                Ok(Terminal::Exists { select: query.select.replace_projection(IndexMap::new()), negated: true })
            }
            QueryOp::Contains(item) => {
                let item = self.translate_value(&mut query, item)?;
                let Some(ProjectionValue::Scalar(value)) = query.select.mapping.get(&ProjectionMember::root()).cloned() else {
                    return QueryError::not_translated("Contains over a sequence of non-scalar values").err();
                };
                let item = SqlExpr::with_inferred_mapping(&item, value.type_mapping());
                let select = query.select.clear_ordering().replace_projection(IndexMap::from([
                    (ProjectionMember::root(), ProjectionValue::Scalar(value)),
                ]));
                Ok(Terminal::In { item, select })
            }
            QueryOp::First { predicate, or_default } | QueryOp::Single { predicate, or_default } => {
                self.apply_filter(&mut query, predicate.as_ref())?;
                // a second row only serves to detect a non-single top-level result
                let limit = if matches!(op, QueryOp::Single { .. }) && !self.nested { 2 } else { 1 };
                query.select = query.select.apply_limit(&mut self.ctx.aliases, SqlExpr::int(limit))?;
                let query = self.expand_includes(query)?;
                Ok(Terminal::Element(query.with_cardinality(cardinality(*or_default))))
            }
            QueryOp::Last { predicate, or_default } => {
                self.apply_filter(&mut query, predicate.as_ref())?;
                if query.select.orderings.is_empty() {
                    return QueryError::unsupported_operator("Last", Some("no ordering".into())).err();
                }
                query.select = query.select.reverse_orderings(&mut self.ctx.aliases)?;
                query.select = query.select.apply_limit(&mut self.ctx.aliases, SqlExpr::int(1))?;
                let query = self.expand_includes(query)?;
                Ok(Terminal::Element(query.with_cardinality(cardinality(*or_default))))
            }
            QueryOp::ElementAt { index, or_default } => {
                let index = self.translate_value(&mut query, index)?;
                query.select = query.select.apply_offset(&mut self.ctx.aliases, index)?;
                query.select = query.select.apply_limit(&mut self.ctx.aliases, SqlExpr::int(1))?;
                let query = self.expand_includes(query)?;
                Ok(Terminal::Element(query.with_cardinality(cardinality(*or_default))))
            }
            other => QueryError::invalid(format!("'{}' is not a single-value operator", other.name())).err(),
        }
    }

    fn apply_filter(&mut self, query: &mut ShapedQuery, predicate: Option<&Lambda>) -> QueryResult<()> {
        if let Some(l) = predicate {
            let shaper = query.shaper.clone();
            let p = self.translate_lambda(query, &[shaper], l)?.into_sql()?;
            query.select = std::mem::take(&mut query.select).apply_predicate(&mut self.ctx.aliases, p)?;
        }
        Ok(())
    }

    fn aggregate(&mut self, mut query: ShapedQuery, kind: AggregateKind, lambda: Option<&Lambda>) -> QueryResult<Terminal> {
        let shaper = query.shaper.clone();
        if kind.is_count() {
            if let Some(l) = lambda {
                let p = self.translate_lambda(&mut query, &[shaper.clone()], l)?.into_sql()?;
                query.select = query.select.apply_predicate(&mut self.ctx.aliases, p)?;
            }
        }
        if query.select.is_limited() || query.select.distinct || query.select.is_grouped() {
            query.select = query.select.pushdown_into_subquery(&mut self.ctx.aliases)?;
            self.group_elements = None;
        }
        let value = match lambda {
            _ if kind.is_count() => None,
            Some(l) => Some(self.translate_lambda(&mut query, &[shaper], l)?.into_sql()?),
            None => Some(materialize(&query.select.mapping, &query.select.client_projections, &shaper, None)?.into_sql()?),
        };
        let aggregate = kind.build(value)?;
        let mapping = IndexMap::from([(ProjectionMember::root(), ProjectionValue::Scalar(aggregate))]);
        let select = query.select.clear_ordering().replace_projection(mapping);
        Ok(Terminal::Scalar(
            ShapedQuery::new(select, Shaper::member(ProjectionMember::root())).with_cardinality(ResultCardinality::Single),
        ))
    }

    fn expand_includes(&mut self, query: ShapedQuery) -> QueryResult<ShapedQuery> {
        if self.includes.is_empty() {
            return Ok(query);
        }
        let model = self.ctx.model;
        let mut trees = Vec::new();
        for (entity_type, builder) in std::mem::take(&mut self.includes) {
            let tree = builder.build(model, &entity_type)?;
            trees.push((entity_type, tree));
        }
        expand_includes(self.ctx, query, &trees)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{_tests::fixtures, sql::BinaryOp};

    fn sequence(ctx: &mut QueryCompilationContext, query: &Query) -> QueryResult<ShapedQuery> {
        QueryableTranslator::new(ctx, Scope::new()).translate(query)?.into_sequence("test")
    }

    #[test]
    fn paging_composes_without_subquery_until_filtered() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let query = Query::entity("Customer")
            .filter("c", ClientExpr::path("c", &["IsActive"]).eq(ClientExpr::constant(true)))
            .order_by("c", ClientExpr::path("c", &["Name"]))
            .skip(10)
            .take(5);
        let shaped = sequence(&mut ctx, &query).unwrap();
        let (select, _) = shaped.select.clone().finalize().unwrap();
        assert_eq!(select.subquery_count(), 0);
        assert!(select.predicate.is_some());
        assert_eq!(select.orderings.len(), 1);
        assert_eq!(select.offset.as_ref().map(|e| e.to_string()), Some("10".to_string()));
        assert_eq!(select.limit.as_ref().map(|e| e.to_string()), Some("5".to_string()));

        let filtered = query.filter("c", ClientExpr::path("c", &["City"]).ne(ClientExpr::null()));
        let shaped = sequence(&mut ctx, &filtered).unwrap();
        assert_eq!(shaped.select.finalize().unwrap().0.subquery_count(), 1);
    }

    #[test]
    fn distinct_identifies_rows_by_key() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let query = Query::entity("OrderLine").then(QueryOp::Distinct);
        let shaped = sequence(&mut ctx, &query).unwrap();
        let names: Vec<String> = shaped.select.identifier.iter()
            .filter_map(|i| i.expr.as_column().map(|c| c.name.clone()))
            .collect();
        assert_eq!(names, vec!["OrderId".to_string(), "LineNo".to_string()]);
        assert!(shaped.select.distinct);

        let twice = sequence(&mut ctx, &query.then(QueryOp::Distinct)).unwrap();
        let table = twice.select.tables[0].id;
        let again: Vec<String> = twice.select.identifier.iter()
            .filter_map(|i| i.expr.as_column().filter(|c| c.table == table).map(|c| c.name.clone()))
            .collect();
        assert_eq!(again, names);
        assert_eq!(twice.select.identifier.len(), names.len());
        assert_eq!(twice.select.tables.len(), 1);
        assert!(matches!(twice.select.tables[0].table, TableExpr::Table { .. }));
    }

    #[test]
    fn all_treats_null_comparisons_as_failed() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let london = Lambda::new(&["c"], ClientExpr::path("c", &["City"]).eq(ClientExpr::constant("London")));
        let all = QueryableTranslator::new(&mut ctx, Scope::new())
            .translate(&Query::entity("Customer").then(QueryOp::All(london)))
            .unwrap();
        let TranslatedQuery::Terminal(Terminal::Exists { select, negated: true }) = all else {
            panic!("expected NOT EXISTS, got {all:?}")
        };
        let predicate = select.predicate.unwrap().to_string();
        assert!(predicate.contains("<> 'London'"), "{predicate}");
        assert!(predicate.contains("IS NULL"), "{predicate}");
        assert!(!predicate.starts_with("NOT"), "{predicate}");
    }

    #[test]
    fn computed_group_key_is_lifted() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let key = ClientExpr::binary(BinaryOp::Add, ClientExpr::path("p", &["CategoryId"]), ClientExpr::constant(1));
        let query = Query::entity("Product")
            .then(QueryOp::GroupBy { key: Lambda::new(&["p"], key), element: None })
            .select("g", ClientExpr::new_object(vec![
                ("Key", ClientExpr::var("g").member("Key")),
                ("Count", ClientExpr::subquery(Query::grouping(ClientExpr::var("g")).then(QueryOp::Count(None)))),
            ]));
        let shaped = sequence(&mut ctx, &query).unwrap();
        assert_eq!(shaped.select.group_by.len(), 1);
        assert!(shaped.select.group_by[0].is_column());
        let (select, _) = shaped.select.finalize().unwrap();
        assert_eq!(select.subquery_count(), 1);
        assert!(select.projection.iter().any(|p| p.expr.to_string() == "COUNT(*)"));
    }

    #[test]
    fn last_without_ordering_is_unsupported() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let query = Query::entity("Customer").then(QueryOp::Last { predicate: None, or_default: false });
        let err = QueryableTranslator::new(&mut ctx, Scope::new()).translate(&query).unwrap_err();
        assert_eq!(err, QueryError::unsupported_operator("Last", Some("no ordering".into())));
    }

    #[test]
    fn of_type_filters_on_discriminator() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let shaped = sequence(&mut ctx, &Query::entity("Animal").then(QueryOp::OfType("Cat".into()))).unwrap();
        let predicate = shaped.select.predicate.clone().unwrap();
        assert!(predicate.to_string().contains("'Cat'"));
        let root = shaped.select.mapping[&ProjectionMember::root()].as_structural().unwrap();
        assert_eq!(root.entity_type, "Cat");
        assert!(!root.properties.contains_key("Barks"));
    }

    #[test]
    fn any_and_count_terminals() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let any = QueryableTranslator::new(&mut ctx, Scope::new())
            .translate(&Query::entity("Order").then(QueryOp::Any(None)))
            .unwrap();
        assert!(matches!(any, TranslatedQuery::Terminal(Terminal::Exists { negated: false, .. })));

        let count = QueryableTranslator::new(&mut ctx, Scope::new())
            .translate(&Query::entity("Order").take(3).then(QueryOp::Count(None)))
            .unwrap()
            .into_shaped()
            .unwrap();
        assert_eq!(count.cardinality, ResultCardinality::Single);
        let (select, _) = count.select.finalize().unwrap();
        assert_eq!(select.subquery_count(), 1);
        assert_eq!(select.projection[0].expr.to_string(), "COUNT(*)");
    }

    #[test]
    fn join_pairs_both_sides() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let query = Query::entity("Order").then(QueryOp::Join {
            inner: Box::new(Query::entity("Customer")),
            outer_key: Lambda::new(&["o"], ClientExpr::path("o", &["CustomerId"])),
            inner_key: Lambda::new(&["c"], ClientExpr::path("c", &["Id"])),
            result: Lambda::new(&["o", "c"], ClientExpr::new_object(vec![
                ("Id", ClientExpr::path("o", &["Id"])),
                ("Name", ClientExpr::path("c", &["Name"])),
            ])),
        });
        let shaped = sequence(&mut ctx, &query).unwrap();
        assert_eq!(shaped.select.tables.len(), 2);
        assert_eq!(shaped.select.tables[1].join_kind(), Some(JoinKind::Inner));
        assert!(matches!(shaped.shaper, Shaper::Object(ref f) if f.len() == 2));
    }

    #[test]
    fn collection_projection_stays_pending() {
        let model = fixtures::model();
        let mut ctx = fixtures::context(&model);
        let query = Query::entity("Customer").select("c", ClientExpr::new_object(vec![
            ("Name", ClientExpr::path("c", &["Name"])),
            ("Orders", ClientExpr::path("c", &["Orders"])),
        ]));
        let shaped = sequence(&mut ctx, &query).unwrap();
        assert!(shaped.shaper.has_pending());
        assert!(!shaped.select.client_projections.is_empty());
    }
}
