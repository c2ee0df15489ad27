use indexmap::IndexMap;

use crate::{
    error::{QueryError, QueryResult},
    metadata::{Model, Navigation},
    translation::QueryOp
};

/// Navigations to load together with an entity, as a tree of paths.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IncludeTree {
    nodes: IndexMap<String, IncludeNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncludeNode {
    pub navigation: Navigation,
    /// Type declaring the navigation; a derived type for includes through a cast
    pub declaring_type: String,
    /// Operators narrowing an included collection (`Where`, ordering, `Skip`, `Take`)
    pub filter: Vec<QueryOp>,
    pub children: IncludeTree,
}

impl IncludeNode {
    pub fn is_collection(&self) -> bool {
        self.navigation.is_collection
    }

    /// Part of the owner's row already (JSON-mapped owned navigation).
    pub fn is_embedded(&self) -> bool {
        self.navigation.owned && self.navigation.is_json_mapped()
    }
}

impl IncludeTree {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, navigation: &str) -> Option<&IncludeNode> {
        self.nodes.get(navigation)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &IncludeNode> {
        self.nodes.values()
    }

    /// Reference navigations first, then collections, each in declaration order.
    pub fn expansion_order(&self) -> Vec<&IncludeNode> {
        let (references, collections): (Vec<_>, Vec<_>) = self.nodes.values().partition(|n| !n.is_collection());
        references.into_iter().chain(collections).collect()
    }
}

#[derive(Debug, Clone, Default)]
struct PendingNode {
    filter: Vec<QueryOp>,
    children: IndexMap<String, PendingNode>,
}

/// Collects include paths, merging the ones that share a prefix.
#[derive(Debug, Clone, Default)]
pub struct IncludeTreeBuilder {
    roots: IndexMap<String, PendingNode>,
}

impl IncludeTreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `path` (`Include` followed by `ThenInclude`s); `filter` narrows its last navigation.
    pub fn include(&mut self, path: &[String], filter: Vec<QueryOp>) -> QueryResult<()> {
        let Some((last, prefix)) = path.split_last() else {
            return QueryError::invalid("include path is empty").err();
        };
        if let Some(op) = filter.iter().find(|op| !op.is_include_filter()) {
            return QueryError::invalid(format!("'{}' cannot be used in a filtered include", op.name())).err();
        }
        let mut level = &mut self.roots;
        for segment in prefix {
            level = &mut level.entry(segment.clone()).or_default().children;
        }
        let node = level.entry(last.clone()).or_default();
        if !filter.is_empty() {
            if !node.filter.is_empty() && node.filter != filter {
                return QueryError::invalid(format!("'{last}' is included with different filters")).err();
            }
            node.filter = filter;
        }
        Ok(())
    }

    /// Resolve every path against `entity_type`. Navigations of derived
    /// types are found too.
    pub fn build(self, model: &Model, entity_type: &str) -> QueryResult<IncludeTree> {
        Self::resolve(model, entity_type, self.roots)
    }

    fn resolve(model: &Model, entity_type: &str, pending: IndexMap<String, PendingNode>) -> QueryResult<IncludeTree> {
        let mut nodes = IndexMap::new();
        for (name, node) in pending {
            let (declaring_type, navigation) = Self::find_navigation(model, entity_type, &name)?;
            if !navigation.is_collection && !node.filter.is_empty() {
                return QueryError::invalid(format!("reference navigation '{name}' cannot be filtered")).err();
            }
            let children = Self::resolve(model, &navigation.target, node.children)?;
            nodes.insert(name, IncludeNode { navigation, declaring_type, filter: node.filter, children });
        }
        Ok(IncludeTree { nodes })
    }

    fn find_navigation(model: &Model, entity_type: &str, name: &str) -> QueryResult<(String, Navigation)> {
        for candidate in model.type_and_descendants(entity_type)? {
            if let Some(nav) = model.find_navigation(&candidate.name, name)? {
                return Ok((candidate.name.clone(), nav.clone()));
            }
        }
        QueryError::invalid(format!("'{name}' is not a navigation of '{entity_type}'")).err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        _tests::fixtures,
        translation::{ClientExpr, Lambda}
    };

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn shared_prefixes_merge() {
        let model = fixtures::model();
        let mut builder = IncludeTreeBuilder::new();
        builder.include(&path(&["Orders"]), vec![]).unwrap();
        builder.include(&path(&["Orders", "Lines"]), vec![]).unwrap();
        builder.include(&path(&["Orders", "Lines", "Product"]), vec![]).unwrap();
        let tree = builder.build(&model, "Customer").unwrap();

        assert_eq!(tree.len(), 1);
        let orders = tree.get("Orders").unwrap();
        assert!(orders.is_collection());
        let lines = orders.children.get("Lines").unwrap();
        assert_eq!(lines.children.get("Product").unwrap().navigation.target, "Product");
    }

    #[test]
    fn references_expand_before_collections() {
        let model = fixtures::model();
        let mut builder = IncludeTreeBuilder::new();
        builder.include(&path(&["Lines"]), vec![]).unwrap();
        builder.include(&path(&["Customer"]), vec![]).unwrap();
        let tree = builder.build(&model, "Order").unwrap();
        let order: Vec<&str> = tree.expansion_order().iter().map(|n| n.navigation.name.as_str()).collect();
        assert_eq!(order, vec!["Customer", "Lines"]);
    }

    #[test]
    fn unknown_navigation_is_invalid() {
        let model = fixtures::model();
        let mut builder = IncludeTreeBuilder::new();
        builder.include(&path(&["Nope"]), vec![]).unwrap();
        let err = builder.build(&model, "Customer").unwrap_err();
        assert!(!err.is_translation_failure());
    }

    #[test]
    fn conflicting_filters_are_invalid() {
        let filter = |n: i64| vec![QueryOp::Take(ClientExpr::constant(n))];
        let mut builder = IncludeTreeBuilder::new();
        builder.include(&path(&["Orders"]), filter(1)).unwrap();
        builder.include(&path(&["Orders"]), filter(1)).unwrap();
        assert!(builder.include(&path(&["Orders"]), filter(2)).is_err());
    }

    #[test]
    fn unsupported_filter_operator_is_invalid() {
        let mut builder = IncludeTreeBuilder::new();
        let select = QueryOp::Select(Lambda::new(&["o"], ClientExpr::var("o")));
        let err = builder.include(&path(&["Orders"]), vec![select]).unwrap_err();
        assert!(matches!(err, QueryError::InvalidOperation(_)));
    }
}
