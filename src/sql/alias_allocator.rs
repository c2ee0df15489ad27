use std::{collections::HashMap, fmt};

/// Stable handle of a table source within one compilation.
///
/// Columns store this handle instead of the table itself, so replacing a
/// table only touches the owning select's source list.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(u32);

impl TableId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

impl fmt::Debug for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableId({})", self.0)
    }
}

/// A freshly generated alias together with its handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableAlias {
    pub id: TableId,
    pub name: String,
}

/// Hands out table aliases that are unique within one query compilation.
///
/// The alias is the first ASCII letter of the hint, lower-cased. Repeated
/// letters get a numeric suffix: `c`, `c0`, `c1`, ... Given the same sequence
/// of calls the same aliases come out, which keeps generated SQL stable.
#[derive(Debug, Default, Clone)]
pub struct AliasAllocator {
    counters: HashMap<char, usize>,
    aliases: Vec<String>,
}

impl AliasAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate_table_alias(&mut self, hint: &str) -> TableAlias {
        let letter = hint.chars()
            .find(|c| c.is_ascii_alphabetic())
            .map(|c| c.to_ascii_lowercase())
            .unwrap_or('t');

        let counter = self.counters.entry(letter).or_insert(0);
        let name = if *counter == 0 {
            letter.to_string()
        } else {
            format!("{}{}", letter, *counter - 1)
        };
        *counter += 1;

        let id = TableId(self.aliases.len() as u32);
        self.aliases.push(name.clone());
        TableAlias { id, name }
    }

    pub fn alias_of(&self, id: TableId) -> Option<&str> {
        self.aliases.get(id.index()).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn aliases_use_first_letter_and_suffix() {
        let mut a = AliasAllocator::new();
        assert_eq!(a.generate_table_alias("Customers").name, "c");
        assert_eq!(a.generate_table_alias("customers").name, "c0");
        assert_eq!(a.generate_table_alias("Orders").name, "o");
        assert_eq!(a.generate_table_alias("Cities").name, "c1");
        assert_eq!(a.generate_table_alias("").name, "t");
        assert_eq!(a.generate_table_alias("_1").name, "t0");
    }

    #[test]
    fn handles_resolve_to_their_alias() {
        let mut a = AliasAllocator::new();
        let x = a.generate_table_alias("x");
        let y = a.generate_table_alias("x");
        assert_ne!(x.id, y.id);
        assert_eq!(a.alias_of(y.id), Some("x0"));
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn allocation_is_deterministic() {
        let hints = ["Orders", "subquery", "Orders", "union", "s"];
        let run = || {
            let mut a = AliasAllocator::new();
            hints.iter().map(|h| a.generate_table_alias(h).name).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    proptest! {
        #[test]
        fn aliases_are_pairwise_distinct(hints in proptest::collection::vec("[a-zA-Z_0-9]{0,6}", 1..200)) {
            let mut a = AliasAllocator::new();
            let mut seen = HashSet::new();
            for h in &hints {
                let alias = a.generate_table_alias(h);
                prop_assert!(seen.insert(alias.name.clone()), "duplicate alias {}", alias.name);
            }
        }
    }
}
