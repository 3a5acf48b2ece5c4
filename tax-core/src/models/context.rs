//! Transaction context and the polymorphic entity keys groups are scoped to.
//!
//! Callers describe a transaction with plural entity-type names
//! (`{"regions": ["jakarta"], "categories": ["food"]}`). Keys are normalised
//! exactly once, when a [`TransactionContext`] is built, so matching and
//! storage only ever see singular, lowercase entity types.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// Identifies one transaction-context entity, e.g. `("region", "jakarta")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl ContextKey {
    /// Builds a key, normalising `entity_type` the same way context maps are.
    pub fn new(
        entity_type: &str,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: normalize_entity_type(entity_type),
            entity_id: entity_id.into(),
        }
    }
}

/// The set of entities describing a transaction, keyed by singular entity type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "HashMap<String, Vec<String>>",
    into = "BTreeMap<String, BTreeSet<String>>"
)]
pub struct TransactionContext {
    entries: BTreeMap<String, BTreeSet<String>>,
}

impl TransactionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds ids under a (possibly plural) entity-type name.
    pub fn with<I, S>(
        mut self,
        entity_type: &str,
        ids: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert(entity_type, ids);
        self
    }

    pub fn insert<I, S>(
        &mut self,
        entity_type: &str,
        ids: I,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = normalize_entity_type(entity_type);
        if key.is_empty() {
            return;
        }
        let ids: BTreeSet<String> = ids
            .into_iter()
            .map(Into::into)
            .filter(|id: &String| !id.is_empty())
            .collect();
        if ids.is_empty() {
            return;
        }
        self.entries.entry(key).or_default().extend(ids);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(
        &self,
        key: &ContextKey,
    ) -> bool {
        self.entries
            .get(&key.entity_type)
            .is_some_and(|ids| ids.contains(&key.entity_id))
    }

    /// Singular entity types present in the context.
    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Every `(entity_type, entity_id)` pair, in deterministic order.
    pub fn keys(&self) -> impl Iterator<Item = ContextKey> + '_ {
        self.entries.iter().flat_map(|(entity_type, ids)| {
            ids.iter().map(move |id| ContextKey {
                entity_type: entity_type.clone(),
                entity_id: id.clone(),
            })
        })
    }
}

impl<S: Into<String>> From<HashMap<String, Vec<S>>> for TransactionContext {
    fn from(raw: HashMap<String, Vec<S>>) -> Self {
        let mut context = Self::new();
        for (entity_type, ids) in raw {
            context.insert(&entity_type, ids);
        }
        context
    }
}

impl From<TransactionContext> for BTreeMap<String, BTreeSet<String>> {
    fn from(context: TransactionContext) -> Self {
        context.entries
    }
}

/// Trims, lowercases and singularises an entity-type name
/// (`"Regions"` → `"region"`, `"categories"` → `"category"`).
pub fn normalize_entity_type(name: &str) -> String {
    singularize(&name.trim().to_lowercase())
}

fn singularize(word: &str) -> String {
    const KEEP: [&str; 6] = ["ss", "us", "is", "news", "series", "species"];
    const ES_ENDINGS: [&str; 5] = ["sses", "xes", "zes", "ches", "shes"];

    if KEEP.iter().any(|ending| word.ends_with(ending)) {
        return word.to_string();
    }
    if let Some(stem) = word.strip_suffix("ies") {
        if !stem.is_empty() {
            return format!("{stem}y");
        }
    }
    if ES_ENDINGS.iter().any(|ending| word.ends_with(ending)) {
        return word[..word.len() - 2].to_string();
    }
    match word.strip_suffix('s') {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => word.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn singularizes_common_plurals() {
        assert_eq!(normalize_entity_type("regions"), "region");
        assert_eq!(normalize_entity_type("categories"), "category");
        assert_eq!(normalize_entity_type("products"), "product");
        assert_eq!(normalize_entity_type("boxes"), "box");
        assert_eq!(normalize_entity_type("branches"), "branch");
        assert_eq!(normalize_entity_type("addresses"), "address");
    }

    #[test]
    fn keeps_singular_names() {
        assert_eq!(normalize_entity_type("region"), "region");
        assert_eq!(normalize_entity_type("address"), "address");
        assert_eq!(normalize_entity_type("status"), "status");
        assert_eq!(normalize_entity_type("tax"), "tax");
    }

    #[test]
    fn trims_and_lowercases() {
        assert_eq!(normalize_entity_type("  Regions "), "region");
    }

    #[test]
    fn context_from_raw_map_normalizes_keys() {
        let raw = HashMap::from([
            ("regions".to_string(), vec!["jakarta", "bandung"]),
            ("categories".to_string(), vec!["food"]),
        ]);

        let context = TransactionContext::from(raw);

        assert!(context.contains(&ContextKey::new("region", "jakarta")));
        assert!(context.contains(&ContextKey::new("regions", "bandung")));
        assert!(context.contains(&ContextKey::new("category", "food")));
        assert!(!context.contains(&ContextKey::new("region", "surabaya")));
        assert_eq!(context.entity_types().collect::<Vec<_>>(), vec!["category", "region"]);
    }

    #[test]
    fn empty_id_lists_are_dropped() {
        let context = TransactionContext::new().with("regions", Vec::<String>::new());

        assert!(context.is_empty());
    }

    #[test]
    fn plural_and_singular_keys_merge() {
        let context = TransactionContext::new()
            .with("regions", ["jakarta"])
            .with("region", ["bandung"]);

        assert_eq!(context.keys().count(), 2);
    }
}
