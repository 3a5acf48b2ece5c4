//! Decides whether a tax group applies to a transaction context.

use crate::models::{ContextAssignment, TransactionContext};

/// Returns true when a group with the given context `scope` applies to
/// `context`.
///
/// An empty scope is global and matches every context, including the empty
/// one. Otherwise at least one scoped entity must be present in the context.
pub fn applies(
    scope: &[ContextAssignment],
    context: &TransactionContext,
) -> bool {
    scope.is_empty() || scope.iter().any(|assignment| context.contains(&assignment.key))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::ContextKey;

    fn scoped(keys: &[(&str, &str)]) -> Vec<ContextAssignment> {
        keys.iter()
            .enumerate()
            .map(|(i, (entity_type, entity_id))| ContextAssignment {
                id: i as i64 + 1,
                tax_group_id: 1,
                key: ContextKey::new(entity_type, *entity_id),
                created_at: Utc::now(),
            })
            .collect()
    }

    #[test]
    fn global_group_matches_empty_context() {
        assert!(applies(&[], &TransactionContext::new()));
    }

    #[test]
    fn global_group_matches_any_context() {
        let context = TransactionContext::new().with("regions", ["bandung"]);

        assert!(applies(&[], &context));
    }

    #[test]
    fn scoped_group_needs_matching_entity() {
        let scope = scoped(&[("region", "jakarta")]);

        assert!(applies(&scope, &TransactionContext::new().with("regions", ["jakarta"])));
        assert!(!applies(&scope, &TransactionContext::new().with("regions", ["bandung"])));
    }

    #[test]
    fn scoped_group_never_matches_empty_context() {
        let scope = scoped(&[("region", "jakarta")]);

        assert!(!applies(&scope, &TransactionContext::new()));
    }

    #[test]
    fn entity_type_must_match_as_well_as_id() {
        let scope = scoped(&[("category", "jakarta")]);

        assert!(!applies(&scope, &TransactionContext::new().with("regions", ["jakarta"])));
    }

    #[test]
    fn any_of_several_scopes_is_enough() {
        let scope = scoped(&[("region", "jakarta"), ("category", "food")]);
        let context = TransactionContext::new()
            .with("regions", ["surabaya"])
            .with("categories", ["food", "drinks"]);

        assert!(applies(&scope, &context));
    }

    #[test]
    fn unknown_entity_types_work_without_code_changes() {
        let scope = scoped(&[("warehouses", "wh-3")]);

        assert!(applies(&scope, &TransactionContext::new().with("Warehouses", ["wh-3"])));
    }
}
