//! Best-effort bulk variants of the engine's tax and group mutations.
//!
//! Each item runs as its own unit of work through the single-item operation,
//! so one failing item never rolls back the others. Callers that need
//! all-or-nothing creation use [`TaxEngine::create_taxes_atomic`].

use tracing::warn;

use super::error::EngineError;
use super::TaxEngine;
use crate::models::{Owner, Tax, TaxGroup, TaxGroupInput, TaxGroupUpdate, TaxInput, TaxUpdate};

/// Why one item of a bulk request failed.
#[derive(Debug, PartialEq, Eq)]
pub struct BulkFailure {
    /// Position of the item in the request.
    pub index: usize,
    /// Id of the targeted record, for updates and deletes.
    pub id: Option<i64>,
    pub error: EngineError,
}

/// Per-item outcome of a bulk request.
#[derive(Debug, PartialEq, Eq)]
pub struct BulkOutcome<T> {
    pub succeeded: Vec<T>,
    pub failures: Vec<BulkFailure>,
}

impl<T> Default for BulkOutcome<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<T> BulkOutcome<T> {
    fn record(
        &mut self,
        index: usize,
        id: Option<i64>,
        result: Result<T, EngineError>,
    ) {
        match result {
            Ok(value) => self.succeeded.push(value),
            Err(error) => self.failures.push(BulkFailure { index, id, error }),
        }
    }

    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// The succeeded values, or [`EngineError::PartialBulkFailure`] if any
    /// item failed.
    pub fn into_result(self) -> Result<Vec<T>, EngineError> {
        if self.failures.is_empty() {
            return Ok(self.succeeded);
        }
        Err(EngineError::PartialBulkFailure {
            succeeded: self.succeeded.len(),
            failed: self.failures.len(),
        })
    }

    fn report(
        self,
        operation: &str,
    ) -> Self {
        if !self.is_complete() {
            warn!(
                operation,
                succeeded = self.success_count(),
                failed = self.failure_count(),
                "Bulk operation partially failed"
            );
        }
        self
    }
}

impl TaxEngine {
    pub async fn create_bulk_taxes(
        &self,
        owner: &Owner,
        inputs: Vec<TaxInput>,
    ) -> BulkOutcome<Tax> {
        let mut outcome = BulkOutcome::default();
        for (index, input) in inputs.into_iter().enumerate() {
            outcome.record(index, None, self.create_tax(owner, input).await);
        }
        outcome.report("create_bulk_taxes")
    }

    pub async fn update_bulk_taxes(
        &self,
        owner: &Owner,
        updates: Vec<(i64, TaxUpdate)>,
    ) -> BulkOutcome<Tax> {
        let mut outcome = BulkOutcome::default();
        for (index, (id, changes)) in updates.into_iter().enumerate() {
            outcome.record(index, Some(id), self.update_tax(owner, id, changes).await);
        }
        outcome.report("update_bulk_taxes")
    }

    /// Succeeded values are the ids that were deleted.
    pub async fn delete_bulk_taxes(
        &self,
        owner: &Owner,
        ids: &[i64],
    ) -> BulkOutcome<i64> {
        let mut outcome = BulkOutcome::default();
        for (index, &id) in ids.iter().enumerate() {
            let result = self.delete_tax(owner, id).await.map(|()| id);
            outcome.record(index, Some(id), result);
        }
        outcome.report("delete_bulk_taxes")
    }

    pub async fn create_bulk_tax_groups(
        &self,
        owner: &Owner,
        inputs: Vec<TaxGroupInput>,
    ) -> BulkOutcome<TaxGroup> {
        let mut outcome = BulkOutcome::default();
        for (index, input) in inputs.into_iter().enumerate() {
            outcome.record(index, None, self.create_tax_group(owner, input).await);
        }
        outcome.report("create_bulk_tax_groups")
    }

    pub async fn update_bulk_tax_groups(
        &self,
        owner: &Owner,
        updates: Vec<(i64, TaxGroupUpdate)>,
    ) -> BulkOutcome<TaxGroup> {
        let mut outcome = BulkOutcome::default();
        for (index, (id, changes)) in updates.into_iter().enumerate() {
            outcome.record(index, Some(id), self.update_tax_group(owner, id, changes).await);
        }
        outcome.report("update_bulk_tax_groups")
    }

    pub async fn delete_bulk_tax_groups(
        &self,
        owner: &Owner,
        ids: &[i64],
    ) -> BulkOutcome<i64> {
        let mut outcome = BulkOutcome::default();
        for (index, &id) in ids.iter().enumerate() {
            let result = self.delete_tax_group(owner, id).await.map(|()| id);
            outcome.record(index, Some(id), result);
        }
        outcome.report("delete_bulk_tax_groups")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::memory::MemoryRepository;
    use crate::engine::error::Entity;

    fn engine() -> TaxEngine {
        TaxEngine::new(Arc::new(MemoryRepository::new()))
    }

    fn merchant(id: &str) -> Owner {
        Owner::scoped("merchant", id).unwrap()
    }

    #[tokio::test]
    async fn bulk_create_reports_each_failure() {
        let engine = engine();

        let outcome = engine
            .create_bulk_taxes(
                &Owner::System,
                vec![
                    TaxInput::named("VAT"),
                    TaxInput::named(""),
                    TaxInput::named("VAT"),
                    TaxInput::named("Luxury"),
                ],
            )
            .await;

        assert_eq!(outcome.success_count(), 2);
        assert_eq!(outcome.failures.iter().map(|f| f.index).collect::<Vec<_>>(), vec![1, 2]);
        assert!(matches!(outcome.failures[0].error, EngineError::Validation(_)));
        assert!(matches!(outcome.failures[1].error, EngineError::Conflict(_)));
        assert_eq!(engine.list_taxes(&Owner::System).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn partial_failure_converts_to_error() {
        let engine = engine();

        let result = engine
            .create_bulk_taxes(&Owner::System, vec![TaxInput::named("VAT"), TaxInput::named("VAT")])
            .await
            .into_result();

        assert_eq!(
            result,
            Err(EngineError::PartialBulkFailure {
                succeeded: 1,
                failed: 1
            })
        );
    }

    #[tokio::test]
    async fn complete_outcome_converts_to_values() {
        let engine = engine();

        let groups = engine
            .create_bulk_tax_groups(
                &merchant("m1"),
                vec![TaxGroupInput::named("Dine-in"), TaxGroupInput::named("Takeaway")],
            )
            .await
            .into_result()
            .unwrap();

        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.owner == merchant("m1")));
    }

    #[tokio::test]
    async fn bulk_update_applies_ownership_per_item() {
        let engine = engine();
        let mine = engine.create_tax(&merchant("m1"), TaxInput::named("Mine")).await.unwrap();
        let theirs = engine.create_tax(&merchant("m2"), TaxInput::named("Theirs")).await.unwrap();
        let rename = || TaxUpdate {
            name: Some("Renamed".to_string()),
            ..Default::default()
        };

        let outcome = engine
            .update_bulk_taxes(&merchant("m1"), vec![(mine.id, rename()), (theirs.id, rename())])
            .await;

        assert_eq!(outcome.succeeded[0].name, "Renamed");
        assert_eq!(
            outcome.failures,
            vec![BulkFailure {
                index: 1,
                id: Some(theirs.id),
                error: EngineError::OwnershipMismatch {
                    entity: Entity::Tax,
                    id: theirs.id
                },
            }]
        );
        assert_eq!(engine.get_tax(theirs.id).await.unwrap().name, "Theirs");
    }

    #[tokio::test]
    async fn bulk_delete_returns_deleted_ids() {
        let engine = engine();
        let a = engine.create_tax(&Owner::System, TaxInput::named("A")).await.unwrap();
        let b = engine.create_tax(&Owner::System, TaxInput::named("B")).await.unwrap();

        let outcome = engine.delete_bulk_taxes(&Owner::System, &[a.id, 999, b.id]).await;

        assert_eq!(outcome.succeeded, vec![a.id, b.id]);
        assert_eq!(outcome.failures[0].id, Some(999));
        assert!(matches!(outcome.failures[0].error, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn bulk_group_update_and_delete() {
        let engine = engine();
        let group = engine
            .create_tax_group(&Owner::System, TaxGroupInput::named("Old"))
            .await
            .unwrap();

        let updated = engine
            .update_bulk_tax_groups(
                &Owner::System,
                vec![(
                    group.id,
                    TaxGroupUpdate {
                        is_active: Some(false),
                        ..Default::default()
                    },
                )],
            )
            .await;
        let deleted = engine.delete_bulk_tax_groups(&Owner::System, &[group.id]).await;

        assert!(!updated.succeeded[0].is_active);
        assert!(deleted.is_complete());
        assert!(engine.get_tax_group(group.id).await.is_err());
    }

    #[tokio::test]
    async fn atomic_create_rolls_back_on_conflict() {
        let engine = engine();
        engine.create_tax(&Owner::System, TaxInput::named("VAT")).await.unwrap();

        let result = engine
            .create_taxes_atomic(&Owner::System, vec![TaxInput::named("Luxury"), TaxInput::named("VAT")])
            .await;

        assert!(matches!(result, Err(EngineError::Conflict(_))));
        assert_eq!(engine.list_taxes(&Owner::System).await.unwrap().len(), 1);
    }
}
