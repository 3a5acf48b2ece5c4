//! Gathers the rates that apply to an owner and transaction context.
//!
//! # Algorithm
//!
//! | Step | Description |
//! |------|-------------|
//! | 1    | Load active system taxes, plus active taxes of the owner when it is scoped |
//! | 2    | For each tax, load the active groups linked to it |
//! | 3    | Keep groups whose context scope matches the transaction context |
//! | 4    | Load each group's rates valid at `as_of` that belong to the tax |
//! | 5    | Optionally drop rates whose price band excludes the price |
//! | 6    | Keep one rate per priority, ordered ascending |
//!
//! Ties on priority are broken by the lowest `(tax_id, tax_group_id, rate id)`,
//! so the outcome never depends on store iteration order.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::calculations::calculator::RateEntry;
use crate::calculations::matcher;
use crate::db::repository::{
    RepositoryError, TaxAssignmentStore, TaxGroupStore, TaxRateStore, TaxRepository, TaxStore,
};
use crate::models::{AssignedEntity, Owner, Tax, TaxRate, TransactionContext};

/// Resolves rates across the owner hierarchy against one repository.
pub struct HierarchyResolver<'a, R: TaxRepository + ?Sized> {
    repository: &'a R,
}

impl<'a, R: TaxRepository + ?Sized> HierarchyResolver<'a, R> {
    pub fn new(repository: &'a R) -> Self {
        Self { repository }
    }

    /// Rates applying to `owner` in `context` at `as_of`, one per priority,
    /// sorted ascending.
    pub async fn resolve(
        &self,
        owner: &Owner,
        context: &TransactionContext,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<RateEntry>, RepositoryError> {
        let candidates = self.collect(owner, context, as_of, None).await?;
        Ok(deduplicate_by_priority(candidates))
    }

    /// Like [`resolve`](Self::resolve), but rates whose `[min_price,
    /// max_price]` band excludes `price` are dropped before deduplication.
    pub async fn resolve_for_price(
        &self,
        owner: &Owner,
        context: &TransactionContext,
        as_of: DateTime<Utc>,
        price: Decimal,
    ) -> Result<Vec<RateEntry>, RepositoryError> {
        let candidates = self.collect(owner, context, as_of, Some(price)).await?;
        Ok(deduplicate_by_priority(candidates))
    }

    /// Active taxes visible to `owner`: system taxes first, then the owner's.
    pub async fn visible_taxes(
        &self,
        owner: &Owner,
    ) -> Result<Vec<Tax>, RepositoryError> {
        let mut taxes = self.repository.find_taxes_by_owner(&Owner::System).await?;
        if !owner.is_system() {
            taxes.extend(self.repository.find_taxes_by_owner(owner).await?);
        }
        taxes.retain(|tax| tax.is_active);
        Ok(taxes)
    }

    async fn collect(
        &self,
        owner: &Owner,
        context: &TransactionContext,
        as_of: DateTime<Utc>,
        price: Option<Decimal>,
    ) -> Result<Vec<RateEntry>, RepositoryError> {
        let mut entries = Vec::new();

        for tax in self.visible_taxes(owner).await? {
            let groups = self
                .repository
                .find_groups_by_assigned_entity(&AssignedEntity::Tax { tax_id: tax.id })
                .await?;

            for group in groups {
                if !group.is_active {
                    debug!(tax_id = tax.id, group_id = group.id, "Skipping inactive group");
                    continue;
                }

                let scope = self.repository.find_assignments_by_group(group.id).await?;
                if !matcher::applies(&scope, context) {
                    debug!(tax_id = tax.id, group_id = group.id, "Group out of context scope");
                    continue;
                }

                let rates = self
                    .repository
                    .find_active_rates_by_group(group.id, as_of)
                    .await?;

                entries.extend(
                    rates
                        .into_iter()
                        .filter(|rate| rate.tax_id == tax.id)
                        .filter(|rate| price.is_none_or(|price| rate.covers_price(price)))
                        .map(|rate| rate_entry(&tax, rate)),
                );
            }
        }

        debug!(owner = %owner, candidates = entries.len(), "Collected candidate rates");
        Ok(entries)
    }
}

fn rate_entry(
    tax: &Tax,
    rate: TaxRate,
) -> RateEntry {
    RateEntry {
        id: rate.id,
        tax_id: rate.tax_id,
        tax_group_id: rate.tax_group_id,
        name: tax.name.clone(),
        rate: rate.rate,
        rate_type: rate.rate_type,
        is_inclusive: rate.is_inclusive,
        priority: rate.priority,
        based_on: rate.based_on,
    }
}

/// Keeps one entry per priority and returns them in ascending priority.
///
/// Within a priority the entry with the lowest `(tax_id, tax_group_id, id)`
/// wins; the others are discarded, never summed.
pub fn deduplicate_by_priority(mut entries: Vec<RateEntry>) -> Vec<RateEntry> {
    entries.sort_by_key(|entry| (entry.priority, entry.tax_id, entry.tax_group_id, entry.id));
    entries.dedup_by_key(|entry| entry.priority);
    entries
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::db::memory::MemoryRepository;
    use crate::models::{
        ContextKey, NewTaxRate, RateBasis, RateType, TaxGroupInput, TaxInput,
    };

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn merchant(id: &str) -> Owner {
        Owner::scoped("merchant", id).unwrap()
    }

    /// Creates a tax with one linked group holding a single percentage rate.
    async fn seed(
        repo: &MemoryRepository,
        owner: &Owner,
        name: &str,
        rate: Decimal,
        priority: i32,
    ) -> (i64, i64) {
        let tax = repo
            .create_tax(TaxInput::named(name).into_new_tax(owner.clone()))
            .await
            .unwrap();
        let group = repo
            .create_group(TaxGroupInput::named(name).into_new_group(owner.clone()))
            .await
            .unwrap();
        repo.link_tax(group.id, tax.id).await.unwrap();
        repo.create_rate(NewTaxRate::percentage(group.id, tax.id, rate, priority))
            .await
            .unwrap();
        (tax.id, group.id)
    }

    fn entry(
        id: i64,
        tax_id: i64,
        tax_group_id: i64,
        priority: i32,
    ) -> RateEntry {
        RateEntry {
            id,
            tax_id,
            tax_group_id,
            name: format!("Tax {tax_id}"),
            rate: dec!(1),
            rate_type: RateType::Percentage,
            is_inclusive: false,
            priority,
            based_on: RateBasis::Price,
        }
    }

    // =========================================================================
    // deduplicate_by_priority
    // =========================================================================

    #[test]
    fn dedup_keeps_lowest_tax_then_group_then_rate() {
        let entries = vec![
            entry(10, 5, 1, 1),
            entry(11, 2, 9, 1),
            entry(12, 2, 3, 1),
            entry(9, 2, 3, 1),
        ];

        let result = deduplicate_by_priority(entries);

        assert_eq!(result, vec![entry(9, 2, 3, 1)]);
    }

    #[test]
    fn dedup_sorts_ascending_with_one_entry_per_priority() {
        let entries = vec![entry(1, 1, 1, 3), entry(2, 2, 2, 1), entry(3, 3, 3, 3), entry(4, 4, 4, 2)];

        let priorities: Vec<i32> = deduplicate_by_priority(entries)
            .iter()
            .map(|e| e.priority)
            .collect();

        assert_eq!(priorities, vec![1, 2, 3]);
    }

    #[test]
    fn dedup_is_independent_of_input_order() {
        let a = vec![entry(1, 1, 1, 1), entry(2, 2, 2, 1), entry(3, 3, 3, 2)];
        let mut b = a.clone();
        b.reverse();

        assert_eq!(deduplicate_by_priority(a), deduplicate_by_priority(b));
    }

    // =========================================================================
    // resolve
    // =========================================================================

    #[tokio::test]
    async fn empty_store_resolves_to_nothing() {
        let repo = MemoryRepository::new();

        let rates = HierarchyResolver::new(&repo)
            .resolve(&merchant("m1"), &TransactionContext::new(), now())
            .await
            .unwrap();

        assert!(rates.is_empty());
    }

    #[tokio::test]
    async fn system_and_owner_taxes_are_combined() {
        let repo = MemoryRepository::new();
        seed(&repo, &Owner::System, "VAT", dec!(11), 2).await;
        seed(&repo, &merchant("m1"), "Service", dec!(5), 1).await;
        seed(&repo, &merchant("m2"), "Other", dec!(7), 3).await;

        let rates = HierarchyResolver::new(&repo)
            .resolve(&merchant("m1"), &TransactionContext::new(), now())
            .await
            .unwrap();

        let names: Vec<&str> = rates.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Service", "VAT"]);
    }

    #[tokio::test]
    async fn system_owner_sees_only_system_taxes() {
        let repo = MemoryRepository::new();
        seed(&repo, &Owner::System, "VAT", dec!(11), 1).await;
        seed(&repo, &merchant("m1"), "Service", dec!(5), 2).await;

        let rates = HierarchyResolver::new(&repo)
            .resolve(&Owner::System, &TransactionContext::new(), now())
            .await
            .unwrap();

        assert_eq!(rates.len(), 1);
        assert_eq!(rates[0].name, "VAT");
    }

    #[tokio::test]
    async fn unknown_owner_type_yields_system_taxes() {
        let repo = MemoryRepository::new();
        seed(&repo, &Owner::System, "VAT", dec!(11), 1).await;

        let owner = Owner::scoped("galaxy", "g1").unwrap();
        let rates = HierarchyResolver::new(&repo)
            .resolve(&owner, &TransactionContext::new(), now())
            .await
            .unwrap();

        assert_eq!(rates.len(), 1);
    }

    #[tokio::test]
    async fn group_scoped_to_other_region_is_excluded() {
        let repo = MemoryRepository::new();
        let (_, group_id) = seed(&repo, &Owner::System, "Regional", dec!(2), 1).await;
        repo.create_assignments(group_id, &[ContextKey::new("regions", "jakarta")])
            .await
            .unwrap();
        let resolver = HierarchyResolver::new(&repo);

        let bandung = TransactionContext::new().with("regions", ["bandung"]);
        let jakarta = TransactionContext::new().with("regions", ["jakarta"]);

        assert!(resolver.resolve(&Owner::System, &bandung, now()).await.unwrap().is_empty());
        assert_eq!(resolver.resolve(&Owner::System, &jakarta, now()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn inactive_tax_and_group_contribute_nothing() {
        let repo = MemoryRepository::new();
        let tax = repo
            .create_tax(TaxInput {
                is_active: false,
                ..TaxInput::named("Dormant")
            }
            .into_new_tax(Owner::System))
            .await
            .unwrap();
        let group = repo
            .create_group(TaxGroupInput::named("Dormant").into_new_group(Owner::System))
            .await
            .unwrap();
        repo.link_tax(group.id, tax.id).await.unwrap();
        repo.create_rate(NewTaxRate::percentage(group.id, tax.id, dec!(3), 1))
            .await
            .unwrap();

        let active_tax = repo
            .create_tax(TaxInput::named("Live").into_new_tax(Owner::System))
            .await
            .unwrap();
        let inactive_group = repo
            .create_group(
                TaxGroupInput {
                    is_active: false,
                    ..TaxGroupInput::named("Paused")
                }
                .into_new_group(Owner::System),
            )
            .await
            .unwrap();
        repo.link_tax(inactive_group.id, active_tax.id).await.unwrap();
        repo.create_rate(NewTaxRate::percentage(inactive_group.id, active_tax.id, dec!(4), 2))
            .await
            .unwrap();

        let rates = HierarchyResolver::new(&repo)
            .resolve(&Owner::System, &TransactionContext::new(), now())
            .await
            .unwrap();

        assert!(rates.is_empty());
    }

    #[tokio::test]
    async fn rates_of_other_taxes_in_a_shared_group_are_ignored() {
        let repo = MemoryRepository::new();
        let (vat_id, group_id) = seed(&repo, &Owner::System, "VAT", dec!(11), 1).await;
        let other = repo
            .create_tax(TaxInput::named("Unlinked").into_new_tax(Owner::System))
            .await
            .unwrap();
        repo.create_rate(NewTaxRate::percentage(group_id, other.id, dec!(2), 2))
            .await
            .unwrap();

        let rates = HierarchyResolver::new(&repo)
            .resolve(&Owner::System, &TransactionContext::new(), now())
            .await
            .unwrap();

        assert_eq!(rates.len(), 1);
        assert_eq!(rates[0].tax_id, vat_id);
    }

    #[tokio::test]
    async fn expired_rates_are_skipped() {
        let repo = MemoryRepository::new();
        let (tax_id, group_id) = seed(&repo, &Owner::System, "VAT", dec!(11), 1).await;
        repo.create_rate(NewTaxRate {
            valid_until: Some(now() - Duration::days(1)),
            ..NewTaxRate::percentage(group_id, tax_id, dec!(10), 2)
        })
        .await
        .unwrap();

        let rates = HierarchyResolver::new(&repo)
            .resolve(&Owner::System, &TransactionContext::new(), now())
            .await
            .unwrap();

        assert_eq!(rates.len(), 1);
        assert_eq!(rates[0].rate, dec!(11));
    }

    #[tokio::test]
    async fn price_band_is_applied_before_dedup() {
        let repo = MemoryRepository::new();
        let (tax_id, group_id) = seed(&repo, &Owner::System, "Luxury", dec!(20), 1).await;
        let banded = repo.find_rates_by_group(group_id).await.unwrap().remove(0);
        repo.update_rate(
            banded.id,
            banded.version,
            &crate::models::TaxRateUpdate {
                min_price: Some(Some(dec!(1000))),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        repo.create_rate(NewTaxRate::percentage(group_id, tax_id, dec!(10), 1))
            .await
            .unwrap();
        let resolver = HierarchyResolver::new(&repo);
        let context = TransactionContext::new();

        let unbanded = resolver.resolve(&Owner::System, &context, now()).await.unwrap();
        let cheap = resolver
            .resolve_for_price(&Owner::System, &context, now(), dec!(50))
            .await
            .unwrap();

        assert_eq!(unbanded[0].rate, dec!(20));
        assert_eq!(cheap.len(), 1);
        assert_eq!(cheap[0].rate, dec!(10));
    }
}
