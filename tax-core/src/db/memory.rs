//! In-process backend implementing every store contract.
//!
//! State lives behind one mutex, so each store call is atomic with respect to
//! the others; that is what gives the bulk and versioned operations their
//! all-or-nothing semantics here.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::repository::{
    RepositoryError, TaxAssignmentStore, TaxGroupStore, TaxRateStore, TaxStore,
};
use crate::models::{
    AssignedEntity, ContextAssignment, ContextKey, GroupTaxLink, NewTax, NewTaxGroup, NewTaxRate,
    Owner, Tax, TaxGroup, TaxGroupUpdate, TaxRate, TaxRateUpdate, TaxUpdate,
};

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    taxes: BTreeMap<i64, Tax>,
    groups: BTreeMap<i64, TaxGroup>,
    rates: BTreeMap<i64, TaxRate>,
    assignments: BTreeMap<i64, ContextAssignment>,
    links: Vec<GroupTaxLink>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_unique_slug(
        &self,
        owner: &Owner,
        slug: &str,
        except: Option<i64>,
    ) -> Result<(), RepositoryError> {
        let taken = self
            .taxes
            .values()
            .any(|t| &t.owner == owner && t.slug == slug && Some(t.id) != except);
        if taken {
            return Err(RepositoryError::Conflict(format!(
                "slug '{slug}' already exists for owner {owner}"
            )));
        }
        Ok(())
    }

    fn insert_tax(
        &mut self,
        tax: NewTax,
        now: DateTime<Utc>,
    ) -> Result<Tax, RepositoryError> {
        self.ensure_unique_slug(&tax.owner, &tax.slug, None)?;
        let id = self.next_id();
        let tax = Tax {
            id,
            owner: tax.owner,
            name: tax.name,
            slug: tax.slug,
            description: tax.description,
            is_active: tax.is_active,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        self.taxes.insert(id, tax.clone());
        Ok(tax)
    }

    fn insert_group(
        &mut self,
        group: NewTaxGroup,
        now: DateTime<Utc>,
    ) -> TaxGroup {
        let id = self.next_id();
        let group = TaxGroup {
            id,
            owner: group.owner,
            name: group.name,
            description: group.description,
            is_active: group.is_active,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        self.groups.insert(id, group.clone());
        group
    }
}

fn check_version(
    stored: i64,
    expected: i64,
) -> Result<(), RepositoryError> {
    if stored != expected {
        return Err(RepositoryError::Conflict(format!(
            "stale version {expected}, current version is {stored}"
        )));
    }
    Ok(())
}

fn sorted_rates(mut rates: Vec<TaxRate>) -> Vec<TaxRate> {
    rates.sort_by_key(|r| (r.priority, r.id));
    rates
}

/// Volatile repository for tests, tooling and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, RepositoryError> {
        self.state
            .lock()
            .map_err(|_| RepositoryError::Database("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl TaxStore for MemoryRepository {
    async fn create_tax(
        &self,
        tax: NewTax,
    ) -> Result<Tax, RepositoryError> {
        self.lock()?.insert_tax(tax, Utc::now())
    }

    async fn create_taxes(
        &self,
        taxes: Vec<NewTax>,
    ) -> Result<Vec<Tax>, RepositoryError> {
        let mut state = self.lock()?;
        let mut staged = MemoryState {
            next_id: state.next_id,
            taxes: state.taxes.clone(),
            ..MemoryState::default()
        };
        let now = Utc::now();
        let created = taxes
            .into_iter()
            .map(|tax| staged.insert_tax(tax, now))
            .collect::<Result<Vec<_>, _>>()?;

        state.next_id = staged.next_id;
        state.taxes = staged.taxes;
        Ok(created)
    }

    async fn update_tax(
        &self,
        id: i64,
        expected_version: i64,
        changes: &TaxUpdate,
    ) -> Result<Tax, RepositoryError> {
        let mut state = self.lock()?;
        let mut tax = state
            .taxes
            .get(&id)
            .cloned()
            .ok_or(RepositoryError::NotFound)?;
        check_version(tax.version, expected_version)?;
        changes.apply_to(&mut tax);
        state.ensure_unique_slug(&tax.owner, &tax.slug, Some(id))?;

        tax.version += 1;
        tax.updated_at = Utc::now();
        state.taxes.insert(id, tax.clone());
        Ok(tax)
    }

    async fn delete_tax(
        &self,
        id: i64,
        expected_version: i64,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        let tax = state.taxes.get(&id).ok_or(RepositoryError::NotFound)?;
        check_version(tax.version, expected_version)?;
        if state.rates.values().any(|r| r.tax_id == id) {
            return Err(RepositoryError::Conflict(format!(
                "tax {id} is still referenced by rates"
            )));
        }

        state.taxes.remove(&id);
        state.links.retain(|l| l.tax_id != id);
        Ok(())
    }

    async fn find_tax(
        &self,
        id: i64,
    ) -> Result<Option<Tax>, RepositoryError> {
        Ok(self.lock()?.taxes.get(&id).cloned())
    }

    async fn find_taxes_by_owner(
        &self,
        owner: &Owner,
    ) -> Result<Vec<Tax>, RepositoryError> {
        Ok(self
            .lock()?
            .taxes
            .values()
            .filter(|t| &t.owner == owner)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TaxGroupStore for MemoryRepository {
    async fn create_group(
        &self,
        group: NewTaxGroup,
    ) -> Result<TaxGroup, RepositoryError> {
        Ok(self.lock()?.insert_group(group, Utc::now()))
    }

    async fn create_groups(
        &self,
        groups: Vec<NewTaxGroup>,
    ) -> Result<Vec<TaxGroup>, RepositoryError> {
        let mut state = self.lock()?;
        let now = Utc::now();
        Ok(groups
            .into_iter()
            .map(|group| state.insert_group(group, now))
            .collect())
    }

    async fn update_group(
        &self,
        id: i64,
        expected_version: i64,
        changes: &TaxGroupUpdate,
    ) -> Result<TaxGroup, RepositoryError> {
        let mut state = self.lock()?;
        let group = state.groups.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        check_version(group.version, expected_version)?;

        changes.apply_to(group);
        group.version += 1;
        group.updated_at = Utc::now();
        Ok(group.clone())
    }

    async fn delete_group(
        &self,
        id: i64,
        expected_version: i64,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        let group = state.groups.get(&id).ok_or(RepositoryError::NotFound)?;
        check_version(group.version, expected_version)?;

        state.groups.remove(&id);
        state.rates.retain(|_, r| r.tax_group_id != id);
        state.assignments.retain(|_, a| a.tax_group_id != id);
        state.links.retain(|l| l.tax_group_id != id);
        Ok(())
    }

    async fn find_group(
        &self,
        id: i64,
    ) -> Result<Option<TaxGroup>, RepositoryError> {
        Ok(self.lock()?.groups.get(&id).cloned())
    }

    async fn find_groups_by_owner(
        &self,
        owner: &Owner,
    ) -> Result<Vec<TaxGroup>, RepositoryError> {
        Ok(self
            .lock()?
            .groups
            .values()
            .filter(|g| &g.owner == owner)
            .cloned()
            .collect())
    }

    async fn find_groups_by_assigned_entity(
        &self,
        entity: &AssignedEntity,
    ) -> Result<Vec<TaxGroup>, RepositoryError> {
        let state = self.lock()?;
        let group_ids: Vec<i64> = match entity {
            AssignedEntity::Tax { tax_id } => state
                .links
                .iter()
                .filter(|l| l.tax_id == *tax_id)
                .map(|l| l.tax_group_id)
                .collect(),
            AssignedEntity::Context(key) => state
                .assignments
                .values()
                .filter(|a| &a.key == key)
                .map(|a| a.tax_group_id)
                .collect(),
        };

        Ok(state
            .groups
            .values()
            .filter(|g| group_ids.contains(&g.id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TaxRateStore for MemoryRepository {
    async fn create_rate(
        &self,
        rate: NewTaxRate,
    ) -> Result<TaxRate, RepositoryError> {
        let mut state = self.lock()?;
        if !state.groups.contains_key(&rate.tax_group_id) {
            return Err(RepositoryError::Conflict(format!(
                "tax group {} does not exist",
                rate.tax_group_id
            )));
        }
        if !state.taxes.contains_key(&rate.tax_id) {
            return Err(RepositoryError::Conflict(format!(
                "tax {} does not exist",
                rate.tax_id
            )));
        }

        let id = state.next_id();
        let now = Utc::now();
        let rate = TaxRate {
            id,
            tax_group_id: rate.tax_group_id,
            tax_id: rate.tax_id,
            rate: rate.rate,
            rate_type: rate.rate_type,
            is_inclusive: rate.is_inclusive,
            priority: rate.priority,
            based_on: rate.based_on,
            valid_from: rate.valid_from,
            valid_until: rate.valid_until,
            min_price: rate.min_price,
            max_price: rate.max_price,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        state.rates.insert(id, rate.clone());
        Ok(rate)
    }

    async fn update_rate(
        &self,
        id: i64,
        expected_version: i64,
        changes: &TaxRateUpdate,
    ) -> Result<TaxRate, RepositoryError> {
        let mut state = self.lock()?;
        if let Some(tax_id) = changes.tax_id {
            if !state.taxes.contains_key(&tax_id) {
                return Err(RepositoryError::Conflict(format!(
                    "tax {tax_id} does not exist"
                )));
            }
        }
        let rate = state.rates.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        check_version(rate.version, expected_version)?;
        changes.apply_to(rate);
        rate.version += 1;
        rate.updated_at = Utc::now();
        Ok(rate.clone())
    }

    async fn delete_rate(
        &self,
        id: i64,
        expected_version: i64,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        let rate = state.rates.get(&id).ok_or(RepositoryError::NotFound)?;
        check_version(rate.version, expected_version)?;
        state.rates.remove(&id);
        Ok(())
    }

    async fn find_rate(
        &self,
        id: i64,
    ) -> Result<Option<TaxRate>, RepositoryError> {
        Ok(self.lock()?.rates.get(&id).cloned())
    }

    async fn find_rates_by_group(
        &self,
        group_id: i64,
    ) -> Result<Vec<TaxRate>, RepositoryError> {
        let rates = self
            .lock()?
            .rates
            .values()
            .filter(|r| r.tax_group_id == group_id)
            .cloned()
            .collect();
        Ok(sorted_rates(rates))
    }

    async fn find_active_rates_by_group(
        &self,
        group_id: i64,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<TaxRate>, RepositoryError> {
        let rates = self
            .lock()?
            .rates
            .values()
            .filter(|r| r.tax_group_id == group_id && r.is_valid_at(as_of))
            .cloned()
            .collect();
        Ok(sorted_rates(rates))
    }
}

#[async_trait]
impl TaxAssignmentStore for MemoryRepository {
    async fn create_assignments(
        &self,
        group_id: i64,
        keys: &[ContextKey],
    ) -> Result<Vec<ContextAssignment>, RepositoryError> {
        let mut state = self.lock()?;
        if !state.groups.contains_key(&group_id) {
            return Err(RepositoryError::NotFound);
        }

        let now = Utc::now();
        let mut created = Vec::new();
        for key in keys {
            let exists = state
                .assignments
                .values()
                .any(|a| a.tax_group_id == group_id && &a.key == key)
                || created.iter().any(|a: &ContextAssignment| &a.key == key);
            if exists {
                continue;
            }
            let assignment = ContextAssignment {
                id: state.next_id(),
                tax_group_id: group_id,
                key: key.clone(),
                created_at: now,
            };
            created.push(assignment);
        }

        for assignment in &created {
            state.assignments.insert(assignment.id, assignment.clone());
        }
        Ok(created)
    }

    async fn delete_assignments(
        &self,
        group_id: i64,
        keys: &[ContextKey],
    ) -> Result<u64, RepositoryError> {
        let mut state = self.lock()?;
        let before = state.assignments.len();
        state
            .assignments
            .retain(|_, a| !(a.tax_group_id == group_id && keys.contains(&a.key)));
        Ok((before - state.assignments.len()) as u64)
    }

    async fn find_assignments_by_group(
        &self,
        group_id: i64,
    ) -> Result<Vec<ContextAssignment>, RepositoryError> {
        Ok(self
            .lock()?
            .assignments
            .values()
            .filter(|a| a.tax_group_id == group_id)
            .cloned()
            .collect())
    }

    async fn link_tax(
        &self,
        group_id: i64,
        tax_id: i64,
    ) -> Result<GroupTaxLink, RepositoryError> {
        let mut state = self.lock()?;
        if !state.groups.contains_key(&group_id) || !state.taxes.contains_key(&tax_id) {
            return Err(RepositoryError::NotFound);
        }
        if let Some(existing) = state
            .links
            .iter()
            .find(|l| l.tax_group_id == group_id && l.tax_id == tax_id)
        {
            return Ok(existing.clone());
        }

        let link = GroupTaxLink {
            tax_group_id: group_id,
            tax_id,
            created_at: Utc::now(),
        };
        state.links.push(link.clone());
        Ok(link)
    }

    async fn unlink_tax(
        &self,
        group_id: i64,
        tax_id: i64,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.lock()?;
        let before = state.links.len();
        state
            .links
            .retain(|l| !(l.tax_group_id == group_id && l.tax_id == tax_id));
        Ok(state.links.len() < before)
    }

    async fn find_tax_links(
        &self,
        group_id: i64,
    ) -> Result<Vec<GroupTaxLink>, RepositoryError> {
        Ok(self
            .lock()?
            .links
            .iter()
            .filter(|l| l.tax_group_id == group_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::models::{NewTaxRate, TaxInput};

    fn merchant(id: &str) -> Owner {
        Owner::scoped("merchant", id).unwrap()
    }

    fn new_group(owner: Owner) -> NewTaxGroup {
        NewTaxGroup {
            owner,
            name: "Standard".to_string(),
            description: None,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn slug_is_unique_per_owner_scope() {
        let repo = MemoryRepository::new();
        repo.create_tax(TaxInput::named("VAT").into_new_tax(Owner::System))
            .await
            .unwrap();
        repo.create_tax(TaxInput::named("VAT").into_new_tax(merchant("m1")))
            .await
            .expect("same slug under another owner");

        let duplicate = repo
            .create_tax(TaxInput::named("VAT").into_new_tax(Owner::System))
            .await;

        assert!(matches!(duplicate, Err(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn bulk_create_is_all_or_nothing() {
        let repo = MemoryRepository::new();
        let batch = vec![
            TaxInput::named("VAT").into_new_tax(Owner::System),
            TaxInput::named("VAT").into_new_tax(Owner::System),
        ];

        let result = repo.create_taxes(batch).await;

        assert!(matches!(result, Err(RepositoryError::Conflict(_))));
        assert!(repo.find_taxes_by_owner(&Owner::System).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let repo = MemoryRepository::new();
        let tax = repo
            .create_tax(TaxInput::named("VAT").into_new_tax(Owner::System))
            .await
            .unwrap();
        let rename = TaxUpdate {
            name: Some("Value Added Tax".to_string()),
            ..TaxUpdate::default()
        };

        let updated = repo.update_tax(tax.id, tax.version, &rename).await.unwrap();
        let stale = repo.update_tax(tax.id, tax.version, &rename).await;

        assert_eq!(updated.version, tax.version + 1);
        assert!(matches!(stale, Err(RepositoryError::Conflict(_))));
        assert!(matches!(
            repo.delete_tax(tax.id, tax.version).await,
            Err(RepositoryError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn stale_rate_version_is_a_conflict() {
        let repo = MemoryRepository::new();
        let tax = repo
            .create_tax(TaxInput::named("Levy").into_new_tax(Owner::System))
            .await
            .unwrap();
        let group = repo.create_group(new_group(Owner::System)).await.unwrap();
        let rate = repo
            .create_rate(NewTaxRate {
                rate_type: crate::models::RateType::Fixed,
                ..NewTaxRate::percentage(group.id, tax.id, dec!(2000), 1)
            })
            .await
            .unwrap();
        let to_percentage = TaxRateUpdate {
            rate_type: Some(crate::models::RateType::Percentage),
            rate: Some(dec!(5)),
            ..TaxRateUpdate::default()
        };
        let to_negative = TaxRateUpdate {
            rate: Some(dec!(-5)),
            ..TaxRateUpdate::default()
        };

        let updated = repo
            .update_rate(rate.id, rate.version, &to_percentage)
            .await
            .unwrap();
        let stale = repo.update_rate(rate.id, rate.version, &to_negative).await;

        assert_eq!(updated.version, rate.version + 1);
        assert!(matches!(stale, Err(RepositoryError::Conflict(_))));
        assert_eq!(repo.find_rate(rate.id).await.unwrap(), Some(updated.clone()));
        assert!(matches!(
            repo.delete_rate(rate.id, rate.version).await,
            Err(RepositoryError::Conflict(_))
        ));
        repo.delete_rate(rate.id, updated.version).await.unwrap();
        assert_eq!(repo.find_rate(rate.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_group_cascades_to_children() {
        let repo = MemoryRepository::new();
        let tax = repo
            .create_tax(TaxInput::named("VAT").into_new_tax(Owner::System))
            .await
            .unwrap();
        let group = repo.create_group(new_group(Owner::System)).await.unwrap();
        repo.link_tax(group.id, tax.id).await.unwrap();
        repo.create_rate(NewTaxRate::percentage(group.id, tax.id, dec!(10), 1))
            .await
            .unwrap();
        repo.create_assignments(group.id, &[ContextKey::new("region", "jakarta")])
            .await
            .unwrap();

        repo.delete_group(group.id, group.version).await.unwrap();

        assert!(repo.find_rates_by_group(group.id).await.unwrap().is_empty());
        assert!(repo.find_assignments_by_group(group.id).await.unwrap().is_empty());
        assert!(repo.find_tax_links(group.id).await.unwrap().is_empty());
        assert!(repo.find_tax(tax.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_tax_referenced_by_rates_is_rejected() {
        let repo = MemoryRepository::new();
        let tax = repo
            .create_tax(TaxInput::named("VAT").into_new_tax(Owner::System))
            .await
            .unwrap();
        let group = repo.create_group(new_group(Owner::System)).await.unwrap();
        repo.create_rate(NewTaxRate::percentage(group.id, tax.id, dec!(10), 1))
            .await
            .unwrap();

        let result = repo.delete_tax(tax.id, tax.version).await;

        assert!(matches!(result, Err(RepositoryError::Conflict(_))));
        assert!(repo.find_group(group.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn assignments_skip_duplicates() {
        let repo = MemoryRepository::new();
        let group = repo.create_group(new_group(merchant("m1"))).await.unwrap();
        let jakarta = ContextKey::new("region", "jakarta");

        let first = repo
            .create_assignments(group.id, &[jakarta.clone(), jakarta.clone()])
            .await
            .unwrap();
        let second = repo
            .create_assignments(group.id, &[jakarta.clone()])
            .await
            .unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(
            repo.delete_assignments(group.id, &[jakarta]).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn groups_found_by_assigned_entity() {
        let repo = MemoryRepository::new();
        let tax = repo
            .create_tax(TaxInput::named("VAT").into_new_tax(Owner::System))
            .await
            .unwrap();
        let backing = repo.create_group(new_group(Owner::System)).await.unwrap();
        let scoped = repo.create_group(new_group(Owner::System)).await.unwrap();
        repo.link_tax(backing.id, tax.id).await.unwrap();
        repo.link_tax(backing.id, tax.id).await.unwrap();
        let jakarta = ContextKey::new("regions", "jakarta");
        repo.create_assignments(scoped.id, std::slice::from_ref(&jakarta))
            .await
            .unwrap();

        let by_tax = repo
            .find_groups_by_assigned_entity(&AssignedEntity::Tax { tax_id: tax.id })
            .await
            .unwrap();
        let by_context = repo
            .find_groups_by_assigned_entity(&AssignedEntity::Context(jakarta))
            .await
            .unwrap();

        assert_eq!(by_tax.iter().map(|g| g.id).collect::<Vec<_>>(), vec![backing.id]);
        assert_eq!(by_context.iter().map(|g| g.id).collect::<Vec<_>>(), vec![scoped.id]);
    }

    #[tokio::test]
    async fn active_rates_respect_validity_window() {
        let repo = MemoryRepository::new();
        let tax = repo
            .create_tax(TaxInput::named("VAT").into_new_tax(Owner::System))
            .await
            .unwrap();
        let group = repo.create_group(new_group(Owner::System)).await.unwrap();
        let now = Utc::now();
        let expired = NewTaxRate {
            valid_until: Some(now - chrono::Duration::days(1)),
            ..NewTaxRate::percentage(group.id, tax.id, dec!(10), 2)
        };
        repo.create_rate(expired).await.unwrap();
        let current = repo
            .create_rate(NewTaxRate::percentage(group.id, tax.id, dec!(11), 1))
            .await
            .unwrap();

        let active = repo.find_active_rates_by_group(group.id, now).await.unwrap();

        assert_eq!(active, vec![current]);
        assert_eq!(repo.find_rates_by_group(group.id).await.unwrap().len(), 2);
    }
}
