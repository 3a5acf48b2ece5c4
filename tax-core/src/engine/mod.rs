//! The tax engine facade.
//!
//! [`TaxEngine`] is the single entry point applications use: it stamps and
//! checks ownership on every mutation, validates rate definitions, expands
//! transaction contexts into assignments and runs the resolver and calculator
//! for price calculations. It holds no state besides its collaborators, so
//! one engine can be shared freely between tasks.
//!
//! Every mutation of an existing record loads it, compares its owner with
//! the owner the caller declared, and then writes with the version it read.
//! A concurrent writer therefore produces [`EngineError::Conflict`] rather
//! than a lost update.

mod bulk;
mod config;
mod error;
mod policy;
mod reports;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};

pub use bulk::{BulkFailure, BulkOutcome};
pub use config::EngineConfig;
pub use error::{Entity, EngineError};
pub use policy::{
    AccessPolicy, Action, Actor, AllowAll, Decision, OwnershipPolicy, Resource, ResourceKind, Role,
};
pub use reports::{GroupNode, HierarchyLevel, TaxHierarchy, TaxNode, TaxStatistics};

use crate::calculations::{CalculationError, HierarchyResolver, TaxCalculation, TaxCalculator};
use crate::db::repository::{
    TaxAssignmentStore, TaxGroupStore, TaxRateStore, TaxRepository, TaxStore,
};
use crate::models::{
    ContextAssignment, ContextKey, GroupTaxLink, NewTaxRate, Owned, Owner, RateType, Tax, TaxGroup,
    TaxGroupInput, TaxGroupUpdate, TaxInput, TaxRate, TaxRateUpdate, TaxUpdate,
    TransactionContext,
};

/// Facade over a [`TaxRepository`].
#[derive(Clone)]
pub struct TaxEngine {
    repository: Arc<dyn TaxRepository>,
    config: EngineConfig,
    policy: Arc<dyn AccessPolicy>,
}

impl TaxEngine {
    /// Creates an engine with the default configuration and the
    /// [`OwnershipPolicy`].
    pub fn new(repository: Arc<dyn TaxRepository>) -> Self {
        Self {
            repository,
            config: EngineConfig::default(),
            policy: Arc::new(OwnershipPolicy),
        }
    }

    pub fn with_config(
        mut self,
        config: EngineConfig,
    ) -> Self {
        self.config = config;
        self
    }

    pub fn with_policy(
        mut self,
        policy: Arc<dyn AccessPolicy>,
    ) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn repository(&self) -> &dyn TaxRepository {
        self.repository.as_ref()
    }

    // =========================================================================
    // taxes
    // =========================================================================

    pub async fn create_tax(
        &self,
        owner: &Owner,
        input: TaxInput,
    ) -> Result<Tax, EngineError> {
        let new_tax = input.into_new_tax(owner.clone());
        validate_name(&new_tax.name)?;
        if new_tax.slug.is_empty() {
            return Err(EngineError::Validation(format!(
                "cannot derive a slug from tax name '{}'",
                new_tax.name
            )));
        }

        let tax = self.repository.create_tax(new_tax).await?;
        info!(tax_id = tax.id, owner = %owner, slug = %tax.slug, "Created tax");
        Ok(tax)
    }

    /// Creates every tax or none of them.
    pub async fn create_taxes_atomic(
        &self,
        owner: &Owner,
        inputs: Vec<TaxInput>,
    ) -> Result<Vec<Tax>, EngineError> {
        let mut batch = Vec::with_capacity(inputs.len());
        for input in inputs {
            let new_tax = input.into_new_tax(owner.clone());
            validate_name(&new_tax.name)?;
            batch.push(new_tax);
        }

        let taxes = self.repository.create_taxes(batch).await?;
        info!(count = taxes.len(), owner = %owner, "Created taxes atomically");
        Ok(taxes)
    }

    pub async fn update_tax(
        &self,
        owner: &Owner,
        id: i64,
        changes: TaxUpdate,
    ) -> Result<Tax, EngineError> {
        if let Some(name) = &changes.name {
            validate_name(name)?;
        }
        if changes.slug.as_deref().is_some_and(|slug| slug.trim().is_empty()) {
            return Err(EngineError::Validation("slug must not be empty".to_string()));
        }

        let tax = self.owned_tax(owner, id).await?;
        let updated = self
            .repository
            .update_tax(id, tax.version, &changes)
            .await
            .map_err(EngineError::from_store(Entity::Tax, id))?;
        info!(tax_id = id, version = updated.version, "Updated tax");
        Ok(updated)
    }

    /// Deletes a tax and its group links. Fails with
    /// [`EngineError::Conflict`] while rates still reference it.
    pub async fn delete_tax(
        &self,
        owner: &Owner,
        id: i64,
    ) -> Result<(), EngineError> {
        let tax = self.owned_tax(owner, id).await?;
        self.repository
            .delete_tax(id, tax.version)
            .await
            .map_err(EngineError::from_store(Entity::Tax, id))?;
        info!(tax_id = id, "Deleted tax");
        Ok(())
    }

    pub async fn get_tax(
        &self,
        id: i64,
    ) -> Result<Tax, EngineError> {
        self.repository
            .find_tax(id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: Entity::Tax,
                id,
            })
    }

    /// Taxes owned by exactly `owner`.
    pub async fn list_taxes(
        &self,
        owner: &Owner,
    ) -> Result<Vec<Tax>, EngineError> {
        Ok(self.repository.find_taxes_by_owner(owner).await?)
    }

    // =========================================================================
    // tax groups
    // =========================================================================

    pub async fn create_tax_group(
        &self,
        owner: &Owner,
        input: TaxGroupInput,
    ) -> Result<TaxGroup, EngineError> {
        validate_name(&input.name)?;

        let group = self
            .repository
            .create_group(input.into_new_group(owner.clone()))
            .await?;
        info!(group_id = group.id, owner = %owner, "Created tax group");
        Ok(group)
    }

    pub async fn update_tax_group(
        &self,
        owner: &Owner,
        id: i64,
        changes: TaxGroupUpdate,
    ) -> Result<TaxGroup, EngineError> {
        if let Some(name) = &changes.name {
            validate_name(name)?;
        }

        let group = self.owned_group(owner, id).await?;
        let updated = self
            .repository
            .update_group(id, group.version, &changes)
            .await
            .map_err(EngineError::from_store(Entity::TaxGroup, id))?;
        info!(group_id = id, version = updated.version, "Updated tax group");
        Ok(updated)
    }

    /// Deletes a group together with its rates, tax links and context
    /// assignments.
    pub async fn delete_tax_group(
        &self,
        owner: &Owner,
        id: i64,
    ) -> Result<(), EngineError> {
        let group = self.owned_group(owner, id).await?;
        self.repository
            .delete_group(id, group.version)
            .await
            .map_err(EngineError::from_store(Entity::TaxGroup, id))?;
        info!(group_id = id, "Deleted tax group");
        Ok(())
    }

    pub async fn get_tax_group(
        &self,
        id: i64,
    ) -> Result<TaxGroup, EngineError> {
        self.repository
            .find_group(id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: Entity::TaxGroup,
                id,
            })
    }

    pub async fn list_tax_groups(
        &self,
        owner: &Owner,
    ) -> Result<Vec<TaxGroup>, EngineError> {
        Ok(self.repository.find_groups_by_owner(owner).await?)
    }

    // =========================================================================
    // tax rates
    // =========================================================================

    /// Adds a rate to a group owned by `owner`.
    pub async fn create_tax_rate(
        &self,
        owner: &Owner,
        rate: NewTaxRate,
    ) -> Result<TaxRate, EngineError> {
        self.owned_group(owner, rate.tax_group_id).await?;
        self.get_tax(rate.tax_id).await?;
        validate_new_rate(&rate)?;

        let created = self.repository.create_rate(rate).await?;
        info!(
            rate_id = created.id,
            group_id = created.tax_group_id,
            tax_id = created.tax_id,
            "Created tax rate"
        );
        Ok(created)
    }

    pub async fn update_tax_rate(
        &self,
        owner: &Owner,
        id: i64,
        changes: TaxRateUpdate,
    ) -> Result<TaxRate, EngineError> {
        let mut merged = self.owned_rate(owner, id).await?;
        let expected_version = merged.version;
        if let Some(tax_id) = changes.tax_id {
            self.get_tax(tax_id).await?;
        }
        changes.apply_to(&mut merged);
        validate_rate(
            merged.rate_type,
            merged.rate,
            merged.valid_from,
            merged.valid_until,
            merged.min_price,
            merged.max_price,
        )?;

        let updated = self
            .repository
            .update_rate(id, expected_version, &changes)
            .await
            .map_err(EngineError::from_store(Entity::TaxRate, id))?;
        info!(rate_id = id, version = updated.version, "Updated tax rate");
        Ok(updated)
    }

    pub async fn delete_tax_rate(
        &self,
        owner: &Owner,
        id: i64,
    ) -> Result<(), EngineError> {
        let rate = self.owned_rate(owner, id).await?;
        self.repository
            .delete_rate(id, rate.version)
            .await
            .map_err(EngineError::from_store(Entity::TaxRate, id))?;
        info!(rate_id = id, "Deleted tax rate");
        Ok(())
    }

    pub async fn list_tax_rates(
        &self,
        group_id: i64,
    ) -> Result<Vec<TaxRate>, EngineError> {
        self.get_tax_group(group_id).await?;
        Ok(self.repository.find_rates_by_group(group_id).await?)
    }

    // =========================================================================
    // assignments
    // =========================================================================

    /// Makes the group's rates count as rates of `tax_id`. Both records must
    /// belong to `owner`.
    pub async fn assign_group_to_tax(
        &self,
        owner: &Owner,
        group_id: i64,
        tax_id: i64,
    ) -> Result<GroupTaxLink, EngineError> {
        self.owned_group(owner, group_id).await?;
        self.owned_tax(owner, tax_id).await?;

        let link = self
            .repository
            .link_tax(group_id, tax_id)
            .await
            .map_err(EngineError::from_store(Entity::GroupTaxLink, group_id))?;
        info!(group_id, tax_id, "Linked tax group to tax");
        Ok(link)
    }

    /// Returns whether a link existed.
    pub async fn remove_group_from_tax(
        &self,
        owner: &Owner,
        group_id: i64,
        tax_id: i64,
    ) -> Result<bool, EngineError> {
        self.owned_group(owner, group_id).await?;

        let removed = self.repository.unlink_tax(group_id, tax_id).await?;
        info!(group_id, tax_id, removed, "Unlinked tax group from tax");
        Ok(removed)
    }

    /// Scopes the group to every entity in `context`. Entities the group is
    /// already scoped to are skipped; only new assignments are returned.
    pub async fn assign_tax_to_context(
        &self,
        owner: &Owner,
        group_id: i64,
        context: &TransactionContext,
    ) -> Result<Vec<ContextAssignment>, EngineError> {
        self.owned_group(owner, group_id).await?;

        let keys: Vec<ContextKey> = context.keys().collect();
        if keys.is_empty() {
            return Err(EngineError::Validation(
                "context must name at least one entity".to_string(),
            ));
        }

        let created = self
            .repository
            .create_assignments(group_id, &keys)
            .await
            .map_err(EngineError::from_store(Entity::TaxGroup, group_id))?;
        info!(group_id, requested = keys.len(), created = created.len(), "Assigned tax group to context");
        Ok(created)
    }

    /// Returns how many assignments were removed. Removing the last one makes
    /// the group global again.
    pub async fn remove_tax_from_context(
        &self,
        owner: &Owner,
        group_id: i64,
        context: &TransactionContext,
    ) -> Result<u64, EngineError> {
        self.owned_group(owner, group_id).await?;

        let keys: Vec<ContextKey> = context.keys().collect();
        let removed = self.repository.delete_assignments(group_id, &keys).await?;
        info!(group_id, removed, "Removed tax group from context");
        Ok(removed)
    }

    pub async fn get_context_assignments(
        &self,
        group_id: i64,
    ) -> Result<Vec<ContextAssignment>, EngineError> {
        self.get_tax_group(group_id).await?;
        Ok(self.repository.find_assignments_by_group(group_id).await?)
    }

    // =========================================================================
    // calculation
    // =========================================================================

    /// Calculates the taxes `owner` charges on `price` in `context`, using
    /// rates valid now.
    ///
    /// Missing data never fails a calculation: when nothing applies the
    /// result carries zero tax.
    pub async fn calculate_tax_for_owner(
        &self,
        price: Decimal,
        owner: &Owner,
        context: &TransactionContext,
    ) -> Result<TaxCalculation, EngineError> {
        self.calculate_tax_for_owner_at(price, owner, context, Utc::now())
            .await
    }

    /// [`calculate_tax_for_owner`](Self::calculate_tax_for_owner) against the
    /// rates valid at `as_of`.
    pub async fn calculate_tax_for_owner_at(
        &self,
        price: Decimal,
        owner: &Owner,
        context: &TransactionContext,
        as_of: DateTime<Utc>,
    ) -> Result<TaxCalculation, EngineError> {
        if price < Decimal::ZERO {
            return Err(CalculationError::NegativePrice(price).into());
        }

        let resolver = HierarchyResolver::new(self.repository.as_ref());
        let rates = if self.config.enforce_price_band {
            resolver.resolve_for_price(owner, context, as_of, price).await?
        } else {
            resolver.resolve(owner, context, as_of).await?
        };

        let calculation = TaxCalculator::new(&rates).calculate(price)?;
        info!(
            owner = %owner,
            %price,
            rates = rates.len(),
            total_tax = %calculation.total_tax,
            "Calculated tax"
        );
        Ok(calculation)
    }

    // =========================================================================
    // ownership
    // =========================================================================

    async fn owned_tax(
        &self,
        owner: &Owner,
        id: i64,
    ) -> Result<Tax, EngineError> {
        let tax = self.get_tax(id).await?;
        ensure_owned(&tax, owner, Entity::Tax, id)?;
        Ok(tax)
    }

    async fn owned_group(
        &self,
        owner: &Owner,
        id: i64,
    ) -> Result<TaxGroup, EngineError> {
        let group = self.get_tax_group(id).await?;
        ensure_owned(&group, owner, Entity::TaxGroup, id)?;
        Ok(group)
    }

    /// A rate is owned through its group.
    async fn owned_rate(
        &self,
        owner: &Owner,
        id: i64,
    ) -> Result<TaxRate, EngineError> {
        let rate = self
            .repository
            .find_rate(id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: Entity::TaxRate,
                id,
            })?;
        let group = self.get_tax_group(rate.tax_group_id).await?;
        ensure_owned(&group, owner, Entity::TaxRate, id)?;
        Ok(rate)
    }
}

/// Fails unless `record` belongs to exactly `expected`.
///
/// System records match only the system owner; scoped records match only the
/// same owner type and id.
pub fn ensure_owned<T: Owned>(
    record: &T,
    expected: &Owner,
    entity: Entity,
    id: i64,
) -> Result<(), EngineError> {
    if record.owner() == expected {
        return Ok(());
    }
    warn!(
        %entity,
        id,
        expected = %expected,
        actual = %record.owner(),
        "Ownership check failed"
    );
    Err(EngineError::OwnershipMismatch { entity, id })
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation("name must not be empty".to_string()));
    }
    Ok(())
}

/// Checks a rate before it is written. Every rate mutation applies these
/// rules, so callers can use it to vet a whole batch up front.
pub fn validate_new_rate(rate: &NewTaxRate) -> Result<(), EngineError> {
    validate_rate(
        rate.rate_type,
        rate.rate,
        rate.valid_from,
        rate.valid_until,
        rate.min_price,
        rate.max_price,
    )
}

fn validate_rate(
    rate_type: RateType,
    rate: Decimal,
    valid_from: Option<DateTime<Utc>>,
    valid_until: Option<DateTime<Utc>>,
    min_price: Option<Decimal>,
    max_price: Option<Decimal>,
) -> Result<(), EngineError> {
    if rate_type == RateType::Percentage && rate < Decimal::ZERO {
        return Err(EngineError::Validation(format!(
            "percentage rate must not be negative, got {rate}"
        )));
    }
    if let (Some(from), Some(until)) = (valid_from, valid_until) {
        if from > until {
            return Err(EngineError::Validation(
                "valid_from must not be after valid_until".to_string(),
            ));
        }
    }
    if let (Some(min), Some(max)) = (min_price, max_price) {
        if min > max {
            return Err(EngineError::Validation(
                "min_price must not exceed max_price".to_string(),
            ));
        }
    }
    Ok(())
}
