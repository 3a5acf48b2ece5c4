use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{
    AssignedEntity, ContextAssignment, ContextKey, GroupTaxLink, NewTax, NewTaxGroup, NewTaxRate,
    Owner, Tax, TaxGroup, TaxGroupUpdate, TaxRate, TaxRateUpdate, TaxUpdate,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("Record not found")]
    NotFound,

    /// A unique key or optimistic version check was violated.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

#[async_trait]
pub trait TaxStore: Send + Sync {
    async fn create_tax(
        &self,
        tax: NewTax,
    ) -> Result<Tax, RepositoryError>;

    /// Inserts every tax or none of them.
    async fn create_taxes(
        &self,
        taxes: Vec<NewTax>,
    ) -> Result<Vec<Tax>, RepositoryError>;

    /// Applies `changes` if the stored version still equals
    /// `expected_version`, returning the updated record.
    async fn update_tax(
        &self,
        id: i64,
        expected_version: i64,
        changes: &TaxUpdate,
    ) -> Result<Tax, RepositoryError>;

    /// Removes the tax and its group links. Groups are never removed with
    /// it; a tax still referenced by rates is a `Conflict`.
    async fn delete_tax(
        &self,
        id: i64,
        expected_version: i64,
    ) -> Result<(), RepositoryError>;

    async fn find_tax(
        &self,
        id: i64,
    ) -> Result<Option<Tax>, RepositoryError>;

    /// Taxes owned by exactly `owner`, ordered by id.
    async fn find_taxes_by_owner(
        &self,
        owner: &Owner,
    ) -> Result<Vec<Tax>, RepositoryError>;
}

#[async_trait]
pub trait TaxGroupStore: Send + Sync {
    async fn create_group(
        &self,
        group: NewTaxGroup,
    ) -> Result<TaxGroup, RepositoryError>;

    async fn create_groups(
        &self,
        groups: Vec<NewTaxGroup>,
    ) -> Result<Vec<TaxGroup>, RepositoryError>;

    async fn update_group(
        &self,
        id: i64,
        expected_version: i64,
        changes: &TaxGroupUpdate,
    ) -> Result<TaxGroup, RepositoryError>;

    /// Removes the group together with its rates, tax links and context
    /// assignments.
    async fn delete_group(
        &self,
        id: i64,
        expected_version: i64,
    ) -> Result<(), RepositoryError>;

    async fn find_group(
        &self,
        id: i64,
    ) -> Result<Option<TaxGroup>, RepositoryError>;

    async fn find_groups_by_owner(
        &self,
        owner: &Owner,
    ) -> Result<Vec<TaxGroup>, RepositoryError>;

    /// Groups attached to a tax or scoped to a context entity, ordered by id.
    async fn find_groups_by_assigned_entity(
        &self,
        entity: &AssignedEntity,
    ) -> Result<Vec<TaxGroup>, RepositoryError>;
}

#[async_trait]
pub trait TaxRateStore: Send + Sync {
    async fn create_rate(
        &self,
        rate: NewTaxRate,
    ) -> Result<TaxRate, RepositoryError>;

    /// Versioned like [`TaxStore::update_tax`].
    async fn update_rate(
        &self,
        id: i64,
        expected_version: i64,
        changes: &TaxRateUpdate,
    ) -> Result<TaxRate, RepositoryError>;

    async fn delete_rate(
        &self,
        id: i64,
        expected_version: i64,
    ) -> Result<(), RepositoryError>;

    async fn find_rate(
        &self,
        id: i64,
    ) -> Result<Option<TaxRate>, RepositoryError>;

    /// Every rate in the group, ordered by priority then id.
    async fn find_rates_by_group(
        &self,
        group_id: i64,
    ) -> Result<Vec<TaxRate>, RepositoryError>;

    /// Rates whose validity window contains `as_of`, ordered by priority
    /// then id.
    async fn find_active_rates_by_group(
        &self,
        group_id: i64,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<TaxRate>, RepositoryError>;
}

#[async_trait]
pub trait TaxAssignmentStore: Send + Sync {
    /// Inserts the keys not yet assigned to the group and returns only the
    /// newly created rows. Runs as one unit.
    async fn create_assignments(
        &self,
        group_id: i64,
        keys: &[ContextKey],
    ) -> Result<Vec<ContextAssignment>, RepositoryError>;

    /// Returns how many assignments were removed.
    async fn delete_assignments(
        &self,
        group_id: i64,
        keys: &[ContextKey],
    ) -> Result<u64, RepositoryError>;

    async fn find_assignments_by_group(
        &self,
        group_id: i64,
    ) -> Result<Vec<ContextAssignment>, RepositoryError>;

    /// Idempotent: linking an already linked pair returns the existing link.
    async fn link_tax(
        &self,
        group_id: i64,
        tax_id: i64,
    ) -> Result<GroupTaxLink, RepositoryError>;

    /// Returns whether a link was removed.
    async fn unlink_tax(
        &self,
        group_id: i64,
        tax_id: i64,
    ) -> Result<bool, RepositoryError>;

    async fn find_tax_links(
        &self,
        group_id: i64,
    ) -> Result<Vec<GroupTaxLink>, RepositoryError>;
}

/// Every store contract the engine consumes, served by one backend.
pub trait TaxRepository: TaxStore + TaxGroupStore + TaxRateStore + TaxAssignmentStore {}

impl<T> TaxRepository for T where T: TaxStore + TaxGroupStore + TaxRateStore + TaxAssignmentStore
{}
