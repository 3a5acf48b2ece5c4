use std::fmt;

use thiserror::Error;

use crate::calculations::CalculationError;
use crate::db::repository::RepositoryError;
use crate::models::OwnerError;

/// The record kinds the engine reports failures about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entity {
    Tax,
    TaxGroup,
    TaxRate,
    GroupTaxLink,
}

impl fmt::Display for Entity {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(match self {
            Self::Tax => "tax",
            Self::TaxGroup => "tax group",
            Self::TaxRate => "tax rate",
            Self::GroupTaxLink => "group link",
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The record exists but belongs to a different owner than the caller
    /// declared.
    #[error("{entity} {id} does not belong to the requesting owner")]
    OwnershipMismatch { entity: Entity, id: i64 },

    #[error("{entity} {id} not found")]
    NotFound { entity: Entity, id: i64 },

    #[error("Validation failed: {0}")]
    Validation(String),

    /// Slug collision, stale version or a record still referenced elsewhere.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Bulk operation partially failed: {succeeded} succeeded, {failed} failed")]
    PartialBulkFailure { succeeded: usize, failed: usize },

    #[error(transparent)]
    Calculation(#[from] CalculationError),

    #[error(transparent)]
    Repository(RepositoryError),
}

impl EngineError {
    /// Maps a store error raised while operating on `entity` `id`, so a
    /// row that vanished mid-operation surfaces as [`EngineError::NotFound`].
    pub(crate) fn from_store(
        entity: Entity,
        id: i64,
    ) -> impl FnOnce(RepositoryError) -> Self {
        move |err| match err {
            RepositoryError::NotFound => Self::NotFound { entity, id },
            other => Self::from(other),
        }
    }
}

impl From<RepositoryError> for EngineError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Repository(other),
        }
    }
}

impl From<OwnerError> for EngineError {
    fn from(err: OwnerError) -> Self {
        Self::Validation(err.to_string())
    }
}
