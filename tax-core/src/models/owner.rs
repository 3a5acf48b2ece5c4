use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Owner type tag reserved for globally defined records.
pub const SYSTEM_OWNER_TYPE: &str = "system";

/// Rejected owner type / owner id combination.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OwnerError {
    #[error("system-owned records must not carry an owner id (got '{0}')")]
    SystemWithId(String),

    #[error("owner type '{0}' requires an owner id")]
    MissingOwnerId(String),

    #[error("owner type must not be empty")]
    EmptyOwnerType,
}

/// The scope a tax record belongs to.
///
/// `System` records apply to every owner. Scoped records belong to exactly one
/// `(owner_type, owner_id)` pair; the owner type is an open tag
/// (`"organization"`, `"merchant"`, ...), never validated against a fixed list.
///
/// A system owner never has an id and a scoped owner always has one, so the
/// ownership invariant holds for every value of this type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "OwnerRecord", into = "OwnerRecord")]
pub enum Owner {
    System,
    Scoped { owner_type: String, owner_id: String },
}

impl Owner {
    /// Builds an owner from the loose `(owner_type, owner_id)` pair used at
    /// storage and transport boundaries.
    pub fn parse(
        owner_type: &str,
        owner_id: Option<&str>,
    ) -> Result<Self, OwnerError> {
        let owner_type = owner_type.trim();
        let owner_id = owner_id.map(str::trim).filter(|id| !id.is_empty());

        match (owner_type, owner_id) {
            ("", _) => Err(OwnerError::EmptyOwnerType),
            (SYSTEM_OWNER_TYPE, None) => Ok(Self::System),
            (SYSTEM_OWNER_TYPE, Some(id)) => Err(OwnerError::SystemWithId(id.to_string())),
            (other, None) => Err(OwnerError::MissingOwnerId(other.to_string())),
            (other, Some(id)) => Ok(Self::Scoped {
                owner_type: other.to_string(),
                owner_id: id.to_string(),
            }),
        }
    }

    /// Shorthand for a scoped owner. A `"system"` tag is rejected.
    pub fn scoped(
        owner_type: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Result<Self, OwnerError> {
        let owner_type = owner_type.into();
        let owner_id = owner_id.into();
        Self::parse(&owner_type, Some(&owner_id))
    }

    pub fn owner_type(&self) -> &str {
        match self {
            Self::System => SYSTEM_OWNER_TYPE,
            Self::Scoped { owner_type, .. } => owner_type,
        }
    }

    pub fn owner_id(&self) -> Option<&str> {
        match self {
            Self::System => None,
            Self::Scoped { owner_id, .. } => Some(owner_id),
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System)
    }
}

impl fmt::Display for Owner {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Self::System => f.write_str(SYSTEM_OWNER_TYPE),
            Self::Scoped {
                owner_type,
                owner_id,
            } => write!(f, "{owner_type}:{owner_id}"),
        }
    }
}

/// Flat wire/storage shape of an [`Owner`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub owner_type: String,
    #[serde(default)]
    pub owner_id: Option<String>,
}

impl TryFrom<OwnerRecord> for Owner {
    type Error = OwnerError;

    fn try_from(record: OwnerRecord) -> Result<Self, Self::Error> {
        Owner::parse(&record.owner_type, record.owner_id.as_deref())
    }
}

impl From<Owner> for OwnerRecord {
    fn from(owner: Owner) -> Self {
        Self {
            owner_type: owner.owner_type().to_string(),
            owner_id: owner.owner_id().map(str::to_string),
        }
    }
}

/// Records that belong to an [`Owner`].
pub trait Owned {
    fn owner(&self) -> &Owner;
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parse_system_without_id() {
        assert_eq!(Owner::parse("system", None), Ok(Owner::System));
    }

    #[test]
    fn parse_system_treats_blank_id_as_absent() {
        assert_eq!(Owner::parse("system", Some("  ")), Ok(Owner::System));
    }

    #[test]
    fn parse_system_with_id_is_rejected() {
        assert_eq!(
            Owner::parse("system", Some("m1")),
            Err(OwnerError::SystemWithId("m1".to_string()))
        );
    }

    #[test]
    fn parse_scoped_requires_id() {
        assert_eq!(
            Owner::parse("merchant", None),
            Err(OwnerError::MissingOwnerId("merchant".to_string()))
        );
    }

    #[test]
    fn parse_accepts_unknown_owner_types() {
        let owner = Owner::parse("franchise", Some("f-9")).expect("open owner type");

        assert_eq!(owner.owner_type(), "franchise");
        assert_eq!(owner.owner_id(), Some("f-9"));
        assert!(!owner.is_system());
    }

    #[test]
    fn parse_rejects_empty_type() {
        assert_eq!(Owner::parse(" ", Some("x")), Err(OwnerError::EmptyOwnerType));
    }

    #[test]
    fn scoped_refuses_system_tag() {
        assert!(Owner::scoped("system", "x").is_err());
    }

    #[test]
    fn display_formats_scope() {
        assert_eq!(Owner::System.to_string(), "system");
        assert_eq!(
            Owner::scoped("merchant", "m1").unwrap().to_string(),
            "merchant:m1"
        );
    }

    #[test]
    fn record_round_trip_keeps_invariant() {
        let record = OwnerRecord::from(Owner::System);

        assert_eq!(record.owner_id, None);
        assert_eq!(Owner::try_from(record), Ok(Owner::System));
    }
}
