use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::owner::{Owned, Owner};
use super::tax::default_active;

/// A named bundle of rates; the unit that is linked to taxes and scoped to
/// transaction contexts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxGroup {
    pub id: i64,
    #[serde(flatten)]
    pub owner: Owner,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Owned for TaxGroup {
    fn owner(&self) -> &Owner {
        &self.owner
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTaxGroup {
    #[serde(flatten)]
    pub owner: Owner,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxGroupInput {
    pub name: String,
    pub description: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl TaxGroupInput {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            is_active: true,
        }
    }

    pub fn into_new_group(
        self,
        owner: Owner,
    ) -> NewTaxGroup {
        NewTaxGroup {
            owner,
            name: self.name,
            description: self.description,
            is_active: self.is_active,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxGroupUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub is_active: Option<bool>,
}

impl TaxGroupUpdate {
    pub fn apply_to(
        &self,
        group: &mut TaxGroup,
    ) {
        if let Some(name) = &self.name {
            group.name = name.clone();
        }
        if let Some(description) = &self.description {
            group.description = description.clone();
        }
        if let Some(is_active) = self.is_active {
            group.is_active = is_active;
        }
    }
}
