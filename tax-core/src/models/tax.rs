use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::owner::{Owned, Owner};

/// A named tax concept such as "VAT".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tax {
    pub id: i64,
    #[serde(flatten)]
    pub owner: Owner,
    pub name: String,
    /// Unique within the owner scope.
    pub slug: String,
    pub description: Option<String>,
    pub is_active: bool,
    /// Optimistic concurrency token, bumped on every update.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Owned for Tax {
    fn owner(&self) -> &Owner {
        &self.owner
    }
}

/// For creating new taxes (no id, version or timestamps).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTax {
    #[serde(flatten)]
    pub owner: Owner,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub is_active: bool,
}

/// Caller-supplied fields for a tax; ownership is stamped by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxInput {
    pub name: String,
    /// Derived from `name` when absent.
    pub slug: Option<String>,
    pub description: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl TaxInput {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slug: None,
            description: None,
            is_active: true,
        }
    }

    pub fn into_new_tax(
        self,
        owner: Owner,
    ) -> NewTax {
        let slug = self
            .slug
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| slugify(&self.name));
        NewTax {
            owner,
            name: self.name,
            slug,
            description: self.description,
            is_active: self.is_active,
        }
    }
}

pub(crate) fn default_active() -> bool {
    true
}

/// Partial update; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxUpdate {
    pub name: Option<String>,
    pub slug: Option<String>,
    /// `Some(None)` clears the description.
    pub description: Option<Option<String>>,
    pub is_active: Option<bool>,
}

impl TaxUpdate {
    pub fn apply_to(
        &self,
        tax: &mut Tax,
    ) {
        if let Some(name) = &self.name {
            tax.name = name.clone();
        }
        if let Some(slug) = &self.slug {
            tax.slug = slug.clone();
        }
        if let Some(description) = &self.description {
            tax.description = description.clone();
        }
        if let Some(is_active) = self.is_active {
            tax.is_active = is_active;
        }
    }
}

/// Lowercase ASCII slug: alphanumerics are kept, every other run of
/// characters collapses to a single `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;

    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    slug
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Value Added  Tax"), "value-added-tax");
        assert_eq!(slugify("  PPN (11%) "), "ppn-11");
        assert_eq!(slugify("---"), "");
    }

    #[test]
    fn input_derives_slug_from_name() {
        let new_tax = TaxInput::named("Service Charge").into_new_tax(Owner::System);

        assert_eq!(new_tax.slug, "service-charge");
        assert!(new_tax.is_active);
    }

    #[test]
    fn input_keeps_explicit_slug() {
        let input = TaxInput {
            slug: Some("sc".to_string()),
            ..TaxInput::named("Service Charge")
        };

        assert_eq!(input.into_new_tax(Owner::System).slug, "sc");
    }
}
