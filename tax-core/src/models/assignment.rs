use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::ContextKey;

/// Scopes a group to one transaction-context entity.
///
/// A group with no context assignments applies to every transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextAssignment {
    pub id: i64,
    pub tax_group_id: i64,
    #[serde(flatten)]
    pub key: ContextKey,
    pub created_at: DateTime<Utc>,
}

/// Declares that a group's rates are rates of a tax.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTaxLink {
    pub tax_group_id: i64,
    pub tax_id: i64,
    pub created_at: DateTime<Utc>,
}

/// What a group can be attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssignedEntity {
    /// Groups backing the tax with this id.
    Tax { tax_id: i64 },
    /// Groups scoped to this context entity.
    Context(ContextKey),
}
