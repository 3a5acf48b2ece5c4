//! Read-only views composed from the store queries.

use serde::{Deserialize, Serialize};

use super::error::EngineError;
use super::TaxEngine;
use crate::db::repository::{TaxAssignmentStore, TaxGroupStore, TaxRateStore, TaxStore};
use crate::models::{
    AssignedEntity, ContextKey, Owner, RateType, Tax, TaxGroup, TaxRate,
};

/// Counts over the taxes and groups visible to one owner (system records
/// plus the owner's own).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxStatistics {
    pub system_taxes: usize,
    pub owner_taxes: usize,
    pub active_taxes: usize,
    pub inactive_taxes: usize,
    pub tax_groups: usize,
    pub active_tax_groups: usize,
    /// Groups with no context assignment.
    pub global_tax_groups: usize,
    pub scoped_tax_groups: usize,
    pub rates: usize,
    pub inclusive_rates: usize,
    pub fixed_rates: usize,
}

/// Taxes per owner level, each with the groups backing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxHierarchy {
    pub owner: Owner,
    /// System level first, then the owner's own level when it is scoped.
    pub levels: Vec<HierarchyLevel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyLevel {
    pub owner: Owner,
    pub taxes: Vec<TaxNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxNode {
    pub tax: Tax,
    pub groups: Vec<GroupNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupNode {
    pub group: TaxGroup,
    /// Empty for a global group.
    pub scope: Vec<ContextKey>,
    /// Rates of the group that belong to the enclosing tax.
    pub rates: Vec<TaxRate>,
}

impl TaxEngine {
    pub async fn get_tax_statistics(
        &self,
        owner: &Owner,
    ) -> Result<TaxStatistics, EngineError> {
        let mut stats = TaxStatistics::default();

        for level in levels(owner) {
            let taxes = self.repository.find_taxes_by_owner(&level).await?;
            if level.is_system() {
                stats.system_taxes = taxes.len();
            } else {
                stats.owner_taxes = taxes.len();
            }
            stats.active_taxes += taxes.iter().filter(|t| t.is_active).count();
            stats.inactive_taxes += taxes.iter().filter(|t| !t.is_active).count();

            for group in self.repository.find_groups_by_owner(&level).await? {
                stats.tax_groups += 1;
                if group.is_active {
                    stats.active_tax_groups += 1;
                }
                if self.repository.find_assignments_by_group(group.id).await?.is_empty() {
                    stats.global_tax_groups += 1;
                } else {
                    stats.scoped_tax_groups += 1;
                }

                let rates = self.repository.find_rates_by_group(group.id).await?;
                stats.rates += rates.len();
                stats.inclusive_rates += rates.iter().filter(|r| r.is_inclusive).count();
                stats.fixed_rates += rates
                    .iter()
                    .filter(|r| r.rate_type == RateType::Fixed)
                    .count();
            }
        }

        Ok(stats)
    }

    /// Every tax visible to `owner`, active or not, with the groups backing
    /// it, their context scope and their rates.
    pub async fn get_tax_hierarchy(
        &self,
        owner: &Owner,
    ) -> Result<TaxHierarchy, EngineError> {
        let mut hierarchy = TaxHierarchy {
            owner: owner.clone(),
            levels: Vec::new(),
        };

        for level in levels(owner) {
            let mut taxes = Vec::new();
            for tax in self.repository.find_taxes_by_owner(&level).await? {
                let groups = self
                    .repository
                    .find_groups_by_assigned_entity(&AssignedEntity::Tax { tax_id: tax.id })
                    .await?;

                let mut nodes = Vec::with_capacity(groups.len());
                for group in groups {
                    let scope = self
                        .repository
                        .find_assignments_by_group(group.id)
                        .await?
                        .into_iter()
                        .map(|a| a.key)
                        .collect();
                    let rates = self
                        .repository
                        .find_rates_by_group(group.id)
                        .await?
                        .into_iter()
                        .filter(|r| r.tax_id == tax.id)
                        .collect();
                    nodes.push(GroupNode { group, scope, rates });
                }
                taxes.push(TaxNode { tax, groups: nodes });
            }
            hierarchy.levels.push(HierarchyLevel { owner: level, taxes });
        }

        Ok(hierarchy)
    }

    /// Case-insensitive substring search over the name and slug of every tax
    /// visible to `owner`, sorted by name then id. A blank query matches all.
    pub async fn search_taxes(
        &self,
        owner: &Owner,
        query: &str,
    ) -> Result<Vec<Tax>, EngineError> {
        let needle = query.trim().to_lowercase();
        let mut found = Vec::new();

        for level in levels(owner) {
            found.extend(
                self.repository
                    .find_taxes_by_owner(&level)
                    .await?
                    .into_iter()
                    .filter(|tax| {
                        tax.name.to_lowercase().contains(&needle) || tax.slug.contains(&needle)
                    }),
            );
        }

        found.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(found)
    }
}

fn levels(owner: &Owner) -> Vec<Owner> {
    if owner.is_system() {
        vec![Owner::System]
    } else {
        vec![Owner::System, owner.clone()]
    }
}
