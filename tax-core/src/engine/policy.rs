//! Pluggable access decisions for tax administration.
//!
//! The engine never consults a policy on its own; callers that know who is
//! acting ask [`TaxEngine::authorize`] or one of the `can_manage_*` helpers
//! before invoking a mutation.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::EngineError;
use super::TaxEngine;
use crate::models::Owner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Manages every record, system-owned ones included.
    SystemAdmin,
    /// Manages records of its own owner scope.
    OwnerAdmin,
    /// Read-only.
    Viewer,
}

/// Who is acting, and on behalf of which owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub role: Role,
    pub owner: Owner,
}

impl Actor {
    pub fn new(
        role: Role,
        owner: Owner,
    ) -> Self {
        Self { role, owner }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Read,
    Manage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Tax,
    TaxGroup,
    TaxAssignment,
}

/// What is being acted on. Assignments carry the owner of their group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub kind: ResourceKind,
    pub owner: Owner,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

pub trait AccessPolicy: Send + Sync {
    fn decide(
        &self,
        actor: &Actor,
        action: Action,
        resource: &Resource,
    ) -> Decision;
}

/// Role × ownership rule.
///
/// | role          | read                       | manage              |
/// |---------------|----------------------------|---------------------|
/// | `SystemAdmin` | everything                 | everything          |
/// | `OwnerAdmin`  | system and own records     | own records only    |
/// | `Viewer`      | system and own records     | nothing             |
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnershipPolicy;

impl AccessPolicy for OwnershipPolicy {
    fn decide(
        &self,
        actor: &Actor,
        action: Action,
        resource: &Resource,
    ) -> Decision {
        let own = resource.owner == actor.owner;

        match (actor.role, action) {
            (Role::SystemAdmin, _) => Decision::Allow,
            (_, Action::Read) if own || resource.owner.is_system() => Decision::Allow,
            (_, Action::Read) => {
                Decision::Deny(format!("{} is outside the actor's scope", resource.owner))
            }
            (Role::OwnerAdmin, Action::Manage) if own && !resource.owner.is_system() => {
                Decision::Allow
            }
            (Role::OwnerAdmin, Action::Manage) => Decision::Deny(format!(
                "owner admin of {} cannot manage records of {}",
                actor.owner, resource.owner
            )),
            (Role::Viewer, Action::Manage) => Decision::Deny("viewers are read-only".to_string()),
        }
    }
}

/// Authorises every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn decide(
        &self,
        _actor: &Actor,
        _action: Action,
        _resource: &Resource,
    ) -> Decision {
        Decision::Allow
    }
}

impl TaxEngine {
    /// Fails with [`EngineError::PermissionDenied`] unless the configured
    /// policy allows `action` on `resource`.
    pub fn authorize(
        &self,
        actor: &Actor,
        action: Action,
        resource: &Resource,
    ) -> Result<(), EngineError> {
        match self.policy.decide(actor, action, resource) {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => {
                warn!(
                    role = ?actor.role,
                    actor = %actor.owner,
                    ?action,
                    kind = ?resource.kind,
                    %reason,
                    "Access denied"
                );
                Err(EngineError::PermissionDenied(reason))
            }
        }
    }

    pub async fn can_manage_tax(
        &self,
        actor: &Actor,
        tax_id: i64,
    ) -> Result<bool, EngineError> {
        let tax = self.get_tax(tax_id).await?;
        Ok(self.can_manage(actor, ResourceKind::Tax, tax.owner))
    }

    pub async fn can_manage_tax_group(
        &self,
        actor: &Actor,
        group_id: i64,
    ) -> Result<bool, EngineError> {
        let group = self.get_tax_group(group_id).await?;
        Ok(self.can_manage(actor, ResourceKind::TaxGroup, group.owner))
    }

    /// Whether `actor` may change the taxes and contexts `group_id` is
    /// assigned to.
    pub async fn can_manage_tax_assignment(
        &self,
        actor: &Actor,
        group_id: i64,
    ) -> Result<bool, EngineError> {
        let group = self.get_tax_group(group_id).await?;
        Ok(self.can_manage(actor, ResourceKind::TaxAssignment, group.owner))
    }

    fn can_manage(
        &self,
        actor: &Actor,
        kind: ResourceKind,
        owner: Owner,
    ) -> bool {
        self.policy
            .decide(actor, Action::Manage, &Resource { kind, owner })
            .is_allowed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::memory::MemoryRepository;
    use crate::engine::error::Entity;
    use crate::models::{TaxGroupInput, TaxInput};

    fn merchant(id: &str) -> Owner {
        Owner::scoped("merchant", id).unwrap()
    }

    fn resource(owner: Owner) -> Resource {
        Resource {
            kind: ResourceKind::Tax,
            owner,
        }
    }

    // =========================================================================
    // OwnershipPolicy
    // =========================================================================

    #[test]
    fn system_admin_manages_everything() {
        let admin = Actor::new(Role::SystemAdmin, Owner::System);

        assert!(OwnershipPolicy.decide(&admin, Action::Manage, &resource(Owner::System)).is_allowed());
        assert!(OwnershipPolicy.decide(&admin, Action::Manage, &resource(merchant("m1"))).is_allowed());
    }

    #[test]
    fn owner_admin_manages_only_own_records() {
        let admin = Actor::new(Role::OwnerAdmin, merchant("m1"));

        assert!(OwnershipPolicy.decide(&admin, Action::Manage, &resource(merchant("m1"))).is_allowed());
        assert!(!OwnershipPolicy.decide(&admin, Action::Manage, &resource(merchant("m2"))).is_allowed());
        assert!(!OwnershipPolicy.decide(&admin, Action::Manage, &resource(Owner::System)).is_allowed());
    }

    #[test]
    fn owner_admin_reads_system_records() {
        let admin = Actor::new(Role::OwnerAdmin, merchant("m1"));

        assert_eq!(OwnershipPolicy.decide(&admin, Action::Read, &resource(Owner::System)), Decision::Allow);
        assert!(!OwnershipPolicy.decide(&admin, Action::Read, &resource(merchant("m2"))).is_allowed());
    }

    #[test]
    fn viewer_is_read_only() {
        let viewer = Actor::new(Role::Viewer, merchant("m1"));

        assert!(OwnershipPolicy.decide(&viewer, Action::Read, &resource(merchant("m1"))).is_allowed());
        assert_eq!(
            OwnershipPolicy.decide(&viewer, Action::Manage, &resource(merchant("m1"))),
            Decision::Deny("viewers are read-only".to_string())
        );
    }

    #[test]
    fn allow_all_never_denies() {
        let viewer = Actor::new(Role::Viewer, merchant("m1"));

        assert!(AllowAll.decide(&viewer, Action::Manage, &resource(Owner::System)).is_allowed());
    }

    // =========================================================================
    // engine helpers
    // =========================================================================

    #[tokio::test]
    async fn can_manage_reflects_record_owner() {
        let engine = TaxEngine::new(Arc::new(MemoryRepository::new()));
        let tax = engine
            .create_tax(&merchant("m1"), TaxInput::named("Service"))
            .await
            .unwrap();
        let group = engine
            .create_tax_group(&merchant("m2"), TaxGroupInput::named("Other"))
            .await
            .unwrap();
        let actor = Actor::new(Role::OwnerAdmin, merchant("m1"));

        assert!(engine.can_manage_tax(&actor, tax.id).await.unwrap());
        assert!(!engine.can_manage_tax_group(&actor, group.id).await.unwrap());
        assert!(!engine.can_manage_tax_assignment(&actor, group.id).await.unwrap());
    }

    #[tokio::test]
    async fn can_manage_unknown_record_is_not_found() {
        let engine = TaxEngine::new(Arc::new(MemoryRepository::new()));
        let actor = Actor::new(Role::SystemAdmin, Owner::System);

        let result = engine.can_manage_tax(&actor, 99).await;

        assert_eq!(
            result,
            Err(EngineError::NotFound {
                entity: Entity::Tax,
                id: 99
            })
        );
    }

    #[tokio::test]
    async fn authorize_surfaces_denial() {
        let engine = TaxEngine::new(Arc::new(MemoryRepository::new()));
        let viewer = Actor::new(Role::Viewer, merchant("m1"));

        let result = engine.authorize(&viewer, Action::Manage, &resource(merchant("m1")));

        assert!(matches!(result, Err(EngineError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn permissive_policy_can_be_injected() {
        let engine = TaxEngine::new(Arc::new(MemoryRepository::new())).with_policy(Arc::new(AllowAll));
        let viewer = Actor::new(Role::Viewer, merchant("m1"));

        assert_eq!(engine.authorize(&viewer, Action::Manage, &resource(Owner::System)), Ok(()));
    }
}
