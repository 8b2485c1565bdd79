//! Access control seam.
//!
//! The services ask an [`AccessControl`] before every mutating or listing
//! operation. Denials surface as [`ServiceError::NotAllowed`](super::ServiceError);
//! search results are filtered per item instead.

use wayflow_types::identity::Identity;
use wayflow_types::session::SessionRecord;
use wayflow_types::workflow::WorkflowDefinition;

pub trait AccessControl: Send + Sync {
    fn can_create_workflow(&self, who: &Identity) -> bool;
    fn can_search_workflows(&self, who: &Identity) -> bool;
    fn can_read_workflow(&self, who: &Identity, def: &WorkflowDefinition) -> bool;
    fn can_update_workflow(&self, who: &Identity, def: &WorkflowDefinition) -> bool;
    fn can_delete_workflow(&self, who: &Identity, def: &WorkflowDefinition) -> bool;
    fn can_undelete_workflow(&self, who: &Identity, def: &WorkflowDefinition) -> bool;
    fn can_execute_workflow(&self, who: &Identity, def: &WorkflowDefinition) -> bool;

    fn can_search_sessions(&self, who: &Identity) -> bool;
    fn can_read_session(&self, who: &Identity, session: &SessionRecord) -> bool;
    /// Resume and cancel.
    fn can_manage_session(&self, who: &Identity, session: &SessionRecord) -> bool;
}

/// Grants everything. Used by the CLI and embedded setups.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn can_create_workflow(&self, _who: &Identity) -> bool {
        true
    }

    fn can_search_workflows(&self, _who: &Identity) -> bool {
        true
    }

    fn can_read_workflow(&self, _who: &Identity, _def: &WorkflowDefinition) -> bool {
        true
    }

    fn can_update_workflow(&self, _who: &Identity, _def: &WorkflowDefinition) -> bool {
        true
    }

    fn can_delete_workflow(&self, _who: &Identity, _def: &WorkflowDefinition) -> bool {
        true
    }

    fn can_undelete_workflow(&self, _who: &Identity, _def: &WorkflowDefinition) -> bool {
        true
    }

    fn can_execute_workflow(&self, _who: &Identity, _def: &WorkflowDefinition) -> bool {
        true
    }

    fn can_search_sessions(&self, _who: &Identity) -> bool {
        true
    }

    fn can_read_session(&self, _who: &Identity, _session: &SessionRecord) -> bool {
        true
    }

    fn can_manage_session(&self, _who: &Identity, _session: &SessionRecord) -> bool {
        true
    }
}

/// Owners (and the system identity) may do anything with their own
/// workflows and sessions; everyone else may only create and search.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerOnly;

impl OwnerOnly {
    fn owns(who: &Identity, owner: u64) -> bool {
        who.is_system() || who.id == owner
    }
}

impl AccessControl for OwnerOnly {
    fn can_create_workflow(&self, _who: &Identity) -> bool {
        true
    }

    fn can_search_workflows(&self, _who: &Identity) -> bool {
        true
    }

    fn can_read_workflow(&self, who: &Identity, def: &WorkflowDefinition) -> bool {
        Self::owns(who, def.owned_by)
    }

    fn can_update_workflow(&self, who: &Identity, def: &WorkflowDefinition) -> bool {
        Self::owns(who, def.owned_by)
    }

    fn can_delete_workflow(&self, who: &Identity, def: &WorkflowDefinition) -> bool {
        Self::owns(who, def.owned_by)
    }

    fn can_undelete_workflow(&self, who: &Identity, def: &WorkflowDefinition) -> bool {
        Self::owns(who, def.owned_by)
    }

    fn can_execute_workflow(&self, who: &Identity, def: &WorkflowDefinition) -> bool {
        Self::owns(who, def.owned_by)
    }

    fn can_search_sessions(&self, _who: &Identity) -> bool {
        true
    }

    fn can_read_session(&self, who: &Identity, session: &SessionRecord) -> bool {
        Self::owns(who, session.created_by)
    }

    fn can_manage_session(&self, who: &Identity, session: &SessionRecord) -> bool {
        Self::owns(who, session.created_by)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayflow_types::scope::Scope;

    #[test]
    fn test_owner_only_checks_owner_and_system() {
        let mut def = WorkflowDefinition::new("mine");
        def.owned_by = 7;
        let owner = Identity::new(7, "ann");
        let other = Identity::new(8, "bob");

        assert!(OwnerOnly.can_update_workflow(&owner, &def));
        assert!(OwnerOnly.can_update_workflow(&Identity::system(), &def));
        assert!(!OwnerOnly.can_update_workflow(&other, &def));
        assert!(OwnerOnly.can_create_workflow(&other));

        let session = SessionRecord::new(1, 1, Scope::new(), &other);
        assert!(OwnerOnly.can_read_session(&other, &session));
        assert!(!OwnerOnly.can_manage_session(&owner, &session));
    }
}
