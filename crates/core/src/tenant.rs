//! Tenant context: the resolved company every operation runs under.
//!
//! There is no ambient "current company". Callers (HTTP handlers, batch workers)
//! build an [`OperationContext`] from already-authenticated input and pass it to
//! every engine entry point. Storage adapters then refuse to read or write any row
//! whose `company_id` differs from the context, even when upstream authorization
//! already approved the action.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{CompanyId, UserId};

/// Rows and messages owned by exactly one company.
pub trait TenantScoped {
    fn company_id(&self) -> CompanyId;
}

/// Authorization outcome decided upstream (RBAC is not evaluated here).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessDecision {
    Granted,
    Denied,
}

/// Explicit per-operation context: who acts, for which company, and whether they may.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationContext {
    company_id: CompanyId,
    actor: UserId,
    decision: AccessDecision,
}

impl OperationContext {
    /// Context for an authorized actor.
    pub fn new(company_id: CompanyId, actor: UserId) -> Self {
        Self {
            company_id,
            actor,
            decision: AccessDecision::Granted,
        }
    }

    pub fn with_decision(mut self, decision: AccessDecision) -> Self {
        self.decision = decision;
        self
    }

    pub fn company_id(&self) -> CompanyId {
        self.company_id
    }

    pub fn actor(&self) -> UserId {
        self.actor
    }

    pub fn decision(&self) -> AccessDecision {
        self.decision
    }

    pub fn ensure_authorized(&self) -> DomainResult<()> {
        match self.decision {
            AccessDecision::Granted => Ok(()),
            AccessDecision::Denied => Err(DomainError::Unauthorized),
        }
    }
}

/// Reads: a row from another company is reported exactly like a missing row.
pub fn ensure_visible<T: TenantScoped>(company_id: CompanyId, row: &T) -> DomainResult<()> {
    if row.company_id() == company_id {
        Ok(())
    } else {
        Err(DomainError::NotFound)
    }
}

/// Writes: referencing another company's row is a validation failure on `field`.
pub fn ensure_same_company<T: TenantScoped>(
    company_id: CompanyId,
    row: &T,
    field: &str,
) -> DomainResult<()> {
    if row.company_id() == company_id {
        Ok(())
    } else {
        Err(DomainError::validation(field, "does not belong to this company"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Row(CompanyId);

    impl TenantScoped for Row {
        fn company_id(&self) -> CompanyId {
            self.0
        }
    }

    #[test]
    fn foreign_rows_are_invisible_on_read() {
        let mine = CompanyId::new();
        let theirs = CompanyId::new();

        assert!(ensure_visible(mine, &Row(mine)).is_ok());
        assert_eq!(ensure_visible(mine, &Row(theirs)), Err(DomainError::NotFound));
    }

    #[test]
    fn foreign_references_fail_validation_on_write() {
        let mine = CompanyId::new();
        let err = ensure_same_company(mine, &Row(CompanyId::new()), "invoice_id").unwrap_err();
        assert!(err.field_errors().unwrap().contains("invoice_id"));
    }

    #[test]
    fn denied_context_is_unauthorized() {
        let ctx = OperationContext::new(CompanyId::new(), UserId::new())
            .with_decision(AccessDecision::Denied);
        assert_eq!(ctx.ensure_authorized(), Err(DomainError::Unauthorized));
    }
}
