use reconcile_core::{AccessDecision, CompanyId, OperationContext, UserId};

/// Tenant context for a request.
///
/// Resolved upstream and passed in `X-Company-Id`; immutable for the request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TenantContext {
    company_id: CompanyId,
}

impl TenantContext {
    pub fn new(company_id: CompanyId) -> Self {
        Self { company_id }
    }

    pub fn company_id(&self) -> CompanyId {
        self.company_id
    }
}

/// Acting user plus the authorization decision made upstream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    user_id: UserId,
    decision: AccessDecision,
}

impl PrincipalContext {
    pub fn new(user_id: UserId, decision: AccessDecision) -> Self {
        Self { user_id, decision }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn decision(&self) -> AccessDecision {
        self.decision
    }
}

/// The engine-facing context for one operation.
pub fn operation_context(tenant: &TenantContext, principal: &PrincipalContext) -> OperationContext {
    OperationContext::new(tenant.company_id(), principal.user_id()).with_decision(principal.decision())
}
