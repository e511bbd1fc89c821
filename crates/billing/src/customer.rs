use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use reconcile_core::{CompanyId, CustomerId, DomainError, DomainResult, Entity, TenantScoped};

/// The paying entity a payment and its invoices belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub company_id: CompanyId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Customer {
    pub fn new(company_id: CompanyId, name: impl Into<String>, at: DateTime<Utc>) -> DomainResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::validation("name", "is required"));
        }
        Ok(Self {
            id: CustomerId::new(),
            company_id,
            name,
            created_at: at,
        })
    }
}

impl Entity for Customer {
    type Id = CustomerId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl TenantScoped for Customer {
    fn company_id(&self) -> CompanyId {
        self.company_id
    }
}
