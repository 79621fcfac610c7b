use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warehouse_core::{DomainError, DomainResult, Entity, SupplierId};

use crate::{ensure_max_chars, ensure_optional_max_chars};

/// Goods supplier referenced by income documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Supplier {
    pub id: SupplierId,
    pub name: String,
    /// Taxpayer number (INN); unique when present.
    pub inn: Option<String>,
    pub contact_person: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Entity for Supplier {
    type Id = SupplierId;

    fn id(&self) -> SupplierId {
        self.id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSupplier {
    pub name: String,
    pub inn: Option<String>,
    pub contact_person: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
}

impl NewSupplier {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("supplier name cannot be empty"));
        }
        ensure_max_chars("supplier name", self.name.trim(), 200)?;
        if let Some(inn) = &self.inn {
            let len = inn.chars().count();
            // Russian INN: 10 digits for organisations, 12 for individuals.
            if !(len == 10 || len == 12) || !inn.chars().all(|c| c.is_ascii_digit()) {
                return Err(DomainError::validation("inn must be 10 or 12 digits"));
            }
        }
        ensure_optional_max_chars("contact person", self.contact_person.as_deref(), 100)?;
        ensure_optional_max_chars("phone", self.phone.as_deref(), 20)?;
        ensure_optional_max_chars("email", self.email.as_deref(), 120)?;
        ensure_optional_max_chars("address", self.address.as_deref(), 200)
    }

    pub fn into_supplier(self, id: SupplierId, now: DateTime<Utc>) -> Supplier {
        Supplier {
            id,
            name: self.name.trim().to_string(),
            inn: self.inn,
            contact_person: self.contact_person,
            phone: self.phone,
            email: self.email,
            address: self.address,
            created_at: now,
        }
    }
}
