use serde::{Deserialize, Serialize};

use warehouse_core::{CellId, DomainError, DomainResult, Entity};

use crate::{ensure_max_chars, ensure_optional_max_chars};

/// Physical storage location (e.g. `A-01`, `B-12`).
///
/// The data model allows many cells; posting currently targets one configured
/// default cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseCell {
    pub id: CellId,
    pub name: String,
    pub description: Option<String>,
}

impl Entity for WarehouseCell {
    type Id = CellId;

    fn id(&self) -> CellId {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWarehouseCell {
    pub name: String,
    pub description: Option<String>,
}

impl NewWarehouseCell {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(DomainError::validation("cell name cannot be empty"));
        }
        ensure_max_chars("cell name", name, 20)?;
        ensure_optional_max_chars("cell description", self.description.as_deref(), 200)
    }

    pub fn into_cell(self, id: CellId) -> WarehouseCell {
        WarehouseCell {
            id,
            name: self.name.trim().to_string(),
            description: self.description,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_cell_names_are_rejected() {
        assert!(NewWarehouseCell::named("A-01").validate().is_ok());
        assert!(NewWarehouseCell::named("X".repeat(21)).validate().is_err());

        let mut cell = NewWarehouseCell::named("A-01");
        cell.description = Some("я".repeat(200));
        assert!(cell.validate().is_ok());
        cell.description = Some("я".repeat(201));
        assert!(cell.validate().is_err());
    }
}
