use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warehouse_core::{CellId, Entity, ProductId, Quantity};

/// Quantity of one product held in one cell.
///
/// Rows are created lazily by the first movement into a (product, cell) pair
/// and are never deleted; a fully consumed balance stays at zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockBalance {
    pub product_id: ProductId,
    pub cell_id: CellId,
    pub quantity: Quantity,
    pub last_updated: DateTime<Utc>,
}

impl StockBalance {
    pub fn empty(product_id: ProductId, cell_id: CellId, now: DateTime<Utc>) -> Self {
        Self {
            product_id,
            cell_id,
            quantity: Quantity::ZERO,
            last_updated: now,
        }
    }

    pub fn key(&self) -> (ProductId, CellId) {
        (self.product_id, self.cell_id)
    }
}

impl Entity for StockBalance {
    type Id = (ProductId, CellId);

    fn id(&self) -> Self::Id {
        self.key()
    }
}

/// Criteria for listing balances; every `Some` field must match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceFilter {
    pub product_id: Option<ProductId>,
    pub cell_id: Option<CellId>,
    /// Only rows holding at least this much.
    pub min_quantity: Option<Quantity>,
}

impl BalanceFilter {
    pub fn for_product(product_id: ProductId) -> Self {
        Self {
            product_id: Some(product_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, balance: &StockBalance) -> bool {
        if self.product_id.is_some_and(|p| p != balance.product_id) {
            return false;
        }
        if self.cell_id.is_some_and(|c| c != balance.cell_id) {
            return false;
        }
        if self.min_quantity.is_some_and(|min| balance.quantity < min) {
            return false;
        }
        true
    }
}
