//! Stock ledger: the authoritative (product, cell) -> quantity mapping.
//!
//! `StockLedger` is a pure working set. Storage loads (and locks) the rows a
//! document touches, the posting engine mutates them here, and storage writes
//! back whatever `changed_balances()` reports, all inside one transaction.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use warehouse_core::{CellId, ProductId, Quantity};

use crate::balance::StockBalance;

/// Ledger-level failure.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerError {
    /// Increase/decrease called with a zero amount.
    #[error("movement amount must be positive (product {product_id}, cell {cell_id})")]
    NonPositiveAmount {
        product_id: ProductId,
        cell_id: CellId,
    },

    /// Not enough stock to satisfy a decrease.
    ///
    /// `cell_id` is `None` when the shortage was detected against the total
    /// across all cells.
    #[error("insufficient stock for product {product_id}: required {required}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        cell_id: Option<CellId>,
        required: Quantity,
        available: Quantity,
    },

    /// Decimal overflow while adding to a balance.
    #[error("quantity overflow for product {product_id} in cell {cell_id}")]
    Overflow {
        product_id: ProductId,
        cell_id: CellId,
    },
}

type Key = (ProductId, CellId);

/// Working set of stock balances with change tracking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StockLedger {
    rows: BTreeMap<Key, StockBalance>,
    dirty: BTreeSet<Key>,
}

impl StockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the ledger with rows already persisted (not marked as changed).
    pub fn from_balances(balances: impl IntoIterator<Item = StockBalance>) -> Self {
        let rows = balances.into_iter().map(|b| (b.key(), b)).collect();
        Self {
            rows,
            dirty: BTreeSet::new(),
        }
    }

    /// Quantity of `product_id` in `cell_id`; zero when no row exists.
    pub fn quantity(&self, product_id: ProductId, cell_id: CellId) -> Quantity {
        self.rows
            .get(&(product_id, cell_id))
            .map(|b| b.quantity)
            .unwrap_or(Quantity::ZERO)
    }

    /// Quantity of `product_id` summed across every cell; zero when unknown.
    pub fn total_quantity(&self, product_id: ProductId) -> Quantity {
        self.rows
            .range((product_id, CellId::new(i64::MIN))..=(product_id, CellId::new(i64::MAX)))
            .map(|(_, b)| b.quantity)
            .sum()
    }

    /// Add `amount` to the balance, creating the row if absent.
    pub fn increase(
        &mut self,
        product_id: ProductId,
        cell_id: CellId,
        amount: Quantity,
        now: DateTime<Utc>,
    ) -> Result<Quantity, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::NonPositiveAmount { product_id, cell_id });
        }

        let key = (product_id, cell_id);
        let row = self
            .rows
            .entry(key)
            .or_insert_with(|| StockBalance::empty(product_id, cell_id, now));
        row.quantity = row
            .quantity
            .checked_add(amount)
            .ok_or(LedgerError::Overflow { product_id, cell_id })?;
        row.last_updated = now;
        let updated = row.quantity;
        self.dirty.insert(key);
        Ok(updated)
    }

    /// Subtract `amount` from the balance.
    ///
    /// Fails without touching anything when the cell holds less than
    /// `amount`; never creates a row.
    pub fn decrease(
        &mut self,
        product_id: ProductId,
        cell_id: CellId,
        amount: Quantity,
        now: DateTime<Utc>,
    ) -> Result<Quantity, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::NonPositiveAmount { product_id, cell_id });
        }

        let key = (product_id, cell_id);
        let available = self.quantity(product_id, cell_id);
        let remaining = available
            .checked_sub(amount)
            .ok_or(LedgerError::InsufficientStock {
                product_id,
                cell_id: Some(cell_id),
                required: amount,
                available,
            })?;

        // checked_sub succeeded, so a row with at least `amount` exists.
        if let Some(row) = self.rows.get_mut(&key) {
            row.quantity = remaining;
            row.last_updated = now;
            self.dirty.insert(key);
        }
        Ok(remaining)
    }

    /// Rows modified since construction, in (product, cell) order.
    pub fn changed_balances(&self) -> Vec<StockBalance> {
        self.dirty
            .iter()
            .filter_map(|key| self.rows.get(key).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    const P: ProductId = ProductId::new(1);
    const DEFAULT_CELL: CellId = CellId::new(1);
    const OTHER_CELL: CellId = CellId::new(2);

    fn qty(v: Decimal) -> Quantity {
        Quantity::new(v).unwrap()
    }

    #[test]
    fn unknown_rows_read_as_zero() {
        let ledger = StockLedger::new();
        assert_eq!(ledger.quantity(P, DEFAULT_CELL), Quantity::ZERO);
        assert_eq!(ledger.total_quantity(P), Quantity::ZERO);
    }

    #[test]
    fn increase_creates_row_lazily() {
        let mut ledger = StockLedger::new();
        let now = Utc::now();
        assert_eq!(ledger.increase(P, DEFAULT_CELL, qty(dec!(10)), now).unwrap(), qty(dec!(10)));
        assert_eq!(ledger.increase(P, DEFAULT_CELL, qty(dec!(2.5)), now).unwrap(), qty(dec!(12.5)));
        assert_eq!(ledger.changed_balances().len(), 1);
    }

    #[test]
    fn increase_past_the_column_limit_is_an_overflow() {
        let mut ledger = StockLedger::new();
        let now = Utc::now();
        ledger.increase(P, DEFAULT_CELL, qty(dec!(99999999)), now).unwrap();
        assert_eq!(
            ledger.increase(P, DEFAULT_CELL, qty(dec!(1)), now),
            Err(LedgerError::Overflow { product_id: P, cell_id: DEFAULT_CELL })
        );
        assert_eq!(ledger.quantity(P, DEFAULT_CELL), qty(dec!(99999999)));
    }

    #[test]
    fn decrease_below_zero_fails_without_mutation() {
        let mut ledger = StockLedger::new();
        let now = Utc::now();
        ledger.increase(P, DEFAULT_CELL, qty(dec!(10)), now).unwrap();
        let before = ledger.clone();

        let err = ledger.decrease(P, DEFAULT_CELL, qty(dec!(15)), now).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientStock {
                product_id: P,
                cell_id: Some(DEFAULT_CELL),
                required: qty(dec!(15)),
                available: qty(dec!(10)),
            }
        );
        assert_eq!(ledger, before);
    }

    #[test]
    fn decrease_never_creates_rows() {
        let mut ledger = StockLedger::new();
        assert!(ledger.decrease(P, DEFAULT_CELL, qty(dec!(1)), Utc::now()).is_err());
        assert_eq!(ledger, StockLedger::new());
    }

    #[test]
    fn zero_amounts_are_rejected() {
        let mut ledger = StockLedger::new();
        let err = ledger.increase(P, DEFAULT_CELL, Quantity::ZERO, Utc::now()).unwrap_err();
        assert!(matches!(err, LedgerError::NonPositiveAmount { .. }));
    }

    #[test]
    fn fully_consumed_rows_persist_at_zero() {
        let mut ledger = StockLedger::new();
        let now = Utc::now();
        ledger.increase(P, DEFAULT_CELL, qty(dec!(4)), now).unwrap();
        ledger.decrease(P, DEFAULT_CELL, qty(dec!(4)), now).unwrap();
        let rows = ledger.changed_balances();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].quantity.is_zero());
    }

    #[test]
    fn total_sums_across_cells_only_for_that_product() {
        let mut ledger = StockLedger::new();
        let now = Utc::now();
        ledger.increase(P, DEFAULT_CELL, qty(dec!(3)), now).unwrap();
        ledger.increase(P, OTHER_CELL, qty(dec!(4.25)), now).unwrap();
        ledger.increase(ProductId::new(2), DEFAULT_CELL, qty(dec!(100)), now).unwrap();
        assert_eq!(ledger.total_quantity(P), qty(dec!(7.25)));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: no sequence of increases/decreases drives a balance negative,
        /// and the final quantity equals the sum of the accepted movements.
        #[test]
        fn balance_never_goes_negative(
            moves in prop::collection::vec((any::<bool>(), 1i64..100_000i64), 1..50)
        ) {
            let mut ledger = StockLedger::new();
            let mut expected = Decimal::ZERO;
            let now = Utc::now();

            for (is_increase, cents) in moves {
                let amount = Quantity::new(Decimal::new(cents, 2)).unwrap();
                if is_increase {
                    ledger.increase(P, DEFAULT_CELL, amount, now).unwrap();
                    expected += amount.value();
                } else if ledger.decrease(P, DEFAULT_CELL, amount, now).is_ok() {
                    expected -= amount.value();
                }
                prop_assert!(expected >= Decimal::ZERO);
            }

            prop_assert_eq!(ledger.quantity(P, DEFAULT_CELL).value(), expected);
        }

        /// Property: a decrease of exactly what was increased restores the row.
        #[test]
        fn increase_then_decrease_is_inverse(start in 0i64..1_000_000i64, delta in 1i64..1_000_000i64) {
            let now = Utc::now();
            let start_q = Quantity::new(Decimal::new(start, 2)).unwrap();
            let delta_q = Quantity::new(Decimal::new(delta, 2)).unwrap();
            let mut ledger = StockLedger::from_balances([StockBalance {
                product_id: P,
                cell_id: DEFAULT_CELL,
                quantity: start_q,
                last_updated: now,
            }]);

            ledger.increase(P, DEFAULT_CELL, delta_q, now).unwrap();
            ledger.decrease(P, DEFAULT_CELL, delta_q, now).unwrap();
            prop_assert_eq!(ledger.quantity(P, DEFAULT_CELL), start_q);
        }
    }
}
