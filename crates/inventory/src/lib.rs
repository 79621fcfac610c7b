//! Stock ledger domain module.
//!
//! Business rules for per-product, per-cell stock balances, implemented as
//! deterministic domain logic (no IO, no storage).

pub mod balance;
pub mod ledger;

pub use balance::{BalanceFilter, StockBalance};
pub use ledger::{LedgerError, StockLedger};
