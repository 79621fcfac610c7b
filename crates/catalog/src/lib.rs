//! Catalog / reference data.
//!
//! Products, suppliers, categories and storage cells. The posting engine reads
//! these for existence checks and never writes them.

pub mod category;
pub mod cell;
pub mod product;
pub mod supplier;

pub use category::{Category, NewCategory};
pub use cell::{NewWarehouseCell, WarehouseCell};
pub use product::{NewProduct, Product, DEFAULT_UNIT};
pub use supplier::{NewSupplier, Supplier};

use warehouse_core::{DomainError, DomainResult};

/// Reject `value` when it is longer than `max` characters (the column width).
pub(crate) fn ensure_max_chars(field: &str, value: &str, max: usize) -> DomainResult<()> {
    if value.chars().count() > max {
        return Err(DomainError::validation(format!(
            "{field} is limited to {max} characters"
        )));
    }
    Ok(())
}

/// Same as [`ensure_max_chars`] for optional columns.
pub(crate) fn ensure_optional_max_chars(
    field: &str,
    value: Option<&str>,
    max: usize,
) -> DomainResult<()> {
    value.map_or(Ok(()), |v| ensure_max_chars(field, v, max))
}
