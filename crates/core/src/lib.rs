//! Shared domain primitives for the warehouse crates: typed ids, fixed-point
//! quantities and prices, and the common error type. No IO.

pub mod entity;
pub mod error;
pub mod id;
pub mod value_object;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{CategoryId, CellId, DocumentId, ProductId, SupplierId, UserId};
pub use value_object::{Price, Quantity, MAX_AMOUNT, SCALE};
