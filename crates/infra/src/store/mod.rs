//! Storage boundary for catalog rows, documents and stock balances.
//!
//! The posting engine and draft service talk to storage only through these
//! traits. Every state change runs inside a [`StoreTransaction`]: rows read
//! through `lock_*` stay locked until `commit`, and dropping a transaction
//! without committing discards all of its writes.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use warehouse_catalog::{
    Category, NewCategory, NewProduct, NewSupplier, NewWarehouseCell, Product, Supplier,
    WarehouseCell,
};
use warehouse_core::{CategoryId, CellId, DocumentId, ProductId, SupplierId};
use warehouse_documents::{Document, DocumentFilter, DocumentNumber, NewDocument};
use warehouse_inventory::{BalanceFilter, StockBalance};

pub use in_memory::InMemoryWarehouseStore;
pub use postgres::PostgresWarehouseStore;

/// Storage failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A row addressed by id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent modification detected (serialization failure, deadlock,
    /// unique key race). Retrying the whole operation may succeed.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A schema constraint rejected the write (foreign key, check, duplicate
    /// natural key).
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// A delete was refused because other rows still reference the target
    /// (stock balances, document lines, products).
    #[error("still in use: {0}")]
    InUse(String),

    /// Connection loss, decode failure or any other backend problem.
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// `Ok` when every reference count is zero, otherwise [`StoreError::InUse`]
/// listing what still points at `what`.
pub(crate) fn ensure_unreferenced(
    what: String,
    references: &[(&str, u64)],
) -> Result<(), StoreError> {
    let held: Vec<String> = references
        .iter()
        .filter(|(_, count)| *count > 0)
        .map(|(kind, count)| format!("{count} {kind}"))
        .collect();
    if held.is_empty() {
        Ok(())
    } else {
        Err(StoreError::InUse(format!("{what} has {}", held.join(", "))))
    }
}

/// One atomic unit of work against the warehouse store.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Load a document with its items and hold its row lock until commit.
    async fn lock_document(&mut self, id: DocumentId) -> Result<Option<Document>, StoreError>;

    /// Lock every balance row of `products` (all cells) in (product, cell)
    /// order. Rows that do not exist yet are simply absent.
    async fn lock_balances(
        &mut self,
        products: &[ProductId],
    ) -> Result<Vec<StockBalance>, StoreError>;

    /// Insert or overwrite the given balance rows.
    async fn save_balances(&mut self, balances: &[StockBalance]) -> Result<(), StoreError>;

    /// Subset of `products` that have no catalog row.
    async fn missing_products(&mut self, products: &[ProductId])
        -> Result<Vec<ProductId>, StoreError>;

    async fn cell_exists(&mut self, id: CellId) -> Result<bool, StoreError>;

    /// Highest sequence issued in a numbering series (0 when empty). Holds a
    /// series lock until commit so two drafts cannot take the same number.
    async fn last_sequence_in_series(&mut self, series: &str) -> Result<u32, StoreError>;

    /// Persist a new draft, assigning its id.
    async fn insert_document(
        &mut self,
        number: DocumentNumber,
        input: NewDocument,
        now: DateTime<Utc>,
    ) -> Result<Document, StoreError>;

    /// Overwrite header fields and items of an existing draft.
    async fn save_draft(&mut self, document: &Document) -> Result<(), StoreError>;

    /// Persist status and transition timestamps of `document`.
    async fn save_status(&mut self, document: &Document) -> Result<(), StoreError>;

    /// Remove a document and its items.
    async fn delete_document(&mut self, id: DocumentId) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Warehouse storage: transactional writes plus non-locking reads.
#[async_trait]
pub trait WarehouseStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    async fn insert_category(&self, input: NewCategory) -> Result<Category, StoreError>;
    async fn insert_supplier(&self, input: NewSupplier) -> Result<Supplier, StoreError>;
    async fn insert_product(&self, input: NewProduct) -> Result<Product, StoreError>;
    async fn insert_cell(&self, input: NewWarehouseCell) -> Result<WarehouseCell, StoreError>;

    async fn update_category(
        &self,
        id: CategoryId,
        input: NewCategory,
    ) -> Result<Category, StoreError>;
    async fn update_supplier(
        &self,
        id: SupplierId,
        input: NewSupplier,
    ) -> Result<Supplier, StoreError>;
    /// Edit a product's catalog fields. Posted documents keep the prices
    /// they were created with.
    async fn update_product(&self, id: ProductId, input: NewProduct)
        -> Result<Product, StoreError>;

    /// Refused with [`StoreError::InUse`] while products reference it.
    async fn delete_category(&self, id: CategoryId) -> Result<(), StoreError>;
    /// Refused with [`StoreError::InUse`] while products or documents
    /// reference it.
    async fn delete_supplier(&self, id: SupplierId) -> Result<(), StoreError>;
    /// Refused with [`StoreError::InUse`] while the product has balance rows
    /// (even zero ones) or appears on any document line.
    async fn delete_product(&self, id: ProductId) -> Result<(), StoreError>;
    /// Refused with [`StoreError::InUse`] while the cell has balance rows.
    async fn delete_cell(&self, id: CellId) -> Result<(), StoreError>;

    async fn get_product(&self, id: ProductId) -> Result<Option<Product>, StoreError>;
    async fn list_products(&self) -> Result<Vec<Product>, StoreError>;
    async fn list_categories(&self) -> Result<Vec<Category>, StoreError>;
    async fn list_suppliers(&self) -> Result<Vec<Supplier>, StoreError>;
    async fn list_cells(&self) -> Result<Vec<WarehouseCell>, StoreError>;

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>, StoreError>;

    /// Documents matching `filter`, newest first (date desc, then id desc).
    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>, StoreError>;

    /// Balance rows matching `filter`, in (product, cell) order.
    async fn list_balances(&self, filter: BalanceFilter) -> Result<Vec<StockBalance>, StoreError>;
}

#[async_trait]
impl<S> WarehouseStore for std::sync::Arc<S>
where
    S: WarehouseStore + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        (**self).begin().await
    }

    async fn insert_category(&self, input: NewCategory) -> Result<Category, StoreError> {
        (**self).insert_category(input).await
    }

    async fn insert_supplier(&self, input: NewSupplier) -> Result<Supplier, StoreError> {
        (**self).insert_supplier(input).await
    }

    async fn insert_product(&self, input: NewProduct) -> Result<Product, StoreError> {
        (**self).insert_product(input).await
    }

    async fn insert_cell(&self, input: NewWarehouseCell) -> Result<WarehouseCell, StoreError> {
        (**self).insert_cell(input).await
    }

    async fn update_category(
        &self,
        id: CategoryId,
        input: NewCategory,
    ) -> Result<Category, StoreError> {
        (**self).update_category(id, input).await
    }

    async fn update_supplier(
        &self,
        id: SupplierId,
        input: NewSupplier,
    ) -> Result<Supplier, StoreError> {
        (**self).update_supplier(id, input).await
    }

    async fn update_product(
        &self,
        id: ProductId,
        input: NewProduct,
    ) -> Result<Product, StoreError> {
        (**self).update_product(id, input).await
    }

    async fn delete_category(&self, id: CategoryId) -> Result<(), StoreError> {
        (**self).delete_category(id).await
    }

    async fn delete_supplier(&self, id: SupplierId) -> Result<(), StoreError> {
        (**self).delete_supplier(id).await
    }

    async fn delete_product(&self, id: ProductId) -> Result<(), StoreError> {
        (**self).delete_product(id).await
    }

    async fn delete_cell(&self, id: CellId) -> Result<(), StoreError> {
        (**self).delete_cell(id).await
    }

    async fn get_product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        (**self).get_product(id).await
    }

    async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
        (**self).list_products().await
    }

    async fn list_categories(&self) -> Result<Vec<Category>, StoreError> {
        (**self).list_categories().await
    }

    async fn list_suppliers(&self) -> Result<Vec<Supplier>, StoreError> {
        (**self).list_suppliers().await
    }

    async fn list_cells(&self) -> Result<Vec<WarehouseCell>, StoreError> {
        (**self).list_cells().await
    }

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        (**self).get_document(id).await
    }

    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>, StoreError> {
        (**self).list_documents(filter).await
    }

    async fn list_balances(&self, filter: BalanceFilter) -> Result<Vec<StockBalance>, StoreError> {
        (**self).list_balances(filter).await
    }
}
