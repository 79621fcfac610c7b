//! Document posting engine.
//!
//! The engine is the only component that moves a document between
//! `draft`, `posted` and `cancelled` while touching stock balances. Every
//! operation follows the same pipeline inside one store transaction:
//!
//! ```text
//! begin
//!   ↓
//! 1. Lock the document row, check status and type
//!   ↓
//! 2. Check referenced products and the default cell exist
//!   ↓
//! 3. Lock every balance row of the document's products (all cells)
//!   ↓
//! 4. Validate availability (expense posting only)
//!   ↓
//! 5. Apply movements to a `StockLedger` working set
//!   ↓
//! 6. Write changed balances and the new document status
//!   ↓
//! commit
//! ```
//!
//! Any error before commit drops the transaction, which rolls back every
//! write. The engine never retries; callers check
//! [`PostingError::is_retryable`] and run the whole operation again.

use std::collections::BTreeMap;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use warehouse_core::{CellId, DocumentId, DomainError, ProductId, Quantity};
use warehouse_documents::{Document, DocumentError, DocumentStatus, DocumentType};
use warehouse_inventory::{BalanceFilter, LedgerError, StockLedger};

use crate::store::{StoreError, StoreTransaction, WarehouseStore};

/// Failure of a posting engine or draft service operation.
///
/// Every variant except `Storage` is deterministic: the same call against
/// the same state fails the same way, and nothing was written.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PostingError {
    /// The document's status does not allow the requested operation.
    #[error("document cannot move from {from} to {to}")]
    InvalidStateTransition {
        from: DocumentStatus,
        to: DocumentStatus,
    },

    /// Draft edits and deletes require `draft`.
    #[error("document is {status}; only drafts can be changed")]
    NotDraft { status: DocumentStatus },

    #[error("operation expects a {expected} document, got {actual}")]
    WrongDocumentType {
        expected: DocumentType,
        actual: DocumentType,
    },

    /// Not enough stock. `cell_id` is `None` when checked against the total
    /// across all cells.
    #[error("insufficient stock for product {product_id}: required {required}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        cell_id: Option<CellId>,
        required: Quantity,
        available: Quantity,
    },

    #[error("document has no line items with a positive quantity")]
    EmptyDocument,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    /// Storage failed; the transaction was rolled back.
    #[error(transparent)]
    Storage(StoreError),
}

impl PostingError {
    /// Whether running the same operation again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PostingError::Storage(StoreError::Conflict(_)))
    }
}

impl From<StoreError> for PostingError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(what) => PostingError::NotFound(what),
            other => PostingError::Storage(other),
        }
    }
}

impl From<LedgerError> for PostingError {
    fn from(value: LedgerError) -> Self {
        match value {
            LedgerError::InsufficientStock {
                product_id,
                cell_id,
                required,
                available,
            } => PostingError::InsufficientStock {
                product_id,
                cell_id,
                required,
                available,
            },
            other => PostingError::Validation(other.to_string()),
        }
    }
}

impl From<DocumentError> for PostingError {
    fn from(value: DocumentError) -> Self {
        match value {
            DocumentError::InvalidStateTransition { from, to } => {
                PostingError::InvalidStateTransition { from, to }
            }
            DocumentError::WrongDocumentType { expected, actual } => {
                PostingError::WrongDocumentType { expected, actual }
            }
            DocumentError::NotDraft { status, .. } => PostingError::NotDraft { status },
            DocumentError::Empty => PostingError::EmptyDocument,
            other => PostingError::Validation(other.to_string()),
        }
    }
}

impl From<DomainError> for PostingError {
    fn from(value: DomainError) -> Self {
        PostingError::Validation(value.to_string())
    }
}

/// Posts and cancels documents against the stock ledger.
///
/// All stock movements target a single configurable default cell.
#[derive(Debug, Clone)]
pub struct PostingEngine<S> {
    store: S,
    default_cell: CellId,
}

impl<S> PostingEngine<S>
where
    S: WarehouseStore,
{
    pub fn new(store: S, default_cell: CellId) -> Self {
        Self {
            store,
            default_cell,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Committed quantity of `product_id` in `cell_id` (zero when absent).
    pub async fn get_quantity(
        &self,
        product_id: ProductId,
        cell_id: CellId,
    ) -> Result<Quantity, PostingError> {
        let rows = self
            .store
            .list_balances(BalanceFilter {
                product_id: Some(product_id),
                cell_id: Some(cell_id),
                min_quantity: None,
            })
            .await?;
        Ok(StockLedger::from_balances(rows).quantity(product_id, cell_id))
    }

    /// Committed quantity of `product_id` across all cells.
    pub async fn get_total_quantity(&self, product_id: ProductId) -> Result<Quantity, PostingError> {
        let rows = self
            .store
            .list_balances(BalanceFilter::for_product(product_id))
            .await?;
        Ok(StockLedger::from_balances(rows).total_quantity(product_id))
    }

    /// Post an income draft: add every line to the default cell.
    #[instrument(skip(self), fields(document_id = %id, default_cell = %self.default_cell), err)]
    pub async fn post_income(&self, id: DocumentId) -> Result<(), PostingError> {
        self.post_as(id, DocumentType::Income).await
    }

    /// Post an expense draft: check every line against the product's total
    /// stock, then take every line from the default cell.
    #[instrument(skip(self), fields(document_id = %id, default_cell = %self.default_cell), err)]
    pub async fn post_expense(&self, id: DocumentId) -> Result<(), PostingError> {
        self.post_as(id, DocumentType::Expense).await
    }

    /// Post a draft with the operation matching its type.
    pub async fn post(&self, id: DocumentId) -> Result<(), PostingError> {
        let document = self
            .store
            .get_document(id)
            .await?
            .ok_or_else(|| PostingError::NotFound(format!("document {id}")))?;
        match document.doc_type() {
            DocumentType::Income => self.post_income(id).await,
            DocumentType::Expense => self.post_expense(id).await,
        }
    }

    /// Reverse a posted document's stock effect and mark it cancelled.
    #[instrument(skip(self), fields(document_id = %id, default_cell = %self.default_cell), err)]
    pub async fn cancel(&self, id: DocumentId) -> Result<(), PostingError> {
        let result = self.cancel_in_tx(id).await;
        log_rejection(id, "cancel", &result);
        result
    }

    async fn post_as(&self, id: DocumentId, expected: DocumentType) -> Result<(), PostingError> {
        let result = self.post_in_tx(id, expected).await;
        log_rejection(id, expected.as_str(), &result);
        result
    }

    async fn post_in_tx(&self, id: DocumentId, expected: DocumentType) -> Result<(), PostingError> {
        let mut tx = self.store.begin().await?;
        let mut document = lock_document(tx.as_mut(), id).await?;
        document.ensure_can_post(expected)?;

        let mut ledger = self.lock_ledger(tx.as_mut(), &document).await?;
        let now = Utc::now();
        match expected {
            DocumentType::Income => {
                for item in document.items() {
                    ledger.increase(item.product_id, self.default_cell, item.quantity, now)?;
                }
            }
            DocumentType::Expense => {
                ensure_available(&ledger, &document)?;
                for item in document.items() {
                    ledger.decrease(item.product_id, self.default_cell, item.quantity, now)?;
                }
            }
        }

        document.mark_posted(now)?;
        tx.save_balances(&ledger.changed_balances()).await?;
        tx.save_status(&document).await?;
        tx.commit().await?;

        info!(
            document_id = %id,
            number = %document.number(),
            doc_type = %expected,
            lines = document.items().len(),
            "document posted"
        );
        Ok(())
    }

    async fn cancel_in_tx(&self, id: DocumentId) -> Result<(), PostingError> {
        let mut tx = self.store.begin().await?;
        let mut document = lock_document(tx.as_mut(), id).await?;
        document.ensure_can_cancel()?;

        let mut ledger = self.lock_ledger(tx.as_mut(), &document).await?;
        let now = Utc::now();
        for item in document.items() {
            match document.doc_type() {
                DocumentType::Income => {
                    ledger.decrease(item.product_id, self.default_cell, item.quantity, now)?
                }
                DocumentType::Expense => {
                    ledger.increase(item.product_id, self.default_cell, item.quantity, now)?
                }
            };
        }

        document.mark_cancelled(now)?;
        tx.save_balances(&ledger.changed_balances()).await?;
        tx.save_status(&document).await?;
        tx.commit().await?;

        info!(
            document_id = %id,
            number = %document.number(),
            doc_type = %document.doc_type(),
            "document cancelled"
        );
        Ok(())
    }

    async fn lock_ledger(
        &self,
        tx: &mut dyn StoreTransaction,
        document: &Document,
    ) -> Result<StockLedger, PostingError> {
        let products = document.product_ids();
        if let Some(missing) = tx.missing_products(&products).await?.first() {
            return Err(PostingError::NotFound(format!("product {missing}")));
        }
        if !tx.cell_exists(self.default_cell).await? {
            return Err(PostingError::NotFound(format!("cell {}", self.default_cell)));
        }
        let rows = tx.lock_balances(&products).await?;
        Ok(StockLedger::from_balances(rows))
    }
}

pub(crate) async fn lock_document(
    tx: &mut dyn StoreTransaction,
    id: DocumentId,
) -> Result<Document, PostingError> {
    tx.lock_document(id)
        .await?
        .ok_or_else(|| PostingError::NotFound(format!("document {id}")))
}

/// Availability check run before any expense line is applied.
///
/// Lines of the same product are summed, so a document can never pass the
/// check and then run dry halfway through its own lines.
fn ensure_available(ledger: &StockLedger, document: &Document) -> Result<(), PostingError> {
    let mut required: BTreeMap<ProductId, Quantity> = BTreeMap::new();
    for item in document.items() {
        let entry = required.entry(item.product_id).or_default();
        *entry = entry
            .checked_add(item.quantity)
            .ok_or_else(|| PostingError::Validation(format!("quantity overflow for product {}", item.product_id)))?;
    }

    for (product_id, required) in required {
        let available = ledger.total_quantity(product_id);
        if available < required {
            return Err(PostingError::InsufficientStock {
                product_id,
                cell_id: None,
                required,
                available,
            });
        }
    }
    Ok(())
}

fn log_rejection(id: DocumentId, operation: &str, result: &Result<(), PostingError>) {
    match result {
        Err(PostingError::InsufficientStock {
            product_id,
            required,
            available,
            ..
        }) => warn!(
            document_id = %id,
            operation,
            product_id = %product_id,
            required = %required,
            available = %available,
            "insufficient stock"
        ),
        Err(
            err @ (PostingError::InvalidStateTransition { .. }
            | PostingError::WrongDocumentType { .. }
            | PostingError::EmptyDocument),
        ) => warn!(document_id = %id, operation, error = %err, "posting rejected"),
        _ => {}
    }
}
