//! Draft document lifecycle: create, edit, delete and read.
//!
//! None of these operations touch stock balances.

use chrono::Utc;
use tracing::{info, instrument};

use warehouse_core::{DocumentId, Entity, ProductId};
use warehouse_documents::{Document, DocumentFilter, DocumentNumber, DraftUpdate, NewDocument};

use crate::posting::{lock_document, PostingError};
use crate::store::{StoreTransaction, WarehouseStore};

#[derive(Debug, Clone)]
pub struct DocumentService<S> {
    store: S,
}

impl<S> DocumentService<S>
where
    S: WarehouseStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Validate `input`, assign the next number in its monthly series and
    /// store it as a draft.
    #[instrument(
        skip(self, input),
        fields(doc_type = %input.doc_type, lines = input.items.len()),
        err
    )]
    pub async fn create_draft(&self, input: NewDocument) -> Result<Document, PostingError> {
        input.validate()?;
        let now = Utc::now();

        let mut tx = self.store.begin().await?;
        let products: Vec<_> = input.items.iter().map(|i| i.product_id).collect();
        ensure_products(tx.as_mut(), &products).await?;

        let month = now.date_naive();
        let last = tx
            .last_sequence_in_series(&DocumentNumber::series(input.doc_type, month))
            .await?;
        let number = DocumentNumber::next(input.doc_type, month, last);
        let document = tx.insert_document(number, input, now).await?;
        tx.commit().await?;

        info!(document_id = %document.id(), number = %document.number(), "draft created");
        Ok(document)
    }

    /// Replace header fields and lines of a draft.
    #[instrument(skip(self, update), fields(document_id = %id), err)]
    pub async fn update_draft(
        &self,
        id: DocumentId,
        update: DraftUpdate,
    ) -> Result<Document, PostingError> {
        let mut tx = self.store.begin().await?;
        let mut document = lock_document(tx.as_mut(), id).await?;
        document.update_draft(update)?;
        ensure_products(tx.as_mut(), &document.product_ids()).await?;
        tx.save_draft(&document).await?;
        tx.commit().await?;
        Ok(document)
    }

    /// Remove a draft and its lines.
    #[instrument(skip(self), fields(document_id = %id), err)]
    pub async fn delete_draft(&self, id: DocumentId) -> Result<(), PostingError> {
        let mut tx = self.store.begin().await?;
        let document = lock_document(tx.as_mut(), id).await?;
        document.ensure_deletable()?;
        tx.delete_document(id).await?;
        tx.commit().await?;
        info!(document_id = %id, number = %document.number(), "draft deleted");
        Ok(())
    }

    pub async fn get_document(&self, id: DocumentId) -> Result<Document, PostingError> {
        self.store
            .get_document(id)
            .await?
            .ok_or_else(|| PostingError::NotFound(format!("document {id}")))
    }

    pub async fn list_documents(
        &self,
        filter: &DocumentFilter,
    ) -> Result<Vec<Document>, PostingError> {
        Ok(self.store.list_documents(filter).await?)
    }
}

async fn ensure_products(
    tx: &mut dyn StoreTransaction,
    products: &[ProductId],
) -> Result<(), PostingError> {
    match tx.missing_products(products).await?.first() {
        Some(missing) => Err(PostingError::NotFound(format!("product {missing}"))),
        None => Ok(()),
    }
}
