use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use warehouse_catalog::{
    Category, NewCategory, NewProduct, NewSupplier, NewWarehouseCell, Product, Supplier,
    WarehouseCell,
};
use warehouse_core::{CategoryId, CellId, DocumentId, Entity, ProductId, SupplierId};
use warehouse_documents::{Document, DocumentFilter, DocumentNumber, NewDocument};
use warehouse_inventory::{BalanceFilter, StockBalance};

use super::{ensure_unreferenced, StoreError, StoreTransaction, WarehouseStore};

#[derive(Debug, Clone, Default)]
struct State {
    categories: BTreeMap<CategoryId, Category>,
    suppliers: BTreeMap<SupplierId, Supplier>,
    products: BTreeMap<ProductId, Product>,
    cells: BTreeMap<CellId, WarehouseCell>,
    balances: BTreeMap<(ProductId, CellId), StockBalance>,
    documents: BTreeMap<DocumentId, Document>,
    last_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn require_category(&self, id: Option<CategoryId>) -> Result<(), StoreError> {
        match id {
            Some(id) if !self.categories.contains_key(&id) => {
                Err(StoreError::Constraint(format!("category {id} does not exist")))
            }
            _ => Ok(()),
        }
    }

    fn require_supplier(&self, id: Option<SupplierId>) -> Result<(), StoreError> {
        match id {
            Some(id) if !self.suppliers.contains_key(&id) => {
                Err(StoreError::Constraint(format!("supplier {id} does not exist")))
            }
            _ => Ok(()),
        }
    }

    fn require_products<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a ProductId>,
    ) -> Result<(), StoreError> {
        for id in ids {
            if !self.products.contains_key(id) {
                return Err(StoreError::Constraint(format!("product {id} does not exist")));
            }
        }
        Ok(())
    }
}

/// In-memory warehouse store.
///
/// Intended for tests/dev. A single mutex guards the whole state, so
/// transactions run one at a time; each works on a staged copy that replaces
/// the shared state on commit.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWarehouseStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryWarehouseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Transaction over [`InMemoryWarehouseStore`]; holds the store lock.
pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<State>,
    staged: State,
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn lock_document(&mut self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        Ok(self.staged.documents.get(&id).cloned())
    }

    async fn lock_balances(
        &mut self,
        products: &[ProductId],
    ) -> Result<Vec<StockBalance>, StoreError> {
        Ok(self
            .staged
            .balances
            .values()
            .filter(|b| products.contains(&b.product_id))
            .cloned()
            .collect())
    }

    async fn save_balances(&mut self, balances: &[StockBalance]) -> Result<(), StoreError> {
        for balance in balances {
            self.staged.require_products([&balance.product_id])?;
            if !self.staged.cells.contains_key(&balance.cell_id) {
                return Err(StoreError::Constraint(format!(
                    "cell {} does not exist",
                    balance.cell_id
                )));
            }
            self.staged.balances.insert(balance.key(), balance.clone());
        }
        Ok(())
    }

    async fn missing_products(
        &mut self,
        products: &[ProductId],
    ) -> Result<Vec<ProductId>, StoreError> {
        Ok(products
            .iter()
            .copied()
            .filter(|id| !self.staged.products.contains_key(id))
            .collect())
    }

    async fn cell_exists(&mut self, id: CellId) -> Result<bool, StoreError> {
        Ok(self.staged.cells.contains_key(&id))
    }

    async fn last_sequence_in_series(&mut self, series: &str) -> Result<u32, StoreError> {
        Ok(self
            .staged
            .documents
            .values()
            .filter(|d| d.number().belongs_to(series))
            .filter_map(|d| d.number().sequence())
            .max()
            .unwrap_or(0))
    }

    async fn insert_document(
        &mut self,
        number: DocumentNumber,
        input: NewDocument,
        now: DateTime<Utc>,
    ) -> Result<Document, StoreError> {
        if self.staged.documents.values().any(|d| d.number() == &number) {
            return Err(StoreError::Constraint(format!(
                "document number {number} already exists"
            )));
        }
        self.staged.require_supplier(input.supplier_id)?;
        self.staged
            .require_products(input.items.iter().map(|i| &i.product_id))?;

        let id = DocumentId::new(self.staged.next_id());
        let document = Document::draft(id, number, input, now)
            .map_err(|e| StoreError::Constraint(e.to_string()))?;
        self.staged.documents.insert(id, document.clone());
        Ok(document)
    }

    async fn save_draft(&mut self, document: &Document) -> Result<(), StoreError> {
        self.staged.require_supplier(document.supplier_id())?;
        self.staged
            .require_products(document.items().iter().map(|i| &i.product_id))?;
        match self.staged.documents.get_mut(&document.id()) {
            Some(row) => {
                *row = document.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("document {}", document.id()))),
        }
    }

    async fn save_status(&mut self, document: &Document) -> Result<(), StoreError> {
        match self.staged.documents.get_mut(&document.id()) {
            Some(row) => {
                *row = document.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("document {}", document.id()))),
        }
    }

    async fn delete_document(&mut self, id: DocumentId) -> Result<(), StoreError> {
        self.staged
            .documents
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("document {id}")))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryTransaction { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }
}

#[async_trait]
impl WarehouseStore for InMemoryWarehouseStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(InMemoryTransaction { guard, staged }))
    }

    async fn insert_category(&self, input: NewCategory) -> Result<Category, StoreError> {
        input
            .validate()
            .map_err(|e| StoreError::Constraint(e.to_string()))?;
        let mut state = self.state.lock().await;
        if state.categories.values().any(|c| c.name == input.name) {
            return Err(StoreError::Constraint(format!(
                "category {:?} already exists",
                input.name
            )));
        }
        let category = input.into_category(CategoryId::new(state.next_id()));
        state.categories.insert(category.id, category.clone());
        Ok(category)
    }

    async fn insert_supplier(&self, input: NewSupplier) -> Result<Supplier, StoreError> {
        input
            .validate()
            .map_err(|e| StoreError::Constraint(e.to_string()))?;
        let mut state = self.state.lock().await;
        if let Some(inn) = input.inn.as_deref() {
            if state.suppliers.values().any(|s| s.inn.as_deref() == Some(inn)) {
                return Err(StoreError::Constraint(format!(
                    "supplier with INN {inn} already exists"
                )));
            }
        }
        let supplier = input.into_supplier(SupplierId::new(state.next_id()), Utc::now());
        state.suppliers.insert(supplier.id, supplier.clone());
        Ok(supplier)
    }

    async fn insert_product(&self, input: NewProduct) -> Result<Product, StoreError> {
        input
            .validate()
            .map_err(|e| StoreError::Constraint(e.to_string()))?;
        let mut state = self.state.lock().await;
        if state.products.values().any(|p| p.article == input.article) {
            return Err(StoreError::Constraint(format!(
                "article {:?} already exists",
                input.article
            )));
        }
        state.require_category(input.category_id)?;
        state.require_supplier(input.supplier_id)?;
        let product = input.into_product(ProductId::new(state.next_id()), Utc::now());
        state.products.insert(product.id, product.clone());
        Ok(product)
    }

    async fn insert_cell(&self, input: NewWarehouseCell) -> Result<WarehouseCell, StoreError> {
        input
            .validate()
            .map_err(|e| StoreError::Constraint(e.to_string()))?;
        let mut state = self.state.lock().await;
        if state.cells.values().any(|c| c.name == input.name) {
            return Err(StoreError::Constraint(format!(
                "cell {:?} already exists",
                input.name
            )));
        }
        let cell = input.into_cell(CellId::new(state.next_id()));
        state.cells.insert(cell.id, cell.clone());
        Ok(cell)
    }

    async fn update_category(
        &self,
        id: CategoryId,
        input: NewCategory,
    ) -> Result<Category, StoreError> {
        input
            .validate()
            .map_err(|e| StoreError::Constraint(e.to_string()))?;
        let mut state = self.state.lock().await;
        if !state.categories.contains_key(&id) {
            return Err(StoreError::NotFound(format!("category {id}")));
        }
        let category = input.into_category(id);
        if state
            .categories
            .values()
            .any(|c| c.id != id && c.name == category.name)
        {
            return Err(StoreError::Constraint(format!(
                "category {:?} already exists",
                category.name
            )));
        }
        state.categories.insert(id, category.clone());
        Ok(category)
    }

    async fn update_supplier(
        &self,
        id: SupplierId,
        input: NewSupplier,
    ) -> Result<Supplier, StoreError> {
        input
            .validate()
            .map_err(|e| StoreError::Constraint(e.to_string()))?;
        let mut state = self.state.lock().await;
        let created_at = match state.suppliers.get(&id) {
            Some(existing) => existing.created_at,
            None => return Err(StoreError::NotFound(format!("supplier {id}"))),
        };
        if let Some(inn) = input.inn.as_deref() {
            if state
                .suppliers
                .values()
                .any(|s| s.id != id && s.inn.as_deref() == Some(inn))
            {
                return Err(StoreError::Constraint(format!(
                    "supplier with INN {inn} already exists"
                )));
            }
        }
        let supplier = input.into_supplier(id, created_at);
        state.suppliers.insert(id, supplier.clone());
        Ok(supplier)
    }

    async fn update_product(
        &self,
        id: ProductId,
        input: NewProduct,
    ) -> Result<Product, StoreError> {
        input
            .validate()
            .map_err(|e| StoreError::Constraint(e.to_string()))?;
        let mut state = self.state.lock().await;
        let Some(existing) = state.products.get(&id).cloned() else {
            return Err(StoreError::NotFound(format!("product {id}")));
        };
        state.require_category(input.category_id)?;
        state.require_supplier(input.supplier_id)?;
        let product = input.apply_to(&existing, Utc::now());
        if state
            .products
            .values()
            .any(|p| p.id != id && p.article == product.article)
        {
            return Err(StoreError::Constraint(format!(
                "article {:?} already exists",
                product.article
            )));
        }
        state.products.insert(id, product.clone());
        Ok(product)
    }

    async fn delete_category(&self, id: CategoryId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.categories.contains_key(&id) {
            return Err(StoreError::NotFound(format!("category {id}")));
        }
        let products = state
            .products
            .values()
            .filter(|p| p.category_id == Some(id))
            .count() as u64;
        ensure_unreferenced(format!("category {id}"), &[("products", products)])?;
        state.categories.remove(&id);
        Ok(())
    }

    async fn delete_supplier(&self, id: SupplierId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.suppliers.contains_key(&id) {
            return Err(StoreError::NotFound(format!("supplier {id}")));
        }
        let products = state
            .products
            .values()
            .filter(|p| p.supplier_id == Some(id))
            .count() as u64;
        let documents = state
            .documents
            .values()
            .filter(|d| d.supplier_id() == Some(id))
            .count() as u64;
        ensure_unreferenced(
            format!("supplier {id}"),
            &[("products", products), ("documents", documents)],
        )?;
        state.suppliers.remove(&id);
        Ok(())
    }

    async fn delete_product(&self, id: ProductId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.products.contains_key(&id) {
            return Err(StoreError::NotFound(format!("product {id}")));
        }
        let balances = state.balances.keys().filter(|(p, _)| *p == id).count() as u64;
        let lines = state
            .documents
            .values()
            .flat_map(|d| d.items())
            .filter(|i| i.product_id == id)
            .count() as u64;
        ensure_unreferenced(
            format!("product {id}"),
            &[("balance rows", balances), ("document lines", lines)],
        )?;
        state.products.remove(&id);
        Ok(())
    }

    async fn delete_cell(&self, id: CellId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.cells.contains_key(&id) {
            return Err(StoreError::NotFound(format!("cell {id}")));
        }
        let balances = state.balances.keys().filter(|(_, c)| *c == id).count() as u64;
        ensure_unreferenced(format!("cell {id}"), &[("balance rows", balances)])?;
        state.cells.remove(&id);
        Ok(())
    }

    async fn get_product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.state.lock().await.products.get(&id).cloned())
    }

    async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
        Ok(self.state.lock().await.products.values().cloned().collect())
    }

    async fn list_categories(&self) -> Result<Vec<Category>, StoreError> {
        Ok(self.state.lock().await.categories.values().cloned().collect())
    }

    async fn list_suppliers(&self) -> Result<Vec<Supplier>, StoreError> {
        Ok(self.state.lock().await.suppliers.values().cloned().collect())
    }

    async fn list_cells(&self) -> Result<Vec<WarehouseCell>, StoreError> {
        Ok(self.state.lock().await.cells.values().cloned().collect())
    }

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        Ok(self.state.lock().await.documents.get(&id).cloned())
    }

    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>, StoreError> {
        let state = self.state.lock().await;
        let mut docs: Vec<Document> = state
            .documents
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        docs.sort_by(|a, b| {
            b.doc_date()
                .cmp(&a.doc_date())
                .then_with(|| b.id().cmp(&a.id()))
        });
        Ok(docs)
    }

    async fn list_balances(&self, filter: BalanceFilter) -> Result<Vec<StockBalance>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .balances
            .values()
            .filter(|b| filter.matches(b))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warehouse_catalog::NewProduct;
    use warehouse_core::{Price, Quantity};
    use warehouse_documents::{DocumentType, NewDocumentItem};

    fn today() -> chrono::NaiveDate {
        Utc::now().date_naive()
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes() {
        let store = InMemoryWarehouseStore::new();
        let cell = store.insert_cell(NewWarehouseCell::named("A-01")).await.unwrap();
        let product = store
            .insert_product(NewProduct::new("BOLT-1", "Болт", Price::ZERO))
            .await
            .unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            let mut row = StockBalance::empty(product.id, cell.id, Utc::now());
            row.quantity = Quantity::units(5);
            tx.save_balances(&[row]).await.unwrap();
            // dropped here
        }

        let rows = store.list_balances(BalanceFilter::default()).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn committed_transaction_is_visible() {
        let store = InMemoryWarehouseStore::new();
        let cell = store.insert_cell(NewWarehouseCell::named("A-01")).await.unwrap();
        let product = store
            .insert_product(NewProduct::new("BOLT-1", "Болт", Price::ZERO))
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        let mut row = StockBalance::empty(product.id, cell.id, Utc::now());
        row.quantity = Quantity::units(5);
        tx.save_balances(&[row]).await.unwrap();
        tx.commit().await.unwrap();

        let rows = store
            .list_balances(BalanceFilter::for_product(product.id))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].quantity, Quantity::units(5));
    }

    #[tokio::test]
    async fn duplicate_articles_are_rejected() {
        let store = InMemoryWarehouseStore::new();
        store
            .insert_product(NewProduct::new("DRL-1", "Дрель", Price::ZERO))
            .await
            .unwrap();
        let err = store
            .insert_product(NewProduct::new("DRL-1", "Другая дрель", Price::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[tokio::test]
    async fn documents_reference_existing_products() {
        let store = InMemoryWarehouseStore::new();
        let mut tx = store.begin().await.unwrap();
        let input = NewDocument::new(
            DocumentType::Income,
            today(),
            vec![NewDocumentItem::new(ProductId::new(99), Quantity::units(1), Price::ZERO)],
        );
        let number = DocumentNumber::next(DocumentType::Income, today(), 0);
        let err = tx.insert_document(number, input, Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }
}
