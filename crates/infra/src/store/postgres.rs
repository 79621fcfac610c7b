//! Postgres-backed warehouse store.
//!
//! ## Locking
//!
//! A posting transaction takes, in this order:
//!
//! 1. the document row (`SELECT ... FOR UPDATE`);
//! 2. the product rows of every line (`FOR NO KEY UPDATE`, ascending id);
//! 3. every existing balance row of those products (`FOR UPDATE`, ordered
//!    by `(product_id, cell_id)`).
//!
//! Step 2 serialises postings that touch the same product even when no
//! balance row exists yet, so two first-time receipts cannot both insert.
//! A consistent lock order keeps concurrent postings deadlock-free; if
//! Postgres still reports one it surfaces as [`StoreError::Conflict`].
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (serialization failure) | `40001` | `Conflict` |
//! | Database (deadlock detected) | `40P01` | `Conflict` |
//! | Database (unique violation on document number / balance key) | `23505` | `Conflict` |
//! | Database (other unique violation) | `23505` | `Constraint` |
//! | Database (foreign key violation) | `23503` | `Constraint` |
//! | Database (check constraint violation) | `23514` | `Constraint` |
//! | RowNotFound | N/A | `NotFound` |
//! | Anything else | N/A | `Backend` |

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument, Span};

use warehouse_catalog::{
    Category, NewCategory, NewProduct, NewSupplier, NewWarehouseCell, Product, Supplier,
    WarehouseCell,
};
use warehouse_core::{
    CategoryId, CellId, DocumentId, Entity, Price, ProductId, Quantity, SupplierId, UserId,
};
use warehouse_documents::{
    Document, DocumentFilter, DocumentItem, DocumentNumber, DocumentParts, DocumentStatus,
    DocumentType, NewDocument,
};
use warehouse_inventory::{BalanceFilter, StockBalance};

use super::{ensure_unreferenced, StoreError, StoreTransaction, WarehouseStore};

const SCHEMA: &str = include_str!("../../migrations/0001_warehouse.sql");

/// Unique constraints that only fire when two transactions race.
const RACE_CONSTRAINTS: [&str; 2] = ["documents_doc_number_key", "stock_balances_product_cell_key"];

/// Postgres-backed warehouse store.
#[derive(Debug, Clone)]
pub struct PostgresWarehouseStore {
    pool: Arc<PgPool>,
}

impl PostgresWarehouseStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    async fn begin_guarded_delete(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    /// Apply the bundled schema. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

/// Transaction over [`PostgresWarehouseStore`]. Rolled back on drop unless
/// committed.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    #[instrument(skip(self), fields(document_id = %id, found = tracing::field::Empty), err)]
    async fn lock_document(&mut self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                id, doc_type, doc_number, doc_date, status, supplier_id,
                author_id, created_at, posted_at, cancelled_at, comment
            FROM documents
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_document", e))?;

        Span::current().record("found", row.is_some());
        match row {
            Some(row) => {
                let header = DocumentRow::from_pg(&row)?;
                let mut docs = attach_items(&mut self.tx, vec![header]).await?;
                Ok(docs.pop())
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(products = products.len(), rows = tracing::field::Empty), err)]
    async fn lock_balances(
        &mut self,
        products: &[ProductId],
    ) -> Result<Vec<StockBalance>, StoreError> {
        let ids = product_ids(products);

        sqlx::query("SELECT id FROM products WHERE id = ANY($1) ORDER BY id FOR NO KEY UPDATE")
            .bind(&ids)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_products", e))?;

        let rows = sqlx::query(
            r#"
            SELECT product_id, cell_id, quantity, last_updated
            FROM stock_balances
            WHERE product_id = ANY($1)
            ORDER BY product_id, cell_id
            FOR UPDATE
            "#,
        )
        .bind(&ids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_balances", e))?;

        Span::current().record("rows", rows.len());
        rows.iter().map(balance_from_row).collect()
    }

    #[instrument(skip(self, balances), fields(rows = balances.len()), err)]
    async fn save_balances(&mut self, balances: &[StockBalance]) -> Result<(), StoreError> {
        for balance in balances {
            sqlx::query(
                r#"
                INSERT INTO stock_balances (product_id, cell_id, quantity, last_updated)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (product_id, cell_id)
                DO UPDATE SET
                    quantity = EXCLUDED.quantity,
                    last_updated = EXCLUDED.last_updated
                "#,
            )
            .bind(balance.product_id.get())
            .bind(balance.cell_id.get())
            .bind(balance.quantity.value())
            .bind(balance.last_updated)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("save_balance", e))?;

            debug!(
                product_id = %balance.product_id,
                cell_id = %balance.cell_id,
                quantity = %balance.quantity,
                "balance written"
            );
        }
        Ok(())
    }

    async fn missing_products(
        &mut self,
        products: &[ProductId],
    ) -> Result<Vec<ProductId>, StoreError> {
        let rows = sqlx::query("SELECT id FROM products WHERE id = ANY($1)")
            .bind(product_ids(products))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("missing_products", e))?;

        let mut found = Vec::with_capacity(rows.len());
        for row in rows {
            found.push(ProductId::new(get(&row, "id")?));
        }
        Ok(products
            .iter()
            .copied()
            .filter(|id| !found.contains(id))
            .collect())
    }

    async fn cell_exists(&mut self, id: CellId) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM warehouse_cells WHERE id = $1) AS found")
            .bind(id.get())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("cell_exists", e))?;
        get(&row, "found")
    }

    #[instrument(skip(self), err)]
    async fn last_sequence_in_series(&mut self, series: &str) -> Result<u32, StoreError> {
        // Transaction-scoped; released on commit or rollback.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(series)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_series", e))?;

        let rows = sqlx::query("SELECT doc_number FROM documents WHERE doc_number LIKE $1 || '-%'")
            .bind(series)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("last_sequence_in_series", e))?;

        let mut last = 0;
        for row in rows {
            let number = DocumentNumber::from_stored(get::<String>(&row, "doc_number")?);
            if number.belongs_to(series) {
                last = last.max(number.sequence().unwrap_or(0));
            }
        }
        Ok(last)
    }

    #[instrument(
        skip(self, input),
        fields(number = %number, doc_type = %input.doc_type, lines = input.items.len()),
        err
    )]
    async fn insert_document(
        &mut self,
        number: DocumentNumber,
        input: NewDocument,
        now: DateTime<Utc>,
    ) -> Result<Document, StoreError> {
        input
            .validate()
            .map_err(|e| StoreError::Constraint(e.to_string()))?;

        let row = sqlx::query(
            r#"
            INSERT INTO documents (
                doc_type, doc_number, doc_date, status, supplier_id, author_id,
                created_at, comment
            )
            VALUES ($1, $2, $3, 'draft', $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(input.doc_type.as_str())
        .bind(number.as_str())
        .bind(input.doc_date)
        .bind(input.supplier_id.map(SupplierId::get))
        .bind(input.author_id.map(UserId::get))
        .bind(now)
        .bind(input.comment.as_deref())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_document", e))?;

        let id = DocumentId::new(get(&row, "id")?);
        let document = Document::draft(id, number, input, now)
            .map_err(|e| StoreError::Constraint(e.to_string()))?;
        insert_items(&mut self.tx, id, document.items()).await?;
        Ok(document)
    }

    #[instrument(skip(self, document), fields(document_id = %document.id()), err)]
    async fn save_draft(&mut self, document: &Document) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE documents SET doc_date = $2, supplier_id = $3, comment = $4 WHERE id = $1",
        )
        .bind(document.id().get())
        .bind(document.doc_date())
        .bind(document.supplier_id().map(SupplierId::get))
        .bind(document.comment())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_draft", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("document {}", document.id())));
        }

        sqlx::query("DELETE FROM document_items WHERE document_id = $1")
            .bind(document.id().get())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("clear_items", e))?;
        insert_items(&mut self.tx, document.id(), document.items()).await
    }

    #[instrument(
        skip(self, document),
        fields(document_id = %document.id(), status = %document.status()),
        err
    )]
    async fn save_status(&mut self, document: &Document) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE documents SET status = $2, posted_at = $3, cancelled_at = $4 WHERE id = $1",
        )
        .bind(document.id().get())
        .bind(document.status().as_str())
        .bind(document.posted_at())
        .bind(document.cancelled_at())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_status", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("document {}", document.id())));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(document_id = %id), err)]
    async fn delete_document(&mut self, id: DocumentId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM documents WHERE id = $1")
            .bind(id.get())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_document", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("document {id}")));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

#[async_trait]
impl WarehouseStore for PostgresWarehouseStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    async fn insert_category(&self, input: NewCategory) -> Result<Category, StoreError> {
        input
            .validate()
            .map_err(|e| StoreError::Constraint(e.to_string()))?;
        let row = sqlx::query("INSERT INTO categories (name, description) VALUES ($1, $2) RETURNING id")
            .bind(&input.name)
            .bind(input.description.as_deref())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_category", e))?;
        Ok(input.into_category(CategoryId::new(get(&row, "id")?)))
    }

    async fn insert_supplier(&self, input: NewSupplier) -> Result<Supplier, StoreError> {
        input
            .validate()
            .map_err(|e| StoreError::Constraint(e.to_string()))?;
        let row = sqlx::query(
            r#"
            INSERT INTO suppliers (name, inn, contact_person, phone, email, address)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, created_at
            "#,
        )
        .bind(&input.name)
        .bind(input.inn.as_deref())
        .bind(input.contact_person.as_deref())
        .bind(input.phone.as_deref())
        .bind(input.email.as_deref())
        .bind(input.address.as_deref())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_supplier", e))?;
        Ok(input.into_supplier(SupplierId::new(get(&row, "id")?), get(&row, "created_at")?))
    }

    async fn insert_product(&self, input: NewProduct) -> Result<Product, StoreError> {
        input
            .validate()
            .map_err(|e| StoreError::Constraint(e.to_string()))?;
        let row = sqlx::query(
            r#"
            INSERT INTO products (article, name, unit, price, category_id, supplier_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, created_at
            "#,
        )
        .bind(&input.article)
        .bind(&input.name)
        .bind(input.unit_or_default())
        .bind(input.price.value())
        .bind(input.category_id.map(CategoryId::get))
        .bind(input.supplier_id.map(SupplierId::get))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_product", e))?;
        Ok(input.into_product(ProductId::new(get(&row, "id")?), get(&row, "created_at")?))
    }

    async fn insert_cell(&self, input: NewWarehouseCell) -> Result<WarehouseCell, StoreError> {
        input
            .validate()
            .map_err(|e| StoreError::Constraint(e.to_string()))?;
        let row = sqlx::query("INSERT INTO warehouse_cells (name, description) VALUES ($1, $2) RETURNING id")
            .bind(&input.name)
            .bind(input.description.as_deref())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_cell", e))?;
        Ok(input.into_cell(CellId::new(get(&row, "id")?)))
    }

    async fn update_category(
        &self,
        id: CategoryId,
        input: NewCategory,
    ) -> Result<Category, StoreError> {
        input
            .validate()
            .map_err(|e| StoreError::Constraint(e.to_string()))?;
        let category = input.into_category(id);
        let result = sqlx::query("UPDATE categories SET name = $2, description = $3 WHERE id = $1")
            .bind(id.get())
            .bind(&category.name)
            .bind(category.description.as_deref())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_category", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("category {id}")));
        }
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
        let row = sqlx::query(
            r#"
            UPDATE suppliers
            SET name = $2, inn = $3, contact_person = $4, phone = $5, email = $6, address = $7
            WHERE id = $1
            RETURNING created_at
            "#,
        )
        .bind(id.get())
        .bind(input.name.trim())
        .bind(input.inn.as_deref())
        .bind(input.contact_person.as_deref())
        .bind(input.phone.as_deref())
        .bind(input.email.as_deref())
        .bind(input.address.as_deref())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_supplier", e))?
        .ok_or_else(|| StoreError::NotFound(format!("supplier {id}")))?;
        Ok(input.into_supplier(id, get(&row, "created_at")?))
    }

    #[instrument(skip(self, input), fields(product_id = %id), err)]
    async fn update_product(
        &self,
        id: ProductId,
        input: NewProduct,
    ) -> Result<Product, StoreError> {
        input
            .validate()
            .map_err(|e| StoreError::Constraint(e.to_string()))?;
        let row = sqlx::query(
            r#"
            UPDATE products
            SET article = $2, name = $3, unit = $4, price = $5,
                category_id = $6, supplier_id = $7, updated_at = NOW()
            WHERE id = $1
            RETURNING id, article, name, unit, price, category_id, supplier_id,
                created_at, updated_at
            "#,
        )
        .bind(id.get())
        .bind(input.article.trim())
        .bind(input.name.trim())
        .bind(input.unit_or_default())
        .bind(input.price.value())
        .bind(input.category_id.map(CategoryId::get))
        .bind(input.supplier_id.map(SupplierId::get))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_product", e))?
        .ok_or_else(|| StoreError::NotFound(format!("product {id}")))?;
        product_from_row(&row)
    }

    #[instrument(skip(self), fields(category_id = %id), err)]
    async fn delete_category(&self, id: CategoryId) -> Result<(), StoreError> {
        let mut tx = self.begin_guarded_delete().await?;
        lock_row(&mut tx, "categories", id.get(), || format!("category {id}")).await?;
        let products = count_rows(&mut tx, "products", "category_id", id.get()).await?;
        ensure_unreferenced(format!("category {id}"), &[("products", products)])?;
        delete_row(&mut tx, "categories", id.get()).await?;
        commit(tx).await
    }

    #[instrument(skip(self), fields(supplier_id = %id), err)]
    async fn delete_supplier(&self, id: SupplierId) -> Result<(), StoreError> {
        let mut tx = self.begin_guarded_delete().await?;
        lock_row(&mut tx, "suppliers", id.get(), || format!("supplier {id}")).await?;
        let products = count_rows(&mut tx, "products", "supplier_id", id.get()).await?;
        let documents = count_rows(&mut tx, "documents", "supplier_id", id.get()).await?;
        ensure_unreferenced(
            format!("supplier {id}"),
            &[("products", products), ("documents", documents)],
        )?;
        delete_row(&mut tx, "suppliers", id.get()).await?;
        commit(tx).await
    }

    #[instrument(skip(self), fields(product_id = %id), err)]
    async fn delete_product(&self, id: ProductId) -> Result<(), StoreError> {
        let mut tx = self.begin_guarded_delete().await?;
        // FOR UPDATE conflicts with the FOR NO KEY UPDATE taken by postings.
        lock_row(&mut tx, "products", id.get(), || format!("product {id}")).await?;
        let balances = count_rows(&mut tx, "stock_balances", "product_id", id.get()).await?;
        let lines = count_rows(&mut tx, "document_items", "product_id", id.get()).await?;
        ensure_unreferenced(
            format!("product {id}"),
            &[("balance rows", balances), ("document lines", lines)],
        )?;
        delete_row(&mut tx, "products", id.get()).await?;
        commit(tx).await
    }

    #[instrument(skip(self), fields(cell_id = %id), err)]
    async fn delete_cell(&self, id: CellId) -> Result<(), StoreError> {
        let mut tx = self.begin_guarded_delete().await?;
        lock_row(&mut tx, "warehouse_cells", id.get(), || format!("cell {id}")).await?;
        let balances = count_rows(&mut tx, "stock_balances", "cell_id", id.get()).await?;
        ensure_unreferenced(format!("cell {id}"), &[("balance rows", balances)])?;
        delete_row(&mut tx, "warehouse_cells", id.get()).await?;
        commit(tx).await
    }

    async fn get_product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, article, name, unit, price, category_id, supplier_id, created_at, updated_at
            FROM products
            WHERE id = $1
            "#,
        )
        .bind(id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_product", e))?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, article, name, unit, price, category_id, supplier_id, created_at, updated_at
            FROM products
            ORDER BY id
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_products", e))?;
        rows.iter().map(product_from_row).collect()
    }

    async fn list_categories(&self) -> Result<Vec<Category>, StoreError> {
        let rows = sqlx::query("SELECT id, name, description FROM categories ORDER BY id")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_categories", e))?;
        rows.iter()
            .map(|row| {
                Ok(Category {
                    id: CategoryId::new(get(row, "id")?),
                    name: get(row, "name")?,
                    description: get(row, "description")?,
                })
            })
            .collect()
    }

    async fn list_suppliers(&self) -> Result<Vec<Supplier>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, inn, contact_person, phone, email, address, created_at
            FROM suppliers
            ORDER BY id
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_suppliers", e))?;
        rows.iter()
            .map(|row| {
                Ok(Supplier {
                    id: SupplierId::new(get(row, "id")?),
                    name: get(row, "name")?,
                    inn: get(row, "inn")?,
                    contact_person: get(row, "contact_person")?,
                    phone: get(row, "phone")?,
                    email: get(row, "email")?,
                    address: get(row, "address")?,
                    created_at: get(row, "created_at")?,
                })
            })
            .collect()
    }

    async fn list_cells(&self) -> Result<Vec<WarehouseCell>, StoreError> {
        let rows = sqlx::query("SELECT id, name, description FROM warehouse_cells ORDER BY id")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_cells", e))?;
        rows.iter()
            .map(|row| {
                Ok(WarehouseCell {
                    id: CellId::new(get(row, "id")?),
                    name: get(row, "name")?,
                    description: get(row, "description")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self), fields(document_id = %id), err)]
    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        let row = sqlx::query(
            r#"
            SELECT
                id, doc_type, doc_number, doc_date, status, supplier_id,
                author_id, created_at, posted_at, cancelled_at, comment
            FROM documents
            WHERE id = $1
            "#,
        )
        .bind(id.get())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("get_document", e))?;

        match row {
            Some(row) => {
                let header = DocumentRow::from_pg(&row)?;
                let mut docs = attach_items(&mut conn, vec![header]).await?;
                Ok(docs.pop())
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(count = tracing::field::Empty), err)]
    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        let rows = sqlx::query(
            r#"
            SELECT
                d.id, d.doc_type, d.doc_number, d.doc_date, d.status, d.supplier_id,
                d.author_id, d.created_at, d.posted_at, d.cancelled_at, d.comment
            FROM documents d
            WHERE ($1::text IS NULL OR d.doc_type = $1)
                AND ($2::text IS NULL OR d.status = $2)
                AND ($3::date IS NULL OR d.doc_date >= $3)
                AND ($4::date IS NULL OR d.doc_date <= $4)
                AND ($5::bigint IS NULL OR EXISTS (
                    SELECT 1 FROM document_items i
                    WHERE i.document_id = d.id AND i.product_id = $5
                ))
            ORDER BY d.doc_date DESC, d.id DESC
            "#,
        )
        .bind(filter.doc_type.map(DocumentType::as_str))
        .bind(filter.status.map(DocumentStatus::as_str))
        .bind(filter.date_from)
        .bind(filter.date_to)
        .bind(filter.product_id.map(ProductId::get))
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("list_documents", e))?;

        let headers = rows
            .iter()
            .map(DocumentRow::from_pg)
            .collect::<Result<Vec<_>, _>>()?;
        let docs = attach_items(&mut conn, headers).await?;
        Span::current().record("count", docs.len());
        Ok(docs)
    }

    async fn list_balances(&self, filter: BalanceFilter) -> Result<Vec<StockBalance>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT product_id, cell_id, quantity, last_updated
            FROM stock_balances
            WHERE ($1::bigint IS NULL OR product_id = $1)
                AND ($2::bigint IS NULL OR cell_id = $2)
                AND ($3::numeric IS NULL OR quantity >= $3)
            ORDER BY product_id, cell_id
            "#,
        )
        .bind(filter.product_id.map(ProductId::get))
        .bind(filter.cell_id.map(CellId::get))
        .bind(filter.min_quantity.map(Quantity::value))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_balances", e))?;
        rows.iter().map(balance_from_row).collect()
    }
}

// Row decoding

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Backend(format!("failed to read column {column}: {e}")))
}

fn corrupt(what: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("stored {what} is invalid: {err}"))
}

fn product_ids(products: &[ProductId]) -> Vec<i64> {
    products.iter().map(|p| p.get()).collect()
}

fn quantity(row: &PgRow, column: &str) -> Result<Quantity, StoreError> {
    Quantity::new(get::<Decimal>(row, column)?).map_err(|e| corrupt(column, e))
}

fn price(row: &PgRow, column: &str) -> Result<Price, StoreError> {
    Price::new(get::<Decimal>(row, column)?).map_err(|e| corrupt(column, e))
}

fn balance_from_row(row: &PgRow) -> Result<StockBalance, StoreError> {
    Ok(StockBalance {
        product_id: ProductId::new(get(row, "product_id")?),
        cell_id: CellId::new(get(row, "cell_id")?),
        quantity: quantity(row, "quantity")?,
        last_updated: get(row, "last_updated")?,
    })
}

fn product_from_row(row: &PgRow) -> Result<Product, StoreError> {
    Ok(Product {
        id: ProductId::new(get(row, "id")?),
        article: get(row, "article")?,
        name: get(row, "name")?,
        unit: get(row, "unit")?,
        price: price(row, "price")?,
        category_id: get::<Option<i64>>(row, "category_id")?.map(CategoryId::new),
        supplier_id: get::<Option<i64>>(row, "supplier_id")?.map(SupplierId::new),
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

/// Document header columns, before items are attached.
#[derive(Debug)]
struct DocumentRow {
    id: i64,
    doc_type: DocumentType,
    number: String,
    doc_date: NaiveDate,
    status: DocumentStatus,
    supplier_id: Option<i64>,
    author_id: Option<i64>,
    created_at: DateTime<Utc>,
    posted_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    comment: Option<String>,
}

impl DocumentRow {
    fn from_pg(row: &PgRow) -> Result<Self, StoreError> {
        let doc_type: String = get(row, "doc_type")?;
        let status: String = get(row, "status")?;
        Ok(Self {
            id: get(row, "id")?,
            doc_type: doc_type.parse().map_err(|e| corrupt("doc_type", e))?,
            number: get(row, "doc_number")?,
            doc_date: get(row, "doc_date")?,
            status: status.parse().map_err(|e| corrupt("status", e))?,
            supplier_id: get(row, "supplier_id")?,
            author_id: get(row, "author_id")?,
            created_at: get(row, "created_at")?,
            posted_at: get(row, "posted_at")?,
            cancelled_at: get(row, "cancelled_at")?,
            comment: get(row, "comment")?,
        })
    }

    fn into_document(self, items: Vec<DocumentItem>) -> Document {
        Document::restore(DocumentParts {
            id: DocumentId::new(self.id),
            doc_type: self.doc_type,
            number: DocumentNumber::from_stored(self.number),
            doc_date: self.doc_date,
            status: self.status,
            supplier_id: self.supplier_id.map(SupplierId::new),
            author_id: self.author_id.map(UserId::new),
            created_at: self.created_at,
            posted_at: self.posted_at,
            cancelled_at: self.cancelled_at,
            comment: self.comment,
            items,
        })
    }
}

/// Load items for `headers` in one query and assemble documents, keeping
/// the header order.
async fn attach_items(
    conn: &mut PgConnection,
    headers: Vec<DocumentRow>,
) -> Result<Vec<Document>, StoreError> {
    if headers.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<i64> = headers.iter().map(|h| h.id).collect();
    let rows = sqlx::query(
        r#"
        SELECT document_id, line_no, product_id, quantity, price
        FROM document_items
        WHERE document_id = ANY($1)
        ORDER BY document_id, line_no
        "#,
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_items", e))?;

    let mut items: BTreeMap<i64, Vec<DocumentItem>> = BTreeMap::new();
    for row in &rows {
        let line_no: i32 = get(row, "line_no")?;
        items
            .entry(get(row, "document_id")?)
            .or_default()
            .push(DocumentItem {
                line_no: u32::try_from(line_no).map_err(|e| corrupt("line_no", e))?,
                product_id: ProductId::new(get(row, "product_id")?),
                quantity: quantity(row, "quantity")?,
                price: price(row, "price")?,
            });
    }

    Ok(headers
        .into_iter()
        .map(|h| {
            let lines = items.remove(&h.id).unwrap_or_default();
            h.into_document(lines)
        })
        .collect())
}

async fn insert_items(
    conn: &mut PgConnection,
    document_id: DocumentId,
    items: &[DocumentItem],
) -> Result<(), StoreError> {
    for item in items {
        let line_no = i32::try_from(item.line_no)
            .map_err(|_| StoreError::Constraint(format!("line number {} too large", item.line_no)))?;
        sqlx::query(
            r#"
            INSERT INTO document_items (document_id, line_no, product_id, quantity, price)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(document_id.get())
        .bind(line_no)
        .bind(item.product_id.get())
        .bind(item.quantity.value())
        .bind(item.price.value())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("insert_item", e))?;
    }
    Ok(())
}

// Guarded deletes. Table and column names are compile-time constants.

/// Lock a catalog row for the rest of the transaction; `NotFound` if absent.
async fn lock_row(
    conn: &mut PgConnection,
    table: &'static str,
    id: i64,
    what: impl FnOnce() -> String,
) -> Result<(), StoreError> {
    let sql = format!("SELECT id FROM {table} WHERE id = $1 FOR UPDATE");
    sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("lock_row", e))?
        .map(|_| ())
        .ok_or_else(|| StoreError::NotFound(what()))
}

async fn count_rows(
    conn: &mut PgConnection,
    table: &'static str,
    column: &'static str,
    id: i64,
) -> Result<u64, StoreError> {
    let sql = format!("SELECT COUNT(*) AS n FROM {table} WHERE {column} = $1");
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("count_references", e))?;
    let n: i64 = get(&row, "n")?;
    u64::try_from(n).map_err(|e| corrupt("row count", e))
}

async fn delete_row(conn: &mut PgConnection, table: &'static str, id: i64) -> Result<(), StoreError> {
    let sql = format!("DELETE FROM {table} WHERE id = $1");
    sqlx::query(&sql)
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("delete_row", e))?;
    Ok(())
}

async fn commit(tx: Transaction<'static, Postgres>) -> Result<(), StoreError> {
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("40001") | Some("40P01") => StoreError::Conflict(msg),
                Some("23505") => {
                    if db_err
                        .constraint()
                        .is_some_and(|c| RACE_CONSTRAINTS.contains(&c))
                    {
                        StoreError::Conflict(msg)
                    } else {
                        StoreError::Constraint(msg)
                    }
                }
                Some("23503") | Some("23514") => StoreError::Constraint(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::RowNotFound => {
            StoreError::NotFound(format!("unexpected row not found in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}
