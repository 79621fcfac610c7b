//! Read-only stock reports built from committed balances and posted documents.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;

use warehouse_core::{CategoryId, DocumentId, Entity, Price, ProductId, Quantity, SupplierId};
use warehouse_documents::{DocumentFilter, DocumentNumber, DocumentStatus, DocumentType};
use warehouse_inventory::{BalanceFilter, StockLedger};

use crate::posting::PostingError;
use crate::store::WarehouseStore;

/// Label used for products without a category or documents without a supplier.
pub const NONE_LABEL: &str = "-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockReportRow {
    pub product_id: ProductId,
    pub article: String,
    pub name: String,
    pub category: String,
    pub unit: String,
    pub quantity: Quantity,
    pub price: Price,
    pub value: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StockReport {
    pub rows: Vec<StockReportRow>,
    pub total_items: usize,
    pub total_quantity: Decimal,
    pub total_value: Decimal,
}

/// Products currently in stock (total across cells > 0) valued at their
/// catalog price, sorted by category then name.
pub async fn stock_report<S>(store: &S) -> Result<StockReport, PostingError>
where
    S: WarehouseStore + ?Sized,
{
    let categories: BTreeMap<CategoryId, String> = store
        .list_categories()
        .await?
        .into_iter()
        .map(|c| (c.id, c.name))
        .collect();
    let ledger = StockLedger::from_balances(store.list_balances(BalanceFilter::default()).await?);

    let mut rows = Vec::new();
    for product in store.list_products().await? {
        let quantity = ledger.total_quantity(product.id);
        if !quantity.is_positive() {
            continue;
        }
        let category = product
            .category_id
            .and_then(|id| categories.get(&id).cloned())
            .unwrap_or_else(|| NONE_LABEL.to_string());
        rows.push(StockReportRow {
            product_id: product.id,
            value: quantity.times(product.price),
            article: product.article,
            name: product.name,
            category,
            unit: product.unit,
            quantity,
            price: product.price,
        });
    }
    rows.sort_by(|a, b| a.category.cmp(&b.category).then_with(|| a.name.cmp(&b.name)));

    Ok(StockReport {
        total_items: rows.len(),
        total_quantity: rows.iter().map(|r| r.quantity.value()).sum(),
        total_value: rows.iter().map(|r| r.value).sum(),
        rows,
    })
}

/// One posted document line in a product movement report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MovementLine {
    pub date: NaiveDate,
    pub document_id: DocumentId,
    pub number: DocumentNumber,
    pub doc_type: DocumentType,
    pub quantity: Quantity,
    pub price: Price,
    pub total: Decimal,
    pub supplier: String,
    /// Balance after this line.
    pub balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MovementReport {
    pub product_id: ProductId,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    /// Signed sum of posted lines dated before `date_from`.
    pub opening_balance: Decimal,
    pub lines: Vec<MovementLine>,
    pub closing_balance: Decimal,
}

fn signed(doc_type: DocumentType, quantity: Quantity) -> Decimal {
    match doc_type {
        DocumentType::Income => quantity.value(),
        DocumentType::Expense => -quantity.value(),
    }
}

/// Posted lines of `product_id` within the inclusive date range, in
/// (date, document id) order with a running balance.
pub async fn product_movement<S>(
    store: &S,
    product_id: ProductId,
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
) -> Result<MovementReport, PostingError>
where
    S: WarehouseStore + ?Sized,
{
    if store.get_product(product_id).await?.is_none() {
        return Err(PostingError::NotFound(format!("product {product_id}")));
    }
    let suppliers: BTreeMap<SupplierId, String> = store
        .list_suppliers()
        .await?
        .into_iter()
        .map(|s| (s.id, s.name))
        .collect();

    let filter = DocumentFilter {
        status: Some(DocumentStatus::Posted),
        product_id: Some(product_id),
        date_to,
        ..DocumentFilter::default()
    };
    let mut documents = store.list_documents(&filter).await?;
    documents.sort_by(|a, b| {
        a.doc_date()
            .cmp(&b.doc_date())
            .then_with(|| a.id().cmp(&b.id()))
    });

    let mut opening_balance = Decimal::ZERO;
    let mut lines = Vec::new();
    for document in &documents {
        let before_range = date_from.is_some_and(|from| document.doc_date() < from);
        for item in document.items().iter().filter(|i| i.product_id == product_id) {
            let delta = signed(document.doc_type(), item.quantity);
            if before_range {
                opening_balance += delta;
                continue;
            }
            lines.push(MovementLine {
                date: document.doc_date(),
                document_id: document.id(),
                number: document.number().clone(),
                doc_type: document.doc_type(),
                quantity: item.quantity,
                price: item.price,
                total: item.total(),
                supplier: document
                    .supplier_id()
                    .and_then(|id| suppliers.get(&id).cloned())
                    .unwrap_or_else(|| NONE_LABEL.to_string()),
                balance: delta,
            });
        }
    }

    let mut running = opening_balance;
    for line in &mut lines {
        running += line.balance;
        line.balance = running;
    }

    Ok(MovementReport {
        product_id,
        date_from,
        date_to,
        opening_balance,
        lines,
        closing_balance: running,
    })
}

/// Per-product turnover over posted documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnoverRow {
    pub product_id: ProductId,
    pub article: String,
    pub name: String,
    pub category: String,
    pub unit: String,
    /// Quantity moved in either direction.
    pub quantity: Decimal,
    pub amount: Decimal,
    pub operations: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TurnoverReport {
    pub rows: Vec<TurnoverRow>,
    pub total_operations: usize,
    pub total_quantity: Decimal,
    pub total_amount: Decimal,
}

/// Lines of posted documents dated on or after `date_from`, grouped by
/// product and sorted by product name. `category_id` narrows to one
/// category.
pub async fn turnover_report<S>(
    store: &S,
    date_from: NaiveDate,
    category_id: Option<CategoryId>,
) -> Result<TurnoverReport, PostingError>
where
    S: WarehouseStore + ?Sized,
{
    let categories: BTreeMap<CategoryId, String> = store
        .list_categories()
        .await?
        .into_iter()
        .map(|c| (c.id, c.name))
        .collect();
    let products: BTreeMap<ProductId, _> = store
        .list_products()
        .await?
        .into_iter()
        .filter(|p| category_id.is_none() || p.category_id == category_id)
        .map(|p| (p.id, p))
        .collect();

    let filter = DocumentFilter {
        status: Some(DocumentStatus::Posted),
        date_from: Some(date_from),
        ..DocumentFilter::default()
    };
    let mut totals: BTreeMap<ProductId, (Decimal, Decimal, usize)> = BTreeMap::new();
    for document in store.list_documents(&filter).await? {
        for item in document.items() {
            if !products.contains_key(&item.product_id) {
                continue;
            }
            let entry = totals.entry(item.product_id).or_default();
            entry.0 += item.quantity.value();
            entry.1 += item.total();
            entry.2 += 1;
        }
    }

    let mut rows: Vec<TurnoverRow> = totals
        .into_iter()
        .filter_map(|(product_id, (quantity, amount, operations))| {
            let product = products.get(&product_id)?;
            Some(TurnoverRow {
                product_id,
                article: product.article.clone(),
                name: product.name.clone(),
                category: product
                    .category_id
                    .and_then(|id| categories.get(&id).cloned())
                    .unwrap_or_else(|| NONE_LABEL.to_string()),
                unit: product.unit.clone(),
                quantity,
                amount,
                operations,
            })
        })
        .collect();
    rows.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(TurnoverReport {
        total_operations: rows.iter().map(|r| r.operations).sum(),
        total_quantity: rows.iter().map(|r| r.quantity).sum(),
        total_amount: rows.iter().map(|r| r.amount).sum(),
        rows,
    })
}

/// Default look-back window of [`suppliers_report`] when the caller has no
/// explicit start date.
pub const SUPPLIER_REPORT_DAYS: u64 = 365;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupplierReportRow {
    pub supplier_id: SupplierId,
    pub name: String,
    pub inn: String,
    pub contact_person: String,
    pub phone: String,
    /// Catalog products linked to this supplier.
    pub products: usize,
    /// Posted income documents dated on or after the report start.
    pub deliveries: usize,
    /// Sum of line totals over those deliveries.
    pub purchases: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupplierReport {
    pub date_from: NaiveDate,
    pub rows: Vec<SupplierReportRow>,
    pub total_suppliers: usize,
    pub total_products: usize,
    pub total_purchases: Decimal,
}

/// Every supplier with its product count and the posted income documents
/// received from it since `date_from`, largest purchase value first.
pub async fn suppliers_report<S>(
    store: &S,
    date_from: NaiveDate,
) -> Result<SupplierReport, PostingError>
where
    S: WarehouseStore + ?Sized,
{
    let mut products: BTreeMap<SupplierId, usize> = BTreeMap::new();
    for product in store.list_products().await? {
        if let Some(id) = product.supplier_id {
            *products.entry(id).or_default() += 1;
        }
    }

    let filter = DocumentFilter {
        doc_type: Some(DocumentType::Income),
        status: Some(DocumentStatus::Posted),
        date_from: Some(date_from),
        ..DocumentFilter::default()
    };
    let mut deliveries: BTreeMap<SupplierId, (usize, Decimal)> = BTreeMap::new();
    for document in store.list_documents(&filter).await? {
        if let Some(id) = document.supplier_id() {
            let entry = deliveries.entry(id).or_default();
            entry.0 += 1;
            entry.1 += document.total_amount();
        }
    }

    let label = |value: Option<String>| value.unwrap_or_else(|| NONE_LABEL.to_string());
    let mut rows: Vec<SupplierReportRow> = store
        .list_suppliers()
        .await?
        .into_iter()
        .map(|supplier| {
            let (deliveries, purchases) =
                deliveries.get(&supplier.id).copied().unwrap_or_default();
            SupplierReportRow {
                supplier_id: supplier.id,
                products: products.get(&supplier.id).copied().unwrap_or(0),
                deliveries,
                purchases,
                name: supplier.name,
                inn: label(supplier.inn),
                contact_person: label(supplier.contact_person),
                phone: label(supplier.phone),
            }
        })
        .collect();
    rows.sort_by(|a, b| {
        b.purchases
            .cmp(&a.purchases)
            .then_with(|| a.name.cmp(&b.name))
    });

    Ok(SupplierReport {
        date_from,
        total_suppliers: rows.len(),
        total_products: rows.iter().map(|r| r.products).sum(),
        total_purchases: rows.iter().map(|r| r.purchases).sum(),
        rows,
    })
}
