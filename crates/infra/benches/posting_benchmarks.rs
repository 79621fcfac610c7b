use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::{NaiveDate, Utc};
use rust_decimal_macros::dec;
use tokio::runtime::Runtime;

use warehouse_catalog::{NewProduct, NewWarehouseCell};
use warehouse_core::{CellId, Entity, Price, ProductId, Quantity};
use warehouse_documents::{DocumentType, NewDocument, NewDocumentItem};
use warehouse_infra::{DocumentService, InMemoryWarehouseStore, PostingEngine, WarehouseStore};
use warehouse_inventory::StockLedger;

struct Bench {
    engine: PostingEngine<InMemoryWarehouseStore>,
    drafts: DocumentService<InMemoryWarehouseStore>,
    products: Vec<ProductId>,
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

async fn setup(product_count: usize) -> Bench {
    let store = InMemoryWarehouseStore::new();
    let cell = store.insert_cell(NewWarehouseCell::named("A-01")).await.unwrap().id;
    let mut products = Vec::with_capacity(product_count);
    for i in 0..product_count {
        let product = NewProduct::new(format!("ART-{i}"), format!("Товар {i}"), Price::ZERO);
        products.push(store.insert_product(product).await.unwrap().id);
    }
    Bench {
        engine: PostingEngine::new(store.clone(), cell),
        drafts: DocumentService::new(store),
        products,
    }
}

fn document(doc_type: DocumentType, products: &[ProductId], amount: Quantity) -> NewDocument {
    let items = products
        .iter()
        .map(|p| NewDocumentItem::new(*p, amount, Price::new(dec!(9.99)).unwrap()))
        .collect();
    NewDocument::new(
        doc_type,
        NaiveDate::from_ymd_opt(2026, 10, 1).unwrap(),
        items,
    )
}

/// Draft creation plus income posting, by number of lines.
fn bench_post_income(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("post_income");

    for lines in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*lines as u64));
        let bench = rt.block_on(setup(*lines));
        group.bench_with_input(BenchmarkId::new("lines", lines), lines, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let draft = bench
                        .drafts
                        .create_draft(document(DocumentType::Income, &bench.products, Quantity::units(1)))
                        .await
                        .unwrap();
                    bench.engine.post_income(black_box(draft.id())).await.unwrap();
                })
            });
        });
    }

    group.finish();
}

/// Expense posting followed by its cancellation; the balance returns to the
/// starting level every iteration.
fn bench_expense_and_cancel(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("expense_and_cancel");

    for lines in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*lines as u64));
        let bench = rt.block_on(async {
            let bench = setup(*lines).await;
            let stock = bench
                .drafts
                .create_draft(document(DocumentType::Income, &bench.products, Quantity::units(1_000)))
                .await
                .unwrap();
            bench.engine.post_income(stock.id()).await.unwrap();
            bench
        });
        group.bench_with_input(BenchmarkId::new("lines", lines), lines, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let draft = bench
                        .drafts
                        .create_draft(document(DocumentType::Expense, &bench.products, Quantity::units(5)))
                        .await
                        .unwrap();
                    bench.engine.post_expense(draft.id()).await.unwrap();
                    bench.engine.cancel(draft.id()).await.unwrap();
                })
            });
        });
    }

    group.finish();
}

/// Raw ledger arithmetic without storage.
fn bench_ledger(c: &mut Criterion) {
    let mut group = c.benchmark_group("stock_ledger");
    let cell = CellId::new(1);
    let now = Utc::now();

    for products in [10i64, 1_000].iter() {
        group.throughput(Throughput::Elements(*products as u64));
        group.bench_with_input(
            BenchmarkId::new("increase_then_decrease", products),
            products,
            |b, &products| {
                b.iter(|| {
                    let mut ledger = StockLedger::default();
                    for id in 1..=products {
                        let product = ProductId::new(id);
                        ledger.increase(product, cell, Quantity::units(10), now).unwrap();
                        ledger.decrease(product, cell, Quantity::units(3), now).unwrap();
                    }
                    black_box(ledger.changed_balances())
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_post_income,
    bench_expense_and_cancel,
    bench_ledger
);
criterion_main!(benches);
