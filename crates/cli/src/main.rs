//! `warehouse-cli`: operator commands against the Postgres warehouse store.
//!
//! Configuration comes from the environment (`DATABASE_URL`,
//! `WAREHOUSE_DEFAULT_CELL`, `WAREHOUSE_LOG`, ...). Results are printed to
//! stdout as JSON; logs go to stderr.

use std::future::Future;

use anyhow::{Context, Result};
use chrono::{Days, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::warn;

use warehouse_core::{CategoryId, CellId, DocumentId, ProductId, Quantity};
use warehouse_documents::Document;
use warehouse_infra::config::DEFAULT_LOG_FILTER;
use warehouse_infra::reports::{
    product_movement, stock_report, suppliers_report, turnover_report, SUPPLIER_REPORT_DAYS,
};
use warehouse_infra::{
    PostgresWarehouseStore, PostingEngine, PostingError, WarehouseConfig, WarehouseStore,
};
use warehouse_inventory::BalanceFilter;

#[derive(Parser)]
#[command(name = "warehouse-cli", about = "Warehouse stock posting and reports", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update the database schema.
    Migrate,
    /// Post a draft document (income or expense, by its type).
    Post(DocumentArgs),
    /// Cancel a posted document.
    Cancel(DocumentArgs),
    /// Print a document with its lines and total.
    Show(DocumentArgs),
    /// List storage cells.
    Cells,
    /// Stock of one product: one cell or the total across cells.
    Quantity(QuantityArgs),
    /// Balance rows, optionally filtered.
    Balances(BalancesArgs),
    #[command(subcommand)]
    Report(ReportCommands),
}

#[derive(Subcommand)]
enum ReportCommands {
    /// Products in stock valued at catalog price.
    Stock,
    /// Posted movements of one product with running balance.
    Movement(MovementArgs),
    /// Per-product turnover since a date.
    Turnover(TurnoverArgs),
    /// Suppliers ranked by posted purchases.
    Suppliers(SuppliersArgs),
}

#[derive(Args)]
struct DocumentArgs {
    #[arg(help = "Document id")]
    id: DocumentId,
}

#[derive(Args)]
struct QuantityArgs {
    #[arg(long, help = "Product id")]
    product: ProductId,
    #[arg(long, help = "Cell id; omit for the total across cells")]
    cell: Option<CellId>,
}

#[derive(Args)]
struct BalancesArgs {
    #[arg(long)]
    product: Option<ProductId>,
    #[arg(long)]
    cell: Option<CellId>,
    #[arg(long, help = "Only rows with at least this quantity")]
    min: Option<Decimal>,
}

#[derive(Args)]
struct MovementArgs {
    #[arg(long)]
    product: ProductId,
    #[arg(long, help = "First date, YYYY-MM-DD")]
    from: Option<NaiveDate>,
    #[arg(long, help = "Last date, YYYY-MM-DD")]
    to: Option<NaiveDate>,
}

#[derive(Args)]
struct TurnoverArgs {
    #[arg(long, help = "First date, YYYY-MM-DD")]
    from: NaiveDate,
    #[arg(long)]
    category: Option<CategoryId>,
}

#[derive(Args)]
struct SuppliersArgs {
    #[arg(long, help = "First date, YYYY-MM-DD; defaults to one year ago")]
    from: Option<NaiveDate>,
}

#[derive(Serialize)]
struct Outcome {
    document_id: DocumentId,
    operation: &'static str,
    attempts: u32,
}

#[derive(Serialize)]
struct DocumentOutput {
    #[serde(flatten)]
    document: Document,
    total_amount: Decimal,
}

#[derive(Serialize)]
struct QuantityOutput {
    product_id: ProductId,
    cell_id: Option<CellId>,
    quantity: Quantity,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = WarehouseConfig::from_env();
    warehouse_observability::init_with_filter(
        config
            .as_ref()
            .map_or(DEFAULT_LOG_FILTER, |c| c.log_filter.as_str()),
    );

    let config = config.context("invalid configuration")?;
    if config.uses_dev_database() {
        warn!("DATABASE_URL not set; using local dev database");
    }
    let store = PostgresWarehouseStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("failed to connect to the database")?;

    match cli.command {
        Commands::Migrate => {
            store.migrate().await.context("migration failed")?;
            print_json(&serde_json::json!({ "migrated": true }))
        }
        Commands::Post(args) => {
            let engine = PostingEngine::new(store, config.default_cell);
            let attempts = with_retries(config.posting_retries, || engine.post(args.id))
                .await
                .with_context(|| format!("failed to post document {}", args.id))?;
            print_json(&Outcome {
                document_id: args.id,
                operation: "post",
                attempts,
            })
        }
        Commands::Cancel(args) => {
            let engine = PostingEngine::new(store, config.default_cell);
            let attempts = with_retries(config.posting_retries, || engine.cancel(args.id))
                .await
                .with_context(|| format!("failed to cancel document {}", args.id))?;
            print_json(&Outcome {
                document_id: args.id,
                operation: "cancel",
                attempts,
            })
        }
        Commands::Show(args) => {
            let document = store
                .get_document(args.id)
                .await?
                .with_context(|| format!("document {} not found", args.id))?;
            print_json(&DocumentOutput {
                total_amount: document.total_amount(),
                document,
            })
        }
        Commands::Cells => print_json(&store.list_cells().await?),
        Commands::Quantity(args) => {
            let engine = PostingEngine::new(store, config.default_cell);
            let quantity = match args.cell {
                Some(cell) => engine.get_quantity(args.product, cell).await?,
                None => engine.get_total_quantity(args.product).await?,
            };
            print_json(&QuantityOutput {
                product_id: args.product,
                cell_id: args.cell,
                quantity,
            })
        }
        Commands::Balances(args) => {
            let min_quantity = args
                .min
                .map(Quantity::new)
                .transpose()
                .context("invalid --min")?;
            let rows = store
                .list_balances(BalanceFilter {
                    product_id: args.product,
                    cell_id: args.cell,
                    min_quantity,
                })
                .await?;
            print_json(&rows)
        }
        Commands::Report(ReportCommands::Stock) => print_json(&stock_report(&store).await?),
        Commands::Report(ReportCommands::Movement(args)) => {
            print_json(&product_movement(&store, args.product, args.from, args.to).await?)
        }
        Commands::Report(ReportCommands::Turnover(args)) => {
            print_json(&turnover_report(&store, args.from, args.category).await?)
        }
        Commands::Report(ReportCommands::Suppliers(args)) => {
            let from = match args.from {
                Some(from) => from,
                None => Utc::now()
                    .date_naive()
                    .checked_sub_days(Days::new(SUPPLIER_REPORT_DAYS))
                    .context("report start date out of range")?,
            };
            print_json(&suppliers_report(&store, from).await?)
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// `attempts` runs are used up. Returns the number of runs.
async fn with_retries<F, Fut>(attempts: u32, mut op: F) -> Result<u32, PostingError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), PostingError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(()) => return Ok(attempt),
            Err(err) if err.is_retryable() && attempt < attempts => {
                warn!(attempt, error = %err, "retrying after conflict");
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use warehouse_infra::StoreError;

    #[tokio::test]
    async fn conflicts_are_retried_until_success() {
        let calls = Cell::new(0);
        let attempts = with_retries(3, || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 3 {
                    Err(PostingError::Storage(StoreError::Conflict("deadlock".into())))
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn business_errors_are_not_retried() {
        let calls = Cell::new(0);
        let err = with_retries(5, || {
            calls.set(calls.get() + 1);
            async { Err(PostingError::EmptyDocument) }
        })
        .await
        .unwrap_err();
        assert_eq!(err, PostingError::EmptyDocument);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn retries_stop_at_the_limit() {
        let calls = Cell::new(0);
        let err = with_retries(2, || {
            calls.set(calls.get() + 1);
            async { Err(PostingError::Storage(StoreError::Conflict("busy".into()))) }
        })
        .await
        .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn arguments_parse() {
        let cli = Cli::try_parse_from([
            "warehouse-cli",
            "report",
            "movement",
            "--product",
            "7",
            "--from",
            "2026-10-01",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Report(ReportCommands::Movement(MovementArgs { product, to: None, .. }))
                if product == ProductId::new(7)
        ));

        assert!(Cli::try_parse_from(["warehouse-cli", "post", "0"]).is_err());

        let cli = Cli::try_parse_from(["warehouse-cli", "report", "suppliers"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Report(ReportCommands::Suppliers(SuppliersArgs { from: None }))
        ));
    }
}
