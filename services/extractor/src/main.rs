//! Extractor Service - Loads extraction snapshots into staging tables
//!
//! Responsibilities:
//! - Read one CSV file per source table from a snapshot directory
//! - Validate each file against its exact column contract (schema drift = fatal)
//! - Recreate the staging table and bulk-insert rows as raw TEXT
//! - Record a content hash per snapshot file for provenance
//! - Track job runs for auditing
//!
//! Staging columns are deliberately untyped (TEXT, empty cell = NULL):
//! type coercion happens in the loader so a bad value rejects one row,
//! not the whole extraction.
//!
//! Usage:
//!   # Full snapshot:
//!   cargo run --bin extractor -- --snapshot-dir ./data/snapshot
//!
//!   # Single table:
//!   cargo run --bin extractor -- --snapshot-dir ./data/snapshot --table product

use anyhow::{Context, Result};
use clap::Parser;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, QueryBuilder};
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "extractor", about = "Loads extraction snapshots into staging tables")]
struct Args {
    /// Directory holding one CSV file per source table
    #[arg(long)]
    snapshot_dir: PathBuf,

    /// Restrict the run to a single source table (file stem, e.g. "product")
    #[arg(long)]
    table: Option<String>,

    /// Dry run - validate files without writing to the database
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

// =============================================================================
// Source table contracts
// =============================================================================
// One entry per source table. Headers must match exactly (name and order) -
// anything else is schema drift and aborts the run before staging is touched.

struct SourceTable {
    /// File stem inside the snapshot directory (`<name>.csv`)
    name: &'static str,
    /// Target staging table (schema `staging`)
    staging_table: &'static str,
    /// Exact expected header row
    columns: &'static [&'static str],
}

const SOURCE_TABLES: &[SourceTable] = &[
    SourceTable {
        name: "customer",
        staging_table: "stage_customers",
        columns: &["CustomerID", "PersonID", "StoreID", "TerritoryID"],
    },
    SourceTable {
        name: "person",
        staging_table: "stage_persons",
        columns: &["BusinessEntityID", "FirstName", "LastName"],
    },
    SourceTable {
        name: "product",
        staging_table: "stage_products",
        columns: &[
            "ProductID",
            "Name",
            "ProductNumber",
            "ProductSubcategoryID",
            "ProductLine",
            "Color",
            "Size",
            "StandardCost",
            "ListPrice",
            "SellStartDate",
            "SellEndDate",
        ],
    },
    SourceTable {
        name: "product_subcategory",
        staging_table: "stage_subcategories",
        columns: &["ProductSubcategoryID", "ProductCategoryID", "Name"],
    },
    SourceTable {
        name: "product_category",
        staging_table: "stage_categories",
        columns: &["ProductCategoryID", "Name"],
    },
    SourceTable {
        name: "sales_territory",
        staging_table: "stage_territories",
        columns: &["TerritoryID", "Name", "CountryRegionCode", "Group"],
    },
    SourceTable {
        name: "country_region",
        staging_table: "stage_countries",
        columns: &["CountryRegionCode", "Name"],
    },
    SourceTable {
        name: "sales_person",
        staging_table: "stage_salespersons",
        columns: &["BusinessEntityID", "TerritoryID", "SalesQuota", "CommissionPct"],
    },
    SourceTable {
        name: "employee",
        staging_table: "stage_employees",
        columns: &["BusinessEntityID", "HireDate"],
    },
    SourceTable {
        name: "special_offer",
        staging_table: "stage_offers",
        columns: &[
            "SpecialOfferID",
            "Description",
            "Type",
            "DiscountPct",
            "StartDate",
            "EndDate",
            "MinQty",
            "MaxQty",
        ],
    },
    SourceTable {
        name: "sales_order_header",
        staging_table: "stage_order_headers",
        columns: &[
            "SalesOrderID",
            "OrderDate",
            "CustomerID",
            "SalesPersonID",
            "TerritoryID",
        ],
    },
    SourceTable {
        name: "sales_order_detail",
        staging_table: "stage_order_details",
        columns: &[
            "SalesOrderID",
            "SalesOrderDetailID",
            "OrderQty",
            "ProductID",
            "SpecialOfferID",
            "UnitPrice",
            "UnitPriceDiscount",
        ],
    },
];

/// Insert batch size (rows per multi-row INSERT)
const BATCH_SIZE: usize = 500;

// =============================================================================
// CSV snapshot parsing
// =============================================================================

/// One parsed snapshot row: one Option per contract column, empty cell = None
type RawRow = Vec<Option<String>>;

/// Parse a snapshot CSV against its table contract.
/// Fails on header drift; tolerates a UTF-8 BOM on the first header.
fn parse_snapshot_csv(content: &str, table: &SourceTable) -> Result<Vec<RawRow>> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);

    let mut reader = csv::ReaderBuilder::new()
        .flexible(false)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV headers")?
        .iter()
        .map(|h| h.to_string())
        .collect();

    if headers.len() != table.columns.len() {
        anyhow::bail!(
            "Schema drift in '{}': expected {} columns, found {}. Headers: {:?}",
            table.name,
            table.columns.len(),
            headers.len(),
            headers
        );
    }

    for (i, (found, expected)) in headers.iter().zip(table.columns.iter()).enumerate() {
        if found != *expected {
            anyhow::bail!(
                "Schema drift in '{}': column {} expected '{}', found '{}'",
                table.name,
                i,
                expected,
                found
            );
        }
    }

    let mut rows: Vec<RawRow> = Vec::new();
    for (line_idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| {
            format!("CSV parse error in '{}' at line {}", table.name, line_idx + 2)
        })?;

        let row: RawRow = record
            .iter()
            .map(|field| {
                let trimmed = field.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            })
            .collect();

        rows.push(row);
    }

    Ok(rows)
}

/// Content hash of a snapshot file, recorded for provenance
fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

// =============================================================================
// Staging writes
// =============================================================================

/// Drop and recreate a staging table with one TEXT column per contract column.
/// Source column names are kept verbatim (quoted) so loader joins read
/// like the source schema.
async fn recreate_staging_table(pool: &PgPool, table: &SourceTable) -> Result<()> {
    sqlx::query("CREATE SCHEMA IF NOT EXISTS staging")
        .execute(pool)
        .await?;

    sqlx::query(&format!(
        "DROP TABLE IF EXISTS staging.{} CASCADE",
        table.staging_table
    ))
    .execute(pool)
    .await?;

    let column_defs = table
        .columns
        .iter()
        .map(|c| format!("\"{}\" TEXT", c))
        .collect::<Vec<_>>()
        .join(", ");

    sqlx::query(&format!(
        "CREATE TABLE staging.{} ({})",
        table.staging_table, column_defs
    ))
    .execute(pool)
    .await?;

    Ok(())
}

/// Bulk-insert parsed rows into the staging table in batches
async fn insert_staging_rows(pool: &PgPool, table: &SourceTable, rows: &[RawRow]) -> Result<usize> {
    let column_list = table
        .columns
        .iter()
        .map(|c| format!("\"{}\"", c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut inserted = 0;
    for batch in rows.chunks(BATCH_SIZE) {
        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
            "INSERT INTO staging.{} ({}) ",
            table.staging_table, column_list
        ));

        builder.push_values(batch, |mut b, row| {
            for field in row {
                b.push_bind(field.clone());
            }
        });

        builder.build().execute(pool).await.with_context(|| {
            format!("Failed inserting batch into staging.{}", table.staging_table)
        })?;

        inserted += batch.len();
    }

    Ok(inserted)
}

// =============================================================================
// Job run bookkeeping
// =============================================================================

async fn create_job_run(pool: &PgPool, task: &str) -> Result<Uuid> {
    sqlx::query("CREATE SCHEMA IF NOT EXISTS etl").execute(pool).await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS etl.job_runs (
            job_run_id UUID PRIMARY KEY,
            component TEXT NOT NULL,
            task TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            finished_at TIMESTAMPTZ,
            error TEXT,
            detail JSONB NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    let job_run_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO etl.job_runs (job_run_id, component, task, status, detail)
        VALUES ($1, 'extractor', $2, 'running', '{}')
        "#,
    )
    .bind(job_run_id)
    .bind(task)
    .execute(pool)
    .await?;

    Ok(job_run_id)
}

async fn finish_job_run(
    pool: &PgPool,
    job_run_id: Uuid,
    status: &str,
    error: Option<&str>,
    detail: serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE etl.job_runs
        SET finished_at = now(), status = $2, error = $3, detail = detail || $4
        WHERE job_run_id = $1
        "#,
    )
    .bind(job_run_id)
    .bind(status)
    .bind(error)
    .bind(detail)
    .execute(pool)
    .await?;

    Ok(())
}

// =============================================================================
// Per-table extraction
// =============================================================================

/// Load one snapshot file into its staging table, returning (rows, hash)
async fn extract_table(
    pool: &PgPool,
    snapshot_dir: &Path,
    table: &SourceTable,
    dry_run: bool,
) -> Result<(usize, String)> {
    let file_path = snapshot_dir.join(format!("{}.csv", table.name));
    println!("  File: {}", file_path.display());

    let bytes = fs::read(&file_path).await.with_context(|| {
        format!("Snapshot file missing or unreadable: {}", file_path.display())
    })?;

    let hash = content_hash(&bytes);
    println!("  Hash: {}", hash);

    let content = String::from_utf8(bytes).with_context(|| {
        format!("Snapshot file is not valid UTF-8: {}", file_path.display())
    })?;

    let rows = parse_snapshot_csv(&content, table)?;
    println!("  Parsed {} rows", rows.len());

    if rows.is_empty() {
        println!("  Warning: snapshot for '{}' is empty", table.name);
    }

    if dry_run {
        println!("  Dry run - staging.{} not touched", table.staging_table);
        return Ok((rows.len(), hash));
    }

    recreate_staging_table(pool, table).await?;
    let inserted = insert_staging_rows(pool, table, &rows).await?;
    println!("  staging.{}: {} rows loaded", table.staging_table, inserted);

    Ok((inserted, hash))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let db_url = std::env::var("DW_URL").context("DW_URL env var missing")?;

    println!("=== Sales DW Extractor ===");
    println!("Snapshot: {}", args.snapshot_dir.display());
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let tables: Vec<&SourceTable> = match &args.table {
        Some(name) => {
            let table = SOURCE_TABLES
                .iter()
                .find(|t| t.name == name)
                .with_context(|| {
                    let known: Vec<&str> = SOURCE_TABLES.iter().map(|t| t.name).collect();
                    format!("Unknown source table '{}'. Known tables: {:?}", name, known)
                })?;
            vec![table]
        }
        None => SOURCE_TABLES.iter().collect(),
    };

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("Failed to connect to warehouse database")?;

    let job_run_id = if !args.dry_run {
        Some(create_job_run(&pool, "extract").await?)
    } else {
        None
    };

    let result = async {
        let mut total_rows = 0usize;
        let mut file_hashes = serde_json::Map::new();

        for table in &tables {
            println!("\n[{}] -> staging.{}", table.name, table.staging_table);
            let (rows, hash) = extract_table(&pool, &args.snapshot_dir, table, args.dry_run).await?;
            total_rows += rows;
            file_hashes.insert(table.name.to_string(), serde_json::json!(hash));
        }

        Ok::<(usize, serde_json::Value), anyhow::Error>((
            total_rows,
            serde_json::Value::Object(file_hashes),
        ))
    }
    .await;

    if let Some(job_id) = job_run_id {
        match &result {
            Ok((total, hashes)) => {
                finish_job_run(
                    &pool,
                    job_id,
                    "ok",
                    None,
                    serde_json::json!({ "tables": tables.len(), "rows": total, "snapshot_hashes": hashes }),
                )
                .await?;
            }
            Err(e) => {
                finish_job_run(
                    &pool,
                    job_id,
                    "failed",
                    Some(&e.to_string()),
                    serde_json::json!({}),
                )
                .await?;
            }
        }
    }

    let (total_rows, _) = result?;

    println!("\n=== Extraction Complete ===");
    println!("Tables: {}", tables.len());
    println!("Rows staged: {}", total_rows);
    println!("Ready for loading: cargo run --bin loader -- --task all");

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
