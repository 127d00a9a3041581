//! Loader Service - Transforms staged rows into the dimensional warehouse
//!
//! Responsibilities:
//! - Ensure the warehouse schema (dw.*) and audit schema (etl.*) exist
//! - Generate the date dimension over a fixed calendar range
//! - Resolve the five business dimensions (type-1 upsert by natural key,
//!   surrogate keys assigned once and never reused)
//! - Compute per-line financial metrics with decimal arithmetic
//! - Load the sales fact table in idempotent, independently re-runnable chunks
//!
//! CRITICAL: re-running any task against the same extraction snapshot must
//! leave the warehouse identical except for load-timestamp bookkeeping.
//!
//! Usage:
//!   cargo run --bin loader -- --task all
//!   cargo run --bin loader -- --task dates --from 2008-01-01 --to 2030-12-31
//!   cargo run --bin loader -- --task dimensions --dimension product
//!   cargo run --bin loader -- --task facts --chunk-size 5000

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use clap::Parser;
use rust_decimal::Decimal;
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "loader", about = "Transforms staged rows into the dimensional warehouse")]
struct Args {
    /// Pipeline task to run (each task is idempotent)
    #[arg(long, value_enum)]
    task: Task,

    /// Start of the date dimension range (inclusive)
    #[arg(long, default_value = "2008-01-01")]
    from: NaiveDate,

    /// End of the date dimension range (inclusive)
    #[arg(long, default_value = "2030-12-31")]
    to: NaiveDate,

    /// Path to the holiday set config (JSON); omitted = no holidays flagged
    #[arg(long)]
    holidays: Option<PathBuf>,

    /// Restrict the dimensions task to a single dimension
    #[arg(long, value_enum)]
    dimension: Option<DimensionKind>,

    /// Fact rows per chunk (overrides CHUNK_SIZE env var, default 5000)
    #[arg(long)]
    chunk_size: Option<i64>,

    /// Dry run - read, coerce and compute without writing to the warehouse
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, clap::ValueEnum)]
enum Task {
    /// Create warehouse tables if missing
    Schema,
    /// Generate the date dimension for --from..--to
    Dates,
    /// Resolve business dimensions from staging
    Dimensions,
    /// Load the sales fact table from staging
    Facts,
    /// Everything, in dependency order
    All,
}

#[derive(Clone, Copy, Debug, PartialEq, clap::ValueEnum)]
enum DimensionKind {
    Customer,
    Product,
    Territory,
    Salesperson,
    Promotion,
}

const DEFAULT_CHUNK_SIZE: i64 = 5000;

// =============================================================================
// Warehouse schema
// =============================================================================
// The loader owns the DDL. Everything is CREATE ... IF NOT EXISTS so the
// schema task is safe to re-run; there is no migration story (out of scope).

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS dw",
    "CREATE SCHEMA IF NOT EXISTS etl",
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
    r#"
    CREATE TABLE IF NOT EXISTS dw.dim_date (
        date_sk INT PRIMARY KEY,
        full_date DATE UNIQUE NOT NULL,
        year SMALLINT NOT NULL,
        quarter SMALLINT NOT NULL,
        month SMALLINT NOT NULL,
        day SMALLINT NOT NULL,
        iso_week SMALLINT NOT NULL,
        weekday SMALLINT NOT NULL,
        month_name TEXT NOT NULL,
        weekday_name TEXT NOT NULL,
        is_weekend BOOLEAN NOT NULL,
        is_holiday BOOLEAN NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dw.dim_customer (
        customer_sk BIGSERIAL PRIMARY KEY,
        customer_nk INT UNIQUE NOT NULL,
        first_name TEXT NOT NULL,
        last_name TEXT NOT NULL,
        full_name TEXT NOT NULL,
        customer_type TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dw.dim_product (
        product_sk BIGSERIAL PRIMARY KEY,
        product_nk INT UNIQUE NOT NULL,
        product_name TEXT NOT NULL,
        product_number TEXT NOT NULL,
        category_name TEXT NOT NULL,
        subcategory_name TEXT NOT NULL,
        product_line TEXT NOT NULL,
        color TEXT NOT NULL,
        size TEXT NOT NULL,
        standard_cost NUMERIC(19,4) NOT NULL,
        list_price NUMERIC(19,4) NOT NULL,
        margin_pct NUMERIC(9,2) NOT NULL,
        sell_start_date DATE,
        sell_end_date DATE,
        is_active BOOLEAN NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dw.dim_territory (
        territory_sk BIGSERIAL PRIMARY KEY,
        territory_nk INT UNIQUE NOT NULL,
        territory_name TEXT NOT NULL,
        country_code TEXT NOT NULL,
        country_name TEXT NOT NULL,
        territory_group TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dw.dim_salesperson (
        salesperson_sk BIGSERIAL PRIMARY KEY,
        salesperson_nk INT UNIQUE NOT NULL,
        salesperson_name TEXT NOT NULL,
        territory_sk BIGINT REFERENCES dw.dim_territory (territory_sk),
        hire_date DATE,
        sales_quota NUMERIC(19,4) NOT NULL,
        commission_pct NUMERIC(9,2) NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dw.dim_promotion (
        promotion_sk BIGSERIAL PRIMARY KEY,
        promotion_nk INT UNIQUE NOT NULL,
        description TEXT NOT NULL,
        promotion_type TEXT NOT NULL,
        discount_pct NUMERIC(9,2) NOT NULL,
        start_date DATE,
        end_date DATE,
        min_qty INT NOT NULL,
        max_qty INT,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dw.fact_sales (
        order_number INT NOT NULL,
        line_number INT NOT NULL,
        date_sk INT NOT NULL REFERENCES dw.dim_date (date_sk),
        customer_sk BIGINT NOT NULL REFERENCES dw.dim_customer (customer_sk),
        product_sk BIGINT NOT NULL REFERENCES dw.dim_product (product_sk),
        territory_sk BIGINT REFERENCES dw.dim_territory (territory_sk),
        salesperson_sk BIGINT REFERENCES dw.dim_salesperson (salesperson_sk),
        promotion_sk BIGINT REFERENCES dw.dim_promotion (promotion_sk),
        quantity INT NOT NULL,
        unit_price NUMERIC(19,4) NOT NULL,
        gross_amount NUMERIC(19,4) NOT NULL,
        discount_amount NUMERIC(19,4) NOT NULL,
        net_amount NUMERIC(19,4) NOT NULL,
        total_cost NUMERIC(19,4) NOT NULL,
        gross_profit NUMERIC(19,4) NOT NULL,
        discount_pct NUMERIC(9,2) NOT NULL,
        margin_pct NUMERIC(9,2),
        loaded_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (order_number, line_number)
    )
    "#,
];

async fn ensure_warehouse_schema(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA_STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("Failed to apply warehouse schema")?;
    }
    Ok(())
}

// =============================================================================
// Job run bookkeeping
// =============================================================================

async fn create_job_run(pool: &PgPool, task: &str) -> Result<Uuid> {
    let job_run_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO etl.job_runs (job_run_id, component, task, status, detail)
        VALUES ($1, 'loader', $2, 'running', '{}')
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
// Row-level error aggregation
// =============================================================================
// Coercion problems never abort a batch: each offending row is recorded with
// its natural key and reason, and the run continues with the remaining rows.

#[derive(Debug, Clone, PartialEq)]
struct RowError {
    key: String,
    reason: String,
}

impl RowError {
    fn new(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

fn print_rejections(label: &str, rejected: &[RowError]) {
    if rejected.is_empty() {
        return;
    }
    println!("  {} rejected {} row(s):", label, rejected.len());
    for err in rejected.iter().take(5) {
        println!("    [{}] {}", err.key, err.reason);
    }
    if rejected.len() > 5 {
        println!("    ... and {} more", rejected.len() - 5);
    }
}

// =============================================================================
// Type coercion helpers
// =============================================================================
// Staging columns are raw TEXT (empty cell = NULL). These helpers turn them
// into typed values, carrying the offending value in the error message so
// rejections are attributable.

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn text_or(value: &Option<String>, default: &str) -> String {
    non_empty(value).unwrap_or(default).to_string()
}

fn req_i32(value: &Option<String>, field: &str) -> Result<i32, String> {
    let s = non_empty(value).ok_or_else(|| format!("missing required field '{}'", field))?;
    s.parse::<i32>()
        .map_err(|_| format!("field '{}': cannot convert '{}' to integer", field, s))
}

fn opt_i32(value: &Option<String>, field: &str) -> Result<Option<i32>, String> {
    match non_empty(value) {
        Some(s) => s
            .parse::<i32>()
            .map(Some)
            .map_err(|_| format!("field '{}': cannot convert '{}' to integer", field, s)),
        None => Ok(None),
    }
}

fn req_decimal(value: &Option<String>, field: &str) -> Result<Decimal, String> {
    let s = non_empty(value).ok_or_else(|| format!("missing required field '{}'", field))?;
    s.parse::<Decimal>()
        .map_err(|_| format!("field '{}': cannot convert '{}' to decimal", field, s))
}

fn opt_decimal(value: &Option<String>, field: &str) -> Result<Option<Decimal>, String> {
    match non_empty(value) {
        Some(s) => s
            .parse::<Decimal>()
            .map(Some)
            .map_err(|_| format!("field '{}': cannot convert '{}' to decimal", field, s)),
        None => Ok(None),
    }
}

/// Dates in snapshots arrive either bare or with a time component
fn parse_date_value(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.date())
        })
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|dt| dt.date())
        })
}

fn req_date(value: &Option<String>, field: &str) -> Result<NaiveDate, String> {
    let s = non_empty(value).ok_or_else(|| format!("missing required field '{}'", field))?;
    parse_date_value(s).ok_or_else(|| format!("field '{}': cannot convert '{}' to date", field, s))
}

fn opt_date(value: &Option<String>, field: &str) -> Result<Option<NaiveDate>, String> {
    match non_empty(value) {
        Some(s) => parse_date_value(s)
            .map(Some)
            .ok_or_else(|| format!("field '{}': cannot convert '{}' to date", field, s)),
        None => Ok(None),
    }
}

// =============================================================================
// Date dimension
// =============================================================================
// Every attribute is a pure function of the calendar date, except the holiday
// flag which comes from an externally supplied config (never computed). The
// surrogate key is the YYYYMMDD encoding so fact loads resolve it without a
// lookup.

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// Indexed by days-from-Sunday, matching the stored weekday number
const WEEKDAY_NAMES: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

#[derive(Debug, Deserialize)]
struct HolidayConfig {
    #[serde(default)]
    version: String,
    holidays: Vec<NaiveDate>,
}

async fn load_holiday_set(path: Option<&Path>) -> Result<HashSet<NaiveDate>> {
    let Some(path) = path else {
        println!("No holiday config supplied - no dates flagged as holidays");
        return Ok(HashSet::new());
    };

    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read holiday config: {}", path.display()))?;
    let config: HolidayConfig =
        serde_json::from_str(&content).context("Failed to parse holiday config")?;

    println!(
        "Holiday config: version '{}', {} dates",
        config.version,
        config.holidays.len()
    );

    Ok(config.holidays.into_iter().collect())
}

#[derive(Debug, Clone, PartialEq)]
struct DateRow {
    date_sk: i32,
    full_date: NaiveDate,
    year: i16,
    quarter: i16,
    month: i16,
    day: i16,
    iso_week: i16,
    weekday: i16,
    month_name: &'static str,
    weekday_name: &'static str,
    is_weekend: bool,
    is_holiday: bool,
}

/// Deterministic YYYYMMDD surrogate key for a calendar date
fn date_sk_for(date: NaiveDate) -> i32 {
    date.year() * 10_000 + date.month() as i32 * 100 + date.day() as i32
}

fn date_row(date: NaiveDate, holidays: &HashSet<NaiveDate>) -> DateRow {
    let weekday = date.weekday().num_days_from_sunday() as i16;
    let month = date.month() as i16;
    DateRow {
        date_sk: date_sk_for(date),
        full_date: date,
        year: date.year() as i16,
        quarter: (month - 1) / 3 + 1,
        month,
        day: date.day() as i16,
        iso_week: date.iso_week().week() as i16,
        weekday,
        month_name: MONTH_NAMES[(month - 1) as usize],
        weekday_name: WEEKDAY_NAMES[weekday as usize],
        is_weekend: weekday == 0 || weekday == 6,
        is_holiday: holidays.contains(&date),
    }
}

/// One row per calendar day over the inclusive range, no gaps, no duplicates.
/// Fails only on an inverted range.
fn build_date_rows(
    from: NaiveDate,
    to: NaiveDate,
    holidays: &HashSet<NaiveDate>,
) -> Result<Vec<DateRow>> {
    if to < from {
        anyhow::bail!("Invalid date range: end {} is before start {}", to, from);
    }

    let mut rows = Vec::with_capacity((to - from).num_days() as usize + 1);
    let mut current = from;
    while current <= to {
        rows.push(date_row(current, holidays));
        current = current
            .succ_opt()
            .context("Date range exceeds the supported calendar")?;
    }

    Ok(rows)
}

/// Upsert the generated calendar. Date rows are immutable, so replays hit
/// ON CONFLICT DO NOTHING and leave the table untouched.
async fn load_date_dimension(
    pool: &PgPool,
    from: NaiveDate,
    to: NaiveDate,
    holidays: &HashSet<NaiveDate>,
    dry_run: bool,
) -> Result<(usize, u64)> {
    let rows = build_date_rows(from, to, holidays)?;
    println!("Generated {} calendar rows ({} .. {})", rows.len(), from, to);

    if dry_run {
        println!("Dry run - dw.dim_date not touched");
        return Ok((rows.len(), 0));
    }

    let mut tx = pool.begin().await?;
    let mut inserted = 0u64;
    for row in &rows {
        let result = sqlx::query(
            r#"
            INSERT INTO dw.dim_date (
                date_sk, full_date, year, quarter, month, day,
                iso_week, weekday, month_name, weekday_name,
                is_weekend, is_holiday
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (date_sk) DO NOTHING
            "#,
        )
        .bind(row.date_sk)
        .bind(row.full_date)
        .bind(row.year)
        .bind(row.quarter)
        .bind(row.month)
        .bind(row.day)
        .bind(row.iso_week)
        .bind(row.weekday)
        .bind(row.month_name)
        .bind(row.weekday_name)
        .bind(row.is_weekend)
        .bind(row.is_holiday)
        .execute(&mut *tx)
        .await?;
        inserted += result.rows_affected();
    }
    tx.commit().await?;

    println!("dw.dim_date: {} new rows, {} already present", inserted, rows.len() as u64 - inserted);
    Ok((rows.len(), inserted))
}

// =============================================================================
// Dimension resolvers
// =============================================================================
// One resolver per business dimension, all following the same pattern:
// read the denormalized staging join as raw TEXT, coerce per row (rejects
// recorded, never thrown), then a single upsert statement per natural key.
// The DO UPDATE carries a distinctness guard so an unchanged row is not
// rewritten and keeps its updated_at; RETURNING yields no row in that case
// and the surrogate key is read back with a plain lookup. Attributes are
// type-1: overwritten only when changed, surrogate key untouched.

type KeyMap = HashMap<i32, i64>;

#[derive(Debug)]
struct DimensionOutcome {
    dimension: &'static str,
    upserted: usize,
    rejected: Vec<RowError>,
}

impl DimensionOutcome {
    fn summarize(&self) {
        println!(
            "  dim_{}: {} rows upserted, {} rejected",
            self.dimension,
            self.upserted,
            self.rejected.len()
        );
        print_rejections(self.dimension, &self.rejected);
    }

    fn detail(&self) -> serde_json::Value {
        serde_json::json!({
            "dimension": self.dimension,
            "upserted": self.upserted,
            "rejected": self.rejected.len(),
        })
    }
}

// -----------------------------------------------------------------------------
// Customer
// -----------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct CustomerStagingRow {
    customer_id: Option<String>,
    person_id: Option<String>,
    store_id: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
}

#[derive(Debug)]
struct CustomerRecord {
    nk: i32,
    first_name: String,
    last_name: String,
    full_name: String,
    customer_type: String,
}

fn coerce_customer(row: &CustomerStagingRow) -> Result<CustomerRecord, String> {
    let nk = req_i32(&row.customer_id, "CustomerID")?;

    let first_name = text_or(&row.first_name, "");
    let last_name = text_or(&row.last_name, "");
    let full_name = if first_name.is_empty() && last_name.is_empty() {
        format!("Customer {}", nk)
    } else {
        format!("{} {}", first_name, last_name).trim().to_string()
    };

    let customer_type = if non_empty(&row.person_id).is_some() {
        "Individual"
    } else if non_empty(&row.store_id).is_some() {
        "Store"
    } else {
        "Unknown"
    };

    Ok(CustomerRecord {
        nk,
        first_name,
        last_name,
        full_name,
        customer_type: customer_type.to_string(),
    })
}

const CUSTOMER_UPSERT_SQL: &str = r#"
    INSERT INTO dw.dim_customer AS d (customer_nk, first_name, last_name, full_name, customer_type)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (customer_nk) DO UPDATE SET
        first_name = EXCLUDED.first_name,
        last_name = EXCLUDED.last_name,
        full_name = EXCLUDED.full_name,
        customer_type = EXCLUDED.customer_type,
        updated_at = now()
    WHERE (d.first_name, d.last_name, d.full_name, d.customer_type)
        IS DISTINCT FROM
        (EXCLUDED.first_name, EXCLUDED.last_name, EXCLUDED.full_name, EXCLUDED.customer_type)
    RETURNING customer_sk
"#;

async fn load_customer_dimension(
    pool: &PgPool,
    dry_run: bool,
) -> Result<(DimensionOutcome, KeyMap)> {
    let rows: Vec<CustomerStagingRow> = sqlx::query_as(
        r#"
        SELECT c."CustomerID" AS customer_id,
               c."PersonID" AS person_id,
               c."StoreID" AS store_id,
               p."FirstName" AS first_name,
               p."LastName" AS last_name
        FROM staging.stage_customers c
        LEFT JOIN staging.stage_persons p ON p."BusinessEntityID" = c."PersonID"
        ORDER BY c."CustomerID"
        "#,
    )
    .fetch_all(pool)
    .await
    .context("Failed to read customer staging rows")?;

    let mut rejected = Vec::new();
    let mut seen: HashSet<i32> = HashSet::new();
    let mut records = Vec::with_capacity(rows.len());
    for row in &rows {
        match coerce_customer(row) {
            Ok(record) => {
                if seen.insert(record.nk) {
                    records.push(record);
                }
            }
            Err(reason) => rejected.push(RowError::new(
                non_empty(&row.customer_id).unwrap_or("<null>"),
                reason,
            )),
        }
    }

    let mut key_map = KeyMap::new();
    if !dry_run {
        let mut tx = pool.begin().await?;
        for record in &records {
            let upserted: Option<(i64,)> = sqlx::query_as(CUSTOMER_UPSERT_SQL)
                .bind(record.nk)
                .bind(&record.first_name)
                .bind(&record.last_name)
                .bind(&record.full_name)
                .bind(&record.customer_type)
                .fetch_optional(&mut *tx)
                .await?;
            let sk = match upserted {
                Some((sk,)) => sk,
                // Guard skipped the update: row unchanged, read the key back
                None => {
                    let (sk,): (i64,) = sqlx::query_as(
                        "SELECT customer_sk FROM dw.dim_customer WHERE customer_nk = $1",
                    )
                    .bind(record.nk)
                    .fetch_one(&mut *tx)
                    .await?;
                    sk
                }
            };
            key_map.insert(record.nk, sk);
        }
        tx.commit().await?;
    }

    Ok((
        DimensionOutcome {
            dimension: "customer",
            upserted: records.len(),
            rejected,
        },
        key_map,
    ))
}

// -----------------------------------------------------------------------------
// Product
// -----------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct ProductStagingRow {
    product_id: Option<String>,
    product_name: Option<String>,
    product_number: Option<String>,
    category_name: Option<String>,
    subcategory_name: Option<String>,
    product_line: Option<String>,
    color: Option<String>,
    size: Option<String>,
    standard_cost: Option<String>,
    list_price: Option<String>,
    sell_start_date: Option<String>,
    sell_end_date: Option<String>,
}

#[derive(Debug)]
struct ProductRecord {
    nk: i32,
    product_name: String,
    product_number: String,
    category_name: String,
    subcategory_name: String,
    product_line: String,
    color: String,
    size: String,
    standard_cost: Decimal,
    list_price: Decimal,
    margin_pct: Decimal,
    sell_start_date: Option<NaiveDate>,
    sell_end_date: Option<NaiveDate>,
    is_active: bool,
}

fn coerce_product(row: &ProductStagingRow) -> Result<ProductRecord, String> {
    let nk = req_i32(&row.product_id, "ProductID")?;
    let standard_cost = opt_decimal(&row.standard_cost, "StandardCost")?.unwrap_or(Decimal::ZERO);
    let list_price = opt_decimal(&row.list_price, "ListPrice")?.unwrap_or(Decimal::ZERO);
    let sell_start_date = opt_date(&row.sell_start_date, "SellStartDate")?;
    let sell_end_date = opt_date(&row.sell_end_date, "SellEndDate")?;

    // List-vs-cost margin, kept on the dimension for category-level reporting
    let margin_pct = if list_price > Decimal::ZERO {
        ((list_price - standard_cost) / list_price * Decimal::ONE_HUNDRED).round_dp(2)
    } else {
        Decimal::ZERO
    };

    Ok(ProductRecord {
        nk,
        product_name: text_or(&row.product_name, "Unknown Product"),
        product_number: text_or(&row.product_number, ""),
        category_name: text_or(&row.category_name, "No Category"),
        subcategory_name: text_or(&row.subcategory_name, "No Subcategory"),
        product_line: text_or(&row.product_line, "N/A"),
        color: text_or(&row.color, "N/A"),
        size: text_or(&row.size, "N/A"),
        standard_cost,
        list_price,
        margin_pct,
        sell_start_date,
        sell_end_date,
        is_active: sell_end_date.is_none(),
    })
}

/// Product key map carries the unit cost alongside the surrogate key:
/// the fact loader needs it as a metric input.
type ProductMap = HashMap<i32, (i64, Decimal)>;

const PRODUCT_UPSERT_SQL: &str = r#"
    INSERT INTO dw.dim_product AS d (
        product_nk, product_name, product_number, category_name,
        subcategory_name, product_line, color, size,
        standard_cost, list_price, margin_pct,
        sell_start_date, sell_end_date, is_active
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
    ON CONFLICT (product_nk) DO UPDATE SET
        product_name = EXCLUDED.product_name,
        product_number = EXCLUDED.product_number,
        category_name = EXCLUDED.category_name,
        subcategory_name = EXCLUDED.subcategory_name,
        product_line = EXCLUDED.product_line,
        color = EXCLUDED.color,
        size = EXCLUDED.size,
        standard_cost = EXCLUDED.standard_cost,
        list_price = EXCLUDED.list_price,
        margin_pct = EXCLUDED.margin_pct,
        sell_start_date = EXCLUDED.sell_start_date,
        sell_end_date = EXCLUDED.sell_end_date,
        is_active = EXCLUDED.is_active,
        updated_at = now()
    WHERE (d.product_name, d.product_number, d.category_name, d.subcategory_name,
           d.product_line, d.color, d.size, d.standard_cost, d.list_price,
           d.margin_pct, d.sell_start_date, d.sell_end_date, d.is_active)
        IS DISTINCT FROM
        (EXCLUDED.product_name, EXCLUDED.product_number, EXCLUDED.category_name,
         EXCLUDED.subcategory_name, EXCLUDED.product_line, EXCLUDED.color,
         EXCLUDED.size, EXCLUDED.standard_cost, EXCLUDED.list_price,
         EXCLUDED.margin_pct, EXCLUDED.sell_start_date, EXCLUDED.sell_end_date,
         EXCLUDED.is_active)
    RETURNING product_sk
"#;

async fn load_product_dimension(
    pool: &PgPool,
    dry_run: bool,
) -> Result<(DimensionOutcome, ProductMap)> {
    let rows: Vec<ProductStagingRow> = sqlx::query_as(
        r#"
        SELECT p."ProductID" AS product_id,
               p."Name" AS product_name,
               p."ProductNumber" AS product_number,
               pc."Name" AS category_name,
               psc."Name" AS subcategory_name,
               p."ProductLine" AS product_line,
               p."Color" AS color,
               p."Size" AS size,
               p."StandardCost" AS standard_cost,
               p."ListPrice" AS list_price,
               p."SellStartDate" AS sell_start_date,
               p."SellEndDate" AS sell_end_date
        FROM staging.stage_products p
        LEFT JOIN staging.stage_subcategories psc
            ON psc."ProductSubcategoryID" = p."ProductSubcategoryID"
        LEFT JOIN staging.stage_categories pc
            ON pc."ProductCategoryID" = psc."ProductCategoryID"
        ORDER BY p."ProductID"
        "#,
    )
    .fetch_all(pool)
    .await
    .context("Failed to read product staging rows")?;

    let mut rejected = Vec::new();
    let mut seen: HashSet<i32> = HashSet::new();
    let mut records = Vec::with_capacity(rows.len());
    for row in &rows {
        match coerce_product(row) {
            Ok(record) => {
                if seen.insert(record.nk) {
                    records.push(record);
                }
            }
            Err(reason) => rejected.push(RowError::new(
                non_empty(&row.product_id).unwrap_or("<null>"),
                reason,
            )),
        }
    }

    let mut key_map = ProductMap::new();
    if !dry_run {
        let mut tx = pool.begin().await?;
        for record in &records {
            let upserted: Option<(i64,)> = sqlx::query_as(PRODUCT_UPSERT_SQL)
                .bind(record.nk)
                .bind(&record.product_name)
                .bind(&record.product_number)
                .bind(&record.category_name)
                .bind(&record.subcategory_name)
                .bind(&record.product_line)
                .bind(&record.color)
                .bind(&record.size)
                .bind(record.standard_cost)
                .bind(record.list_price)
                .bind(record.margin_pct)
                .bind(record.sell_start_date)
                .bind(record.sell_end_date)
                .bind(record.is_active)
                .fetch_optional(&mut *tx)
                .await?;
            let sk = match upserted {
                Some((sk,)) => sk,
                None => {
                    let (sk,): (i64,) = sqlx::query_as(
                        "SELECT product_sk FROM dw.dim_product WHERE product_nk = $1",
                    )
                    .bind(record.nk)
                    .fetch_one(&mut *tx)
                    .await?;
                    sk
                }
            };
            key_map.insert(record.nk, (sk, record.standard_cost));
        }
        tx.commit().await?;
    }

    Ok((
        DimensionOutcome {
            dimension: "product",
            upserted: records.len(),
            rejected,
        },
        key_map,
    ))
}

// -----------------------------------------------------------------------------
// Territory
// -----------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct TerritoryStagingRow {
    territory_id: Option<String>,
    territory_name: Option<String>,
    country_code: Option<String>,
    country_name: Option<String>,
    territory_group: Option<String>,
}

#[derive(Debug)]
struct TerritoryRecord {
    nk: i32,
    territory_name: String,
    country_code: String,
    country_name: String,
    territory_group: String,
}

fn coerce_territory(row: &TerritoryStagingRow) -> Result<TerritoryRecord, String> {
    let nk = req_i32(&row.territory_id, "TerritoryID")?;
    let country_code = text_or(&row.country_code, "??");
    Ok(TerritoryRecord {
        nk,
        territory_name: text_or(&row.territory_name, "Unknown Territory"),
        country_name: text_or(&row.country_name, &country_code),
        country_code,
        territory_group: text_or(&row.territory_group, "Other"),
    })
}

const TERRITORY_UPSERT_SQL: &str = r#"
    INSERT INTO dw.dim_territory AS d (
        territory_nk, territory_name, country_code, country_name, territory_group
    )
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (territory_nk) DO UPDATE SET
        territory_name = EXCLUDED.territory_name,
        country_code = EXCLUDED.country_code,
        country_name = EXCLUDED.country_name,
        territory_group = EXCLUDED.territory_group,
        updated_at = now()
    WHERE (d.territory_name, d.country_code, d.country_name, d.territory_group)
        IS DISTINCT FROM
        (EXCLUDED.territory_name, EXCLUDED.country_code, EXCLUDED.country_name,
         EXCLUDED.territory_group)
    RETURNING territory_sk
"#;

async fn load_territory_dimension(
    pool: &PgPool,
    dry_run: bool,
) -> Result<(DimensionOutcome, KeyMap)> {
    let rows: Vec<TerritoryStagingRow> = sqlx::query_as(
        r#"
        SELECT t."TerritoryID" AS territory_id,
               t."Name" AS territory_name,
               t."CountryRegionCode" AS country_code,
               cr."Name" AS country_name,
               t."Group" AS territory_group
        FROM staging.stage_territories t
        LEFT JOIN staging.stage_countries cr
            ON cr."CountryRegionCode" = t."CountryRegionCode"
        ORDER BY t."TerritoryID"
        "#,
    )
    .fetch_all(pool)
    .await
    .context("Failed to read territory staging rows")?;

    let mut rejected = Vec::new();
    let mut seen: HashSet<i32> = HashSet::new();
    let mut records = Vec::with_capacity(rows.len());
    for row in &rows {
        match coerce_territory(row) {
            Ok(record) => {
                if seen.insert(record.nk) {
                    records.push(record);
                }
            }
            Err(reason) => rejected.push(RowError::new(
                non_empty(&row.territory_id).unwrap_or("<null>"),
                reason,
            )),
        }
    }

    let mut key_map = KeyMap::new();
    if !dry_run {
        let mut tx = pool.begin().await?;
        for record in &records {
            let upserted: Option<(i64,)> = sqlx::query_as(TERRITORY_UPSERT_SQL)
                .bind(record.nk)
                .bind(&record.territory_name)
                .bind(&record.country_code)
                .bind(&record.country_name)
                .bind(&record.territory_group)
                .fetch_optional(&mut *tx)
                .await?;
            let sk = match upserted {
                Some((sk,)) => sk,
                None => {
                    let (sk,): (i64,) = sqlx::query_as(
                        "SELECT territory_sk FROM dw.dim_territory WHERE territory_nk = $1",
                    )
                    .bind(record.nk)
                    .fetch_one(&mut *tx)
                    .await?;
                    sk
                }
            };
            key_map.insert(record.nk, sk);
        }
        tx.commit().await?;
    }

    Ok((
        DimensionOutcome {
            dimension: "territory",
            upserted: records.len(),
            rejected,
        },
        key_map,
    ))
}

// -----------------------------------------------------------------------------
// Salesperson
// -----------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct SalespersonStagingRow {
    salesperson_id: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    hire_date: Option<String>,
    territory_id: Option<String>,
    sales_quota: Option<String>,
    commission_pct: Option<String>,
}

#[derive(Debug)]
struct SalespersonRecord {
    nk: i32,
    salesperson_name: String,
    territory_sk: Option<i64>,
    hire_date: Option<NaiveDate>,
    sales_quota: Decimal,
    commission_pct: Decimal,
}

fn coerce_salesperson(
    row: &SalespersonStagingRow,
    territory_map: &KeyMap,
) -> Result<SalespersonRecord, String> {
    let nk = req_i32(&row.salesperson_id, "BusinessEntityID")?;

    let first_name = text_or(&row.first_name, "");
    let last_name = text_or(&row.last_name, "");
    let salesperson_name = if first_name.is_empty() && last_name.is_empty() {
        format!("Salesperson {}", nk)
    } else {
        format!("{} {}", first_name, last_name).trim().to_string()
    };

    // Dim-to-dim reference: an unresolvable territory stays NULL, it is an
    // attribute of the salesperson, not a fact foreign key
    let territory_sk = opt_i32(&row.territory_id, "TerritoryID")?
        .and_then(|nk| territory_map.get(&nk).copied());

    // Source supplies the commission as a fraction; stored as a percentage
    let commission_pct = opt_decimal(&row.commission_pct, "CommissionPct")?
        .map(|f| (f * Decimal::ONE_HUNDRED).round_dp(2))
        .unwrap_or(Decimal::ZERO);

    Ok(SalespersonRecord {
        nk,
        salesperson_name,
        territory_sk,
        hire_date: opt_date(&row.hire_date, "HireDate")?,
        sales_quota: opt_decimal(&row.sales_quota, "SalesQuota")?.unwrap_or(Decimal::ZERO),
        commission_pct,
    })
}

const SALESPERSON_UPSERT_SQL: &str = r#"
    INSERT INTO dw.dim_salesperson AS d (
        salesperson_nk, salesperson_name, territory_sk,
        hire_date, sales_quota, commission_pct
    )
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (salesperson_nk) DO UPDATE SET
        salesperson_name = EXCLUDED.salesperson_name,
        territory_sk = EXCLUDED.territory_sk,
        hire_date = EXCLUDED.hire_date,
        sales_quota = EXCLUDED.sales_quota,
        commission_pct = EXCLUDED.commission_pct,
        updated_at = now()
    WHERE (d.salesperson_name, d.territory_sk, d.hire_date, d.sales_quota, d.commission_pct)
        IS DISTINCT FROM
        (EXCLUDED.salesperson_name, EXCLUDED.territory_sk, EXCLUDED.hire_date,
         EXCLUDED.sales_quota, EXCLUDED.commission_pct)
    RETURNING salesperson_sk
"#;

async fn load_salesperson_dimension(
    pool: &PgPool,
    territory_map: &KeyMap,
    dry_run: bool,
) -> Result<(DimensionOutcome, KeyMap)> {
    let rows: Vec<SalespersonStagingRow> = sqlx::query_as(
        r#"
        SELECT sp."BusinessEntityID" AS salesperson_id,
               p."FirstName" AS first_name,
               p."LastName" AS last_name,
               e."HireDate" AS hire_date,
               sp."TerritoryID" AS territory_id,
               sp."SalesQuota" AS sales_quota,
               sp."CommissionPct" AS commission_pct
        FROM staging.stage_salespersons sp
        LEFT JOIN staging.stage_employees e ON e."BusinessEntityID" = sp."BusinessEntityID"
        LEFT JOIN staging.stage_persons p ON p."BusinessEntityID" = sp."BusinessEntityID"
        ORDER BY sp."BusinessEntityID"
        "#,
    )
    .fetch_all(pool)
    .await
    .context("Failed to read salesperson staging rows")?;

    let mut rejected = Vec::new();
    let mut seen: HashSet<i32> = HashSet::new();
    let mut records = Vec::with_capacity(rows.len());
    for row in &rows {
        match coerce_salesperson(row, territory_map) {
            Ok(record) => {
                if seen.insert(record.nk) {
                    records.push(record);
                }
            }
            Err(reason) => rejected.push(RowError::new(
                non_empty(&row.salesperson_id).unwrap_or("<null>"),
                reason,
            )),
        }
    }

    let mut key_map = KeyMap::new();
    if !dry_run {
        let mut tx = pool.begin().await?;
        for record in &records {
            let upserted: Option<(i64,)> = sqlx::query_as(SALESPERSON_UPSERT_SQL)
                .bind(record.nk)
                .bind(&record.salesperson_name)
                .bind(record.territory_sk)
                .bind(record.hire_date)
                .bind(record.sales_quota)
                .bind(record.commission_pct)
                .fetch_optional(&mut *tx)
                .await?;
            let sk = match upserted {
                Some((sk,)) => sk,
                None => {
                    let (sk,): (i64,) = sqlx::query_as(
                        "SELECT salesperson_sk FROM dw.dim_salesperson WHERE salesperson_nk = $1",
                    )
                    .bind(record.nk)
                    .fetch_one(&mut *tx)
                    .await?;
                    sk
                }
            };
            key_map.insert(record.nk, sk);
        }
        tx.commit().await?;
    }

    Ok((
        DimensionOutcome {
            dimension: "salesperson",
            upserted: records.len(),
            rejected,
        },
        key_map,
    ))
}

// -----------------------------------------------------------------------------
// Promotion
// -----------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct PromotionStagingRow {
    promotion_id: Option<String>,
    description: Option<String>,
    promotion_type: Option<String>,
    discount_pct: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    min_qty: Option<String>,
    max_qty: Option<String>,
}

#[derive(Debug)]
struct PromotionRecord {
    nk: i32,
    description: String,
    promotion_type: String,
    discount_pct: Decimal,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    min_qty: i32,
    max_qty: Option<i32>,
}

fn coerce_promotion(row: &PromotionStagingRow) -> Result<PromotionRecord, String> {
    let nk = req_i32(&row.promotion_id, "SpecialOfferID")?;

    // Source supplies the discount as a fraction; stored as a percentage
    let discount_pct = opt_decimal(&row.discount_pct, "DiscountPct")?
        .map(|f| (f * Decimal::ONE_HUNDRED).round_dp(2))
        .unwrap_or(Decimal::ZERO);

    Ok(PromotionRecord {
        nk,
        description: text_or(&row.description, "Unknown Promotion"),
        promotion_type: text_or(&row.promotion_type, "N/A"),
        discount_pct,
        start_date: opt_date(&row.start_date, "StartDate")?,
        end_date: opt_date(&row.end_date, "EndDate")?,
        min_qty: opt_i32(&row.min_qty, "MinQty")?.unwrap_or(0),
        max_qty: opt_i32(&row.max_qty, "MaxQty")?,
    })
}

const PROMOTION_UPSERT_SQL: &str = r#"
    INSERT INTO dw.dim_promotion AS d (
        promotion_nk, description, promotion_type, discount_pct,
        start_date, end_date, min_qty, max_qty
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    ON CONFLICT (promotion_nk) DO UPDATE SET
        description = EXCLUDED.description,
        promotion_type = EXCLUDED.promotion_type,
        discount_pct = EXCLUDED.discount_pct,
        start_date = EXCLUDED.start_date,
        end_date = EXCLUDED.end_date,
        min_qty = EXCLUDED.min_qty,
        max_qty = EXCLUDED.max_qty,
        updated_at = now()
    WHERE (d.description, d.promotion_type, d.discount_pct, d.start_date,
           d.end_date, d.min_qty, d.max_qty)
        IS DISTINCT FROM
        (EXCLUDED.description, EXCLUDED.promotion_type, EXCLUDED.discount_pct,
         EXCLUDED.start_date, EXCLUDED.end_date, EXCLUDED.min_qty, EXCLUDED.max_qty)
    RETURNING promotion_sk
"#;

async fn load_promotion_dimension(
    pool: &PgPool,
    dry_run: bool,
) -> Result<(DimensionOutcome, KeyMap)> {
    let rows: Vec<PromotionStagingRow> = sqlx::query_as(
        r#"
        SELECT o."SpecialOfferID" AS promotion_id,
               o."Description" AS description,
               o."Type" AS promotion_type,
               o."DiscountPct" AS discount_pct,
               o."StartDate" AS start_date,
               o."EndDate" AS end_date,
               o."MinQty" AS min_qty,
               o."MaxQty" AS max_qty
        FROM staging.stage_offers o
        ORDER BY o."SpecialOfferID"
        "#,
    )
    .fetch_all(pool)
    .await
    .context("Failed to read promotion staging rows")?;

    let mut rejected = Vec::new();
    let mut seen: HashSet<i32> = HashSet::new();
    let mut records = Vec::with_capacity(rows.len());
    for row in &rows {
        match coerce_promotion(row) {
            Ok(record) => {
                if seen.insert(record.nk) {
                    records.push(record);
                }
            }
            Err(reason) => rejected.push(RowError::new(
                non_empty(&row.promotion_id).unwrap_or("<null>"),
                reason,
            )),
        }
    }

    let mut key_map = KeyMap::new();
    if !dry_run {
        let mut tx = pool.begin().await?;
        for record in &records {
            let upserted: Option<(i64,)> = sqlx::query_as(PROMOTION_UPSERT_SQL)
                .bind(record.nk)
                .bind(&record.description)
                .bind(&record.promotion_type)
                .bind(record.discount_pct)
                .bind(record.start_date)
                .bind(record.end_date)
                .bind(record.min_qty)
                .bind(record.max_qty)
                .fetch_optional(&mut *tx)
                .await?;
            let sk = match upserted {
                Some((sk,)) => sk,
                None => {
                    let (sk,): (i64,) = sqlx::query_as(
                        "SELECT promotion_sk FROM dw.dim_promotion WHERE promotion_nk = $1",
                    )
                    .bind(record.nk)
                    .fetch_one(&mut *tx)
                    .await?;
                    sk
                }
            };
            key_map.insert(record.nk, sk);
        }
        tx.commit().await?;
    }

    Ok((
        DimensionOutcome {
            dimension: "promotion",
            upserted: records.len(),
            rejected,
        },
        key_map,
    ))
}

// -----------------------------------------------------------------------------
// Published key maps
// -----------------------------------------------------------------------------

/// Natural-key -> surrogate-key maps published by the resolvers. Built fresh
/// per run and handed to the fact loader by value; a standalone facts task
/// re-reads them from the dimension tables (which are the published state).
#[derive(Debug, Default)]
struct KeyMaps {
    customer: KeyMap,
    product: ProductMap,
    territory: KeyMap,
    salesperson: KeyMap,
    promotion: KeyMap,
}

impl KeyMaps {
    async fn fetch(pool: &PgPool) -> Result<Self> {
        let customer: Vec<(i32, i64)> =
            sqlx::query_as("SELECT customer_nk, customer_sk FROM dw.dim_customer")
                .fetch_all(pool)
                .await?;
        let product: Vec<(i32, i64, Decimal)> =
            sqlx::query_as("SELECT product_nk, product_sk, standard_cost FROM dw.dim_product")
                .fetch_all(pool)
                .await?;
        let territory: Vec<(i32, i64)> =
            sqlx::query_as("SELECT territory_nk, territory_sk FROM dw.dim_territory")
                .fetch_all(pool)
                .await?;
        let salesperson: Vec<(i32, i64)> =
            sqlx::query_as("SELECT salesperson_nk, salesperson_sk FROM dw.dim_salesperson")
                .fetch_all(pool)
                .await?;
        let promotion: Vec<(i32, i64)> =
            sqlx::query_as("SELECT promotion_nk, promotion_sk FROM dw.dim_promotion")
                .fetch_all(pool)
                .await?;

        Ok(Self {
            customer: customer.into_iter().collect(),
            product: product.into_iter().map(|(nk, sk, cost)| (nk, (sk, cost))).collect(),
            territory: territory.into_iter().collect(),
            salesperson: salesperson.into_iter().collect(),
            promotion: promotion.into_iter().collect(),
        })
    }
}

// =============================================================================
// Metric calculator
// =============================================================================
// Pure decimal arithmetic over a single sales line. Currency is rounded to
// 4 decimal places at each stored step, percentages to 2, in a fixed order
// so replays and tests agree to the cent across 120K+ rows.

#[derive(Debug, Clone, Copy, PartialEq)]
enum Discount {
    /// Fraction of gross (e.g. 0.10 for 10%)
    Rate(Decimal),
    /// Absolute currency amount supplied by the source
    Amount(Decimal),
}

#[derive(Debug, Clone, PartialEq)]
struct LineMetrics {
    gross_amount: Decimal,
    discount_amount: Decimal,
    net_amount: Decimal,
    total_cost: Decimal,
    gross_profit: Decimal,
    discount_pct: Decimal,
    /// None when net is zero: margin is not applicable, never a division error
    margin_pct: Option<Decimal>,
}

fn compute_line_metrics(
    quantity: i32,
    unit_price: Decimal,
    discount: Discount,
    unit_cost: Decimal,
) -> LineMetrics {
    let qty = Decimal::from(quantity);

    let gross_amount = (qty * unit_price).round_dp(4);
    let discount_amount = match discount {
        Discount::Rate(rate) => (gross_amount * rate).round_dp(4),
        Discount::Amount(amount) => amount.round_dp(4),
    };
    let net_amount = gross_amount - discount_amount;
    let total_cost = (qty * unit_cost).round_dp(4);
    let gross_profit = net_amount - total_cost;

    let discount_pct = if gross_amount.is_zero() {
        Decimal::ZERO
    } else {
        (discount_amount / gross_amount * Decimal::ONE_HUNDRED).round_dp(2)
    };

    let margin_pct = if net_amount.is_zero() {
        None
    } else {
        Some((gross_profit / net_amount * Decimal::ONE_HUNDRED).round_dp(2))
    };

    LineMetrics {
        gross_amount,
        discount_amount,
        net_amount,
        total_cost,
        gross_profit,
        discount_pct,
        margin_pct,
    }
}

// =============================================================================
// Fact loader
// =============================================================================
// Chunked upsert keyed by (order_number, line_number). Each chunk commits in
// its own transaction, so a mid-run failure only re-processes the failed
// chunk on retry. Coercion problems reject single rows; a duplicate business
// key within the run or an unresolvable natural key aborts the chunk -
// committing either would corrupt the warehouse invariants.

#[derive(Debug, sqlx::FromRow)]
struct SalesLineStagingRow {
    order_id: Option<String>,
    detail_id: Option<String>,
    order_qty: Option<String>,
    product_id: Option<String>,
    offer_id: Option<String>,
    unit_price: Option<String>,
    discount_rate: Option<String>,
    order_date: Option<String>,
    customer_id: Option<String>,
    salesperson_id: Option<String>,
    territory_id: Option<String>,
}

#[derive(Debug)]
struct SalesLine {
    order_number: i32,
    line_number: i32,
    order_date: NaiveDate,
    customer_nk: i32,
    product_nk: i32,
    territory_nk: Option<i32>,
    salesperson_nk: Option<i32>,
    promotion_nk: Option<i32>,
    quantity: i32,
    unit_price: Decimal,
    discount: Discount,
}

fn coerce_sales_line(row: &SalesLineStagingRow) -> Result<SalesLine, String> {
    let order_number = req_i32(&row.order_id, "SalesOrderID")?;
    let line_number = req_i32(&row.detail_id, "SalesOrderDetailID")?;

    Ok(SalesLine {
        order_number,
        line_number,
        order_date: req_date(&row.order_date, "OrderDate")?,
        customer_nk: req_i32(&row.customer_id, "CustomerID")?,
        product_nk: req_i32(&row.product_id, "ProductID")?,
        territory_nk: opt_i32(&row.territory_id, "TerritoryID")?,
        salesperson_nk: opt_i32(&row.salesperson_id, "SalesPersonID")?,
        promotion_nk: opt_i32(&row.offer_id, "SpecialOfferID")?,
        quantity: req_i32(&row.order_qty, "OrderQty")?,
        unit_price: req_decimal(&row.unit_price, "UnitPrice")?,
        discount: Discount::Rate(
            opt_decimal(&row.discount_rate, "UnitPriceDiscount")?.unwrap_or(Decimal::ZERO),
        ),
    })
}

#[derive(Debug)]
struct FactRow {
    order_number: i32,
    line_number: i32,
    date_sk: i32,
    customer_sk: i64,
    product_sk: i64,
    territory_sk: Option<i64>,
    salesperson_sk: Option<i64>,
    promotion_sk: Option<i64>,
    quantity: i32,
    unit_price: Decimal,
    metrics: LineMetrics,
}

/// Resolve a coerced line against the published key maps.
/// Mandatory misses are fatal for the batch; a present-but-unresolvable
/// optional key is too, since writing NULL there would silently orphan the
/// reference. A genuinely absent optional key resolves to NULL, never a
/// sentinel row.
fn resolve_fact_row(line: &SalesLine, maps: &KeyMaps) -> Result<FactRow> {
    let customer_sk = *maps.customer.get(&line.customer_nk).with_context(|| {
        format!(
            "Unresolved customer natural key {} for order {} line {}",
            line.customer_nk, line.order_number, line.line_number
        )
    })?;

    let (product_sk, unit_cost) = *maps.product.get(&line.product_nk).with_context(|| {
        format!(
            "Unresolved product natural key {} for order {} line {}",
            line.product_nk, line.order_number, line.line_number
        )
    })?;

    let territory_sk = match line.territory_nk {
        Some(nk) => Some(*maps.territory.get(&nk).with_context(|| {
            format!(
                "Unresolved territory natural key {} for order {} line {}",
                nk, line.order_number, line.line_number
            )
        })?),
        None => None,
    };

    let salesperson_sk = match line.salesperson_nk {
        Some(nk) => Some(*maps.salesperson.get(&nk).with_context(|| {
            format!(
                "Unresolved salesperson natural key {} for order {} line {}",
                nk, line.order_number, line.line_number
            )
        })?),
        None => None,
    };

    let promotion_sk = match line.promotion_nk {
        Some(nk) => Some(*maps.promotion.get(&nk).with_context(|| {
            format!(
                "Unresolved promotion natural key {} for order {} line {}",
                nk, line.order_number, line.line_number
            )
        })?),
        None => None,
    };

    Ok(FactRow {
        order_number: line.order_number,
        line_number: line.line_number,
        date_sk: date_sk_for(line.order_date),
        customer_sk,
        product_sk,
        territory_sk,
        salesperson_sk,
        promotion_sk,
        quantity: line.quantity,
        unit_price: line.unit_price,
        metrics: compute_line_metrics(line.quantity, line.unit_price, line.discount, unit_cost),
    })
}

async fn upsert_fact_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    fact: &FactRow,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO dw.fact_sales (
            order_number, line_number, date_sk, customer_sk, product_sk,
            territory_sk, salesperson_sk, promotion_sk,
            quantity, unit_price, gross_amount, discount_amount, net_amount,
            total_cost, gross_profit, discount_pct, margin_pct, loaded_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, now())
        ON CONFLICT (order_number, line_number) DO UPDATE SET
            date_sk = EXCLUDED.date_sk,
            customer_sk = EXCLUDED.customer_sk,
            product_sk = EXCLUDED.product_sk,
            territory_sk = EXCLUDED.territory_sk,
            salesperson_sk = EXCLUDED.salesperson_sk,
            promotion_sk = EXCLUDED.promotion_sk,
            quantity = EXCLUDED.quantity,
            unit_price = EXCLUDED.unit_price,
            gross_amount = EXCLUDED.gross_amount,
            discount_amount = EXCLUDED.discount_amount,
            net_amount = EXCLUDED.net_amount,
            total_cost = EXCLUDED.total_cost,
            gross_profit = EXCLUDED.gross_profit,
            discount_pct = EXCLUDED.discount_pct,
            margin_pct = EXCLUDED.margin_pct,
            loaded_at = now()
        "#,
    )
    .bind(fact.order_number)
    .bind(fact.line_number)
    .bind(fact.date_sk)
    .bind(fact.customer_sk)
    .bind(fact.product_sk)
    .bind(fact.territory_sk)
    .bind(fact.salesperson_sk)
    .bind(fact.promotion_sk)
    .bind(fact.quantity)
    .bind(fact.unit_price)
    .bind(fact.metrics.gross_amount)
    .bind(fact.metrics.discount_amount)
    .bind(fact.metrics.net_amount)
    .bind(fact.metrics.total_cost)
    .bind(fact.metrics.gross_profit)
    .bind(fact.metrics.discount_pct)
    .bind(fact.metrics.margin_pct)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

#[derive(Debug, Default)]
struct FactLoadOutcome {
    loaded: usize,
    rejected: Vec<RowError>,
    chunks: usize,
}

async fn load_fact_table(
    pool: &PgPool,
    maps: &KeyMaps,
    chunk_size: i64,
    dry_run: bool,
) -> Result<FactLoadOutcome> {
    println!("Loading fact_sales in chunks of {}", chunk_size);

    let mut outcome = FactLoadOutcome::default();
    let mut seen_keys: HashSet<(i32, i32)> = HashSet::new();
    let mut offset = 0i64;

    loop {
        let rows: Vec<SalesLineStagingRow> = sqlx::query_as(
            r#"
            SELECT d."SalesOrderID" AS order_id,
                   d."SalesOrderDetailID" AS detail_id,
                   d."OrderQty" AS order_qty,
                   d."ProductID" AS product_id,
                   d."SpecialOfferID" AS offer_id,
                   d."UnitPrice" AS unit_price,
                   d."UnitPriceDiscount" AS discount_rate,
                   h."OrderDate" AS order_date,
                   h."CustomerID" AS customer_id,
                   h."SalesPersonID" AS salesperson_id,
                   h."TerritoryID" AS territory_id
            FROM staging.stage_order_details d
            INNER JOIN staging.stage_order_headers h ON h."SalesOrderID" = d."SalesOrderID"
            ORDER BY d."SalesOrderID", d."SalesOrderDetailID"
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(chunk_size)
        .bind(offset)
        .fetch_all(pool)
        .await
        .context("Failed to read sales line staging rows")?;

        if rows.is_empty() {
            break;
        }

        let fetched = rows.len();
        let mut tx = pool.begin().await?;

        for row in &rows {
            let line = match coerce_sales_line(row) {
                Ok(line) => line,
                Err(reason) => {
                    let key = format!(
                        "order={} line={}",
                        non_empty(&row.order_id).unwrap_or("<null>"),
                        non_empty(&row.detail_id).unwrap_or("<null>"),
                    );
                    outcome.rejected.push(RowError::new(key, reason));
                    continue;
                }
            };

            // Two staged rows claiming the same business key would make the
            // upsert silently overwrite twice - that is an extraction defect
            if !seen_keys.insert((line.order_number, line.line_number)) {
                anyhow::bail!(
                    "Duplicate business key in batch: order {} line {}",
                    line.order_number,
                    line.line_number
                );
            }

            let fact = resolve_fact_row(&line, maps)?;

            if !dry_run {
                upsert_fact_row(&mut tx, &fact).await?;
            }
            outcome.loaded += 1;
        }

        if dry_run {
            tx.rollback().await?;
        } else {
            tx.commit().await?;
        }

        outcome.chunks += 1;
        offset += fetched as i64;
        println!(
            "  chunk {}: {} rows processed ({} total)",
            outcome.chunks, fetched, offset
        );
    }

    println!(
        "fact_sales: {} rows loaded, {} rejected, {} chunk(s)",
        outcome.loaded,
        outcome.rejected.len(),
        outcome.chunks
    );
    print_rejections("fact_sales", &outcome.rejected);

    Ok(outcome)
}

/// End-of-load statistics, printed for the operator after a fact load
async fn print_fact_totals(pool: &PgPool) -> Result<()> {
    let (rows, net, profit): (i64, Option<Decimal>, Option<Decimal>) = sqlx::query_as(
        "SELECT COUNT(*), SUM(net_amount), SUM(gross_profit) FROM dw.fact_sales",
    )
    .fetch_one(pool)
    .await?;

    println!(
        "Warehouse totals: {} fact rows | net revenue {} | gross profit {}",
        rows,
        net.unwrap_or(Decimal::ZERO),
        profit.unwrap_or(Decimal::ZERO)
    );
    Ok(())
}

// =============================================================================
// Task orchestration
// =============================================================================

/// Resolver key maps only cover the fact load when every resolver ran in
/// live mode; a --dimension-restricted or dry-run dimensions step leaves the
/// other maps empty, and the fact loader must re-read the published
/// dimension tables instead.
fn resolver_maps_cover_facts(only: Option<DimensionKind>, dry_run: bool) -> bool {
    only.is_none() && !dry_run
}

/// Run the dimension resolvers and publish their key maps. Territory goes
/// first because the salesperson dimension references it; the remaining four
/// touch disjoint tables and run concurrently.
async fn run_dimension_resolvers(
    pool: &PgPool,
    only: Option<DimensionKind>,
    dry_run: bool,
) -> Result<(Vec<DimensionOutcome>, KeyMaps)> {
    let mut maps = KeyMaps::default();
    let mut outcomes = Vec::new();

    if let Some(kind) = only {
        match kind {
            DimensionKind::Territory => {
                let (outcome, map) = load_territory_dimension(pool, dry_run).await?;
                outcomes.push(outcome);
                maps.territory = map;
            }
            DimensionKind::Customer => {
                let (outcome, map) = load_customer_dimension(pool, dry_run).await?;
                outcomes.push(outcome);
                maps.customer = map;
            }
            DimensionKind::Product => {
                let (outcome, map) = load_product_dimension(pool, dry_run).await?;
                outcomes.push(outcome);
                maps.product = map;
            }
            DimensionKind::Promotion => {
                let (outcome, map) = load_promotion_dimension(pool, dry_run).await?;
                outcomes.push(outcome);
                maps.promotion = map;
            }
            DimensionKind::Salesperson => {
                // Standalone run: the territory map is read back from the
                // already-published dimension table
                let territory: Vec<(i32, i64)> =
                    sqlx::query_as("SELECT territory_nk, territory_sk FROM dw.dim_territory")
                        .fetch_all(pool)
                        .await?;
                maps.territory = territory.into_iter().collect();
                let (outcome, map) =
                    load_salesperson_dimension(pool, &maps.territory, dry_run).await?;
                outcomes.push(outcome);
                maps.salesperson = map;
            }
        }
        return Ok((outcomes, maps));
    }

    let (territory_outcome, territory_map) = load_territory_dimension(pool, dry_run).await?;
    outcomes.push(territory_outcome);
    maps.territory = territory_map;

    let (customer_res, product_res, promotion_res, salesperson_res) = tokio::try_join!(
        load_customer_dimension(pool, dry_run),
        load_product_dimension(pool, dry_run),
        load_promotion_dimension(pool, dry_run),
        load_salesperson_dimension(pool, &maps.territory, dry_run),
    )?;

    let (outcome, map) = customer_res;
    outcomes.push(outcome);
    maps.customer = map;

    let (outcome, map) = product_res;
    outcomes.push(outcome);
    maps.product = map;

    let (outcome, map) = promotion_res;
    outcomes.push(outcome);
    maps.promotion = map;

    let (outcome, map) = salesperson_res;
    outcomes.push(outcome);
    maps.salesperson = map;

    Ok((outcomes, maps))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let db_url = std::env::var("DW_URL").context("DW_URL env var missing")?;

    let chunk_size = args
        .chunk_size
        .or_else(|| {
            std::env::var("CHUNK_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
        })
        .unwrap_or(DEFAULT_CHUNK_SIZE);

    println!("=== Sales DW Loader ===");
    println!("Task: {:?}", args.task);
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("Failed to connect to warehouse database")?;

    // Schema must exist before anything else, including the job-run record
    ensure_warehouse_schema(&pool).await?;

    let task_name = format!("{:?}", args.task).to_lowercase();
    let job_run_id = if !args.dry_run {
        Some(create_job_run(&pool, &task_name).await?)
    } else {
        None
    };

    let result = async {
        let mut detail = serde_json::Map::new();

        if args.task == Task::Schema {
            println!("Warehouse schema ensured");
            detail.insert("schema".into(), serde_json::json!("ok"));
        }

        if matches!(args.task, Task::Dates | Task::All) {
            println!("\n[dates] {} .. {}", args.from, args.to);
            let holidays = load_holiday_set(args.holidays.as_deref()).await?;
            let (generated, inserted) =
                load_date_dimension(&pool, args.from, args.to, &holidays, args.dry_run).await?;
            detail.insert(
                "dates".into(),
                serde_json::json!({ "generated": generated, "inserted": inserted }),
            );
        }

        let mut resolved_maps: Option<KeyMaps> = None;

        if matches!(args.task, Task::Dimensions | Task::All) {
            println!("\n[dimensions]");
            let (outcomes, maps) =
                run_dimension_resolvers(&pool, args.dimension, args.dry_run).await?;
            for outcome in &outcomes {
                outcome.summarize();
            }
            detail.insert(
                "dimensions".into(),
                serde_json::json!(outcomes.iter().map(|o| o.detail()).collect::<Vec<_>>()),
            );
            resolved_maps = Some(maps);
        }

        if matches!(args.task, Task::Facts | Task::All) {
            println!("\n[facts]");
            // Hard ordering barrier: the fact loader only starts once every
            // resolver has returned its key map (full live Task::All), or
            // reads the previously published maps (standalone Task::Facts,
            // dry runs, and --dimension-restricted runs)
            let maps = match resolved_maps {
                Some(maps) if resolver_maps_cover_facts(args.dimension, args.dry_run) => maps,
                _ => KeyMaps::fetch(&pool).await?,
            };
            let outcome = load_fact_table(&pool, &maps, chunk_size, args.dry_run).await?;
            if !args.dry_run {
                print_fact_totals(&pool).await?;
            }
            detail.insert(
                "facts".into(),
                serde_json::json!({
                    "loaded": outcome.loaded,
                    "rejected": outcome.rejected.len(),
                    "chunks": outcome.chunks,
                }),
            );
        }

        Ok::<serde_json::Value, anyhow::Error>(serde_json::Value::Object(detail))
    }
    .await;

    if let Some(job_id) = job_run_id {
        match &result {
            Ok(detail) => finish_job_run(&pool, job_id, "ok", None, detail.clone()).await?,
            Err(e) => {
                finish_job_run(
                    &pool,
                    job_id,
                    "failed",
                    Some(&e.to_string()),
                    serde_json::json!({}),
                )
                .await?
            }
        }
    }

    result?;

    println!("\n=== Load Complete ===");
    println!("Next: cargo run --bin quality -- --json");

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn some(s: &str) -> Option<String> {
        Some(s.to_string())
    }

    // -------------------------------------------------------------------------
    // DATE DIMENSION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_date_sk_encoding() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(date_sk_for(d), 20240307);
    }

    #[test]
    fn test_date_row_fields() {
        // 2024-06-15 is a Saturday
        let d = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();
        let row = date_row(d, &HashSet::new());
        assert_eq!(row.date_sk, 20240615);
        assert_eq!(row.year, 2024);
        assert_eq!(row.quarter, 2);
        assert_eq!(row.month, 6);
        assert_eq!(row.day, 15);
        assert_eq!(row.month_name, "June");
        assert_eq!(row.weekday_name, "Saturday");
        assert_eq!(row.weekday, 6);
        assert!(row.is_weekend);
        assert!(!row.is_holiday);
    }

    #[test]
    fn test_date_row_weekday_index_from_sunday() {
        // 2024-06-16 is a Sunday
        let d = NaiveDate::from_ymd_opt(2024, 6, 16).unwrap();
        let row = date_row(d, &HashSet::new());
        assert_eq!(row.weekday, 0);
        assert!(row.is_weekend);

        // 2024-06-17 is a Monday
        let d = NaiveDate::from_ymd_opt(2024, 6, 17).unwrap();
        let row = date_row(d, &HashSet::new());
        assert_eq!(row.weekday, 1);
        assert!(!row.is_weekend);
    }

    #[test]
    fn test_date_row_iso_week() {
        // 2015-12-31 falls in ISO week 53 of 2015
        let d = NaiveDate::from_ymd_opt(2015, 12, 31).unwrap();
        assert_eq!(date_row(d, &HashSet::new()).iso_week, 53);
        // 2024-01-01 is ISO week 1
        let d = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(date_row(d, &HashSet::new()).iso_week, 1);
    }

    #[test]
    fn test_date_row_holiday_from_config_only() {
        let d = NaiveDate::from_ymd_opt(2024, 12, 25).unwrap();
        assert!(!date_row(d, &HashSet::new()).is_holiday);

        let holidays: HashSet<NaiveDate> = [d].into_iter().collect();
        assert!(date_row(d, &holidays).is_holiday);
    }

    #[test]
    fn test_build_date_rows_exact_count() {
        let from = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();
        let rows = build_date_rows(from, to, &HashSet::new()).unwrap();
        assert_eq!(rows.len(), 366); // leap year
    }

    #[test]
    fn test_build_date_rows_full_original_range() {
        let from = NaiveDate::from_ymd_opt(2008, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2030, 12, 31).unwrap();
        let rows = build_date_rows(from, to, &HashSet::new()).unwrap();
        assert_eq!(rows.len(), (to - from).num_days() as usize + 1);
    }

    #[test]
    fn test_build_date_rows_no_gaps_no_duplicates() {
        let from = NaiveDate::from_ymd_opt(2024, 2, 25).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let rows = build_date_rows(from, to, &HashSet::new()).unwrap();

        let keys: HashSet<i32> = rows.iter().map(|r| r.date_sk).collect();
        assert_eq!(keys.len(), rows.len());
        for pair in rows.windows(2) {
            assert_eq!(pair[0].full_date.succ_opt().unwrap(), pair[1].full_date);
        }
        // leap day included
        assert!(keys.contains(&20240229));
    }

    #[test]
    fn test_build_date_rows_single_day() {
        let d = NaiveDate::from_ymd_opt(2024, 7, 4).unwrap();
        let rows = build_date_rows(d, d, &HashSet::new()).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_build_date_rows_inverted_range_fails() {
        let from = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let result = build_date_rows(from, to, &HashSet::new());
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid date range"));
    }

    #[test]
    fn test_build_date_rows_deterministic() {
        let from = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let a = build_date_rows(from, to, &HashSet::new()).unwrap();
        let b = build_date_rows(from, to, &HashSet::new()).unwrap();
        assert_eq!(a, b);
    }

    // -------------------------------------------------------------------------
    // METRIC CALCULATOR TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_metrics_reference_scenario() {
        // qty 2 at 100.0000 with 10% discount, unit cost 60.0000
        let m = compute_line_metrics(2, dec!(100.0000), Discount::Rate(dec!(0.10)), dec!(60.0000));
        assert_eq!(m.gross_amount, dec!(200.0000));
        assert_eq!(m.discount_amount, dec!(20.0000));
        assert_eq!(m.net_amount, dec!(180.0000));
        assert_eq!(m.total_cost, dec!(120.0000));
        assert_eq!(m.gross_profit, dec!(60.0000));
        assert_eq!(m.discount_pct, dec!(10.00));
        assert_eq!(m.margin_pct, Some(dec!(33.33)));
    }

    #[test]
    fn test_metrics_additive_identities() {
        let cases = [
            (3, dec!(24.9900), dec!(0.15), dec!(12.0443)),
            (1, dec!(3578.2700), dec!(0.00), dec!(2171.2942)),
            (7, dec!(0.3333), dec!(0.02), dec!(0.1111)),
            (250, dec!(19.99), dec!(0.35), dec!(25.50)),
        ];
        for (qty, price, rate, cost) in cases {
            let m = compute_line_metrics(qty, price, Discount::Rate(rate), cost);
            assert_eq!(m.net_amount, m.gross_amount - m.discount_amount);
            assert_eq!(m.gross_profit, m.net_amount - m.total_cost);
        }
    }

    #[test]
    fn test_metrics_currency_rounded_to_4dp() {
        // 7 x 0.3333 = 2.3331; 2% of that = 0.046662 -> 0.0467
        let m = compute_line_metrics(7, dec!(0.3333), Discount::Rate(dec!(0.02)), dec!(0));
        assert_eq!(m.gross_amount, dec!(2.3331));
        assert_eq!(m.discount_amount, dec!(0.0467));
        assert_eq!(m.net_amount, dec!(2.2864));
    }

    #[test]
    fn test_metrics_absolute_discount_amount() {
        let m = compute_line_metrics(2, dec!(100), Discount::Amount(dec!(20)), dec!(60));
        assert_eq!(m.discount_amount, dec!(20.0000));
        assert_eq!(m.net_amount, dec!(180.0000));
        assert_eq!(m.discount_pct, dec!(10.00));
    }

    #[test]
    fn test_metrics_zero_gross_value() {
        let m = compute_line_metrics(0, dec!(100), Discount::Rate(dec!(0.10)), dec!(60));
        assert_eq!(m.gross_amount, dec!(0));
        assert_eq!(m.discount_pct, dec!(0)); // defined as 0, not a division error
        assert_eq!(m.margin_pct, None);
    }

    #[test]
    fn test_metrics_zero_net_value_margin_not_applicable() {
        // 100% discount: net is zero, margin undefined
        let m = compute_line_metrics(1, dec!(50), Discount::Rate(dec!(1.00)), dec!(10));
        assert_eq!(m.net_amount, dec!(0.0000));
        assert_eq!(m.margin_pct, None);
        assert_eq!(m.discount_pct, dec!(100.00));
    }

    #[test]
    fn test_metrics_negative_margin_passes_through() {
        // Cost above net: legitimate loss-making sale
        let m = compute_line_metrics(1, dec!(100), Discount::Rate(dec!(0)), dec!(150));
        assert_eq!(m.gross_profit, dec!(-50.0000));
        assert_eq!(m.margin_pct, Some(dec!(-50.00)));
    }

    #[test]
    fn test_metrics_no_discount() {
        let m = compute_line_metrics(4, dec!(25.5000), Discount::Rate(dec!(0)), dec!(10));
        assert_eq!(m.gross_amount, dec!(102.0000));
        assert_eq!(m.discount_amount, dec!(0.0000));
        assert_eq!(m.net_amount, dec!(102.0000));
        assert_eq!(m.discount_pct, dec!(0));
    }

    #[test]
    fn test_metrics_deterministic() {
        let a = compute_line_metrics(9, dec!(17.4900), Discount::Rate(dec!(0.05)), dec!(6.9223));
        let b = compute_line_metrics(9, dec!(17.4900), Discount::Rate(dec!(0.05)), dec!(6.9223));
        assert_eq!(a, b);
    }

    // -------------------------------------------------------------------------
    // COERCION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_req_i32_missing_field() {
        let err = req_i32(&None, "CustomerID").unwrap_err();
        assert!(err.contains("missing required field 'CustomerID'"));
    }

    #[test]
    fn test_req_i32_bad_value_carries_offender() {
        let err = req_i32(&some("abc"), "CustomerID").unwrap_err();
        assert!(err.contains("abc"));
        assert!(err.contains("CustomerID"));
    }

    #[test]
    fn test_opt_i32_empty_is_none_not_error() {
        assert_eq!(opt_i32(&some("  "), "TerritoryID").unwrap(), None);
        assert_eq!(opt_i32(&None, "TerritoryID").unwrap(), None);
        assert_eq!(opt_i32(&some("5"), "TerritoryID").unwrap(), Some(5));
    }

    #[test]
    fn test_req_decimal_bad_value() {
        let err = req_decimal(&some("12,5"), "UnitPrice").unwrap_err();
        assert!(err.contains("12,5"));
    }

    #[test]
    fn test_date_coercion_accepts_datetime_forms() {
        assert_eq!(
            req_date(&some("2024-03-07"), "OrderDate").unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 7).unwrap()
        );
        assert_eq!(
            req_date(&some("2024-03-07 00:00:00"), "OrderDate").unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 7).unwrap()
        );
        assert_eq!(
            req_date(&some("2024-03-07T13:45:00"), "OrderDate").unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 7).unwrap()
        );
    }

    #[test]
    fn test_date_coercion_rejects_garbage() {
        assert!(req_date(&some("07/03/2024"), "OrderDate").is_err());
    }

    // -------------------------------------------------------------------------
    // DIMENSION COERCION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_customer_null_natural_key_rejected() {
        let row = CustomerStagingRow {
            customer_id: None,
            person_id: some("10"),
            store_id: None,
            first_name: some("Ada"),
            last_name: some("Lovelace"),
        };
        let err = coerce_customer(&row).unwrap_err();
        assert!(err.contains("CustomerID"));
    }

    #[test]
    fn test_customer_type_derivation() {
        let mut row = CustomerStagingRow {
            customer_id: some("1"),
            person_id: some("10"),
            store_id: None,
            first_name: some("Ada"),
            last_name: some("Lovelace"),
        };
        assert_eq!(coerce_customer(&row).unwrap().customer_type, "Individual");
        assert_eq!(coerce_customer(&row).unwrap().full_name, "Ada Lovelace");

        row.person_id = None;
        row.store_id = some("934");
        assert_eq!(coerce_customer(&row).unwrap().customer_type, "Store");

        row.store_id = None;
        assert_eq!(coerce_customer(&row).unwrap().customer_type, "Unknown");
    }

    #[test]
    fn test_customer_name_fallback() {
        let row = CustomerStagingRow {
            customer_id: some("42"),
            person_id: None,
            store_id: None,
            first_name: None,
            last_name: None,
        };
        assert_eq!(coerce_customer(&row).unwrap().full_name, "Customer 42");
    }

    fn product_row() -> ProductStagingRow {
        ProductStagingRow {
            product_id: some("776"),
            product_name: some("Mountain-100 Black, 42"),
            product_number: some("BK-M82B-42"),
            category_name: some("Bikes"),
            subcategory_name: some("Mountain Bikes"),
            product_line: some("M"),
            color: some("Black"),
            size: some("42"),
            standard_cost: some("1898.0944"),
            list_price: some("3374.9900"),
            sell_start_date: some("2011-05-31"),
            sell_end_date: None,
        }
    }

    #[test]
    fn test_product_coercion_full_row() {
        let record = coerce_product(&product_row()).unwrap();
        assert_eq!(record.nk, 776);
        assert_eq!(record.category_name, "Bikes");
        assert_eq!(record.standard_cost, dec!(1898.0944));
        assert!(record.is_active);
        // (3374.99 - 1898.0944) / 3374.99 * 100 = 43.76...
        assert_eq!(record.margin_pct, dec!(43.76));
    }

    #[test]
    fn test_product_inactive_when_sell_end_set() {
        let mut row = product_row();
        row.sell_end_date = some("2013-06-30");
        let record = coerce_product(&row).unwrap();
        assert!(!record.is_active);
        assert_eq!(
            record.sell_end_date,
            Some(NaiveDate::from_ymd_opt(2013, 6, 30).unwrap())
        );
    }

    #[test]
    fn test_product_missing_hierarchy_defaults() {
        let mut row = product_row();
        row.category_name = None;
        row.subcategory_name = None;
        let record = coerce_product(&row).unwrap();
        assert_eq!(record.category_name, "No Category");
        assert_eq!(record.subcategory_name, "No Subcategory");
    }

    #[test]
    fn test_product_zero_list_price_margin() {
        let mut row = product_row();
        row.list_price = None;
        assert_eq!(coerce_product(&row).unwrap().margin_pct, dec!(0));
    }

    #[test]
    fn test_product_bad_cost_is_row_level_error() {
        let mut row = product_row();
        row.standard_cost = some("not-a-number");
        let err = coerce_product(&row).unwrap_err();
        assert!(err.contains("StandardCost"));
        assert!(err.contains("not-a-number"));
    }

    #[test]
    fn test_salesperson_territory_resolved_through_map() {
        let territory_map: KeyMap = [(5, 105i64)].into_iter().collect();
        let row = SalespersonStagingRow {
            salesperson_id: some("280"),
            first_name: some("Pamela"),
            last_name: some("Ansman-Wolfe"),
            hire_date: some("2011-01-05"),
            territory_id: some("5"),
            sales_quota: some("250000.00"),
            commission_pct: some("0.015"),
        };
        let record = coerce_salesperson(&row, &territory_map).unwrap();
        assert_eq!(record.territory_sk, Some(105));
        assert_eq!(record.commission_pct, dec!(1.50)); // fraction -> percent
        assert_eq!(record.salesperson_name, "Pamela Ansman-Wolfe");
    }

    #[test]
    fn test_salesperson_unresolved_territory_stays_null() {
        let row = SalespersonStagingRow {
            salesperson_id: some("280"),
            first_name: None,
            last_name: None,
            hire_date: None,
            territory_id: some("99"),
            sales_quota: None,
            commission_pct: None,
        };
        let record = coerce_salesperson(&row, &KeyMap::new()).unwrap();
        assert_eq!(record.territory_sk, None);
        assert_eq!(record.sales_quota, dec!(0));
        assert_eq!(record.salesperson_name, "Salesperson 280");
    }

    #[test]
    fn test_promotion_fraction_to_percent() {
        let row = PromotionStagingRow {
            promotion_id: some("2"),
            description: some("Volume Discount 11 to 14"),
            promotion_type: some("Volume Discount"),
            discount_pct: some("0.02"),
            start_date: some("2011-05-31"),
            end_date: some("2014-05-30"),
            min_qty: some("11"),
            max_qty: some("14"),
        };
        let record = coerce_promotion(&row).unwrap();
        assert_eq!(record.discount_pct, dec!(2.00));
        assert_eq!(record.min_qty, 11);
        assert_eq!(record.max_qty, Some(14));
    }

    #[test]
    fn test_promotion_open_ended_max_qty_stays_null() {
        let row = PromotionStagingRow {
            promotion_id: some("1"),
            description: some("No Discount"),
            promotion_type: some("No Discount"),
            discount_pct: some("0.00"),
            start_date: None,
            end_date: None,
            min_qty: None,
            max_qty: None,
        };
        let record = coerce_promotion(&row).unwrap();
        assert_eq!(record.max_qty, None); // no magic 999999 sentinel
        assert_eq!(record.min_qty, 0);
    }

    // -------------------------------------------------------------------------
    // FACT RESOLUTION TESTS
    // -------------------------------------------------------------------------

    fn sales_line_row() -> SalesLineStagingRow {
        SalesLineStagingRow {
            order_id: some("43659"),
            detail_id: some("1"),
            order_qty: some("2"),
            product_id: some("776"),
            offer_id: some("1"),
            unit_price: some("100.0000"),
            discount_rate: some("0.10"),
            order_date: some("2011-05-31 00:00:00"),
            customer_id: some("29825"),
            salesperson_id: some("279"),
            territory_id: some("5"),
        }
    }

    fn key_maps() -> KeyMaps {
        KeyMaps {
            customer: [(29825, 1i64)].into_iter().collect(),
            product: [(776, (2i64, dec!(60.0000)))].into_iter().collect(),
            territory: [(5, 3i64)].into_iter().collect(),
            salesperson: [(279, 4i64)].into_iter().collect(),
            promotion: [(1, 5i64)].into_iter().collect(),
        }
    }

    #[test]
    fn test_fact_row_fully_resolved() {
        let line = coerce_sales_line(&sales_line_row()).unwrap();
        let fact = resolve_fact_row(&line, &key_maps()).unwrap();

        assert_eq!(fact.date_sk, 20110531); // no lookup, computed from order date
        assert_eq!(fact.customer_sk, 1);
        assert_eq!(fact.product_sk, 2);
        assert_eq!(fact.territory_sk, Some(3));
        assert_eq!(fact.salesperson_sk, Some(4));
        assert_eq!(fact.promotion_sk, Some(5));
        // metrics computed with the dimension's unit cost
        assert_eq!(fact.metrics.net_amount, dec!(180.0000));
        assert_eq!(fact.metrics.gross_profit, dec!(60.0000));
        assert_eq!(fact.metrics.margin_pct, Some(dec!(33.33)));
    }

    #[test]
    fn test_fact_row_missing_optionals_resolve_to_null() {
        let mut row = sales_line_row();
        row.salesperson_id = None; // direct/online channel
        row.offer_id = None;
        row.territory_id = None;
        let line = coerce_sales_line(&row).unwrap();
        let fact = resolve_fact_row(&line, &key_maps()).unwrap();
        assert_eq!(fact.salesperson_sk, None);
        assert_eq!(fact.promotion_sk, None);
        assert_eq!(fact.territory_sk, None);
    }

    #[test]
    fn test_fact_row_unresolved_mandatory_key_fails() {
        let mut maps = key_maps();
        maps.customer.clear();
        let line = coerce_sales_line(&sales_line_row()).unwrap();
        let err = resolve_fact_row(&line, &maps).unwrap_err();
        assert!(err.to_string().contains("customer natural key 29825"));
    }

    #[test]
    fn test_fact_row_unresolved_optional_key_fails() {
        // Present but unresolvable is a dimension gap, not a missing value
        let mut maps = key_maps();
        maps.salesperson.clear();
        let line = coerce_sales_line(&sales_line_row()).unwrap();
        let err = resolve_fact_row(&line, &maps).unwrap_err();
        assert!(err.to_string().contains("salesperson natural key 279"));
    }

    #[test]
    fn test_sales_line_missing_business_key_rejected() {
        let mut row = sales_line_row();
        row.detail_id = None;
        let err = coerce_sales_line(&row).unwrap_err();
        assert!(err.contains("SalesOrderDetailID"));
    }

    #[test]
    fn test_sales_line_bad_quantity_rejected() {
        let mut row = sales_line_row();
        row.order_qty = some("two");
        let err = coerce_sales_line(&row).unwrap_err();
        assert!(err.contains("OrderQty"));
        assert!(err.contains("two"));
    }

    #[test]
    fn test_sales_line_missing_discount_defaults_to_zero_rate() {
        let mut row = sales_line_row();
        row.discount_rate = None;
        let line = coerce_sales_line(&row).unwrap();
        assert_eq!(line.discount, Discount::Rate(dec!(0)));
    }

    // -------------------------------------------------------------------------
    // RESOLVER UPSERT AND ORCHESTRATION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_dimension_upserts_guard_unchanged_rows() {
        // A replayed identical load must not rewrite rows or bump updated_at:
        // every resolver upsert carries a distinctness guard, and skipped
        // updates are recoverable because RETURNING is only consumed optionally
        let upserts = [
            CUSTOMER_UPSERT_SQL,
            PRODUCT_UPSERT_SQL,
            TERRITORY_UPSERT_SQL,
            SALESPERSON_UPSERT_SQL,
            PROMOTION_UPSERT_SQL,
        ];
        for sql in upserts {
            assert!(sql.contains("IS DISTINCT FROM"), "missing guard in: {}", sql);
            assert!(sql.contains("updated_at = now()"));
            assert!(sql.contains("RETURNING"));
        }
    }

    #[test]
    fn test_dimension_upsert_guard_covers_every_updated_column() {
        // Each column assigned in the SET clause must appear in the guard
        // tuple, otherwise a change to it would be silently skipped
        let upserts = [
            CUSTOMER_UPSERT_SQL,
            PRODUCT_UPSERT_SQL,
            TERRITORY_UPSERT_SQL,
            SALESPERSON_UPSERT_SQL,
            PROMOTION_UPSERT_SQL,
        ];
        for sql in upserts {
            let (set_clause, guard) = sql.split_once("WHERE").unwrap();
            for line in set_clause.lines() {
                let Some((column, _)) = line.trim().split_once(" = EXCLUDED.") else {
                    continue;
                };
                assert!(
                    guard.contains(&format!("EXCLUDED.{}", column)),
                    "column '{}' updated but not guarded in: {}",
                    column,
                    sql
                );
            }
        }
    }

    #[test]
    fn test_facts_use_resolver_maps_only_after_full_live_pass() {
        // Full live dimensions pass: the fresh maps cover the fact load
        assert!(resolver_maps_cover_facts(None, false));
        // A single-dimension pass leaves the other maps empty
        assert!(!resolver_maps_cover_facts(Some(DimensionKind::Customer), false));
        assert!(!resolver_maps_cover_facts(Some(DimensionKind::Territory), false));
        // Dry-run resolvers never published anything
        assert!(!resolver_maps_cover_facts(None, true));
    }
}
