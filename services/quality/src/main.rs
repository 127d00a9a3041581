//! Quality Service - Post-load invariant checker for the warehouse
//!
//! Scans dw.fact_sales after a completed load and reports, per rule, a
//! violation count plus a sample of offending business keys:
//! - referential integrity (every surrogate key lands on a dimension row)
//! - mandatory foreign keys are non-null
//! - additive-measure consistency within rounding tolerance
//! - business-key uniqueness of (order_number, line_number)
//!
//! Findings are advisory: the gate never mutates warehouse data and never
//! exits non-zero because of them. Negative contribution margin is a
//! legitimate business condition and is surfaced as a metric, not a
//! violation.
//!
//! Usage:
//!   cargo run --bin quality
//!   cargo run --bin quality -- --json --sample 10

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "quality", about = "Checks warehouse invariants after a load")]
struct Args {
    /// Emit the report as JSON instead of the human summary
    #[arg(long, default_value = "false")]
    json: bool,

    /// Max offending business keys sampled per rule
    #[arg(long, default_value = "5")]
    sample: u32,
}

/// Measures are stored with 4 decimal places; anything beyond this is drift
const MEASURE_TOLERANCE: &str = "0.0001";

// =============================================================================
// Report types
// =============================================================================

#[derive(Debug, Serialize)]
struct QualityReport {
    generated_at: DateTime<Utc>,
    fact_rows: i64,
    violations_total: i64,
    checks: Vec<CheckResult>,
    advisories: Vec<Advisory>,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    rule: String,
    violations: i64,
    /// Offending (order_number, line_number) pairs, capped at --sample
    sample: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Advisory {
    name: String,
    value: serde_json::Value,
}

impl QualityReport {
    fn print_summary(&self) {
        println!("\n=== Quality Report ===");
        println!("Fact rows: {}", self.fact_rows);
        println!("Violations: {}", self.violations_total);
        for check in &self.checks {
            let marker = if check.violations == 0 { "ok " } else { "WARN" };
            println!("  [{}] {} - {} violation(s)", marker, check.rule, check.violations);
            for key in &check.sample {
                println!("         e.g. {}", key);
            }
        }
        println!("Advisories:");
        for advisory in &self.advisories {
            println!("  {} = {}", advisory.name, advisory.value);
        }
        if self.violations_total > 0 {
            println!("\nWarning condition for the pipeline operator - data NOT mutated");
        }
    }
}

// =============================================================================
// Checks
// =============================================================================
// Each check is a read-only aggregate plus a capped sample query over the
// same predicate. Business keys identify the offenders so findings are
// attributable without surrogate-key archaeology.

async fn check_with_sample(
    pool: &PgPool,
    rule: &str,
    predicate_sql: &str,
    sample_limit: i64,
) -> Result<CheckResult> {
    let count_sql = format!(
        "SELECT COUNT(*) FROM dw.fact_sales f WHERE {}",
        predicate_sql
    );
    let (violations,): (i64,) = sqlx::query_as(&count_sql)
        .fetch_one(pool)
        .await
        .with_context(|| format!("Quality check '{}' failed to execute", rule))?;

    let mut sample = Vec::new();
    if violations > 0 {
        let sample_sql = format!(
            "SELECT f.order_number, f.line_number FROM dw.fact_sales f WHERE {} \
             ORDER BY f.order_number, f.line_number LIMIT $1",
            predicate_sql
        );
        let rows: Vec<(i32, i32)> = sqlx::query_as(&sample_sql)
            .bind(sample_limit)
            .fetch_all(pool)
            .await?;
        sample = rows
            .into_iter()
            .map(|(order, line)| format!("order={} line={}", order, line))
            .collect();
    }

    Ok(CheckResult {
        rule: rule.to_string(),
        violations,
        sample,
    })
}

/// Referential integrity: one check per foreign key. Optional keys are only
/// checked where non-NULL - a NULL salesperson/territory/promotion is a
/// legitimate direct-channel sale, never a violation.
async fn referential_checks(pool: &PgPool, sample_limit: i64) -> Result<Vec<CheckResult>> {
    let rules: &[(&str, &str)] = &[
        (
            "fk_date_exists",
            "NOT EXISTS (SELECT 1 FROM dw.dim_date d WHERE d.date_sk = f.date_sk)",
        ),
        (
            "fk_customer_exists",
            "NOT EXISTS (SELECT 1 FROM dw.dim_customer c WHERE c.customer_sk = f.customer_sk)",
        ),
        (
            "fk_product_exists",
            "NOT EXISTS (SELECT 1 FROM dw.dim_product p WHERE p.product_sk = f.product_sk)",
        ),
        (
            "fk_territory_exists",
            "f.territory_sk IS NOT NULL AND NOT EXISTS \
             (SELECT 1 FROM dw.dim_territory t WHERE t.territory_sk = f.territory_sk)",
        ),
        (
            "fk_salesperson_exists",
            "f.salesperson_sk IS NOT NULL AND NOT EXISTS \
             (SELECT 1 FROM dw.dim_salesperson s WHERE s.salesperson_sk = f.salesperson_sk)",
        ),
        (
            "fk_promotion_exists",
            "f.promotion_sk IS NOT NULL AND NOT EXISTS \
             (SELECT 1 FROM dw.dim_promotion o WHERE o.promotion_sk = f.promotion_sk)",
        ),
    ];

    let mut results = Vec::with_capacity(rules.len());
    for (rule, predicate) in rules {
        results.push(check_with_sample(pool, rule, predicate, sample_limit).await?);
    }
    Ok(results)
}

/// Mandatory keys: enforced by NOT NULL constraints at write time, scanned
/// anyway as the last line of defense
async fn mandatory_null_check(pool: &PgPool, sample_limit: i64) -> Result<CheckResult> {
    check_with_sample(
        pool,
        "mandatory_keys_not_null",
        "f.date_sk IS NULL OR f.customer_sk IS NULL OR f.product_sk IS NULL",
        sample_limit,
    )
    .await
}

/// Additive consistency: net = gross - discount and profit = net - cost,
/// within the 4-decimal rounding tolerance
async fn measure_consistency_checks(pool: &PgPool, sample_limit: i64) -> Result<Vec<CheckResult>> {
    let net_predicate = format!(
        "ABS(f.net_amount - (f.gross_amount - f.discount_amount)) > {}",
        MEASURE_TOLERANCE
    );
    let profit_predicate = format!(
        "ABS(f.gross_profit - (f.net_amount - f.total_cost)) > {}",
        MEASURE_TOLERANCE
    );

    Ok(vec![
        check_with_sample(pool, "net_equals_gross_minus_discount", &net_predicate, sample_limit)
            .await?,
        check_with_sample(pool, "profit_equals_net_minus_cost", &profit_predicate, sample_limit)
            .await?,
    ])
}

/// Business-key uniqueness of (order_number, line_number)
async fn duplicate_business_key_check(pool: &PgPool, sample_limit: i64) -> Result<CheckResult> {
    let (violations,): (i64,) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(cnt - 1), 0)::BIGINT
        FROM (
            SELECT COUNT(*) AS cnt
            FROM dw.fact_sales
            GROUP BY order_number, line_number
            HAVING COUNT(*) > 1
        ) dups
        "#,
    )
    .fetch_one(pool)
    .await?;

    let mut sample = Vec::new();
    if violations > 0 {
        let rows: Vec<(i32, i32)> = sqlx::query_as(
            r#"
            SELECT order_number, line_number
            FROM dw.fact_sales
            GROUP BY order_number, line_number
            HAVING COUNT(*) > 1
            ORDER BY order_number, line_number
            LIMIT $1
            "#,
        )
        .bind(sample_limit)
        .fetch_all(pool)
        .await?;
        sample = rows
            .into_iter()
            .map(|(order, line)| format!("order={} line={}", order, line))
            .collect();
    }

    Ok(CheckResult {
        rule: "business_key_unique".to_string(),
        violations,
        sample,
    })
}

/// Advisory metrics: totals for the operator plus the negative-margin count
async fn collect_advisories(pool: &PgPool) -> Result<Vec<Advisory>> {
    let (fact_rows, net, profit): (i64, Option<Decimal>, Option<Decimal>) = sqlx::query_as(
        "SELECT COUNT(*), SUM(net_amount), SUM(gross_profit) FROM dw.fact_sales",
    )
    .fetch_one(pool)
    .await?;

    let (negative_margin,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM dw.fact_sales WHERE margin_pct IS NOT NULL AND margin_pct < 0",
    )
    .fetch_one(pool)
    .await?;

    let (undefined_margin,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM dw.fact_sales WHERE margin_pct IS NULL")
            .fetch_one(pool)
            .await?;

    Ok(vec![
        Advisory {
            name: "fact_rows".to_string(),
            value: serde_json::json!(fact_rows),
        },
        Advisory {
            name: "net_revenue".to_string(),
            value: serde_json::json!(net.unwrap_or(Decimal::ZERO).to_string()),
        },
        Advisory {
            name: "gross_profit".to_string(),
            value: serde_json::json!(profit.unwrap_or(Decimal::ZERO).to_string()),
        },
        Advisory {
            name: "negative_margin_rows".to_string(),
            value: serde_json::json!(negative_margin),
        },
        Advisory {
            name: "undefined_margin_rows".to_string(),
            value: serde_json::json!(undefined_margin),
        },
    ])
}

async fn build_report(pool: &PgPool, sample_limit: i64) -> Result<QualityReport> {
    let (fact_rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dw.fact_sales")
        .fetch_one(pool)
        .await
        .context("Fact table missing - run the loader first")?;

    let mut checks = referential_checks(pool, sample_limit).await?;
    checks.push(mandatory_null_check(pool, sample_limit).await?);
    checks.extend(measure_consistency_checks(pool, sample_limit).await?);
    checks.push(duplicate_business_key_check(pool, sample_limit).await?);

    let advisories = collect_advisories(pool).await?;
    let violations_total = checks.iter().map(|c| c.violations).sum();

    Ok(QualityReport {
        generated_at: Utc::now(),
        fact_rows,
        violations_total,
        checks,
        advisories,
    })
}

// =============================================================================
// Job run bookkeeping
// =============================================================================

async fn create_job_run(pool: &PgPool) -> Result<Uuid> {
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
        VALUES ($1, 'quality', 'scan', 'running', '{}')
        "#,
    )
    .bind(job_run_id)
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

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let db_url = std::env::var("DW_URL").context("DW_URL env var missing")?;

    if !args.json {
        println!("=== Sales DW Quality Gate ===");
    }

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("Failed to connect to warehouse database")?;

    let job_run_id = create_job_run(&pool).await?;

    let result = build_report(&pool, i64::from(args.sample)).await;

    match &result {
        Ok(report) => {
            finish_job_run(
                &pool,
                job_run_id,
                "ok",
                None,
                serde_json::json!({
                    "fact_rows": report.fact_rows,
                    "violations_total": report.violations_total,
                }),
            )
            .await?;
        }
        Err(e) => {
            finish_job_run(&pool, job_run_id, "failed", Some(&e.to_string()), serde_json::json!({}))
                .await?;
        }
    }

    let report = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.print_summary();
    }

    // Findings are a warning condition, not a pipeline failure
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
