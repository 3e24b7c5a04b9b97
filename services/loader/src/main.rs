//! Loader Service - Loads reshaped fuel sales rows into Postgres
//!
//! Responsibilities:
//! - Ensure the `ans` schema and the per-table target table exist
//! - Truncate the target table (each run replaces the full dataset)
//! - Insert every reshaped row, all-or-nothing, inside one transaction
//!
//! The target table is exclusively owned by this pipeline: no upsert, no
//! history across runs. Re-running with the same load file leaves the table
//! in the same state.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use sqlx::{Connection, PgConnection};
use std::path::PathBuf;
use tokio::fs;

#[derive(Parser, Debug)]
#[command(name = "loader", about = "Loads reshaped fuel sales reports into Postgres")]
struct Args {
    /// Source table to load
    #[arg(long, value_enum)]
    table: SourceTable,

    /// Dry run - read and report the rows, but don't touch the database
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

/// The two report feeds this pipeline owns. Every stage binary takes one of
/// these as its sole parameter; anything else is rejected at argument parsing,
/// before any database object is touched. The target table name is derived
/// from this enum and never from free-form input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceTable {
    Oil,
    Diesel,
}

impl SourceTable {
    fn as_str(self) -> &'static str {
        match self {
            SourceTable::Oil => "oil",
            SourceTable::Diesel => "diesel",
        }
    }
}

impl std::fmt::Display for SourceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct Config {
    db_url: String,
    out_dir: PathBuf,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            db_url: std::env::var("DB_URL").context("DB_URL env var missing")?,
            out_dir: PathBuf::from(
                std::env::var("OUT_DIR").unwrap_or_else(|_| "files/out".to_string()),
            ),
        })
    }
}

/// One row of the reshaped load file.
#[derive(Debug, Deserialize)]
struct LoadRow {
    product: String,
    uf: String,
    unit: String,
    volume: f64,
    year_month: NaiveDate,
}

/// DDL for the target table. Idempotent; the serial id and created_at
/// default are owned by the database.
fn create_table_sql(table: SourceTable) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS ans.{} (
            id SERIAL PRIMARY KEY,
            year_month date NOT NULL,
            uf VARCHAR(100) NOT NULL,
            product VARCHAR(100) NOT NULL,
            unit VARCHAR(5) NOT NULL,
            volume FLOAT NOT NULL,
            created_at timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
        table.as_str()
    )
}

fn truncate_sql(table: SourceTable) -> String {
    format!("TRUNCATE TABLE ans.{}", table.as_str())
}

/// Values are always bound as parameters; only the table identifier is
/// interpolated, and it comes from the closed SourceTable enum.
fn insert_sql(table: SourceTable) -> String {
    format!(
        "INSERT INTO ans.{} (year_month, uf, product, unit, volume) VALUES ($1, $2, $3, $4, $5)",
        table.as_str()
    )
}

/// Deserialize the reshaped load file.
fn parse_rows(content: &str) -> Result<Vec<LoadRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let mut rows = Vec::new();
    for (line_idx, result) in reader.deserialize().enumerate() {
        let row: LoadRow =
            result.with_context(|| format!("line {}: malformed load row", line_idx + 2))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Create the schema and table if needed, then wipe prior contents.
/// DDL and truncate commit as one unit; a failure rolls the unit back.
async fn prepare_target(conn: &mut PgConnection, table: SourceTable) -> Result<()> {
    let mut tx = conn.begin().await?;

    sqlx::query("CREATE SCHEMA IF NOT EXISTS ans")
        .execute(&mut *tx)
        .await?;
    sqlx::query(&create_table_sql(table))
        .execute(&mut *tx)
        .await?;
    sqlx::query(&truncate_sql(table)).execute(&mut *tx).await?;

    tx.commit().await?;
    Ok(())
}

/// Insert every row inside a single transaction. The first failing insert
/// aborts the whole batch; its error names the offending row's volume.
async fn insert_rows(
    conn: &mut PgConnection,
    table: SourceTable,
    rows: &[LoadRow],
) -> Result<usize> {
    let sql = insert_sql(table);
    let mut tx = conn.begin().await?;

    for row in rows {
        sqlx::query(&sql)
            .bind(row.year_month)
            .bind(&row.uf)
            .bind(&row.product)
            .bind(&row.unit)
            .bind(row.volume)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to insert row (volume {})", row.volume))?;
    }

    tx.commit().await?;
    Ok(rows.len())
}

fn print_sample(rows: &[LoadRow]) {
    println!("Read {} rows", rows.len());
    for (i, row) in rows.iter().take(3).enumerate() {
        println!(
            "  [{}] {} | {} | {} | {:.3} | {}",
            i + 1,
            row.product,
            row.uf,
            row.unit,
            row.volume,
            row.year_month
        );
    }
    if rows.len() > 3 {
        println!("  ... and {} more", rows.len() - 3);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    println!("=== ANS Fuel Sales Loader ===");
    println!("Table: ans.{}", args.table);
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let config = Config::from_env()?;
    let load_path = config.out_dir.join(format!("{}.csv", args.table));

    if args.dry_run {
        let content = fs::read_to_string(&load_path)
            .await
            .context("failed to read reshaped load file")?;
        let rows = parse_rows(&content)?;
        print_sample(&rows);
        println!("\nDry run - database untouched");
        return Ok(());
    }

    // An error anywhere below rolls back the open transaction and closes the
    // connection on drop; nothing half-applied survives a failed run.
    let mut conn = PgConnection::connect(&config.db_url)
        .await
        .context("could not connect to the database")?;

    prepare_target(&mut conn, args.table)
        .await
        .with_context(|| format!("failed to set up target table ans.{}", args.table))?;
    println!("Target table ans.{} ready (truncated)", args.table);

    let content = fs::read_to_string(&load_path)
        .await
        .context("failed to read reshaped load file")?;
    let rows = parse_rows(&content)?;
    print_sample(&rows);

    let inserted = insert_rows(&mut conn, args.table, &rows)
        .await
        .with_context(|| format!("failed to load table ans.{}", args.table))?;

    conn.close().await?;

    println!("\n=== Load Complete ===");
    println!("Rows inserted: {}", inserted);

    Ok(())
}
