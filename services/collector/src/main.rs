//! Collector Service - Downloads raw fuel sales reports from the upstream server
//!
//! Responsibilities:
//! - Fetch the wide-format sales CSV for one source table (oil or diesel)
//! - Stage the payload verbatim under files/in/ for the parser
//!
//! Retries, checksums and partial-download detection are deliberately absent:
//! the orchestrator that schedules this binary owns retry policy, and a failed
//! or truncated download surfaces on the next stage.
//!
//! Usage:
//!   cargo run --bin collector -- --table oil
//!   cargo run --bin collector -- --table diesel

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

#[derive(Parser, Debug)]
#[command(name = "collector", about = "Collects raw fuel sales reports")]
struct Args {
    /// Source table to fetch
    #[arg(long, value_enum)]
    table: SourceTable,
}

/// The two report feeds this pipeline owns. Every stage binary takes one of
/// these as its sole parameter; anything else is rejected at argument parsing,
/// before any file or database object is touched.
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
    fetch_base_url: String,
    in_dir: PathBuf,
    timeout_secs: u64,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            fetch_base_url: std::env::var("FETCH_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:5000".to_string()),
            in_dir: PathBuf::from(
                std::env::var("IN_DIR").unwrap_or_else(|_| "files/in".to_string()),
            ),
            timeout_secs: std::env::var("FETCH_TIMEOUT_SECS")
                .unwrap_or_else(|_| "120".to_string())
                .parse()
                .unwrap_or(120),
        })
    }
}

/// Endpoint serving the raw report for a table.
fn endpoint(base_url: &str, table: SourceTable) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), table.as_str())
}

/// Staging path the raw payload is written to.
fn staged_path(in_dir: &Path, table: SourceTable) -> PathBuf {
    in_dir.join(format!("{}.csv", table.as_str()))
}

/// Fetch the report for `table` and stage it verbatim.
/// Returns the path of the staged file.
async fn fetch_table(
    client: &reqwest::Client,
    config: &Config,
    table: SourceTable,
) -> Result<PathBuf> {
    let url = endpoint(&config.fetch_base_url, table);
    println!("  Fetching: {}", url);

    let resp = client
        .get(&url)
        .send()
        .await?
        .error_for_status()
        .context("HTTP request failed")?;

    let bytes = resp.bytes().await?;
    println!("  Downloaded: {} bytes", bytes.len());

    fs::create_dir_all(&config.in_dir).await?;
    let dest = staged_path(&config.in_dir, table);
    fs::write(&dest, &bytes).await?;
    println!("  Saved to: {}", dest.display());

    Ok(dest)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env()?;

    println!("=== ANS Fuel Sales Collector ===");
    println!("Table: {}", args.table);
    println!("Source: {}", config.fetch_base_url);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .user_agent("ans-fuel-pipeline/0.1 (collector)")
        .build()?;

    let dest = fetch_table(&client, &config, args.table)
        .await
        .with_context(|| format!("failed to fetch report for table '{}'", args.table))?;

    println!("\n=== Collection Complete ===");
    println!("Staged file: {}", dest.display());
    println!(
        "Ready for transform: cargo run --bin parser -- --table {}",
        args.table
    );

    Ok(())
}
