//! Parser Service - Reshapes staged fuel sales reports into the load format
//!
//! Responsibilities:
//! - Read the staged wide CSV (one row per product/year/UF, one column per month)
//! - Unpivot the twelve month columns into one row per month with a volume
//! - Rebuild the calendar date from the Portuguese month label and the year
//! - Drop rows the upstream pivot cache failed to populate
//! - Write the long CSV under files/out/ for the loader
//!
//! CRITICAL: This stage must be DETERMINISTIC
//! Same staged file = byte-identical output

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tokio::fs;

#[derive(Parser, Debug)]
#[command(name = "parser", about = "Reshapes raw fuel sales reports for loading")]
struct Args {
    /// Source table to reshape
    #[arg(long, value_enum)]
    table: SourceTable,

    /// Dry run - reshape and report, but don't write the output file
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

/// The two report feeds this pipeline owns. Every stage binary takes one of
/// these as its sole parameter; anything else is rejected at argument parsing,
/// before any staging file is touched.
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
    in_dir: PathBuf,
    out_dir: PathBuf,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            in_dir: PathBuf::from(
                std::env::var("IN_DIR").unwrap_or_else(|_| "files/in".to_string()),
            ),
            out_dir: PathBuf::from(
                std::env::var("OUT_DIR").unwrap_or_else(|_| "files/out".to_string()),
            ),
        })
    }
}

/// Columns of the staged wide report, in order. The upstream header row is
/// untrusted and replaced by these names.
const RAW_COLUMNS: [&str; 18] = [
    "product", "year", "region", "uf", "unit", "Jan", "Fev", "Mar", "Abr", "Mai", "Jun", "Jul",
    "Ago", "Set", "Out", "Nov", "Dez", "total",
];

/// The twelve month columns, as Portuguese three-letter abbreviations.
const MONTH_LABELS: [&str; 12] = [
    "Jan", "Fev", "Mar", "Abr", "Mai", "Jun", "Jul", "Ago", "Set", "Out", "Nov", "Dez",
];

/// Portuguese month abbreviation -> month number (Jan=1 .. Dez=12).
/// A lookup scoped to this module; no process-wide locale state is involved.
fn month_number(label: &str) -> Option<u32> {
    MONTH_LABELS
        .iter()
        .position(|m| *m == label)
        .map(|i| i as u32 + 1)
}

/// One row of the reshaped output.
#[derive(Debug, Clone, PartialEq)]
struct ReshapedRow {
    product: String,
    uf: String,
    unit: String,
    volume: f64,
    year_month: NaiveDate,
}

/// Parse the `year` cell. Empty and zero mark cells the upstream pivot cache
/// failed to populate; those rows are dropped, not defaulted. The upstream
/// export sometimes carries years in float form ("2022.0").
fn parse_year(cell: &str) -> Result<Option<i32>> {
    if cell.is_empty() {
        return Ok(None);
    }
    let year: f64 = cell
        .parse()
        .with_context(|| format!("invalid year value '{}'", cell))?;
    let year = year as i32;
    Ok(if year == 0 { None } else { Some(year) })
}

/// Parse a month cell. Missing volumes are zero.
fn parse_volume(cell: &str) -> Result<f64> {
    if cell.is_empty() {
        return Ok(0.0);
    }
    cell.parse()
        .with_context(|| format!("invalid volume value '{}'", cell))
}

/// Round to 3 fraction digits, half away from zero.
fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Unpivot the wide report into one row per (product, uf, unit, month).
/// Each input row yields its twelve months consecutively, in calendar order.
/// This function is DETERMINISTIC: same input = same output.
fn reshape(content: &str) -> Result<Vec<ReshapedRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let mut rows = Vec::new();

    for (line_idx, record) in reader.records().enumerate() {
        let line_num = line_idx + 2; // 1-indexed + header
        let record = record?;

        if record.len() != RAW_COLUMNS.len() {
            bail!(
                "line {}: expected {} columns, found {}",
                line_num,
                RAW_COLUMNS.len(),
                record.len()
            );
        }

        // region (index 2) and total (index 17) are not part of the output schema
        let product = record[0].to_string();
        let uf = record[3].to_string();
        let unit = record[4].to_string();

        let year = match parse_year(&record[1]).with_context(|| format!("line {}", line_num))? {
            Some(year) => year,
            None => continue,
        };

        for (offset, label) in MONTH_LABELS.iter().enumerate() {
            let volume = parse_volume(&record[5 + offset])
                .with_context(|| format!("line {}, column {}", line_num, label))?;
            let month = month_number(label)
                .with_context(|| format!("unknown month label '{}'", label))?;
            let year_month = NaiveDate::from_ymd_opt(year, month, 1)
                .with_context(|| format!("line {}: no calendar date for {}-{}", line_num, label, year))?;

            rows.push(ReshapedRow {
                product: product.clone(),
                uf: uf.clone(),
                unit: unit.clone(),
                volume: round3(volume),
                year_month,
            });
        }
    }

    Ok(rows)
}

/// Serialize the reshaped rows: header first, volume with three fraction
/// digits, date as ISO YYYY-MM-DD, no synthetic index column.
fn write_output(rows: &[ReshapedRow]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(vec![]);
    writer.write_record(["product", "uf", "unit", "volume", "year_month"])?;

    for row in rows {
        let volume = format!("{:.3}", row.volume);
        let year_month = row.year_month.to_string();
        writer.write_record([
            row.product.as_str(),
            row.uf.as_str(),
            row.unit.as_str(),
            volume.as_str(),
            year_month.as_str(),
        ])?;
    }

    writer.flush()?;
    Ok(writer.into_inner()?)
}

/// Read the staged report, reshape it and write the load file.
/// Returns the number of rows produced.
async fn run_transform(config: &Config, table: SourceTable, dry_run: bool) -> Result<usize> {
    let in_path = config.in_dir.join(format!("{}.csv", table));
    println!("Reading staged file: {}", in_path.display());

    let content = fs::read_to_string(&in_path)
        .await
        .context("failed to read staged input file")?;
    println!("Content size: {} bytes", content.len());

    let rows = reshape(&content)?;
    println!("Reshaped into {} rows", rows.len());

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

    if dry_run {
        println!("\nDry run - output file not written");
        return Ok(rows.len());
    }

    let data = write_output(&rows)?;
    fs::create_dir_all(&config.out_dir).await?;
    let out_path = config.out_dir.join(format!("{}.csv", table));
    fs::write(&out_path, &data).await?;
    println!("Wrote: {}", out_path.display());

    Ok(rows.len())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env()?;

    println!("=== ANS Fuel Sales Parser ===");
    println!("Table: {}", args.table);
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let count = run_transform(&config, args.table, args.dry_run)
        .await
        .with_context(|| format!("transform failed for table '{}'", args.table))?;

    println!("\n=== Transform Complete ===");
    println!("Rows produced: {}", count);
    println!(
        "Ready for load: cargo run --bin loader -- --table {}",
        args.table
    );

    Ok(())
}

// =============================================================================
// TESTS - Critical for ensuring DETERMINISM
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "COMBUSTÍVEL,ANO,REGIÃO,ESTADO,UNIDADE,Jan,Fev,Mar,Abr,Mai,Jun,Jul,Ago,Set,Out,Nov,Dez,TOTAL\n";

    fn wide_row(product: &str, year: &str, uf: &str, months: [&str; 12]) -> String {
        format!(
            "{},{},SE,{},m3,{},{}\n",
            product,
            year,
            uf,
            months.join(","),
            "999.9"
        )
    }

    // -------------------------------------------------------------------------
    // DETERMINISM TESTS - Same input MUST produce same output
    // -------------------------------------------------------------------------

    #[test]
    fn test_reshape_determinism() {
        let csv = format!(
            "{}{}",
            HEADER,
            wide_row(
                "GASOLINA C",
                "2022",
                "SP",
                ["1.5", "2", "", "4", "5", "6", "7", "8", "9", "10", "11", "12"]
            )
        );

        let result1 = reshape(&csv).unwrap();
        let result2 = reshape(&csv).unwrap();
        assert_eq!(result1, result2);
    }

    #[test]
    fn test_reshape_output_byte_identical() {
        let csv = format!(
            "{}{}{}",
            HEADER,
            wide_row(
                "GASOLINA C",
                "2022",
                "SP",
                ["1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12"]
            ),
            wide_row(
                "ETANOL HIDRATADO",
                "2021",
                "RJ",
                ["0.1", "0.2", "0.3", "0.4", "0.5", "0.6", "0.7", "0.8", "0.9", "1", "1.1", "1.2"]
            )
        );

        let bytes1 = write_output(&reshape(&csv).unwrap()).unwrap();
        let bytes2 = write_output(&reshape(&csv).unwrap()).unwrap();
        assert_eq!(bytes1, bytes2);
    }

    // -------------------------------------------------------------------------
    // PIVOT CACHE GAP TESTS - year empty or zero means drop, not default
    // -------------------------------------------------------------------------

    #[test]
    fn test_empty_year_dropped() {
        let csv = format!(
            "{}{}",
            HEADER,
            wide_row("GASOLINA C", "", "SP", ["1"; 12])
        );
        assert_eq!(reshape(&csv).unwrap().len(), 0);
    }

    #[test]
    fn test_zero_year_dropped() {
        let csv = format!(
            "{}{}",
            HEADER,
            wide_row("GASOLINA C", "0", "SP", ["1"; 12])
        );
        assert_eq!(reshape(&csv).unwrap().len(), 0);
    }

    #[test]
    fn test_gap_row_does_not_drop_neighbors() {
        let csv = format!(
            "{}{}{}{}",
            HEADER,
            wide_row("GASOLINA C", "2022", "SP", ["1"; 12]),
            wide_row("GASOLINA C", "", "RJ", ["1"; 12]),
            wide_row("OLEO DIESEL", "2021", "MG", ["1"; 12])
        );
        let rows = reshape(&csv).unwrap();
        assert_eq!(rows.len(), 24);
        assert!(rows.iter().all(|r| r.uf != "RJ"));
    }

    #[test]
    fn test_float_year_accepted() {
        let csv = format!(
            "{}{}",
            HEADER,
            wide_row("GASOLINA C", "2022.0", "SP", ["1"; 12])
        );
        let rows = reshape(&csv).unwrap();
        assert_eq!(rows[0].year_month, NaiveDate::from_ymd_opt(2022, 1, 1).unwrap());
    }

    #[test]
    fn test_non_numeric_year_fails() {
        let csv = format!(
            "{}{}",
            HEADER,
            wide_row("GASOLINA C", "dois mil", "SP", ["1"; 12])
        );
        assert!(reshape(&csv).is_err());
    }

    // -------------------------------------------------------------------------
    // MONTH MAPPING TESTS - Portuguese labels, locale-free
    // -------------------------------------------------------------------------

    #[test]
    fn test_month_number_all_labels() {
        let expected = [
            ("Jan", 1),
            ("Fev", 2),
            ("Mar", 3),
            ("Abr", 4),
            ("Mai", 5),
            ("Jun", 6),
            ("Jul", 7),
            ("Ago", 8),
            ("Set", 9),
            ("Out", 10),
            ("Nov", 11),
            ("Dez", 12),
        ];
        for (label, number) in expected {
            assert_eq!(month_number(label), Some(number), "label {}", label);
        }
    }

    #[test]
    fn test_month_number_unknown_label() {
        assert_eq!(month_number("Feb"), None);
        assert_eq!(month_number("jan"), None);
        assert_eq!(month_number(""), None);
    }

    #[test]
    fn test_year_month_boundaries() {
        let csv = format!(
            "{}{}",
            HEADER,
            wide_row("GASOLINA C", "2022", "SP", ["1"; 12])
        );
        let rows = reshape(&csv).unwrap();
        assert_eq!(rows.len(), 12);
        assert_eq!(rows[0].year_month, NaiveDate::from_ymd_opt(2022, 1, 1).unwrap());
        assert_eq!(rows[11].year_month, NaiveDate::from_ymd_opt(2022, 12, 1).unwrap());
    }

    // -------------------------------------------------------------------------
    // VOLUME TESTS - zero fill, rounding, conservation
    // -------------------------------------------------------------------------

    #[test]
    fn test_missing_volume_becomes_zero() {
        let csv = format!(
            "{}{}",
            HEADER,
            wide_row(
                "GASOLINA C",
                "2022",
                "SP",
                ["", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", ""]
            )
        );
        let rows = reshape(&csv).unwrap();
        assert_eq!(rows[0].volume, 0.0);
        assert_eq!(rows[11].volume, 0.0);
        assert_eq!(rows[1].volume, 2.0);
    }

    #[test]
    fn test_volume_rounded_to_three_digits() {
        let csv = format!(
            "{}{}",
            HEADER,
            wide_row(
                "GASOLINA C",
                "2022",
                "SP",
                ["1.23456", "2.9999", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12"]
            )
        );
        let rows = reshape(&csv).unwrap();
        assert_eq!(rows[0].volume, 1.235);
        assert_eq!(rows[1].volume, 3.0);
    }

    #[test]
    fn test_non_numeric_volume_fails() {
        let csv = format!(
            "{}{}",
            HEADER,
            wide_row(
                "GASOLINA C",
                "2022",
                "SP",
                ["muito", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12"]
            )
        );
        assert!(reshape(&csv).is_err());
    }

    #[test]
    fn test_reshape_conserves_totals() {
        let months = ["10.5", "20", "30", "0.25", "5", "6", "7", "8", "9", "10", "11", "12"];
        let input_sum: f64 = months.iter().map(|m| m.parse::<f64>().unwrap()).sum();

        let csv = format!("{}{}", HEADER, wide_row("GASOLINA C", "2022", "SP", months));
        let rows = reshape(&csv).unwrap();
        let output_sum: f64 = rows.iter().map(|r| r.volume).sum();

        assert!((input_sum - output_sum).abs() < 1e-9);
    }

    // -------------------------------------------------------------------------
    // STRUCTURE TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_wrong_column_count_fails() {
        let csv = format!("{}GASOLINA C,2022,SE,SP,m3,1,2,3\n", HEADER);
        let err = reshape(&csv).unwrap_err();
        assert!(err.to_string().contains("expected 18 columns"));
    }

    #[test]
    fn test_header_only_input() {
        assert_eq!(reshape(HEADER).unwrap().len(), 0);
    }

    #[test]
    fn test_region_and_total_not_in_output() {
        let csv = format!("{}{}", HEADER, wide_row("GASOLINA C", "2022", "SP", ["1"; 12]));
        let out = String::from_utf8(write_output(&reshape(&csv).unwrap()).unwrap()).unwrap();
        assert!(out.starts_with("product,uf,unit,volume,year_month\n"));
        assert!(!out.contains("SE"));
        assert!(!out.contains("999.9"));
    }

    // -------------------------------------------------------------------------
    // CONCRETE SCENARIO - one wide row, first two months
    // -------------------------------------------------------------------------

    #[test]
    fn test_gasolina_scenario() {
        let csv = format!(
            "{}{}",
            HEADER,
            wide_row(
                "GASOLINA",
                "2022",
                "SP",
                ["100", "200", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12"]
            )
        );
        let rows = reshape(&csv).unwrap();

        assert_eq!(rows[0].product, "GASOLINA");
        assert_eq!(rows[0].uf, "SP");
        assert_eq!(rows[0].unit, "m3");
        assert_eq!(rows[0].volume, 100.0);
        assert_eq!(rows[0].year_month, NaiveDate::from_ymd_opt(2022, 1, 1).unwrap());

        assert_eq!(rows[1].volume, 200.0);
        assert_eq!(rows[1].year_month, NaiveDate::from_ymd_opt(2022, 2, 1).unwrap());

        let out = String::from_utf8(write_output(&rows).unwrap()).unwrap();
        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("product,uf,unit,volume,year_month"));
        assert_eq!(lines.next(), Some("GASOLINA,SP,m3,100.000,2022-01-01"));
        assert_eq!(lines.next(), Some("GASOLINA,SP,m3,200.000,2022-02-01"));
    }

    // -------------------------------------------------------------------------
    // TABLE PARAMETER TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_table_rejects_unknown_value() {
        assert!(SourceTable::from_str("ethanol", true).is_err());
        assert_eq!(SourceTable::from_str("diesel", true), Ok(SourceTable::Diesel));
    }
}
