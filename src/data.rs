//! Transaction loading and schema normalization using Polars

use crate::config::ColumnMapping;
use crate::error::SegmentError;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use log::{debug, info, warn};
use polars::prelude::*;
use std::collections::HashSet;
use std::path::Path;

/// Datetime layouts accepted for the sale date column, tried in order
const DATETIME_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

/// A single normalized sale.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub customer_id: String,
    pub country: String,
    /// Sale amount; negative values (refunds) are kept as-is
    pub amount: f64,
    pub quantity: i64,
    pub timestamp: NaiveDateTime,
}

/// Diagnostics gathered while loading.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub rows_read: usize,
    pub rows_kept: usize,
    pub dropped_bad_timestamp: usize,
    pub dropped_incomplete: usize,
    pub unique_customers: usize,
    pub first_timestamp: Option<NaiveDateTime>,
    pub last_timestamp: Option<NaiveDateTime>,
}

/// Loaded transactions together with their load diagnostics
#[derive(Debug, Clone)]
pub struct LoadedTransactions {
    pub records: Vec<TransactionRecord>,
    pub report: LoadReport,
}

/// Load a transaction CSV and normalize it to [`TransactionRecord`]s
///
/// # Arguments
/// * `file_path` - Path to the CSV file
/// * `columns` - Source column names for the canonical fields
///
/// # Returns
/// * `LoadedTransactions` with the surviving rows and drop counts
pub fn load_transactions(
    file_path: impl AsRef<Path>,
    columns: &ColumnMapping,
) -> crate::Result<LoadedTransactions> {
    let path = file_path.as_ref();
    if !path.is_file() {
        return Err(SegmentError::InputNotFound {
            path: path.display().to_string(),
        }
        .into());
    }

    // Every column is read as text; the casts below turn bad cells into nulls
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;

    info!("Read {} rows from {}", df.height(), path.display());
    transactions_from_frame(&df, columns)
}

/// Normalize an in-memory frame to [`TransactionRecord`]s.
///
/// Rows with an unparseable date are dropped and counted, as are rows
/// missing the customer id, country or amount.
pub fn transactions_from_frame(
    df: &DataFrame,
    columns: &ColumnMapping,
) -> crate::Result<LoadedTransactions> {
    let ids = string_column(df, "id", &columns.id)?;
    let countries = string_column(df, "country", &columns.country)?;
    let dates = string_column(df, "date", &columns.date)?;
    let amounts = numeric_column(df, "monetary", &columns.monetary)?;
    let units = optional_integer_column(df, "units", &columns.units)?;

    let mut report = LoadReport {
        rows_read: df.height(),
        ..LoadReport::default()
    };
    let mut records = Vec::with_capacity(df.height());

    for row in 0..df.height() {
        let (Some(customer_id), Some(country), Some(amount)) = (
            ids[row].as_deref(),
            countries[row].as_deref(),
            amounts[row],
        ) else {
            report.dropped_incomplete += 1;
            continue;
        };

        let Some(timestamp) = dates[row].as_deref().and_then(parse_timestamp) else {
            debug!("Dropping row {}: unparseable date {:?}", row, dates[row]);
            report.dropped_bad_timestamp += 1;
            continue;
        };

        records.push(TransactionRecord {
            customer_id: customer_id.trim().to_string(),
            country: country.trim().to_string(),
            amount,
            quantity: units.as_ref().and_then(|u| u[row]).unwrap_or(0),
            timestamp,
        });
    }

    report.rows_kept = records.len();
    report.unique_customers = records
        .iter()
        .map(|r| r.customer_id.as_str())
        .collect::<HashSet<_>>()
        .len();
    report.first_timestamp = records.iter().map(|r| r.timestamp).min();
    report.last_timestamp = records.iter().map(|r| r.timestamp).max();

    if report.dropped_bad_timestamp > 0 {
        warn!(
            "Dropped {} rows with unparseable dates",
            report.dropped_bad_timestamp
        );
    }
    if report.dropped_incomplete > 0 {
        warn!(
            "Dropped {} rows missing id, country or amount",
            report.dropped_incomplete
        );
    }
    info!(
        "Loaded {} transactions for {} customers",
        report.rows_kept, report.unique_customers
    );

    Ok(LoadedTransactions { records, report })
}

/// Parse a sale date in any of the accepted layouts
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Find the source column for a canonical field, falling back to the
/// canonical name itself.
fn resolve_column<'a>(df: &'a DataFrame, canonical: &str, source: &str) -> Option<&'a Series> {
    df.column(source).or_else(|_| df.column(canonical)).ok()
}

fn required_column<'a>(
    df: &'a DataFrame,
    canonical: &'static str,
    source: &str,
) -> crate::Result<&'a Series> {
    resolve_column(df, canonical, source).ok_or_else(|| {
        SegmentError::MissingColumn {
            canonical,
            candidates: vec![source.to_string(), canonical.to_string()],
        }
        .into()
    })
}

fn string_column(
    df: &DataFrame,
    canonical: &'static str,
    source: &str,
) -> crate::Result<Vec<Option<String>>> {
    let series = required_column(df, canonical, source)?.cast(&DataType::String)?;
    Ok(series
        .str()?
        .into_iter()
        .map(|v| v.map(str::to_string).filter(|s| !s.trim().is_empty()))
        .collect())
}

fn numeric_column(
    df: &DataFrame,
    canonical: &'static str,
    source: &str,
) -> crate::Result<Vec<Option<f64>>> {
    let series = required_column(df, canonical, source)?.cast(&DataType::Float64)?;
    Ok(series
        .f64()?
        .into_iter()
        .map(|v| v.filter(|x| x.is_finite()))
        .collect())
}

fn optional_integer_column(
    df: &DataFrame,
    canonical: &'static str,
    source: &str,
) -> crate::Result<Option<Vec<Option<i64>>>> {
    let Some(series) = resolve_column(df, canonical, source) else {
        return Ok(None);
    };
    let series = series.cast(&DataType::Float64)?;
    Ok(Some(
        series
            .f64()?
            .into_iter()
            .map(|v| v.filter(|x| x.is_finite()).map(|x| x.trunc() as i64))
            .collect(),
    ))
}
