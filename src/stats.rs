//! Structural report on per-entity tables: shape, key range, duplicate
//! dates and how rows spread over years. Read-only.

use rusqlite::Connection;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use crate::database::{Database, TableRef};
use crate::error::TidyError;
use crate::inventory::ColumnSpec;
use crate::utils::Utils;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ColumnStat {
    pub name: String,
    pub decl_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DateCount {
    pub date: String,
    pub count: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct YearCount {
    pub year: String,
    pub count: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnStat>,
    pub rows: i64,
    pub key_min: Option<i64>,
    pub key_max: Option<i64>,
    /// Key values missing from the `key_min..=key_max` range.
    pub key_gaps: i64,
    pub min_date: Option<String>,
    pub max_date: Option<String>,
    pub duplicate_dates: Vec<DateCount>,
    pub years: Vec<YearCount>,
}

pub fn table_stats(
    conn: &Connection,
    table: &TableRef,
    columns: &ColumnSpec,
) -> Result<TableStats, TidyError> {
    let column_info = columns.verify(conn, table)?;
    let rows = Database::count_rows(conn, table)?;

    let (key_min, key_max): (Option<i64>, Option<i64>) = conn.query_row(
        &format!(
            "SELECT MIN({key}), MAX({key}) FROM {table}",
            key = columns.quoted_key(),
            table = table.qualified()
        ),
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let key_gaps = match (key_min, key_max) {
        (Some(min), Some(max)) => (max - min + 1 - rows).max(0),
        _ => 0,
    };

    let (min_date, max_date): (Option<String>, Option<String>) = conn.query_row(
        &format!(
            "SELECT CAST(MIN({date}) AS TEXT), CAST(MAX({date}) AS TEXT) FROM {table}",
            date = columns.quoted_date(),
            table = table.qualified()
        ),
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT CAST({date} AS TEXT), COUNT(*) FROM {table}
         GROUP BY {date} HAVING COUNT(*) > 1 ORDER BY {date}",
        date = columns.quoted_date(),
        table = table.qualified()
    ))?;
    let duplicate_dates = stmt
        .query_map([], |row| {
            Ok(DateCount {
                date: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                count: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(&format!(
        "SELECT substr(CAST({date} AS TEXT), 1, 4) AS year, COUNT(*) FROM {table}
         GROUP BY year ORDER BY year",
        date = columns.quoted_date(),
        table = table.qualified()
    ))?;
    let years = stmt
        .query_map([], |row| {
            Ok(YearCount {
                year: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                count: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TableStats {
        schema: table.schema().to_owned(),
        table: table.name().to_owned(),
        columns: column_info
            .into_iter()
            .map(|c| ColumnStat {
                name: c.name,
                decl_type: c.decl_type,
            })
            .collect(),
        rows,
        key_min,
        key_max,
        key_gaps,
        min_date,
        max_date,
        duplicate_dates,
        years,
    })
}

#[derive(Tabled)]
struct StatsRow {
    table: String,
    rows: String,
    keys: String,
    gaps: i64,
    dates: String,
    duplicates: usize,
    columns: usize,
}

impl From<&TableStats> for StatsRow {
    fn from(stats: &TableStats) -> Self {
        let keys = match (stats.key_min, stats.key_max) {
            (Some(min), Some(max)) => format!("{}..{}", min, max),
            _ => "-".to_owned(),
        };
        let dates = match (&stats.min_date, &stats.max_date) {
            (Some(min), Some(max)) => format!("{}..{}", min, max),
            _ => "-".to_owned(),
        };
        StatsRow {
            table: stats.table.clone(),
            rows: Utils::format_count(stats.rows.max(0) as u64),
            keys,
            gaps: stats.key_gaps,
            dates,
            duplicates: stats.duplicate_dates.len(),
            columns: stats.columns.len(),
        }
    }
}

/// One summary row per table.
pub fn render_table(stats: &[TableStats]) -> String {
    let rows: Vec<StatsRow> = stats.iter().map(StatsRow::from).collect();
    Table::new(rows).with(Style::modern()).to_string()
}

/// Columns, duplicate dates and per-year counts of a single table.
pub fn render_detail(stats: &TableStats) -> String {
    let mut out = format!("{}.{}\n", stats.schema, stats.table);
    out.push_str("  columns:\n");
    for column in &stats.columns {
        out.push_str(&format!("    {} {}\n", column.name, column.decl_type));
    }
    if !stats.duplicate_dates.is_empty() {
        out.push_str("  duplicate dates:\n");
        for dup in &stats.duplicate_dates {
            out.push_str(&format!("    {} x{}\n", dup.date, dup.count));
        }
    }
    out.push_str("  rows per year:\n");
    for year in &stats.years {
        out.push_str(&format!(
            "    {} {}\n",
            year.year,
            Utils::format_count(year.count.max(0) as u64)
        ));
    }
    out
}

pub fn to_json(stats: &[TableStats]) -> Result<String, TidyError> {
    serde_json::to_string_pretty(stats).map_err(|e| TidyError::Error(e.to_string()))
}
