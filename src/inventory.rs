//! Read-only discovery and diagnosis of per-entity tables.
//!
//! Nothing in this module writes to the store. Classification never fails:
//! every problem it can run into is reported as a status so the caller can
//! decide what to do with that table and move on.

use std::collections::BTreeSet;

use log::{debug, warn};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use strum_macros::{AsRefStr, Display, EnumIter};

use crate::database::{ColumnInfo, Database, TableRef};
use crate::error::TidyError;
use crate::utils::Utils;

/// Name shape of a per-entity table: literal prefix plus a fixed-width numeric code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TablePattern {
    prefix: String,
    code_width: usize,
    exclude_markers: Vec<String>,
}

impl TablePattern {
    pub fn new(prefix: &str, code_width: usize, exclude_markers: &[String]) -> Self {
        TablePattern {
            prefix: prefix.to_owned(),
            code_width,
            exclude_markers: exclude_markers
                .iter()
                .map(|m| m.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn code_width(&self) -> usize {
        self.code_width
    }

    /// True if the name carries one of the backup/temp/derived markers.
    pub fn is_excluded(&self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        self.exclude_markers.iter().any(|m| lower.contains(m.as_str()))
    }

    /// The entity code if `name` is a genuine per-entity table.
    pub fn entity_code<'a>(&self, name: &'a str) -> Option<&'a str> {
        if self.is_excluded(name) {
            return None;
        }
        let code = name.strip_prefix(self.prefix.as_str())?;
        if code.len() == self.code_width && code.bytes().all(|b| b.is_ascii_digit()) {
            Some(code)
        } else {
            None
        }
    }

    pub fn table_name(&self, code: &str) -> String {
        format!("{}{}", self.prefix, code)
    }
}

/// A per-entity table found by inventory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TableId {
    pub code: String,
    pub table: String,
}

/// Names of the surrogate key and domain date columns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnSpec {
    key: String,
    date: String,
}

impl ColumnSpec {
    pub fn new(key: &str, date: &str) -> Self {
        ColumnSpec {
            key: key.to_owned(),
            date: date.to_owned(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn date(&self) -> &str {
        &self.date
    }

    pub fn quoted_key(&self) -> String {
        Utils::quote_ident(&self.key)
    }

    pub fn quoted_date(&self) -> String {
        Utils::quote_ident(&self.date)
    }

    /// Read the table's columns and make sure both the key and the date column exist.
    ///
    /// Done up front because SQLite would otherwise read a quoted unknown
    /// column name as a string literal.
    pub fn verify(&self, conn: &Connection, table: &TableRef) -> Result<Vec<ColumnInfo>, TidyError> {
        let table_columns = Database::table_columns(conn, table)?;
        if table_columns.is_empty() {
            return Err(TidyError::Error(format!("no such table: {}", table)));
        }
        for wanted in [&self.key, &self.date] {
            if !table_columns.iter().any(|c| c.name.eq_ignore_ascii_case(wanted)) {
                return Err(TidyError::Error(format!(
                    "no such column: {} in {}",
                    wanted, table
                )));
            }
        }
        Ok(table_columns)
    }
}

#[derive(AsRefStr, Display, EnumIter, Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[strum(serialize = "empty")]
    Empty,
    #[strum(serialize = "correct")]
    Correct,
    #[strum(serialize = "incorrect")]
    Incorrect,
    #[strum(serialize = "count-mismatch")]
    CountMismatch,
    #[strum(serialize = "broken")]
    Broken,
}

impl OrderStatus {
    /// Whether the reorder engine has anything to do for a table in this state.
    pub fn needs_reorder(&self) -> bool {
        matches!(self, OrderStatus::Incorrect)
    }

    /// Statuses that mean the table could not be diagnosed.
    pub fn is_unclassifiable(&self) -> bool {
        matches!(self, OrderStatus::CountMismatch | OrderStatus::Broken)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub status: OrderStatus,
    pub count: i64,
    pub first_date: Option<String>,
    pub last_date: Option<String>,
    pub dates_well_formed: bool,
    pub detail: Option<String>,
}

impl Classification {
    fn empty() -> Self {
        Classification {
            status: OrderStatus::Empty,
            count: 0,
            first_date: None,
            last_date: None,
            dates_well_formed: true,
            detail: None,
        }
    }

    fn unclassifiable(status: OrderStatus, count: i64, detail: impl Into<String>) -> Self {
        Classification {
            status,
            count,
            first_date: None,
            last_date: None,
            dates_well_formed: false,
            detail: Some(Utils::bounded_detail(detail)),
        }
    }

    /// `first -> last` for display, or `-` when unknown.
    pub fn date_span(&self) -> String {
        match (&self.first_date, &self.last_date) {
            (Some(first), Some(last)) => format!("{}->{}", first, last),
            _ => "-".to_owned(),
        }
    }
}

/// Ascending means the date at the lowest key is not after the date at the highest key.
pub fn is_ascending(first_date: &str, last_date: &str) -> bool {
    first_date <= last_date
}

/// List every per-entity table in `schema`, ordered by entity code.
pub fn list_candidate_tables(
    conn: &Connection,
    schema: &str,
    pattern: &TablePattern,
) -> Result<Vec<TableId>, TidyError> {
    Database::require_schema(conn, schema)?;

    let mut tables: Vec<TableId> = Database::list_tables(conn, schema)?
        .into_iter()
        .filter_map(|name| {
            pattern.entity_code(&name).map(|code| TableId {
                code: code.to_owned(),
                table: name.clone(),
            })
        })
        .collect();

    tables.sort_by(|a, b| a.code.cmp(&b.code));
    debug!(
        "Found {} candidate table(s) matching '{}' in schema '{}'",
        tables.len(),
        pattern.prefix(),
        schema
    );
    Ok(tables)
}

/// Diagnose the order of one table with read-only queries (row count, NULL dates, both endpoints).
pub fn classify(conn: &Connection, table: &TableRef, columns: &ColumnSpec) -> Classification {
    match try_classify(conn, table, columns) {
        Ok(classification) => classification,
        Err(e) => {
            warn!("Could not classify {}: {}", table, e);
            Classification::unclassifiable(OrderStatus::Broken, 0, e.to_string())
        }
    }
}

fn try_classify(
    conn: &Connection,
    table: &TableRef,
    columns: &ColumnSpec,
) -> Result<Classification, TidyError> {
    columns.verify(conn, table)?;
    let count = Database::count_rows(conn, table)?;
    if count == 0 {
        return Ok(Classification::empty());
    }

    // Interior NULL dates sort ahead of every real date, so the rewrite could
    // never produce an ascending table.
    let null_dates = count_null_dates(conn, table, columns)?;
    if null_dates > 0 {
        return Ok(Classification::unclassifiable(
            OrderStatus::Broken,
            count,
            format!("{} row(s) with NULL {}", null_dates, columns.date()),
        ));
    }

    let first = endpoint_date(conn, table, columns, "ASC")?;
    let last = endpoint_date(conn, table, columns, "DESC")?;

    let (first, last) = match (first, last) {
        (Some(first), Some(last)) => (first, last),
        _ => {
            return Ok(Classification::unclassifiable(
                OrderStatus::CountMismatch,
                count,
                format!("{} row(s) counted but no endpoint rows found", count),
            ))
        }
    };

    let (first, last) = match (first, last) {
        (EndpointDate::Value(first), EndpointDate::Value(last)) => (first, last),
        (EndpointDate::Unusable(reason), _) | (_, EndpointDate::Unusable(reason)) => {
            return Ok(Classification::unclassifiable(OrderStatus::Broken, count, reason))
        }
    };

    let dates_well_formed = Utils::is_well_formed_date(&first) && Utils::is_well_formed_date(&last);
    if !dates_well_formed {
        warn!(
            "{} has dates outside the YYYYMMDD shape ({} -> {}); comparing as strings",
            table, first, last
        );
    }

    let status = if is_ascending(&first, &last) {
        OrderStatus::Correct
    } else {
        OrderStatus::Incorrect
    };

    Ok(Classification {
        status,
        count,
        first_date: Some(first),
        last_date: Some(last),
        dates_well_formed,
        detail: None,
    })
}

fn count_null_dates(
    conn: &Connection,
    table: &TableRef,
    columns: &ColumnSpec,
) -> Result<i64, TidyError> {
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE {} IS NULL",
        table.qualified(),
        columns.quoted_date()
    );
    Ok(conn.query_row(&sql, [], |row| row.get(0))?)
}

enum EndpointDate {
    Value(String),
    Unusable(String),
}

fn endpoint_date(
    conn: &Connection,
    table: &TableRef,
    columns: &ColumnSpec,
    direction: &str,
) -> Result<Option<EndpointDate>, TidyError> {
    let sql = format!(
        "SELECT {date} FROM {table} ORDER BY {key} {direction} LIMIT 1",
        date = columns.quoted_date(),
        table = table.qualified(),
        key = columns.quoted_key(),
        direction = direction,
    );

    let value = conn
        .query_row(&sql, [], |row| row.get::<_, Value>(0))
        .optional()?;

    Ok(value.map(|value| match value {
        Value::Text(text) => EndpointDate::Value(text),
        // Integer-typed YYYYMMDD values compare the same way once rendered
        Value::Integer(number) => EndpointDate::Value(number.to_string()),
        Value::Null => EndpointDate::Unusable(format!(
            "NULL {} at the {} end of the key order",
            columns.date(),
            if direction == "ASC" { "first" } else { "last" }
        )),
        Value::Real(_) | Value::Blob(_) => EndpointDate::Unusable(format!(
            "{} holds a non-text value",
            columns.date()
        )),
    }))
}

/// Outcome of classifying a leading sample of the work list.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Survey {
    pub total_tables: usize,
    pub sampled: usize,
    pub correct: usize,
    pub incorrect: usize,
    pub empty: usize,
    pub unclassifiable: usize,
}

impl Survey {
    /// Extrapolated number of tables needing reorder across the whole list.
    pub fn estimated_reorders(&self) -> usize {
        if self.sampled == 0 {
            return 0;
        }
        self.incorrect * self.total_tables / self.sampled
    }

    pub fn percent(&self, part: usize) -> f64 {
        if self.sampled == 0 {
            0.0
        } else {
            part as f64 * 100.0 / self.sampled as f64
        }
    }
}

/// Classify the first `sample_size` tables to preview the work ahead.
pub fn survey(
    conn: &Connection,
    schema: &str,
    tables: &[TableId],
    columns: &ColumnSpec,
    sample_size: usize,
) -> Survey {
    let mut survey = Survey {
        total_tables: tables.len(),
        ..Default::default()
    };

    for id in tables.iter().take(sample_size) {
        let classification = classify(conn, &TableRef::new(schema, &id.table), columns);
        survey.sampled += 1;
        match classification.status {
            OrderStatus::Correct => survey.correct += 1,
            OrderStatus::Incorrect => survey.incorrect += 1,
            OrderStatus::Empty => survey.empty += 1,
            OrderStatus::CountMismatch | OrderStatus::Broken => survey.unclassifiable += 1,
        }
    }

    survey
}

/// Tables of one schema split by what they are.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableCategories {
    pub entity: Vec<String>,
    pub backup: Vec<String>,
    pub other: Vec<String>,
}

impl TableCategories {
    pub fn total(&self) -> usize {
        self.entity.len() + self.backup.len() + self.other.len()
    }
}

/// Split table names into per-entity tables, backup/temp leftovers and everything else.
///
/// Anything starting with the prefix that isn't a clean entity name (for example
/// `daily_prices_005930_backup_1752651898`) counts as a backup.
pub fn categorize<I, S>(names: I, pattern: &TablePattern) -> TableCategories
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut categories = TableCategories::default();
    for name in names {
        let name = name.as_ref();
        if pattern.entity_code(name).is_some() {
            categories.entity.push(name.to_owned());
        } else if name.starts_with(pattern.prefix()) || pattern.is_excluded(name) {
            categories.backup.push(name.to_owned());
        } else {
            categories.other.push(name.to_owned());
        }
    }
    categories
}

const REGISTRY_CODE_COLUMN: &str = "code";
const REGISTRY_ACTIVE_COLUMN: &str = "is_active";

/// Entity codes listed in a registry table such as `stock_codes`.
///
/// Reads its `code` column, keeping only rows with `is_active = 1` when the
/// table has that column. Codes are zero-padded to the pattern's width.
pub fn active_codes(
    conn: &Connection,
    registry: &TableRef,
    pattern: &TablePattern,
) -> Result<BTreeSet<String>, TidyError> {
    let registry_columns = Database::table_columns(conn, registry)?;
    if registry_columns.is_empty() {
        return Err(TidyError::Error(format!(
            "Registry table {} does not exist",
            registry
        )));
    }
    let has_column = |name: &str| {
        registry_columns
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(name))
    };
    if !has_column(REGISTRY_CODE_COLUMN) {
        return Err(TidyError::Error(format!(
            "Registry table {} has no '{}' column",
            registry, REGISTRY_CODE_COLUMN
        )));
    }

    let mut sql = format!(
        "SELECT {} FROM {}",
        Utils::quote_ident(REGISTRY_CODE_COLUMN),
        registry.qualified()
    );
    if has_column(REGISTRY_ACTIVE_COLUMN) {
        sql.push_str(&format!(" WHERE {} = 1", Utils::quote_ident(REGISTRY_ACTIVE_COLUMN)));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| row.get::<_, Value>(0))?;

    let mut codes = BTreeSet::new();
    for value in rows {
        let code = match value? {
            Value::Text(text) => text,
            Value::Integer(number) => number.to_string(),
            _ => continue,
        };
        codes.insert(format!(
            "{:0>width$}",
            code.trim(),
            width = pattern.code_width()
        ));
    }
    debug!("{} active code(s) in {}", codes.len(), registry);
    Ok(codes)
}
