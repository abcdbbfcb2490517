//! Relocating per-entity tables: between attached schemas of the store, and
//! from a standalone SQLite file into the store.
//!
//! Each table is copied inside its own immediate transaction and its row
//! count checked before commit, so a failure leaves that table exactly where
//! it was and the run moves on to the next one.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, info, warn, Level};
use logging_timer::timer;
use rusqlite::Connection;
use serde::Serialize;
use strum_macros::{AsRefStr, Display};

use crate::database::{Database, TableRef};
use crate::error::TidyError;
use crate::inventory::{list_candidate_tables, ColumnSpec, TableId, TablePattern};
use crate::utils::Utils;

/// Alias the import source file is attached under for the duration of an import.
pub const IMPORT_SCHEMA: &str = "tabletidy_import";

#[derive(AsRefStr, Display, Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    #[strum(serialize = "moved")]
    Moved,
    #[strum(serialize = "imported")]
    Imported,
    #[strum(serialize = "exists")]
    SkippedExisting,
    #[strum(serialize = "empty")]
    SkippedEmpty,
    #[strum(serialize = "failed")]
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    pub table: String,
    pub status: TransferStatus,
    pub rows: i64,
    pub detail: Option<String>,
}

impl TransferReport {
    fn new(table: &str, status: TransferStatus, rows: i64) -> Self {
        TransferReport {
            table: table.to_owned(),
            status,
            rows,
            detail: None,
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(Utils::bounded_detail(detail));
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TransferSummary {
    pub reports: Vec<TransferReport>,
    pub interrupted: bool,
}

impl TransferSummary {
    pub fn count(&self, status: TransferStatus) -> usize {
        self.reports.iter().filter(|r| r.status == status).count()
    }

    pub fn rows_copied(&self) -> i64 {
        self.reports
            .iter()
            .filter(|r| matches!(r.status, TransferStatus::Moved | TransferStatus::Imported))
            .map(|r| r.rows)
            .sum()
    }
}

/// Rewrite a recorded `CREATE TABLE` statement so it creates `dest` instead.
fn retarget_ddl(ddl: &str, dest: &TableRef) -> Result<String, TidyError> {
    let open = ddl
        .find('(')
        .ok_or_else(|| TidyError::Error(format!("Unexpected table definition: {}", ddl)))?;
    Ok(format!("CREATE TABLE {} {}", dest.qualified(), &ddl[open..]))
}

fn create_like(conn: &Connection, source: &TableRef, dest: &TableRef) -> Result<(), TidyError> {
    let ddl = Database::table_sql(conn, source)?
        .ok_or_else(|| TidyError::Error(format!("no such table: {}", source)))?;
    conn.execute_batch(&retarget_ddl(&ddl, dest)?)?;
    Ok(())
}

/// Move one table to `dest_schema`, keys and all. Returns the rows moved.
pub fn move_table(conn: &Connection, source: &TableRef, dest_schema: &str) -> Result<i64, TidyError> {
    let _tmr = timer!(Level::Trace; "move_table", "{} -> {}", source, dest_schema);
    let dest = TableRef::new(dest_schema, source.name());

    Database::immediate_transaction(conn, |conn| {
        let expected = Database::count_rows(conn, source)?;
        create_like(conn, source, &dest)?;
        conn.execute(
            &format!("INSERT INTO {} SELECT * FROM {}", dest.qualified(), source.qualified()),
            [],
        )?;

        let copied = Database::count_rows(conn, &dest)?;
        if copied != expected {
            return Err(TidyError::Error(format!(
                "copied {} of {} rows into {}",
                copied, expected, dest
            )));
        }
        Database::drop_table(conn, source)?;
        Ok(copied)
    })
}

/// Move each listed table from `from` to `to`. Tables already present in
/// `to` are left alone in both schemas.
pub fn move_tables(
    conn: &Connection,
    from: &str,
    to: &str,
    tables: &[TableId],
    interrupt: &AtomicBool,
) -> Result<TransferSummary, TidyError> {
    Database::require_schema(conn, from)?;
    Database::require_schema(conn, to)?;
    if from.eq_ignore_ascii_case(to) {
        return Err(TidyError::Error(format!(
            "Source and destination schema are both '{}'",
            from
        )));
    }

    let mut summary = TransferSummary::default();
    for id in tables {
        if interrupt.load(Ordering::SeqCst) {
            summary.interrupted = true;
            break;
        }

        let source = TableRef::new(from, &id.table);
        let dest = TableRef::new(to, &id.table);

        let report = if Database::table_exists(conn, &dest)? {
            warn!("{} already exists, leaving {} in place", dest, source);
            TransferReport::new(&id.table, TransferStatus::SkippedExisting, 0)
        } else {
            match move_table(conn, &source, to) {
                Ok(rows) => {
                    info!("Moved {} -> {} ({} rows)", source, dest, rows);
                    TransferReport::new(&id.table, TransferStatus::Moved, rows)
                }
                Err(e) => {
                    error!("Moving {} failed: {}", source, e);
                    TransferReport::new(&id.table, TransferStatus::Failed, 0).with_detail(e.to_string())
                }
            }
        };
        summary.reports.push(report);
    }

    Ok(summary)
}

/// Copy one table's payload into `dest` ordered by date, letting `dest`
/// assign fresh keys. `dest` is created from the source definition if missing
/// and must otherwise be empty.
pub fn import_table(
    conn: &Connection,
    source: &TableRef,
    dest: &TableRef,
    columns: &ColumnSpec,
) -> Result<TransferReport, TidyError> {
    let _tmr = timer!(Level::Trace; "import_table", "{} -> {}", source, dest);

    let source_columns = columns.verify(conn, source)?;
    let expected = Database::count_rows(conn, source)?;
    if expected == 0 {
        return Ok(TransferReport::new(dest.name(), TransferStatus::SkippedEmpty, 0));
    }

    Database::immediate_transaction(conn, |conn| {
        if Database::table_exists(conn, dest)? {
            let existing = Database::count_rows(conn, dest)?;
            if existing > 0 {
                return Ok(TransferReport::new(dest.name(), TransferStatus::SkippedExisting, existing));
            }
        } else {
            create_like(conn, source, dest)?;
        }

        let dest_columns = Database::table_columns(conn, dest)?;
        let shared = source_columns
            .iter()
            .filter(|c| !c.name.eq_ignore_ascii_case(columns.key()))
            .filter(|c| dest_columns.iter().any(|d| d.name.eq_ignore_ascii_case(&c.name)))
            .map(|c| Utils::quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");

        conn.execute(
            &format!(
                "INSERT INTO {dest} ({cols}) SELECT {cols} FROM {source} ORDER BY {date} ASC, {key} ASC",
                dest = dest.qualified(),
                source = source.qualified(),
                cols = shared,
                date = columns.quoted_date(),
                key = columns.quoted_key(),
            ),
            [],
        )?;

        let copied = Database::count_rows(conn, dest)?;
        if copied != expected {
            return Err(TidyError::Error(format!(
                "imported {} of {} rows into {}",
                copied, expected, dest
            )));
        }
        Ok(TransferReport::new(dest.name(), TransferStatus::Imported, copied))
    })
}

/// Import every per-entity table found in the SQLite file at `source_file`
/// into `dest_schema`.
pub fn import_tables(
    conn: &Connection,
    source_file: &Path,
    dest_schema: &str,
    pattern: &TablePattern,
    columns: &ColumnSpec,
    interrupt: &AtomicBool,
) -> Result<TransferSummary, TidyError> {
    if !source_file.is_file() {
        return Err(TidyError::Error(format!(
            "Import source '{}' does not exist",
            source_file.display()
        )));
    }
    Database::require_schema(conn, dest_schema)?;
    Database::attach_on(conn, IMPORT_SCHEMA, source_file)?;

    let result = import_attached(conn, dest_schema, pattern, columns, interrupt);

    if let Err(e) = Database::detach_on(conn, IMPORT_SCHEMA) {
        warn!("Could not detach import source: {}", e);
    }
    result
}

fn import_attached(
    conn: &Connection,
    dest_schema: &str,
    pattern: &TablePattern,
    columns: &ColumnSpec,
    interrupt: &AtomicBool,
) -> Result<TransferSummary, TidyError> {
    let tables = list_candidate_tables(conn, IMPORT_SCHEMA, pattern)?;
    info!(
        "Importing up to {} table(s) into schema {}",
        tables.len(),
        dest_schema
    );

    let mut summary = TransferSummary::default();
    for id in &tables {
        if interrupt.load(Ordering::SeqCst) {
            summary.interrupted = true;
            break;
        }

        let source = TableRef::new(IMPORT_SCHEMA, &id.table);
        let dest = TableRef::new(dest_schema, &id.table);
        let report = match import_table(conn, &source, &dest, columns) {
            Ok(report) => {
                info!("{}: {} ({} rows)", dest, report.status, report.rows);
                report
            }
            Err(e) => {
                error!("Importing {} failed: {}", id.table, e);
                TransferReport::new(&id.table, TransferStatus::Failed, 0).with_detail(e.to_string())
            }
        };
        summary.reports.push(report);
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MAIN_SCHEMA;
    use crate::test_support::{self, TestStore};
    use pretty_assertions::assert_eq;

    fn pattern() -> TablePattern {
        TablePattern::new("daily_prices_", 6, &["backup".to_owned(), "temp".to_owned()])
    }

    fn columns() -> ColumnSpec {
        ColumnSpec::new("id", "date")
    }

    fn ids(names: &[&str]) -> Vec<TableId> {
        names
            .iter()
            .map(|n| TableId {
                code: n.trim_start_matches("daily_prices_").to_owned(),
                table: (*n).to_owned(),
            })
            .collect()
    }

    #[test]
    fn test_retarget_ddl() {
        let dest = TableRef::new("archive", "daily_prices_005930");
        assert_eq!(
            retarget_ddl("CREATE TABLE daily_prices_005930 (id INTEGER PRIMARY KEY, date TEXT)", &dest).unwrap(),
            "CREATE TABLE \"archive\".\"daily_prices_005930\" (id INTEGER PRIMARY KEY, date TEXT)"
        );
        assert!(retarget_ddl("CREATE VIRTUAL TABLE x USING fts5", &dest).is_err());
    }

    #[test]
    fn test_move_tables_between_schemas() {
        let store = TestStore::new(&["archive"]);
        let conn = store.conn();
        let moving = test_support::price_table(
            conn,
            MAIN_SCHEMA,
            "daily_prices_005930",
            &["20240103", "20240101", "20240102"],
        );
        let before = test_support::snapshot(conn, &moving);
        test_support::price_table(conn, MAIN_SCHEMA, "daily_prices_000020", &["20240101"]);
        test_support::price_table(conn, "archive", "daily_prices_000020", &["20230101"]);

        let summary = move_tables(
            conn,
            MAIN_SCHEMA,
            "archive",
            &ids(&["daily_prices_005930", "daily_prices_000020"]),
            &AtomicBool::new(false),
        )
        .unwrap();

        assert_eq!(summary.count(TransferStatus::Moved), 1);
        assert_eq!(summary.count(TransferStatus::SkippedExisting), 1);
        assert_eq!(summary.rows_copied(), 3);

        let moved = TableRef::new("archive", "daily_prices_005930");
        assert_eq!(test_support::snapshot(conn, &moved), before);
        assert!(!Database::table_exists(conn, &moving).unwrap());

        // The conflicting table stays in both places, untouched
        let kept = TableRef::new(MAIN_SCHEMA, "daily_prices_000020");
        assert_eq!(test_support::dates_by_key(conn, &kept), vec!["20240101"]);
        let existing = TableRef::new("archive", "daily_prices_000020");
        assert_eq!(test_support::dates_by_key(conn, &existing), vec!["20230101"]);
    }

    #[test]
    fn test_move_to_same_schema_is_rejected() {
        let store = TestStore::new(&[]);
        let result = move_tables(store.conn(), MAIN_SCHEMA, "MAIN", &[], &AtomicBool::new(false));
        assert!(result.is_err());
    }

    #[test]
    fn test_import_orders_rows_and_skips_populated_tables() {
        let store = TestStore::new(&[]);
        let conn = store.conn();

        let source_path = store.dir.path().join("legacy.db");
        {
            let source = Connection::open(&source_path).unwrap();
            test_support::price_table(
                &source,
                MAIN_SCHEMA,
                "daily_prices_005930",
                &["20240103", "20240101", "20240102"],
            );
            test_support::price_table(&source, MAIN_SCHEMA, "daily_prices_000020", &["20240101"]);
            test_support::price_table(&source, MAIN_SCHEMA, "daily_prices_000030", &["20240101"]);
            test_support::price_table(&source, MAIN_SCHEMA, "daily_prices_000040", &[]);
            test_support::price_table(&source, MAIN_SCHEMA, "daily_prices_000050_backup_1752651898", &["20240101"]);
        }

        // Populated: must not be touched. Empty: filled.
        test_support::price_table(conn, MAIN_SCHEMA, "daily_prices_000020", &["20230101", "20230102"]);
        test_support::price_table(conn, MAIN_SCHEMA, "daily_prices_000030", &[]);

        let summary = import_tables(
            conn,
            &source_path,
            MAIN_SCHEMA,
            &pattern(),
            &columns(),
            &AtomicBool::new(false),
        )
        .unwrap();

        let statuses: Vec<(String, TransferStatus)> = summary
            .reports
            .iter()
            .map(|r| (r.table.clone(), r.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("daily_prices_000020".to_owned(), TransferStatus::SkippedExisting),
                ("daily_prices_000030".to_owned(), TransferStatus::Imported),
                ("daily_prices_000040".to_owned(), TransferStatus::SkippedEmpty),
                ("daily_prices_005930".to_owned(), TransferStatus::Imported),
            ]
        );

        let imported = TableRef::new(MAIN_SCHEMA, "daily_prices_005930");
        assert_eq!(
            test_support::dates_by_key(conn, &imported),
            vec!["20240101", "20240102", "20240103"]
        );
        let untouched = TableRef::new(MAIN_SCHEMA, "daily_prices_000020");
        assert_eq!(test_support::dates_by_key(conn, &untouched), vec!["20230101", "20230102"]);

        assert!(!Database::schema_exists(conn, IMPORT_SCHEMA).unwrap());
    }

    #[test]
    fn test_import_missing_file() {
        let store = TestStore::new(&[]);
        let missing = store.dir.path().join("nope.db");
        let result = import_tables(
            store.conn(),
            &missing,
            MAIN_SCHEMA,
            &pattern(),
            &columns(),
            &AtomicBool::new(false),
        );
        assert!(result.is_err());
        assert!(!Database::schema_exists(store.conn(), IMPORT_SCHEMA).unwrap());
    }
}
