//! The safe reorder protocol for a single table.
//!
//! 1. Classify. Only a table whose first date (lowest key) is after its last
//!    date is touched; anything else is a no-op or a failure with no writes.
//! 2. Snapshot the table into a backup table and confirm the copy has the same
//!    row count, committed on its own.
//! 3-5. In one immediate transaction: delete all rows, re-insert the payload
//!    columns from the backup ordered by date (keys are re-assigned), then check
//!    the row count and the first/last dates.
//! 6. Commit, then drop the backup in a second transaction.
//!
//! Any failure in 3-5 rolls back to the exact pre-run content and keeps the
//! backup. No error escapes `reorder`; everything becomes a `ReorderOutcome`.
//!
//! Operators must make sure nothing else writes the table while this runs.

use log::{error, info, warn, Level};
use logging_timer::timer;
use rusqlite::Connection;
use serde::Serialize;
use strum_macros::{AsRefStr, Display};

use crate::backup::{BackupName, RunId};
use crate::database::{Database, TableRef};
use crate::error::TidyError;
use crate::inventory::{classify, ColumnSpec, OrderStatus};
use crate::utils::Utils;

#[derive(AsRefStr, Display, Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    #[strum(serialize = "reordered")]
    Reordered,
    #[strum(serialize = "already-ordered")]
    AlreadyOrdered,
    #[strum(serialize = "empty")]
    Empty,
    #[strum(serialize = "failed")]
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReorderOutcome {
    pub kind: OutcomeKind,
    pub detail: String,
    pub rows_before: i64,
    pub rows_after: Option<i64>,
    /// Backup table left in place for manual recovery.
    pub retained_backup: Option<String>,
}

impl ReorderOutcome {
    fn no_op(kind: OutcomeKind, rows: i64, detail: impl Into<String>) -> Self {
        ReorderOutcome {
            kind,
            detail: Utils::bounded_detail(detail),
            rows_before: rows,
            rows_after: Some(rows),
            retained_backup: None,
        }
    }

    fn failed(rows_before: i64, retained_backup: Option<&TableRef>, detail: impl Into<String>) -> Self {
        ReorderOutcome {
            kind: OutcomeKind::Failed,
            detail: Utils::bounded_detail(detail),
            rows_before,
            rows_after: None,
            retained_backup: retained_backup.map(|b| b.name().to_owned()),
        }
    }
}

/// Rewrite `table` so that key order matches ascending date order.
///
/// Safe to call on any table: ordered and empty tables are left alone, so a
/// second call right after a successful one is always a no-op.
pub fn reorder(
    conn: &Connection,
    table: &TableRef,
    columns: &ColumnSpec,
    run_id: &RunId,
) -> ReorderOutcome {
    let _tmr = timer!(Level::Trace; "reorder", "{}", table);

    let before = classify(conn, table, columns);
    let rows = before.count;
    match before.status {
        OrderStatus::Empty => return ReorderOutcome::no_op(OutcomeKind::Empty, 0, "empty table"),
        OrderStatus::Correct => {
            return ReorderOutcome::no_op(
                OutcomeKind::AlreadyOrdered,
                rows,
                format!("already ordered ({})", before.date_span()),
            )
        }
        OrderStatus::CountMismatch | OrderStatus::Broken => {
            return ReorderOutcome::failed(
                rows,
                None,
                format!(
                    "not classifiable: {}",
                    before.detail.as_deref().unwrap_or(before.status.as_ref())
                ),
            )
        }
        OrderStatus::Incorrect => {}
    }

    let backup = match create_verified_backup(conn, table, run_id, rows) {
        Ok(backup) => backup,
        Err(e) => {
            error!("{}: backup step failed, table untouched: {}", table, e);
            return ReorderOutcome::failed(rows, None, e.to_string());
        }
    };

    let after = match rewrite_in_date_order(conn, table, &backup, columns, rows) {
        Ok(span) => span,
        Err(e) => {
            // immediate_transaction already rolled back; make sure nothing is left open
            Database::rollback_quietly(conn);
            error!(
                "{}: reorder rolled back, backup kept as {}: {}",
                table,
                backup.name(),
                e
            );
            return ReorderOutcome::failed(rows, Some(&backup), e.to_string());
        }
    };

    let mut outcome = ReorderOutcome {
        kind: OutcomeKind::Reordered,
        detail: Utils::bounded_detail(format!(
            "reordered ({}, {} rows)",
            after,
            Utils::format_count(rows as u64)
        )),
        rows_before: rows,
        rows_after: Some(rows),
        retained_backup: None,
    };

    if let Err(e) = Database::immediate_transaction(conn, |conn| Database::drop_table(conn, &backup)) {
        warn!(
            "{}: reordered, but backup {} could not be dropped: {}",
            table,
            backup.name(),
            e
        );
        outcome.detail = Utils::bounded_detail(format!(
            "{}; backup {} kept: {}",
            outcome.detail,
            backup.name(),
            e
        ));
        outcome.retained_backup = Some(backup.name().to_owned());
    }

    info!("{}: {}", table, outcome.detail);
    outcome
}

/// Copy the whole table into a fresh backup and check the copy's row count.
///
/// The copy is committed only if it's complete, so a failed check leaves
/// neither a partial backup nor any change to the target.
fn create_verified_backup(
    conn: &Connection,
    table: &TableRef,
    run_id: &RunId,
    expected_rows: i64,
) -> Result<TableRef, TidyError> {
    let name = BackupName::unused(conn, table.schema(), table.name(), run_id)?;
    let backup = table.sibling(&name.table_name());

    Database::immediate_transaction(conn, |conn| {
        conn.execute_batch(&format!(
            "CREATE TABLE {} AS SELECT * FROM {}",
            backup.qualified(),
            table.qualified()
        ))?;
        let copied = Database::count_rows(conn, &backup)?;
        if copied != expected_rows {
            return Err(TidyError::Error(format!(
                "backup verification failed: copied {} of {} rows",
                copied, expected_rows
            )));
        }
        Ok(())
    })?;

    Ok(backup)
}

/// Truncate and re-insert from the backup in date order, verifying before commit.
/// Returns the new `first->last` date span.
fn rewrite_in_date_order(
    conn: &Connection,
    table: &TableRef,
    backup: &TableRef,
    columns: &ColumnSpec,
    expected_rows: i64,
) -> Result<String, TidyError> {
    let payload = columns
        .verify(conn, table)?
        .into_iter()
        .filter(|c| !c.name.eq_ignore_ascii_case(columns.key()))
        .map(|c| Utils::quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");

    Database::immediate_transaction(conn, |conn| {
        conn.execute(&format!("DELETE FROM {}", table.qualified()), [])?;
        Database::reset_sequence(conn, table)?;

        conn.execute(
            &format!(
                "INSERT INTO {table} ({cols}) SELECT {cols} FROM {backup} ORDER BY {date} ASC, {key} ASC",
                table = table.qualified(),
                backup = backup.qualified(),
                cols = payload,
                date = columns.quoted_date(),
                key = columns.quoted_key(),
            ),
            [],
        )?;

        let after = classify(conn, table, columns);
        if after.count != expected_rows {
            return Err(TidyError::Error(format!(
                "row count mismatch after reinsert: {}/{}",
                after.count, expected_rows
            )));
        }
        if after.status != OrderStatus::Correct {
            return Err(TidyError::Error(format!(
                "order still wrong after reinsert: {} ({})",
                after.date_span(),
                after.status
            )));
        }
        Ok(after.date_span())
    })
}
