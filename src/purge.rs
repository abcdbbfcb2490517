use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, info, warn};
use rusqlite::Connection;

use crate::database::{Database, TableRef};
use crate::error::TidyError;
use crate::inventory::{categorize, TableCategories, TablePattern};

/// Which categories of tables a purge drops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeSelection {
    pub entities: bool,
    pub backups: bool,
    pub others: bool,
}

impl PurgeSelection {
    pub fn is_empty(&self) -> bool {
        !(self.entities || self.backups || self.others)
    }
}

#[derive(Clone, Debug)]
pub struct PurgePlan {
    pub schema: String,
    pub categories: TableCategories,
    pub selection: PurgeSelection,
}

impl PurgePlan {
    /// Tables to drop: entity tables first, then backups, then the rest.
    pub fn tables(&self) -> Vec<&str> {
        let mut tables = Vec::new();
        if self.selection.entities {
            tables.extend(self.categories.entity.iter().map(String::as_str));
        }
        if self.selection.backups {
            tables.extend(self.categories.backup.iter().map(String::as_str));
        }
        if self.selection.others {
            tables.extend(self.categories.other.iter().map(String::as_str));
        }
        tables
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    pub dropped: usize,
    pub batches: usize,
    pub failures: Vec<(String, String)>,
    pub interrupted: bool,
}

pub fn plan_purge(
    conn: &Connection,
    schema: &str,
    pattern: &TablePattern,
    selection: PurgeSelection,
) -> Result<PurgePlan, TidyError> {
    Database::require_schema(conn, schema)?;
    let names = Database::list_tables(conn, schema)?;
    Ok(PurgePlan {
        schema: schema.to_owned(),
        categories: categorize(&names, pattern),
        selection,
    })
}

/// Drop the planned tables, committing every `batch_size` drops.
///
/// A table that can't be dropped is recorded and the batch carries on.
/// `on_batch` is called with (batches done, total batches) after each commit.
pub fn purge(
    conn: &Connection,
    plan: &PurgePlan,
    batch_size: usize,
    on_batch: &mut dyn FnMut(usize, usize),
    interrupt: &AtomicBool,
) -> Result<PurgeSummary, TidyError> {
    let tables = plan.tables();
    let batch_size = batch_size.max(1);
    let total_batches = tables.len().div_ceil(batch_size);
    let mut summary = PurgeSummary::default();

    for chunk in tables.chunks(batch_size) {
        if interrupt.load(Ordering::SeqCst) {
            warn!("Purge of {} interrupted after {} batch(es)", plan.schema, summary.batches);
            summary.interrupted = true;
            break;
        }

        let (dropped, failures) = Database::immediate_transaction(conn, |conn| {
            let mut dropped = 0;
            let mut failures = Vec::new();
            for name in chunk {
                let table = TableRef::new(&plan.schema, name);
                match Database::drop_table(conn, &table) {
                    Ok(()) => dropped += 1,
                    Err(e) => {
                        error!("Dropping {} failed: {}", table, e);
                        failures.push((name.to_string(), e.to_string()));
                    }
                }
            }
            Ok((dropped, failures))
        })?;

        summary.dropped += dropped;
        summary.failures.extend(failures);
        summary.batches += 1;
        info!(
            "Purge batch {}/{} committed in {} ({} dropped)",
            summary.batches, total_batches, plan.schema, dropped
        );
        on_batch(summary.batches, total_batches);
    }

    Ok(summary)
}
