//! Backup tables: how they are named, found again, and restored from.
//!
//! A backup lives next to its target in the same schema, under
//! `<target>__backup_<run id>` (plus `_<n>` when that name is already taken).
//! Names produced by the older maintenance scripts (`<target>_backup_<unix time>`
//! and `<target>_temp_backup`) are recognized so their leftovers can still be
//! listed and restored.

use std::fmt;

use chrono::{DateTime, Utc};
use log::{info, warn};
use rusqlite::Connection;
use serde::Serialize;
use strum_macros::{AsRefStr, Display};

use crate::database::{Database, TableRef};
use crate::error::TidyError;
use crate::utils::Utils;

const STRUCTURED_MARKER: &str = "__backup_";
const LEGACY_TIMESTAMP_MARKER: &str = "_backup_";
const LEGACY_TEMP_SUFFIX: &str = "_temp_backup";

/// Identifies one batch run. Rendered as `YYYYMMDDHHMMSS` (UTC).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RunId(String);

impl RunId {
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        RunId(at.format("%Y%m%d%H%M%S").to_string())
    }

    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Accepts any non-empty run of ASCII digits.
    pub fn parse(token: &str) -> Option<Self> {
        if !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
            Some(RunId(token.to_owned()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn ordinal(&self) -> u64 {
        self.0.parse().unwrap_or(0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(AsRefStr, Display, Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum NamingStyle {
    #[strum(serialize = "structured")]
    Structured,
    #[strum(serialize = "legacy-timestamp")]
    LegacyTimestamp,
    #[strum(serialize = "legacy-temp")]
    LegacyTemp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BackupName {
    target: String,
    run_id: Option<RunId>,
    seq: u32,
    style: NamingStyle,
}

impl BackupName {
    /// The backup name a reorder in run `run_id` uses for `target`.
    pub fn new(target: &str, run_id: &RunId) -> Self {
        BackupName {
            target: target.to_owned(),
            run_id: Some(run_id.clone()),
            seq: 1,
            style: NamingStyle::Structured,
        }
    }

    /// The same name with a disambiguating sequence number.
    pub fn with_seq(mut self, seq: u32) -> Self {
        self.seq = seq.max(1);
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn run_id(&self) -> Option<&RunId> {
        self.run_id.as_ref()
    }

    pub fn style(&self) -> NamingStyle {
        self.style
    }

    pub fn table_name(&self) -> String {
        match self.style {
            NamingStyle::Structured => {
                let run = self.run_id.as_ref().map(RunId::as_str).unwrap_or_default();
                if self.seq > 1 {
                    format!("{}{}{}_{}", self.target, STRUCTURED_MARKER, run, self.seq)
                } else {
                    format!("{}{}{}", self.target, STRUCTURED_MARKER, run)
                }
            }
            NamingStyle::LegacyTimestamp => format!(
                "{}{}{}",
                self.target,
                LEGACY_TIMESTAMP_MARKER,
                self.run_id.as_ref().map(RunId::as_str).unwrap_or_default()
            ),
            NamingStyle::LegacyTemp => format!("{}{}", self.target, LEGACY_TEMP_SUFFIX),
        }
    }

    /// Recognize a backup table name, in any of the supported styles.
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(pos) = name.rfind(STRUCTURED_MARKER) {
            let target = &name[..pos];
            let rest = &name[pos + STRUCTURED_MARKER.len()..];
            let (run, seq) = match rest.split_once('_') {
                Some((run, seq)) => (run, seq.parse::<u32>().ok().filter(|s| *s > 1)?),
                None => (rest, 1),
            };
            if target.is_empty() {
                return None;
            }
            return Some(BackupName {
                target: target.to_owned(),
                run_id: Some(RunId::parse(run)?),
                seq,
                style: NamingStyle::Structured,
            });
        }

        if let Some(target) = name.strip_suffix(LEGACY_TEMP_SUFFIX) {
            if target.is_empty() {
                return None;
            }
            return Some(BackupName {
                target: target.to_owned(),
                run_id: None,
                seq: 1,
                style: NamingStyle::LegacyTemp,
            });
        }

        let pos = name.rfind(LEGACY_TIMESTAMP_MARKER)?;
        let target = &name[..pos];
        let run_id = RunId::parse(&name[pos + LEGACY_TIMESTAMP_MARKER.len()..])?;
        if target.is_empty() {
            return None;
        }
        Some(BackupName {
            target: target.to_owned(),
            run_id: Some(run_id),
            seq: 1,
            style: NamingStyle::LegacyTimestamp,
        })
    }

    /// Sort key where a larger value means a more recent backup.
    ///
    /// Legacy unix-second tokens are rendered as `YYYYMMDDHHMMSS` first so both
    /// styles compare on one clock. `_temp_backup` names carry no time and sort
    /// oldest.
    fn recency(&self) -> (u64, u32) {
        let ordinal = match (&self.style, &self.run_id) {
            (NamingStyle::LegacyTimestamp, Some(run_id)) => run_id
                .as_str()
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .map(|at| RunId::from_datetime(at).ordinal())
                .unwrap_or(0),
            (_, Some(run_id)) => run_id.ordinal(),
            (_, None) => 0,
        };
        (ordinal, self.seq)
    }

    /// The first name for `target` in `run_id` that isn't already a table in `schema`.
    pub fn unused(
        conn: &Connection,
        schema: &str,
        target: &str,
        run_id: &RunId,
    ) -> Result<Self, TidyError> {
        let mut seq = 1;
        loop {
            let candidate = BackupName::new(target, run_id).with_seq(seq);
            if !Database::table_exists(conn, &TableRef::new(schema, &candidate.table_name()))? {
                return Ok(candidate);
            }
            seq += 1;
        }
    }
}

impl fmt::Display for BackupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.table_name())
    }
}

/// A backup table found in a schema.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BackupInfo {
    pub schema: String,
    pub table: String,
    pub name: BackupName,
    pub rows: Option<i64>,
}

impl BackupInfo {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(&self.schema, &self.table)
    }
}

/// Every backup table in `schema`, oldest first within each target.
pub fn list_backups(conn: &Connection, schema: &str) -> Result<Vec<BackupInfo>, TidyError> {
    Database::require_schema(conn, schema)?;

    let mut backups: Vec<BackupInfo> = Database::list_tables(conn, schema)?
        .into_iter()
        .filter_map(|table| {
            BackupName::parse(&table).map(|name| BackupInfo {
                schema: schema.to_owned(),
                table,
                name,
                rows: None,
            })
        })
        .collect();

    for backup in backups.iter_mut() {
        backup.rows = Database::count_rows(conn, &backup.table_ref()).ok();
    }

    backups.sort_by(|a, b| {
        a.name
            .target()
            .cmp(b.name.target())
            .then(a.name.recency().cmp(&b.name.recency()))
    });
    Ok(backups)
}

/// The most recent backup of `target`, if any.
pub fn latest_backup_for(conn: &Connection, target: &TableRef) -> Result<Option<BackupInfo>, TidyError> {
    let latest = list_backups(conn, target.schema())?
        .into_iter()
        .filter(|b| b.name.target() == target.name())
        .max_by_key(|b| b.name.recency());
    Ok(latest)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RestoreOutcome {
    pub target: String,
    pub backup: String,
    pub rows_restored: i64,
    pub columns_skipped: Vec<String>,
}

/// Replace the content of `target` with the rows of `backup`.
///
/// Runs as one transaction: if the restored row count doesn't match the
/// backup the target is left as it was. The backup itself is kept.
pub fn restore_from_backup(
    conn: &Connection,
    target: &TableRef,
    backup: &TableRef,
) -> Result<RestoreOutcome, TidyError> {
    let backup_columns = Database::table_columns(conn, backup)?;
    if backup_columns.is_empty() {
        return Err(TidyError::Error(format!("Backup table {} does not exist", backup)));
    }
    let target_columns = Database::table_columns(conn, target)?;
    if target_columns.is_empty() {
        return Err(TidyError::Error(format!("Target table {} does not exist", target)));
    }

    let backup_rows = Database::count_rows(conn, backup)?;
    if backup_rows == 0 {
        return Err(TidyError::Error(format!("Backup table {} is empty", backup)));
    }

    if backup_columns.len() != target_columns.len() {
        warn!(
            "Column count differs: backup {} has {}, target {} has {}",
            backup,
            backup_columns.len(),
            target,
            target_columns.len()
        );
    }

    let (shared, skipped): (Vec<_>, Vec<_>) = target_columns
        .iter()
        .map(|c| c.name.clone())
        .partition(|name| backup_columns.iter().any(|b| b.name.eq_ignore_ascii_case(name)));

    let column_list = shared
        .iter()
        .map(|c| Utils::quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let rows_restored = Database::immediate_transaction(conn, |conn| {
        conn.execute(&format!("DELETE FROM {}", target.qualified()), [])?;
        Database::reset_sequence(conn, target)?;
        conn.execute(
            &format!(
                "INSERT INTO {} ({cols}) SELECT {cols} FROM {}",
                target.qualified(),
                backup.qualified(),
                cols = column_list
            ),
            [],
        )?;

        let restored = Database::count_rows(conn, target)?;
        if restored != backup_rows {
            return Err(TidyError::Error(format!(
                "Restored {} of {} rows from {}",
                restored, backup_rows, backup
            )));
        }
        Ok(restored)
    })?;

    info!(
        "Restored {} from {} ({} rows)",
        target,
        backup,
        Utils::format_count(rows_restored as u64)
    );

    Ok(RestoreOutcome {
        target: target.to_string(),
        backup: backup.to_string(),
        rows_restored,
        columns_skipped: skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MAIN_SCHEMA;
    use crate::test_support::{self, TestStore};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn run_id() -> RunId {
        RunId::from_datetime(Utc.with_ymd_and_hms(2025, 7, 16, 9, 5, 1).unwrap())
    }

    #[test]
    fn test_structured_name() {
        let name = BackupName::new("daily_prices_005930", &run_id());
        assert_eq!(name.table_name(), "daily_prices_005930__backup_20250716090501");
        assert_eq!(
            name.clone().with_seq(3).table_name(),
            "daily_prices_005930__backup_20250716090501_3"
        );
        assert_eq!(BackupName::parse(&name.table_name()), Some(name));
    }

    #[test]
    fn test_legacy_names_are_recognized() {
        let ts = BackupName::parse("supply_demand_005930_backup_1752651898").unwrap();
        assert_eq!(ts.target(), "supply_demand_005930");
        assert_eq!(ts.style(), NamingStyle::LegacyTimestamp);
        assert_eq!(ts.run_id().map(RunId::as_str), Some("1752651898"));
        assert_eq!(ts.table_name(), "supply_demand_005930_backup_1752651898");

        let temp = BackupName::parse("daily_prices_005930_temp_backup").unwrap();
        assert_eq!(temp.target(), "daily_prices_005930");
        assert_eq!(temp.style(), NamingStyle::LegacyTemp);
    }

    #[test]
    fn test_non_backup_names_are_rejected() {
        assert_eq!(BackupName::parse("daily_prices_005930"), None);
        assert_eq!(BackupName::parse("__backup_20250716090501"), None);
        assert_eq!(BackupName::parse("daily_prices_005930__backup_"), None);
        assert_eq!(BackupName::parse("daily_prices_005930__backup_2025x"), None);
        assert_eq!(BackupName::parse("daily_prices_005930__backup_20250716090501_1"), None);
        assert_eq!(BackupName::parse("daily_prices_005930_backup_old"), None);
    }

    #[test]
    fn test_unused_skips_taken_names() {
        let store = TestStore::new(&[]);
        let conn = store.conn();
        let first = BackupName::new("daily_prices_005930", &run_id());
        test_support::create_price_table(conn, MAIN_SCHEMA, &first.table_name());

        let picked = BackupName::unused(conn, MAIN_SCHEMA, "daily_prices_005930", &run_id()).unwrap();
        assert_eq!(picked.table_name(), "daily_prices_005930__backup_20250716090501_2");
    }

    #[test]
    fn test_latest_backup_and_restore() {
        let store = TestStore::new(&[]);
        let conn = store.conn();
        let target = test_support::price_table(conn, MAIN_SCHEMA, "supply_demand_005930", &["20240101"]);
        let older = test_support::price_table(
            conn,
            MAIN_SCHEMA,
            "supply_demand_005930_backup_1752651898",
            &["20230101", "20230102"],
        );
        let newer = test_support::price_table(
            conn,
            MAIN_SCHEMA,
            "supply_demand_005930__backup_20250716090501",
            &["20240101", "20240102", "20240103"],
        );

        let backups = list_backups(conn, MAIN_SCHEMA).unwrap();
        assert_eq!(backups.len(), 2);
        assert_eq!(backups[0].table, older.name());
        assert_eq!(backups[1].rows, Some(3));

        let latest = latest_backup_for(conn, &target).unwrap().unwrap();
        assert_eq!(latest.table, newer.name());

        let outcome = restore_from_backup(conn, &target, &latest.table_ref()).unwrap();
        assert_eq!(outcome.rows_restored, 3);
        assert!(outcome.columns_skipped.is_empty());
        assert_eq!(
            test_support::snapshot(conn, &target),
            test_support::snapshot(conn, &newer)
        );
        // The backup stays for the operator to drop
        assert!(Database::table_exists(conn, &newer).unwrap());
    }

    #[test]
    fn test_legacy_and_structured_backups_share_one_clock() {
        // 1752700000 is 2025-07-16 21:06:40 UTC
        let legacy = BackupName::parse("daily_prices_005930_backup_1752700000").unwrap();
        let structured = BackupName::parse("daily_prices_005930__backup_20250716090501").unwrap();
        let temp = BackupName::parse("daily_prices_005930_temp_backup").unwrap();

        assert_eq!(legacy.recency().0, 20250716210640);
        assert!(legacy.recency() > structured.recency());
        assert!(structured.recency() > temp.recency());

        let store = TestStore::new(&[]);
        let conn = store.conn();
        let target = test_support::price_table(conn, MAIN_SCHEMA, "daily_prices_005930", &["20240101"]);
        test_support::price_table(conn, MAIN_SCHEMA, &structured.table_name(), &["20240101"]);
        test_support::price_table(conn, MAIN_SCHEMA, &legacy.table_name(), &["20240101"]);

        let latest = latest_backup_for(conn, &target).unwrap().unwrap();
        assert_eq!(latest.table, "daily_prices_005930_backup_1752700000");
    }

    #[test]
    fn test_restore_refuses_empty_backup() {
        let store = TestStore::new(&[]);
        let conn = store.conn();
        let target = test_support::price_table(conn, MAIN_SCHEMA, "daily_prices_005930", &["20240101"]);
        let backup = test_support::price_table(conn, MAIN_SCHEMA, "daily_prices_005930_temp_backup", &[]);

        assert!(restore_from_backup(conn, &target, &backup).is_err());
        assert_eq!(test_support::dates_by_key(conn, &target), vec!["20240101"]);
    }

    #[test]
    fn test_failed_restore_leaves_target_untouched() {
        let store = TestStore::new(&[]);
        let conn = store.conn();
        let target = test_support::price_table(conn, MAIN_SCHEMA, "daily_prices_005930", &["20240101"]);
        let backup = test_support::price_table(
            conn,
            MAIN_SCHEMA,
            "daily_prices_005930_temp_backup",
            &["20230101", "20230102"],
        );
        let before = test_support::snapshot(conn, &target);
        test_support::inject_row_loss(conn, &target, "20230102");

        assert!(restore_from_backup(conn, &target, &backup).is_err());
        assert_eq!(test_support::snapshot(conn, &target), before);
    }

    proptest! {
        #[test]
        fn prop_structured_names_round_trip(
            target in "[a-z][a-z0-9_]{0,30}",
            run in "[0-9]{14}",
            seq in 1u32..50,
        ) {
            let run_id = RunId::parse(&run).unwrap();
            let name = BackupName::new(&target, &run_id).with_seq(seq);
            let parsed = BackupName::parse(&name.table_name());
            prop_assert_eq!(parsed, Some(name));
        }

        #[test]
        fn prop_distinct_targets_never_collide(
            a in "[a-z][a-z0-9_]{0,20}",
            b in "[a-z][a-z0-9_]{0,20}",
            run in "[0-9]{14}",
        ) {
            prop_assume!(a != b);
            let run_id = RunId::parse(&run).unwrap();
            prop_assert_ne!(
                BackupName::new(&a, &run_id).table_name(),
                BackupName::new(&b, &run_id).table_name()
            );
        }
    }
}
