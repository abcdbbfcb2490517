//! Drives classification and the reorder engine over a work list.
//!
//! The orchestrator owns counters and timing, asks a caller-supplied
//! confirmation before any write, reports every item to an observer and
//! stops cleanly between items when the interrupt flag is raised.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};
use rusqlite::Connection;
use strum_macros::{AsRefStr, Display};

use crate::backup::RunId;
use crate::config::BatchConfig;
use crate::database::TableRef;
use crate::inventory::{classify, ColumnSpec, OrderStatus, Survey, TableId};
use crate::reorder::{reorder, OutcomeKind};
use crate::utils::Utils;

/// The scope of a batch, shown to the operator before anything is written.
#[derive(Clone, Debug)]
pub struct BatchPlan {
    pub schema: String,
    pub tables: Vec<TableId>,
    pub survey: Option<Survey>,
}

impl BatchPlan {
    pub fn new(schema: &str, tables: Vec<TableId>) -> Self {
        BatchPlan {
            schema: schema.to_owned(),
            tables,
            survey: None,
        }
    }

    pub fn with_survey(mut self, survey: Survey) -> Self {
        self.survey = Some(survey);
        self
    }
}

/// Operator approval for a plan. Returning false cancels the batch.
pub trait Confirm {
    fn confirm(&self, plan: &BatchPlan) -> bool;
}

impl<F> Confirm for F
where
    F: Fn(&BatchPlan) -> bool,
{
    fn confirm(&self, plan: &BatchPlan) -> bool {
        self(plan)
    }
}

#[derive(AsRefStr, Display, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Disposition {
    #[strum(serialize = "reordered")]
    Reordered,
    #[strum(serialize = "empty")]
    SkippedEmpty,
    #[strum(serialize = "ordered")]
    SkippedOrdered,
    #[strum(serialize = "unclassifiable")]
    SkippedUnclassifiable,
    #[strum(serialize = "failed")]
    Failed,
}

impl Disposition {
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            Disposition::SkippedEmpty
                | Disposition::SkippedOrdered
                | Disposition::SkippedUnclassifiable
        )
    }
}

/// What happened to one table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemReport {
    pub code: String,
    pub table: String,
    pub disposition: Disposition,
    pub detail: String,
    pub retained_backup: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub processed: usize,
    pub total: usize,
    pub reordered: usize,
    pub skipped: usize,
    pub failed: usize,
    pub elapsed: Duration,
    pub average: Duration,
    pub eta: Duration,
}

impl ProgressSnapshot {
    fn new(total: usize) -> Self {
        ProgressSnapshot {
            total,
            ..Default::default()
        }
    }

    fn record(&mut self, disposition: Disposition, elapsed: Duration) {
        self.processed += 1;
        match disposition {
            Disposition::Reordered => self.reordered += 1,
            Disposition::Failed => self.failed += 1,
            d if d.is_skip() => self.skipped += 1,
            _ => {}
        }
        self.update_timing(elapsed);
    }

    fn update_timing(&mut self, elapsed: Duration) {
        self.elapsed = elapsed;
        if self.processed > 0 {
            self.average = elapsed / self.processed as u32;
            let remaining = self.total.saturating_sub(self.processed);
            self.eta = self.average * remaining as u32;
        }
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.processed as f64 * 100.0 / self.total as f64
        }
    }
}

#[derive(Clone, Debug)]
pub enum BatchEvent {
    /// Emitted after every table.
    Item {
        report: ItemReport,
        progress: ProgressSnapshot,
    },
    /// Emitted every `refresh_every` tables and after the last one.
    Checkpoint(ProgressSnapshot),
}

pub trait BatchObserver {
    fn on_event(&mut self, event: &BatchEvent);
}

impl<F> BatchObserver for F
where
    F: FnMut(&BatchEvent),
{
    fn on_event(&mut self, event: &BatchEvent) {
        self(event)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchOptions {
    pub item_delay: Duration,
    pub refresh_every: usize,
}

impl From<&BatchConfig> for BatchOptions {
    fn from(config: &BatchConfig) -> Self {
        BatchOptions {
            item_delay: config.item_delay(),
            refresh_every: config.refresh_every,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub run_id: String,
    pub total: usize,
    pub processed: usize,
    pub reordered: usize,
    pub skipped: usize,
    pub failed: usize,
    pub interrupted: bool,
    pub elapsed: Duration,
    pub average: Duration,
    pub failures: Vec<ItemReport>,
    pub warnings: Vec<ItemReport>,
}

impl BatchSummary {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

pub struct Batch {
    columns: ColumnSpec,
    options: BatchOptions,
    run_id: RunId,
}

impl Batch {
    pub fn new(columns: ColumnSpec, options: BatchOptions) -> Self {
        Batch {
            columns,
            options,
            run_id: RunId::now(),
        }
    }

    /// Process every table in the plan once, in order.
    ///
    /// Returns `None` if the operator declined. An empty plan completes
    /// immediately without asking.
    pub fn run(
        &self,
        conn: &Connection,
        plan: &BatchPlan,
        confirm: &dyn Confirm,
        observer: &mut dyn BatchObserver,
        interrupt: &AtomicBool,
    ) -> Option<BatchSummary> {
        let total = plan.tables.len();
        if total > 0 && !confirm.confirm(plan) {
            info!("Batch over {} declined by operator", plan.schema);
            return None;
        }

        info!(
            "Batch {} started: {} table(s) in schema {}",
            self.run_id,
            total,
            plan.schema
        );

        let start = Instant::now();
        let mut progress = ProgressSnapshot::new(total);
        let mut summary = BatchSummary {
            run_id: self.run_id.to_string(),
            total,
            ..Default::default()
        };

        for (index, id) in plan.tables.iter().enumerate() {
            if interrupt.load(Ordering::SeqCst) {
                warn!(
                    "Batch {} interrupted after {} of {} table(s)",
                    self.run_id, progress.processed, total
                );
                summary.interrupted = true;
                break;
            }

            let table = TableRef::new(&plan.schema, &id.table);
            let report = self.process_one(conn, id, &table);

            progress.record(report.disposition, start.elapsed());
            match report.disposition {
                Disposition::Failed => summary.failures.push(report.clone()),
                Disposition::SkippedUnclassifiable => summary.warnings.push(report.clone()),
                Disposition::Reordered if report.retained_backup.is_some() => {
                    summary.warnings.push(report.clone())
                }
                _ => {}
            }

            observer.on_event(&BatchEvent::Item {
                report,
                progress: progress.clone(),
            });

            let is_last = index + 1 == total;
            if is_last || (self.options.refresh_every > 0 && progress.processed % self.options.refresh_every == 0) {
                observer.on_event(&BatchEvent::Checkpoint(progress.clone()));
            }

            if !is_last && !self.options.item_delay.is_zero() {
                thread::sleep(self.options.item_delay);
            }
        }

        progress.update_timing(start.elapsed());
        summary.processed = progress.processed;
        summary.reordered = progress.reordered;
        summary.skipped = progress.skipped;
        summary.failed = progress.failed;
        summary.elapsed = progress.elapsed;
        summary.average = progress.average;

        info!(
            "Batch {} finished in {}: {} reordered, {} skipped, {} failed",
            self.run_id,
            Utils::format_elapsed(summary.elapsed),
            summary.reordered,
            summary.skipped,
            summary.failed
        );
        Some(summary)
    }

    fn process_one(&self, conn: &Connection, id: &TableId, table: &TableRef) -> ItemReport {
        let classification = classify(conn, table, &self.columns);
        let (disposition, detail, retained_backup) = match classification.status {
            OrderStatus::Empty => (Disposition::SkippedEmpty, "empty table".to_owned(), None),
            OrderStatus::Correct => (
                Disposition::SkippedOrdered,
                format!("already ordered ({})", classification.date_span()),
                None,
            ),
            OrderStatus::Broken | OrderStatus::CountMismatch => {
                let detail = format!(
                    "{}: {}",
                    classification.status,
                    classification.detail.as_deref().unwrap_or("")
                );
                warn!("{}: skipped, {}", table, detail);
                (Disposition::SkippedUnclassifiable, detail, None)
            }
            OrderStatus::Incorrect => {
                let outcome = reorder(conn, table, &self.columns, &self.run_id);
                let disposition = match outcome.kind {
                    OutcomeKind::Reordered => Disposition::Reordered,
                    OutcomeKind::AlreadyOrdered => Disposition::SkippedOrdered,
                    OutcomeKind::Empty => Disposition::SkippedEmpty,
                    OutcomeKind::Failed => Disposition::Failed,
                };
                (disposition, outcome.detail, outcome.retained_backup)
            }
        };

        ItemReport {
            code: id.code.clone(),
            table: id.table.clone(),
            disposition,
            detail: Utils::bounded_detail(detail),
            retained_backup,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::list_backups;
    use crate::database::{Database, MAIN_SCHEMA};
    use crate::test_support::{self, TestStore};
    use pretty_assertions::assert_eq;
    use std::cell::Cell;
    use std::sync::Arc;

    fn id(table: &str) -> TableId {
        TableId {
            code: table.trim_start_matches("daily_prices_").to_owned(),
            table: table.to_owned(),
        }
    }

    fn batch(refresh_every: usize) -> Batch {
        Batch::new(
            ColumnSpec::new("id", "date"),
            BatchOptions {
                item_delay: Duration::ZERO,
                refresh_every,
            },
        )
    }

    fn approve(_: &BatchPlan) -> bool {
        true
    }

    #[test]
    fn test_every_table_is_visited_once() {
        let store = TestStore::new(&[]);
        let conn = store.conn();
        test_support::price_table(conn, MAIN_SCHEMA, "daily_prices_000001", &["20240101", "20240102"]);
        test_support::price_table(conn, MAIN_SCHEMA, "daily_prices_000002", &["20240102", "20240101"]);
        test_support::price_table(conn, MAIN_SCHEMA, "daily_prices_000003", &[]);
        conn.execute_batch("CREATE TABLE daily_prices_000004 (id INTEGER PRIMARY KEY, close_price INTEGER)")
            .unwrap();
        let faulty = test_support::price_table(
            conn,
            MAIN_SCHEMA,
            "daily_prices_000005",
            &["20240105", "20240101"],
        );
        test_support::inject_insert_fault(conn, &faulty);

        let plan = BatchPlan::new(
            MAIN_SCHEMA,
            (1..=5).map(|n| id(&format!("daily_prices_{:06}", n))).collect(),
        );
        let mut events = Vec::new();
        let mut observer = |event: &BatchEvent| events.push(event.clone());
        let summary = batch(2)
            .run(conn, &plan, &approve, &mut observer, &AtomicBool::new(false))
            .unwrap();

        assert_eq!(summary.total, 5);
        assert_eq!(summary.processed, 5);
        assert_eq!(summary.reordered, 1);
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.failed, 1);
        assert!(!summary.interrupted);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].table, "daily_prices_000005");
        assert!(summary.failures[0].retained_backup.is_some());
        assert_eq!(summary.warnings.len(), 1);
        assert_eq!(summary.warnings[0].table, "daily_prices_000004");

        let items: Vec<(String, Disposition)> = events
            .iter()
            .filter_map(|e| match e {
                BatchEvent::Item { report, .. } => Some((report.table.clone(), report.disposition)),
                BatchEvent::Checkpoint(_) => None,
            })
            .collect();
        assert_eq!(
            items,
            vec![
                ("daily_prices_000001".to_owned(), Disposition::SkippedOrdered),
                ("daily_prices_000002".to_owned(), Disposition::Reordered),
                ("daily_prices_000003".to_owned(), Disposition::SkippedEmpty),
                ("daily_prices_000004".to_owned(), Disposition::SkippedUnclassifiable),
                ("daily_prices_000005".to_owned(), Disposition::Failed),
            ]
        );

        let checkpoints: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                BatchEvent::Checkpoint(p) => Some(p.processed),
                BatchEvent::Item { .. } => None,
            })
            .collect();
        assert_eq!(checkpoints, vec![2, 4, 5]);

        let reordered = TableRef::new(MAIN_SCHEMA, "daily_prices_000002");
        assert_eq!(
            test_support::dates_by_key(conn, &reordered),
            vec!["20240101", "20240102"]
        );
        // Only the failed table keeps a backup
        let backups = list_backups(conn, MAIN_SCHEMA).unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].name.target(), "daily_prices_000005");
    }

    #[test]
    fn test_declined_plan_does_nothing() {
        let store = TestStore::new(&[]);
        let conn = store.conn();
        let table = test_support::price_table(
            conn,
            MAIN_SCHEMA,
            "daily_prices_000020",
            &["20240103", "20240102", "20240101"],
        );
        let before = test_support::snapshot(conn, &table);

        let asked = Cell::new(0);
        let decline = |plan: &BatchPlan| {
            asked.set(asked.get() + 1);
            assert_eq!(plan.tables.len(), 1);
            false
        };
        let mut events = 0;
        let mut observer = |_: &BatchEvent| events += 1;

        let plan = BatchPlan::new(MAIN_SCHEMA, vec![id("daily_prices_000020")]);
        let result = batch(100).run(conn, &plan, &decline, &mut observer, &AtomicBool::new(false));

        assert!(result.is_none());
        assert_eq!(asked.get(), 1);
        assert_eq!(events, 0);
        assert_eq!(test_support::snapshot(conn, &table), before);
    }

    #[test]
    fn test_empty_plan_skips_confirmation() {
        let store = TestStore::new(&[]);
        let never = |_: &BatchPlan| -> bool { panic!("should not ask") };
        let mut observer = |_: &BatchEvent| {};

        let summary = batch(100)
            .run(
                store.conn(),
                &BatchPlan::new(MAIN_SCHEMA, Vec::new()),
                &never,
                &mut observer,
                &AtomicBool::new(false),
            )
            .unwrap();

        assert_eq!(summary.total, 0);
        assert_eq!(summary.processed, 0);
    }

    #[test]
    fn test_interrupt_stops_between_items() {
        let store = TestStore::new(&[]);
        let conn = store.conn();
        let first = test_support::price_table(conn, MAIN_SCHEMA, "daily_prices_000001", &["20240102", "20240101"]);
        let second = test_support::price_table(conn, MAIN_SCHEMA, "daily_prices_000002", &["20240102", "20240101"]);
        let second_before = test_support::snapshot(conn, &second);

        let interrupt = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupt);
        let mut observer = move |event: &BatchEvent| {
            if let BatchEvent::Item { .. } = event {
                flag.store(true, Ordering::SeqCst);
            }
        };

        let plan = BatchPlan::new(
            MAIN_SCHEMA,
            vec![id("daily_prices_000001"), id("daily_prices_000002")],
        );
        let summary = batch(100)
            .run(conn, &plan, &approve, &mut observer, &interrupt)
            .unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.reordered, 1);
        assert_eq!(test_support::dates_by_key(conn, &first), vec!["20240101", "20240102"]);
        assert_eq!(test_support::snapshot(conn, &second), second_before);
        assert!(conn.is_autocommit());
        assert_eq!(Database::count_rows(conn, &second).unwrap(), 2);
    }

    #[test]
    fn test_progress_timing() {
        let mut progress = ProgressSnapshot::new(4);
        progress.record(Disposition::Reordered, Duration::from_secs(2));
        progress.record(Disposition::SkippedEmpty, Duration::from_secs(4));

        assert_eq!(progress.average, Duration::from_secs(2));
        assert_eq!(progress.eta, Duration::from_secs(4));
        assert_eq!(progress.percent(), 50.0);
        assert_eq!(progress.skipped, 1);
    }
}
