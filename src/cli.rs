use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use dialoguer::{theme::ColorfulTheme, Confirm};
use directories::ProjectDirs;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use once_cell::sync::OnceCell;
use strum::IntoEnumIterator;
use tabled::{settings::Style, Table, Tabled};

use crate::backup::{latest_backup_for, list_backups, restore_from_backup, BackupName};
use crate::batch::{Batch, BatchOptions, BatchPlan};
use crate::config::Config;
use crate::database::{Database, TableRef, MAIN_SCHEMA};
use crate::error::TidyError;
use crate::inventory::{
    active_codes, classify, list_candidate_tables, survey, Classification, OrderStatus, TableId, TablePattern,
};
use crate::progress::{summary_lines, CliBatchObserver};
use crate::purge::{plan_purge, purge, PurgeSelection};
use crate::stats::{render_detail, render_table, table_stats, to_json};
use crate::transfer::{import_tables, move_tables, TransferStatus, TransferSummary};
use crate::utils::Utils;

#[derive(Parser)]
#[command(
    name = "tabletidy",
    version,
    about = "tabletidy: maintenance for per-symbol price tables"
)]
pub struct Cli {
    /// Config file to use (default: config.toml in the app data directory)
    #[arg(long = "config", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Which tables a command looks at.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    /// Schema holding the tables (default: main)
    #[arg(long = "schema", short = 's', default_value = MAIN_SCHEMA)]
    pub schema: String,

    /// Table name prefix (default: from config)
    #[arg(long = "prefix")]
    pub prefix: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Classify every per-entity table and report its order status
    Inventory {
        #[command(flatten)]
        scope: Scope,

        /// Print JSON instead of a table
        #[arg(long = "json", default_value_t = false)]
        json: bool,
    },

    /// Rewrite out-of-order tables so key order follows date order
    Reorder {
        #[command(flatten)]
        scope: Scope,

        /// Only these entity codes (repeatable)
        #[arg(long = "code", short = 'c')]
        codes: Vec<String>,

        /// Tables to classify for the preview (default: from config)
        #[arg(long = "sample")]
        sample: Option<usize>,

        /// Only codes marked active in this registry table ([schema.]table)
        #[arg(long = "active-from")]
        active_from: Option<String>,

        /// Don't ask for confirmation
        #[arg(long = "yes", short = 'y', default_value_t = false)]
        yes: bool,
    },

    /// List backup tables left in a schema
    Backups {
        #[arg(long = "schema", short = 's', default_value = MAIN_SCHEMA)]
        schema: String,
    },

    /// Replace a table's content with one of its backups
    Restore {
        #[arg(long = "schema", short = 's', default_value = MAIN_SCHEMA)]
        schema: String,

        /// Table to restore
        #[arg(long = "table", short = 't')]
        table: String,

        /// Backup table to restore from (default: the most recent one)
        #[arg(long = "backup", short = 'b')]
        backup: Option<String>,

        #[arg(long = "yes", short = 'y', default_value_t = false)]
        yes: bool,
    },

    /// Move per-entity tables from one schema to another
    Move {
        #[arg(long = "from")]
        from: String,

        #[arg(long = "to")]
        to: String,

        #[arg(long = "prefix")]
        prefix: Option<String>,

        #[arg(long = "yes", short = 'y', default_value_t = false)]
        yes: bool,
    },

    /// Import per-entity tables from a standalone SQLite file
    Import {
        /// SQLite file to read from
        #[arg(long = "source")]
        source: PathBuf,

        #[command(flatten)]
        scope: Scope,

        #[arg(long = "yes", short = 'y', default_value_t = false)]
        yes: bool,
    },

    /// Drop tables from a schema by category
    Purge {
        #[arg(long = "schema", short = 's')]
        schema: String,

        #[arg(long = "prefix")]
        prefix: Option<String>,

        /// Drop per-entity tables
        #[arg(long = "include-entities", default_value_t = false)]
        include_entities: bool,

        /// Drop backup and temp tables
        #[arg(long = "include-backups", default_value_t = false)]
        include_backups: bool,

        /// Drop everything else
        #[arg(long = "include-others", default_value_t = false)]
        include_others: bool,

        #[arg(long = "yes", short = 'y', default_value_t = false)]
        yes: bool,
    },

    /// Structural report: columns, key range, duplicate dates, rows per year
    Stats {
        #[command(flatten)]
        scope: Scope,

        /// Only these entity codes (repeatable)
        #[arg(long = "code", short = 'c')]
        codes: Vec<String>,

        #[arg(long = "json", default_value_t = false)]
        json: bool,
    },
}

#[derive(Tabled)]
struct InventoryRow {
    code: String,
    table: String,
    status: String,
    rows: String,
    first: String,
    last: String,
    note: String,
}

impl InventoryRow {
    fn new(id: &TableId, c: &Classification) -> Self {
        let note = match (&c.detail, c.dates_well_formed) {
            (Some(detail), _) => detail.clone(),
            (None, false) if c.status != OrderStatus::Empty => "malformed dates".to_owned(),
            _ => String::new(),
        };
        InventoryRow {
            code: id.code.clone(),
            table: id.table.clone(),
            status: c.status.to_string(),
            rows: Utils::format_count(c.count.max(0) as u64),
            first: c.first_date.clone().unwrap_or_else(|| "-".to_owned()),
            last: c.last_date.clone().unwrap_or_else(|| "-".to_owned()),
            note,
        }
    }
}

#[derive(Tabled)]
struct BackupRow {
    table: String,
    target: String,
    style: String,
    run: String,
    rows: String,
}

#[derive(serde::Serialize)]
struct InventoryEntry<'a> {
    code: &'a str,
    table: &'a str,
    #[serde(flatten)]
    classification: &'a Classification,
}

impl Cli {
    pub fn handle_command_line() -> Result<(), TidyError> {
        let args = Cli::parse();

        let project_dirs = ProjectDirs::from("", "", "tabletidy").ok_or_else(|| {
            TidyError::Error("Could not determine the application data directory".into())
        })?;
        let config = Config::load_config(&project_dirs, args.config.as_deref())?;
        let _logger = crate::setup_logging(&project_dirs, &config.logging)?;

        info!("tabletidy {} starting", env!("CARGO_PKG_VERSION"));
        let db = Database::open(&config.store)?;

        Self::run_command(&config, &db, args.command)
    }

    fn run_command(config: &Config, db: &Database, command: Command) -> Result<(), TidyError> {
        match command {
            Command::Inventory { scope, json } => Self::inventory(config, db, &scope, json),
            Command::Reorder {
                scope,
                codes,
                sample,
                active_from,
                yes,
            } => Self::reorder(config, db, &scope, &codes, sample, active_from.as_deref(), yes),
            Command::Backups { schema } => Self::backups(db, &schema),
            Command::Restore {
                schema,
                table,
                backup,
                yes,
            } => Self::restore(db, &schema, &table, backup.as_deref(), yes),
            Command::Move {
                from,
                to,
                prefix,
                yes,
            } => Self::move_between(config, db, &from, &to, prefix.as_deref(), yes),
            Command::Import { source, scope, yes } => Self::import(config, db, &source, &scope, yes),
            Command::Purge {
                schema,
                prefix,
                include_entities,
                include_backups,
                include_others,
                yes,
            } => {
                let selection = PurgeSelection {
                    entities: include_entities,
                    backups: include_backups,
                    others: include_others,
                };
                Self::purge(config, db, &schema, prefix.as_deref(), selection, yes)
            }
            Command::Stats { scope, codes, json } => Self::stats(config, db, &scope, &codes, json),
        }
    }

    fn inventory(config: &Config, db: &Database, scope: &Scope, json: bool) -> Result<(), TidyError> {
        let conn = db.conn();
        let pattern = config.tables.pattern(scope.prefix.as_deref());
        let columns = config.tables.columns();
        Database::require_schema(conn, &scope.schema)?;

        let tables = list_candidate_tables(conn, &scope.schema, &pattern)?;
        let classified: Vec<(TableId, Classification)> = tables
            .into_iter()
            .map(|id| {
                let c = classify(conn, &TableRef::new(&scope.schema, &id.table), &columns);
                (id, c)
            })
            .collect();

        if json {
            let entries: Vec<InventoryEntry> = classified
                .iter()
                .map(|(id, c)| InventoryEntry {
                    code: &id.code,
                    table: &id.table,
                    classification: c,
                })
                .collect();
            let out = serde_json::to_string_pretty(&entries)
                .map_err(|e| TidyError::Error(e.to_string()))?;
            println!("{}", out);
            return Ok(());
        }

        let rows: Vec<InventoryRow> = classified.iter().map(|(id, c)| InventoryRow::new(id, c)).collect();
        println!("{}", Table::new(rows).with(Style::modern()));

        println!(
            "{} table(s) in {} matching '{}'",
            Utils::format_count(classified.len() as u64),
            scope.schema,
            pattern.prefix()
        );
        for status in OrderStatus::iter() {
            let count = classified.iter().filter(|(_, c)| c.status == status).count();
            if count > 0 {
                println!("  {:<15} {}", status.as_ref(), Utils::format_count(count as u64));
            }
        }
        let to_reorder = classified.iter().filter(|(_, c)| c.status.needs_reorder()).count();
        let unclassifiable = classified
            .iter()
            .filter(|(_, c)| c.status.is_unclassifiable())
            .count();
        println!(
            "{} table(s) need reordering, {} could not be classified",
            Utils::format_count(to_reorder as u64),
            Utils::format_count(unclassifiable as u64)
        );
        Ok(())
    }

    fn reorder(
        config: &Config,
        db: &Database,
        scope: &Scope,
        codes: &[String],
        sample: Option<usize>,
        active_from: Option<&str>,
        yes: bool,
    ) -> Result<(), TidyError> {
        let conn = db.conn();
        let pattern = config.tables.pattern(scope.prefix.as_deref());
        let columns = config.tables.columns();
        Database::require_schema(conn, &scope.schema)?;

        let candidates = list_candidate_tables(conn, &scope.schema, &pattern)?;
        let mut tables = select_codes(candidates, codes, &pattern);
        if let Some(registry) = active_from {
            let registry = registry_ref(registry);
            let active = active_codes(conn, &registry, &pattern)?;
            let selected = tables.len();
            tables.retain(|t| active.contains(&t.code));
            info!(
                "{} of {} table(s) have an active code in {}",
                tables.len(),
                selected,
                registry
            );
        }
        if tables.is_empty() {
            println!("No matching tables in {}", scope.schema);
            return Ok(());
        }

        let sample_size = sample.unwrap_or(config.batch.sample_size);
        let preview = survey(conn, &scope.schema, &tables, &columns, sample_size);
        let plan = BatchPlan::new(&scope.schema, tables).with_survey(preview);

        let confirm = |plan: &BatchPlan| {
            print_plan(plan);
            match confirm_prompt("Reorder these tables?", yes) {
                Ok(answer) => answer,
                Err(e) => {
                    error!("Confirmation failed: {}", e);
                    false
                }
            }
        };

        let interrupt = install_interrupt_handler()?;
        let batch = Batch::new(columns, BatchOptions::from(&config.batch));
        let mut observer = CliBatchObserver::new(plan.tables.len());

        let summary = batch.run(conn, &plan, &confirm, &mut observer, &interrupt);
        observer.finish();

        let Some(summary) = summary else {
            println!("Cancelled; nothing was changed");
            return Ok(());
        };

        for line in summary_lines(&summary) {
            println!("{}", line);
        }

        if summary.has_failures() {
            return Err(TidyError::Error(format!(
                "{} table(s) failed to reorder",
                summary.failed
            )));
        }
        if summary.interrupted {
            return Err(TidyError::Interrupted);
        }
        Ok(())
    }

    fn backups(db: &Database, schema: &str) -> Result<(), TidyError> {
        let backups = list_backups(db.conn(), schema)?;
        if backups.is_empty() {
            println!("No backup tables in {}", schema);
            return Ok(());
        }

        let rows: Vec<BackupRow> = backups
            .iter()
            .map(|b| BackupRow {
                table: b.table.clone(),
                target: b.name.target().to_owned(),
                style: b.name.style().to_string(),
                run: b.name.run_id().map(|r| r.to_string()).unwrap_or_else(|| "-".to_owned()),
                rows: b
                    .rows
                    .map(|r| Utils::format_count(r.max(0) as u64))
                    .unwrap_or_else(|| "?".to_owned()),
            })
            .collect();
        println!("{}", Table::new(rows).with(Style::modern()));
        println!("{} backup table(s) in {}", backups.len(), schema);
        Ok(())
    }

    fn restore(
        db: &Database,
        schema: &str,
        table: &str,
        backup: Option<&str>,
        yes: bool,
    ) -> Result<(), TidyError> {
        let conn = db.conn();
        Database::require_schema(conn, schema)?;
        let target = TableRef::new(schema, table);

        let backup = match backup {
            Some(name) => {
                if BackupName::parse(name).is_none() {
                    warn!("{} does not look like a backup table name", name);
                }
                target.sibling(name)
            }
            None => latest_backup_for(conn, &target)?
                .map(|b| b.table_ref())
                .ok_or_else(|| TidyError::Error(format!("No backup found for {}", target)))?,
        };

        println!("Restore {} from {}", target, backup);
        if !confirm_prompt("Replace the table's current content?", yes)? {
            println!("Cancelled; nothing was changed");
            return Ok(());
        }

        let outcome = restore_from_backup(conn, &target, &backup)?;
        println!(
            "Restored {} rows into {} from {}",
            Utils::format_count(outcome.rows_restored.max(0) as u64),
            outcome.target,
            outcome.backup
        );
        if !outcome.columns_skipped.is_empty() {
            println!(
                "Columns not in the backup (left at defaults): {}",
                outcome.columns_skipped.join(", ")
            );
        }
        Ok(())
    }

    fn move_between(
        config: &Config,
        db: &Database,
        from: &str,
        to: &str,
        prefix: Option<&str>,
        yes: bool,
    ) -> Result<(), TidyError> {
        let conn = db.conn();
        let pattern = config.tables.pattern(prefix);
        Database::require_schema(conn, from)?;

        let tables = list_candidate_tables(conn, from, &pattern)?;
        if tables.is_empty() {
            println!("No matching tables in {}", from);
            return Ok(());
        }

        println!("Move {} table(s) from {} to {}", tables.len(), from, to);
        if !confirm_prompt("Proceed?", yes)? {
            println!("Cancelled; nothing was changed");
            return Ok(());
        }

        let interrupt = install_interrupt_handler()?;
        let summary = move_tables(conn, from, to, &tables, &interrupt)?;
        print_transfer_summary(&summary, TransferStatus::Moved)
    }

    fn import(
        config: &Config,
        db: &Database,
        source: &Path,
        scope: &Scope,
        yes: bool,
    ) -> Result<(), TidyError> {
        let conn = db.conn();
        let pattern = config.tables.pattern(scope.prefix.as_deref());

        println!(
            "Import '{}*' tables from '{}' into {}",
            pattern.prefix(),
            source.display(),
            scope.schema
        );
        if !confirm_prompt("Proceed?", yes)? {
            println!("Cancelled; nothing was changed");
            return Ok(());
        }

        let interrupt = install_interrupt_handler()?;
        let summary = import_tables(
            conn,
            source,
            &scope.schema,
            &pattern,
            &config.tables.columns(),
            &interrupt,
        )?;
        print_transfer_summary(&summary, TransferStatus::Imported)
    }

    fn purge(
        config: &Config,
        db: &Database,
        schema: &str,
        prefix: Option<&str>,
        selection: PurgeSelection,
        yes: bool,
    ) -> Result<(), TidyError> {
        if selection.is_empty() {
            return Err(TidyError::Error(
                "Nothing selected: pass --include-entities, --include-backups and/or --include-others".into(),
            ));
        }

        let conn = db.conn();
        let plan = plan_purge(conn, schema, &config.tables.pattern(prefix), selection)?;
        let tables = plan.tables();

        println!("Tables in {}:", schema);
        println!("  entity:  {}", plan.categories.entity.len());
        println!("  backup:  {}", plan.categories.backup.len());
        println!("  other:   {}", plan.categories.other.len());
        println!("  total:   {}", plan.categories.total());
        if tables.is_empty() {
            println!("Nothing to drop");
            return Ok(());
        }

        println!("{} table(s) will be dropped", tables.len());
        if !confirm_prompt("Drop them? This cannot be undone", yes)? {
            println!("Cancelled; nothing was changed");
            return Ok(());
        }

        let interrupt = install_interrupt_handler()?;
        let bar = ProgressBar::new(0).with_style(
            ProgressStyle::default_bar()
                .template("{prefix}[{bar:40}] batch {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        let mut on_batch = |done: usize, total: usize| {
            bar.set_length(total as u64);
            bar.set_position(done as u64);
        };
        let summary = purge(conn, &plan, config.batch.purge_batch_size, &mut on_batch, &interrupt)?;
        bar.finish_and_clear();

        println!(
            "Dropped {} table(s) in {} batch(es){}",
            summary.dropped,
            summary.batches,
            if summary.interrupted { " (interrupted)" } else { "" }
        );
        for (table, reason) in &summary.failures {
            println!("  {}: {}", table, reason);
        }
        if !summary.failures.is_empty() {
            return Err(TidyError::Error(format!(
                "{} table(s) could not be dropped",
                summary.failures.len()
            )));
        }
        Ok(())
    }

    fn stats(
        config: &Config,
        db: &Database,
        scope: &Scope,
        codes: &[String],
        json: bool,
    ) -> Result<(), TidyError> {
        let conn = db.conn();
        let pattern = config.tables.pattern(scope.prefix.as_deref());
        let columns = config.tables.columns();
        Database::require_schema(conn, &scope.schema)?;

        let candidates = list_candidate_tables(conn, &scope.schema, &pattern)?;
        let tables = select_codes(candidates, codes, &pattern);
        let mut stats = Vec::with_capacity(tables.len());
        for id in &tables {
            match table_stats(conn, &TableRef::new(&scope.schema, &id.table), &columns) {
                Ok(s) => stats.push(s),
                Err(e) => warn!("{}: no stats: {}", id.table, e),
            }
        }

        if json {
            println!("{}", to_json(&stats)?);
            return Ok(());
        }

        println!("{}", render_table(&stats));
        if !codes.is_empty() {
            for s in &stats {
                print!("{}", render_detail(s));
            }
        }
        if stats.len() < tables.len() {
            println!(
                "{} table(s) could not be read; see the log",
                tables.len() - stats.len()
            );
        }
        Ok(())
    }
}

/// Keep only the tables whose code is listed; all of them if `codes` is empty.
/// Short codes are zero-padded to the configured width, so `5930` selects `005930`.
fn select_codes(tables: Vec<TableId>, codes: &[String], pattern: &TablePattern) -> Vec<TableId> {
    if codes.is_empty() {
        return tables;
    }
    let codes: Vec<String> = codes
        .iter()
        .map(|c| format!("{:0>width$}", c.trim(), width = pattern.code_width()))
        .collect();
    for code in &codes {
        if !tables.iter().any(|t| &t.code == code) {
            warn!("No table {} found", pattern.table_name(code));
        }
    }
    tables.into_iter().filter(|t| codes.contains(&t.code)).collect()
}

/// `schema.table`, or a bare table name in the main schema.
fn registry_ref(value: &str) -> TableRef {
    match value.split_once('.') {
        Some((schema, table)) => TableRef::new(schema, table),
        None => TableRef::new(MAIN_SCHEMA, value),
    }
}

fn confirm_prompt(prompt: &str, assume_yes: bool) -> Result<bool, TidyError> {
    if assume_yes {
        return Ok(true);
    }
    let answer = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;
    Ok(answer)
}

static INTERRUPT: OnceCell<Arc<AtomicBool>> = OnceCell::new();

/// The process-wide Ctrl-C flag. The handler is installed on first use.
fn install_interrupt_handler() -> Result<Arc<AtomicBool>, TidyError> {
    let interrupt = INTERRUPT.get_or_try_init(|| {
        let interrupt = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupt);
        ctrlc::set_handler(move || {
            warn!("Interrupt received; stopping after the current table");
            flag.store(true, Ordering::SeqCst);
        })
        .map_err(|e| TidyError::Error(format!("Failed to install interrupt handler: {}", e)))?;
        Ok::<_, TidyError>(interrupt)
    })?;
    Ok(Arc::clone(interrupt))
}

fn print_plan(plan: &BatchPlan) {
    println!(
        "{} candidate table(s) in {}",
        Utils::format_count(plan.tables.len() as u64),
        plan.schema
    );
    if let Some(survey) = &plan.survey {
        println!("Sample of {}:", survey.sampled);
        println!("  correct:        {} ({:.1}%)", survey.correct, survey.percent(survey.correct));
        println!("  incorrect:      {} ({:.1}%)", survey.incorrect, survey.percent(survey.incorrect));
        println!("  empty:          {} ({:.1}%)", survey.empty, survey.percent(survey.empty));
        println!(
            "  unclassifiable: {} ({:.1}%)",
            survey.unclassifiable,
            survey.percent(survey.unclassifiable)
        );
        println!(
            "Estimated tables to reorder: {}",
            Utils::format_count(survey.estimated_reorders() as u64)
        );
    }
}

fn print_transfer_summary(summary: &TransferSummary, done: TransferStatus) -> Result<(), TidyError> {
    println!(
        "{}: {} table(s), {} row(s){}",
        done,
        summary.count(done),
        Utils::format_count(summary.rows_copied().max(0) as u64),
        if summary.interrupted { " (interrupted)" } else { "" }
    );
    for status in [
        TransferStatus::SkippedExisting,
        TransferStatus::SkippedEmpty,
        TransferStatus::Failed,
    ] {
        let count = summary.count(status);
        if count > 0 {
            println!("{}: {}", status, count);
        }
    }
    for report in summary.reports.iter().filter(|r| r.status == TransferStatus::Failed) {
        println!("  {}: {}", report.table, report.detail.as_deref().unwrap_or(""));
    }

    let failed = summary.count(TransferStatus::Failed);
    if failed > 0 {
        return Err(TidyError::Error(format!("{} table(s) failed", failed)));
    }
    Ok(())
}
