use indicatif::{ProgressBar, ProgressStyle};

use crate::batch::{BatchEvent, BatchObserver, BatchSummary, Disposition, ProgressSnapshot};
use crate::utils::Utils;

const BAR_TEMPLATE: &str = "{prefix}{msg} [{bar:60}] {pos}/{len} (Remaining: {eta})";

/// Renders batch events on the terminal with an indicatif bar.
///
/// Failures and checkpoints are printed above the bar so they stay in the
/// scrollback; per-item results only update the bar message.
pub struct CliBatchObserver {
    bar: ProgressBar,
}

impl CliBatchObserver {
    pub fn new(total: usize) -> Self {
        let style = ProgressStyle::default_bar()
            .template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        let bar = ProgressBar::new(total as u64)
            .with_style(style)
            .with_prefix("Reordering ");
        Self::with_bar(bar)
    }

    pub fn with_bar(bar: ProgressBar) -> Self {
        CliBatchObserver { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl BatchObserver for CliBatchObserver {
    fn on_event(&mut self, event: &BatchEvent) {
        match event {
            BatchEvent::Item { report, progress } => {
                self.bar.set_position(progress.processed as u64);
                self.bar
                    .set_message(format!("{} {}", report.table, report.disposition));
                if report.disposition == Disposition::Failed {
                    self.bar
                        .println(format!("FAILED {}: {}", report.table, report.detail));
                }
            }
            BatchEvent::Checkpoint(progress) => {
                self.bar.println(checkpoint_line(progress));
            }
        }
    }
}

pub fn checkpoint_line(progress: &ProgressSnapshot) -> String {
    format!(
        "[{}/{}] {:.1}% | reordered {} | skipped {} | failed {} | elapsed {} | avg {:.2}s | eta {}",
        Utils::format_count(progress.processed as u64),
        Utils::format_count(progress.total as u64),
        progress.percent(),
        progress.reordered,
        progress.skipped,
        progress.failed,
        Utils::format_elapsed(progress.elapsed),
        progress.average.as_secs_f64(),
        Utils::format_elapsed(progress.eta)
    )
}

/// The final report, one line per entry.
pub fn summary_lines(summary: &BatchSummary) -> Vec<String> {
    let mut lines = vec![
        format!("Run {}", summary.run_id),
        format!(
            "Processed {} of {} table(s){}",
            Utils::format_count(summary.processed as u64),
            Utils::format_count(summary.total as u64),
            if summary.interrupted { " (interrupted)" } else { "" }
        ),
        format!("  Reordered: {}", summary.reordered),
        format!("  Skipped:   {}", summary.skipped),
        format!("  Failed:    {}", summary.failed),
        format!(
            "  Elapsed:   {} (avg {:.2}s per table)",
            Utils::format_elapsed(summary.elapsed),
            summary.average.as_secs_f64()
        ),
    ];

    if !summary.warnings.is_empty() {
        lines.push("Warnings:".to_owned());
        for report in &summary.warnings {
            lines.push(format!("  {}: {}", report.table, report.detail));
        }
    }

    if !summary.failures.is_empty() {
        lines.push("Failures:".to_owned());
        for report in &summary.failures {
            match &report.retained_backup {
                Some(backup) => lines.push(format!(
                    "  {}: {} (backup kept as {})",
                    report.table, report.detail, backup
                )),
                None => lines.push(format!("  {}: {}", report.table, report.detail)),
            }
        }
    }

    lines
}
