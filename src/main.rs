mod backup;
mod batch;
mod cli;
mod config;
mod database;
mod error;
mod inventory;
mod progress;
mod purge;
mod reorder;
mod stats;
#[cfg(test)]
mod test_support;
mod transfer;
mod utils;

use cli::Cli;
use config::LoggingConfig;
use directories::ProjectDirs;
use error::TidyError;
use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, LoggerHandle, Naming};
use log::error;

/// Start file logging under the app's data directory.
///
/// The level comes from the config unless `RUST_LOG` is set. The returned
/// handle must be kept alive for the duration of the run.
pub fn setup_logging(
    project_dirs: &ProjectDirs,
    logging: &LoggingConfig,
) -> Result<LoggerHandle, TidyError> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    let log_spec = format!("tabletidy={}", logging.tabletidy);

    Logger::try_with_env_or_str(&log_spec)
        .and_then(|logger| {
            logger
                .log_to_file(FileSpec::default().directory(log_dir).basename("tabletidy"))
                .rotate(
                    Criterion::Size(10 * 1024 * 1024),
                    Naming::Timestamps,
                    Cleanup::KeepLogFiles(7),
                )
                .format_for_files(flexi_logger::detailed_format)
                .start()
        })
        .map_err(|e| TidyError::Error(format!("Failed to start logging: {}", e)))
}

fn main() {
    if let Err(err) = Cli::handle_command_line() {
        error!("{}", err);
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
