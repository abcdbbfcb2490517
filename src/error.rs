use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TidyError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into TidyError automatically

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Interrupted by operator")]
    Interrupted,

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl From<figment::Error> for TidyError {
    fn from(err: figment::Error) -> Self {
        TidyError::ConfigError(err.to_string())
    }
}

impl From<dialoguer::Error> for TidyError {
    fn from(err: dialoguer::Error) -> Self {
        match err {
            dialoguer::Error::IO(e) => TidyError::IoError(e),
        }
    }
}
