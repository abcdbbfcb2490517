use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::TidyError;
use crate::inventory::{ColumnSpec, TablePattern};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_PREFIX: &str = "TABLETIDY_";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub tabletidy: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const TABLETIDY_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            tabletidy: Self::TABLETIDY_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        let str_original = self.tabletidy.clone();
        self.tabletidy = self.tabletidy.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.tabletidy.as_str()) {
            eprintln!(
                "Config error: tabletidy log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::TABLETIDY_LEVEL
            );
            self.tabletidy = Self::TABLETIDY_LEVEL.to_owned();
        }
    }
}

/// Where the store lives and which extra schemas get attached to it.
///
/// `schemas` maps a schema name to a database file. Each entry is attached
/// to the primary connection under that name, so `"daily_prices"."daily_prices_005930"`
/// addresses a table in the attached file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub path: String,
    pub busy_timeout_ms: u64,
    pub schemas: BTreeMap<String, String>,
}

impl StoreConfig {
    const BUSY_TIMEOUT_MS: u64 = 5_000;

    fn default() -> Self {
        StoreConfig {
            path: "prices.db".to_owned(),
            busy_timeout_ms: Self::BUSY_TIMEOUT_MS,
            schemas: BTreeMap::new(),
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    fn ensure_valid(&mut self) {
        if self.path.trim().is_empty() {
            eprintln!("Config error: store path is empty - using default of 'prices.db'");
            self.path = "prices.db".to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TablesConfig {
    pub prefix: String,
    pub code_width: usize,
    pub key_column: String,
    pub date_column: String,
    pub exclude_markers: Vec<String>,
}

impl TablesConfig {
    const PREFIX: &str = "daily_prices_";
    const CODE_WIDTH: usize = 6;
    const MAX_CODE_WIDTH: usize = 16;
    const KEY_COLUMN: &str = "id";
    const DATE_COLUMN: &str = "date";

    fn default() -> Self {
        TablesConfig {
            prefix: Self::PREFIX.to_owned(),
            code_width: Self::CODE_WIDTH,
            key_column: Self::KEY_COLUMN.to_owned(),
            date_column: Self::DATE_COLUMN.to_owned(),
            exclude_markers: vec!["backup".to_owned(), "temp".to_owned(), "convert".to_owned()],
        }
    }

    fn ensure_valid(&mut self) {
        if self.prefix.is_empty() {
            eprintln!(
                "Config error: table prefix is empty - using default of '{}'",
                Self::PREFIX
            );
            self.prefix = Self::PREFIX.to_owned();
        }

        if self.code_width == 0 || self.code_width > Self::MAX_CODE_WIDTH {
            eprintln!(
                "Config error: code width of {} is invalid - using default of {}",
                self.code_width,
                Self::CODE_WIDTH
            );
            self.code_width = Self::CODE_WIDTH;
        }

        if self.key_column.trim().is_empty() {
            self.key_column = Self::KEY_COLUMN.to_owned();
        }
        if self.date_column.trim().is_empty() {
            self.date_column = Self::DATE_COLUMN.to_owned();
        }

        self.exclude_markers = self
            .exclude_markers
            .iter()
            .map(|m| m.trim().to_ascii_lowercase())
            .filter(|m| !m.is_empty())
            .collect();
    }

    /// Name-shape filter for per-entity tables, optionally with a different prefix.
    pub fn pattern(&self, prefix_override: Option<&str>) -> TablePattern {
        TablePattern::new(
            prefix_override.unwrap_or(&self.prefix),
            self.code_width,
            &self.exclude_markers,
        )
    }

    pub fn columns(&self) -> ColumnSpec {
        ColumnSpec::new(&self.key_column, &self.date_column)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub item_delay_ms: u64,
    pub refresh_every: usize,
    pub sample_size: usize,
    pub purge_batch_size: usize,
}

impl BatchConfig {
    const ITEM_DELAY_MS: u64 = 10;
    const REFRESH_EVERY: usize = 100;
    const SAMPLE_SIZE: usize = 100;
    const PURGE_BATCH_SIZE: usize = 50;

    fn default() -> Self {
        BatchConfig {
            item_delay_ms: Self::ITEM_DELAY_MS,
            refresh_every: Self::REFRESH_EVERY,
            sample_size: Self::SAMPLE_SIZE,
            purge_batch_size: Self::PURGE_BATCH_SIZE,
        }
    }

    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }

    fn ensure_valid(&mut self) {
        if self.refresh_every == 0 {
            self.refresh_every = Self::REFRESH_EVERY;
        }
        if self.sample_size == 0 {
            self.sample_size = Self::SAMPLE_SIZE;
        }
        if self.purge_batch_size == 0 {
            self.purge_batch_size = Self::PURGE_BATCH_SIZE;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub store: StoreConfig,
    pub tables: TablesConfig,
    pub batch: BatchConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            store: StoreConfig::default(),
            tables: TablesConfig::default(),
            batch: BatchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn default_config_path(project_dirs: &ProjectDirs) -> PathBuf {
        project_dirs.data_local_dir().join(CONFIG_FILE_NAME)
    }

    /// Loads the configuration from a TOML file, layered over defaults and under
    /// `TABLETIDY_` environment variables.
    ///
    /// With no explicit path the file in the app's data directory is used, and the
    /// default configuration is written there if it doesn't exist yet. An explicit
    /// path that doesn't exist is an error.
    pub fn load_config(
        project_dirs: &ProjectDirs,
        explicit_path: Option<&Path>,
    ) -> Result<Self, TidyError> {
        let config_path = match explicit_path {
            Some(path) => {
                if !path.exists() {
                    return Err(TidyError::ConfigError(format!(
                        "Config file '{}' does not exist",
                        path.display()
                    )));
                }
                path.to_owned()
            }
            None => {
                let path = Self::default_config_path(project_dirs);
                Self::write_default_if_missing(&path);
                path
            }
        };

        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self, TidyError> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Config = figment.extract()?;
        config.ensure_valid();

        Ok(config)
    }

    fn write_default_if_missing(config_path: &Path) {
        if config_path.exists() {
            return;
        }

        if let Some(parent) = config_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    parent.display(),
                    e
                );
            }
        }

        match toml::to_string_pretty(&Config::default()) {
            Ok(toml_string) => {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            }
            Err(_) => eprintln!("Failed to serialize default config."),
        }
    }

    fn ensure_valid(&mut self) {
        self.store.ensure_valid();
        self.tables.ensure_valid();
        self.batch.ensure_valid();
        self.logging.ensure_valid();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_when_file_is_empty() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", "")?;
            let config = Config::load_from(Path::new("config.toml")).unwrap();
            assert_eq!(config, Config::default());
            assert_eq!(config.tables.prefix, "daily_prices_");
            assert_eq!(config.tables.code_width, 6);
            assert_eq!(config.batch.refresh_every, 100);
            Ok(())
        });
    }

    #[test]
    fn test_file_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                [store]
                path = "/data/stock.db"

                [store.schemas]
                supply_demand = "/data/supply.db"

                [tables]
                prefix = "supply_demand_"
                "#,
            )?;
            let config = Config::load_from(Path::new("config.toml")).unwrap();
            assert_eq!(config.store.path, "/data/stock.db");
            assert_eq!(
                config.store.schemas.get("supply_demand").map(String::as_str),
                Some("/data/supply.db")
            );
            assert_eq!(config.tables.prefix, "supply_demand_");
            // Untouched sections keep their defaults
            assert_eq!(config.tables.date_column, "date");
            assert_eq!(config.batch.sample_size, 100);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", "[batch]\nitem_delay_ms = 50\n")?;
            jail.set_env("TABLETIDY_BATCH__ITEM_DELAY_MS", "0");
            jail.set_env("TABLETIDY_LOGGING__TABLETIDY", "debug");
            let config = Config::load_from(Path::new("config.toml")).unwrap();
            assert_eq!(config.batch.item_delay_ms, 0);
            assert_eq!(config.logging.tabletidy, "debug");
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                [logging]
                tabletidy = " LOUD "

                [tables]
                code_width = 0
                exclude_markers = [" Backup ", ""]

                [batch]
                refresh_every = 0
                "#,
            )?;
            let config = Config::load_from(Path::new("config.toml")).unwrap();
            assert_eq!(config.logging.tabletidy, "info");
            assert_eq!(config.tables.code_width, 6);
            assert_eq!(config.tables.exclude_markers, vec!["backup".to_owned()]);
            assert_eq!(config.batch.refresh_every, 100);
            Ok(())
        });
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", "[batch]\nitem_delay_ms = \"soon\"\n")?;
            let result = Config::load_from(Path::new("config.toml"));
            assert!(matches!(result, Err(TidyError::ConfigError(_))));
            Ok(())
        });
    }

    #[test]
    fn test_log_level_is_normalized() {
        let mut logging = LoggingConfig {
            tabletidy: "  WARN ".to_owned(),
        };
        logging.ensure_valid();
        assert_eq!(logging.tabletidy, "warn");
    }
}
