use std::fmt;
use std::path::Path;

use log::{debug, info};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::config::StoreConfig;
use crate::error::TidyError;
use crate::utils::Utils;

/// Schema name SQLite gives the primary database file.
pub const MAIN_SCHEMA: &str = "main";

const RESERVED_SCHEMAS: [&str; 2] = ["main", "temp"];

/// A table addressed by schema and name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    schema: String,
    name: String,
}

impl TableRef {
    pub fn new(schema: &str, name: &str) -> Self {
        TableRef {
            schema: schema.to_owned(),
            name: name.to_owned(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Same schema, different table.
    pub fn sibling(&self, name: &str) -> Self {
        TableRef::new(&self.schema, name)
    }

    /// `"schema"."table"`, safe to splice into SQL.
    pub fn qualified(&self) -> String {
        format!(
            "{}.{}",
            Utils::quote_ident(&self.schema),
            Utils::quote_ident(&self.name)
        )
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// One column as reported by `pragma_table_info`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    pub not_null: bool,
    pub pk: bool,
}

/// The connection factory and the only owner of the store connection.
///
/// A run opens exactly one `Database`; every operation borrows its connection.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open the primary store file and attach every configured schema.
    ///
    /// Failing here is fatal for the run: nothing has been touched yet. The
    /// store and every attached file must already exist; a mistyped path is
    /// an error, never a fresh empty store.
    pub fn open(store: &StoreConfig) -> Result<Self, TidyError> {
        if !Path::new(&store.path).is_file() {
            return Err(TidyError::ConfigError(format!(
                "Store file '{}' does not exist",
                store.path
            )));
        }
        let conn = Connection::open_with_flags(
            &store.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(store.busy_timeout())?;

        let db = Database { conn };
        for (schema, file) in &store.schemas {
            db.attach(schema, Path::new(file))?;
        }

        info!(
            "Store opened at '{}' with {} attached schema(s)",
            store.path,
            store.schemas.len()
        );
        Ok(db)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Attach an existing database file under `schema`.
    pub fn attach(&self, schema: &str, file: &Path) -> Result<(), TidyError> {
        Self::attach_on(&self.conn, schema, file)
    }

    pub fn attach_on(conn: &Connection, schema: &str, file: &Path) -> Result<(), TidyError> {
        if schema.trim().is_empty() || RESERVED_SCHEMAS.contains(&schema.to_ascii_lowercase().as_str())
        {
            return Err(TidyError::ConfigError(format!(
                "'{}' cannot be used as an attached schema name",
                schema
            )));
        }
        if Self::schema_exists(conn, schema)? {
            return Err(TidyError::ConfigError(format!(
                "Schema '{}' is already attached",
                schema
            )));
        }

        if !file.is_file() {
            return Err(TidyError::ConfigError(format!(
                "Database file '{}' for schema '{}' does not exist",
                file.display(),
                schema
            )));
        }

        let file_str = file.to_string_lossy();
        conn.execute(
            &format!("ATTACH DATABASE ?1 AS {}", Utils::quote_ident(schema)),
            [file_str.as_ref()],
        )?;
        debug!("Attached '{}' as schema '{}'", file_str, schema);
        Ok(())
    }

    pub fn detach_on(conn: &Connection, schema: &str) -> Result<(), TidyError> {
        conn.execute(
            &format!("DETACH DATABASE {}", Utils::quote_ident(schema)),
            [],
        )?;
        Ok(())
    }

    /// Run `func` inside `BEGIN IMMEDIATE ... COMMIT`, rolling back if it fails.
    pub fn immediate_transaction<F, T>(conn: &Connection, func: F) -> Result<T, TidyError>
    where
        F: FnOnce(&Connection) -> Result<T, TidyError>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match func(conn) {
            Ok(value) => {
                if let Err(e) = conn.execute_batch("COMMIT") {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e.into());
                }
                Ok(value)
            }
            Err(e) => {
                Self::rollback_quietly(conn);
                Err(e)
            }
        }
    }

    /// Roll back whatever is open. Errors are swallowed: there may be no open
    /// transaction (SQLite already rolled back on some failures).
    pub fn rollback_quietly(conn: &Connection) {
        if !conn.is_autocommit() {
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                debug!("Rollback reported: {}", e);
            }
        }
    }

    pub fn schema_exists(conn: &Connection, schema: &str) -> Result<bool, TidyError> {
        let mut stmt = conn.prepare("SELECT name FROM pragma_database_list")?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for name in names {
            if name?.eq_ignore_ascii_case(schema) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn require_schema(conn: &Connection, schema: &str) -> Result<(), TidyError> {
        if Self::schema_exists(conn, schema)? {
            Ok(())
        } else {
            Err(TidyError::Error(format!(
                "Schema '{}' is not attached to the store",
                schema
            )))
        }
    }

    /// All user tables in a schema, sorted by name.
    pub fn list_tables(conn: &Connection, schema: &str) -> Result<Vec<String>, TidyError> {
        let sql = format!(
            "SELECT name FROM {}.sqlite_master
            WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
            ORDER BY name",
            Utils::quote_ident(schema)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut tables = Vec::new();
        for row in rows {
            tables.push(row?);
        }
        Ok(tables)
    }

    pub fn table_exists(conn: &Connection, table: &TableRef) -> Result<bool, TidyError> {
        let sql = format!(
            "SELECT 1 FROM {}.sqlite_master WHERE type = 'table' AND name = ?1",
            Utils::quote_ident(table.schema())
        );
        let found = conn
            .query_row(&sql, [table.name()], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn count_rows(conn: &Connection, table: &TableRef) -> Result<i64, TidyError> {
        let count = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", table.qualified()),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn table_columns(conn: &Connection, table: &TableRef) -> Result<Vec<ColumnInfo>, TidyError> {
        let mut stmt = conn.prepare(
            "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1, ?2) ORDER BY cid",
        )?;
        let rows = stmt.query_map(params![table.name(), table.schema()], |row| {
            Ok(ColumnInfo {
                name: row.get(0)?,
                decl_type: row.get(1)?,
                not_null: row.get::<_, i64>(2)? != 0,
                pk: row.get::<_, i64>(3)? != 0,
            })
        })?;

        let mut columns = Vec::new();
        for row in rows {
            columns.push(row?);
        }
        Ok(columns)
    }

    /// The `CREATE TABLE` statement SQLite recorded for a table.
    pub fn table_sql(conn: &Connection, table: &TableRef) -> Result<Option<String>, TidyError> {
        let sql = format!(
            "SELECT sql FROM {}.sqlite_master WHERE type = 'table' AND name = ?1",
            Utils::quote_ident(table.schema())
        );
        let ddl = conn
            .query_row(&sql, [table.name()], |row| row.get::<_, Option<String>>(0))
            .optional()?;
        Ok(ddl.flatten())
    }

    /// Forget the AUTOINCREMENT high-water mark for a table, if the schema keeps one.
    ///
    /// Without this, keys re-assigned after a full delete would continue from
    /// the old maximum rather than restarting at 1.
    pub fn reset_sequence(conn: &Connection, table: &TableRef) -> Result<(), TidyError> {
        if !Self::table_exists(conn, &table.sibling("sqlite_sequence"))? {
            return Ok(());
        }
        conn.execute(
            &format!(
                "DELETE FROM {}.sqlite_sequence WHERE name = ?1",
                Utils::quote_ident(table.schema())
            ),
            [table.name()],
        )?;
        Ok(())
    }

    pub fn drop_table(conn: &Connection, table: &TableRef) -> Result<(), TidyError> {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", table.qualified()))?;
        Ok(())
    }
}
