//! Fixtures shared by the unit tests: a throwaway store on disk and
//! helpers to build price tables with a known physical order.

use std::collections::BTreeMap;

use rusqlite::{params, Connection};
use tempfile::TempDir;

use crate::config::StoreConfig;
use crate::database::{Database, TableRef};

pub struct TestStore {
    pub dir: TempDir,
    pub db: Database,
}

impl TestStore {
    /// A primary store plus one attached file per name in `schemas`.
    pub fn new(schemas: &[&str]) -> Self {
        let dir = TempDir::new().unwrap();
        let mut attached = BTreeMap::new();
        for schema in schemas {
            let path = dir.path().join(format!("{}.db", schema));
            Connection::open(&path).unwrap();
            attached.insert(schema.to_string(), path.to_string_lossy().into_owned());
        }
        let primary = dir.path().join("prices.db");
        Connection::open(&primary).unwrap();
        let store = StoreConfig {
            path: primary.to_string_lossy().into_owned(),
            busy_timeout_ms: 1_000,
            schemas: attached,
        };
        let db = Database::open(&store).unwrap();
        TestStore { dir, db }
    }

    pub fn conn(&self) -> &Connection {
        self.db.conn()
    }
}

pub fn create_price_table(conn: &Connection, schema: &str, name: &str) -> TableRef {
    let table = TableRef::new(schema, name);
    conn.execute_batch(&format!(
        "CREATE TABLE {} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            date TEXT NOT NULL,
            close_price INTEGER,
            volume INTEGER
        )",
        table.qualified()
    ))
    .unwrap();
    table
}

/// Insert one row per date, in the given order. Payload values are derived
/// from the date so content can be compared after a rewrite.
pub fn insert_dates(conn: &Connection, table: &TableRef, dates: &[&str]) {
    let sql = format!(
        "INSERT INTO {} (date, close_price, volume) VALUES (?1, ?2, ?3)",
        table.qualified()
    );
    for date in dates {
        let seed: i64 = date
            .bytes()
            .filter(u8::is_ascii_digit)
            .fold(0, |acc, b| acc * 10 + i64::from(b - b'0'))
            % 100_000;
        conn.execute(&sql, params![date, seed, seed * 7]).unwrap();
    }
}

pub fn price_table(conn: &Connection, schema: &str, name: &str, dates: &[&str]) -> TableRef {
    let table = create_price_table(conn, schema, name);
    insert_dates(conn, &table, dates);
    table
}

/// Dates in surrogate-key order.
pub fn dates_by_key(conn: &Connection, table: &TableRef) -> Vec<String> {
    let mut stmt = conn
        .prepare(&format!("SELECT date FROM {} ORDER BY id ASC", table.qualified()))
        .unwrap();
    let rows = stmt.query_map([], |row| row.get::<_, String>(0)).unwrap();
    rows.map(|r| r.unwrap()).collect()
}

/// All non-key columns, sorted, so two tables can be compared as multisets.
pub fn payload_multiset(conn: &Connection, table: &TableRef) -> Vec<(String, i64, i64)> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT date, close_price, volume FROM {} ORDER BY date, close_price, volume",
            table.qualified()
        ))
        .unwrap();
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .unwrap();
    rows.map(|r| r.unwrap()).collect()
}

/// Full content including keys, in key order.
pub fn snapshot(conn: &Connection, table: &TableRef) -> Vec<(i64, String, i64, i64)> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT id, date, close_price, volume FROM {} ORDER BY id",
            table.qualified()
        ))
        .unwrap();
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })
        .unwrap();
    rows.map(|r| r.unwrap()).collect()
}

/// Make every insert into `table` fail, simulating a fault after the truncate.
pub fn inject_insert_fault(conn: &Connection, table: &TableRef) {
    conn.execute_batch(&format!(
        "CREATE TRIGGER {schema}.\"fault_{name}\" BEFORE INSERT ON \"{name}\"
         BEGIN SELECT RAISE(ABORT, 'injected insert fault'); END;",
        schema = crate::utils::Utils::quote_ident(table.schema()),
        name = table.name()
    ))
    .unwrap();
}

/// Silently drop rows with `date` as they are inserted, so a rewrite loses rows.
pub fn inject_row_loss(conn: &Connection, table: &TableRef, date: &str) {
    conn.execute_batch(&format!(
        "CREATE TRIGGER {schema}.\"loss_{name}\" AFTER INSERT ON \"{name}\"
         WHEN NEW.date = '{date}'
         BEGIN DELETE FROM \"{name}\" WHERE id = NEW.id; END;",
        schema = crate::utils::Utils::quote_ident(table.schema()),
        name = table.name(),
        date = date
    ))
    .unwrap();
}
