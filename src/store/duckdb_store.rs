//! DuckDB Analytical Store
//!
//! Embedded DuckDB file. Every operation runs on a fresh clone of the
//! root connection so no connection state (transactions, secrets,
//! prepared statements) leaks between callers.

use crate::schema::types::{CellValue, ColumnDescriptor};
use crate::store::analytical::{AnalyticalStore, RemoteSecret, StoreError};
use crate::store::ident::{quote_identifier, quote_literal};
use chrono::{Datelike, NaiveDate};
use duckdb::types::{TimeUnit, Value as DuckValue};
use duckdb::{appender_params_from_iter, params, Connection};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Table names resolve case-insensitively, as they do in DuckDB statements
const DESCRIBE_SQL: &str = "SELECT column_name, data_type, is_nullable \
     FROM information_schema.columns \
     WHERE table_schema = current_schema() AND lower(table_name) = lower(?) \
     ORDER BY ordinal_position";

const TABLE_NAME_SQL: &str = "SELECT table_name FROM information_schema.tables \
     WHERE table_schema = current_schema() AND lower(table_name) = lower(?)";

const LIST_TABLES_SQL: &str = "SELECT table_name FROM information_schema.tables \
     WHERE table_schema = current_schema() ORDER BY table_name";

/// Days between 0001-01-01 (CE day 1) and 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

impl From<duckdb::Error> for StoreError {
    fn from(e: duckdb::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Analytical store on an embedded DuckDB database
pub struct DuckDbStore {
    root: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl DuckDbStore {
    /// Open or create the database file at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Ok(DuckDbStore {
            root: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// In-memory database (for tests)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(DuckDbStore {
            root: Mutex::new(Connection::open_in_memory()?),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn connection(&self) -> Result<Connection, StoreError> {
        Ok(self.root.lock().try_clone()?)
    }

    /// Tables in the current schema
    pub fn table_names(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(LIST_TABLES_SQL)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for name in rows {
            names.push(name?);
        }
        Ok(names)
    }

    /// Stored spelling of `table`, if it exists under any case
    fn stored_table_name(&self, table: &str) -> Result<Option<String>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(TABLE_NAME_SQL)?;
        let mut rows = stmt.query_map(params![table], |row| row.get::<_, String>(0))?;
        let name = rows.next().transpose()?;
        Ok(name)
    }

    /// Number of rows in `table`
    pub fn row_count(&self, table: &str) -> Result<u64, StoreError> {
        let conn = self.connection()?;
        let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(table));
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl std::fmt::Debug for DuckDbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDbStore")
            .field("path", &self.path)
            .finish()
    }
}

fn days_since_epoch(date: &NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

fn to_duck_value(cell: &CellValue) -> DuckValue {
    match cell {
        CellValue::Null => DuckValue::Null,
        CellValue::Bool(b) => DuckValue::Boolean(*b),
        CellValue::Number(n) => DuckValue::Double(*n),
        CellValue::String(s) | CellValue::Json(s) => DuckValue::Text(s.clone()),
        CellValue::Date(d) => DuckValue::Date32(days_since_epoch(d)),
        CellValue::Timestamp(t) => {
            DuckValue::Timestamp(TimeUnit::Microsecond, t.timestamp_micros())
        }
    }
}

fn column_definition(column: &ColumnDescriptor) -> String {
    format!(
        "{} {}",
        quote_identifier(&column.name),
        column.column_type.sql_name()
    )
}

impl AnalyticalStore for DuckDbStore {
    fn describe_table(&self, table: &str) -> Result<Option<Vec<ColumnDescriptor>>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(DESCRIBE_SQL)?;
        let rows = stmt.query_map(params![table], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut columns = Vec::new();
        for row in rows {
            let (name, data_type, nullable) = row?;
            columns.push(ColumnDescriptor::from_store(
                name,
                &data_type,
                nullable.eq_ignore_ascii_case("YES"),
            ));
        }
        Ok(if columns.is_empty() { None } else { Some(columns) })
    }

    fn create_table(&self, table: &str, columns: &[ColumnDescriptor]) -> Result<(), StoreError> {
        let defs: Vec<String> = columns.iter().map(column_definition).collect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_identifier(table),
            defs.join(", ")
        );
        debug!(%sql, "create table");
        self.connection()?.execute_batch(&sql)?;
        Ok(())
    }

    fn add_column(&self, table: &str, column: &ColumnDescriptor) -> Result<(), StoreError> {
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
            quote_identifier(table),
            column_definition(column)
        );
        debug!(%sql, "add column");
        self.connection()?.execute_batch(&sql)?;
        Ok(())
    }

    fn append_rows(&self, table: &str, rows: &[Vec<CellValue>]) -> Result<usize, StoreError> {
        let stored = self
            .stored_table_name(table)?
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        let width = self
            .describe_table(&stored)?
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?
            .len();
        if let Some(row) = rows.iter().find(|row| row.len() != width) {
            return Err(StoreError::RowShape {
                table: table.to_string(),
                expected: width,
                found: row.len(),
            });
        }

        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        {
            let mut appender = tx.appender(&stored)?;
            for row in rows {
                appender.append_row(appender_params_from_iter(row.iter().map(to_duck_value)))?;
            }
            appender.flush()?;
        }
        tx.commit()?;
        Ok(rows.len())
    }

    fn export_database(&self, location: &str) -> Result<(), StoreError> {
        let sql = format!(
            "EXPORT DATABASE {} (FORMAT parquet, COMPRESSION zstd)",
            quote_literal(location)
        );
        self.connection()?.execute_batch(&sql)?;
        Ok(())
    }

    fn create_secret(&self, secret: &RemoteSecret) -> Result<(), StoreError> {
        self.connection()?.execute_batch(&secret.create_sql())?;
        Ok(())
    }

    fn drop_secret(&self, name: &str) -> Result<(), StoreError> {
        self.connection()?
            .execute_batch(&RemoteSecret::drop_sql(name))?;
        Ok(())
    }

    fn import_database(
        dest: &Path,
        location: &str,
        secret: Option<&RemoteSecret>,
    ) -> Result<(), StoreError> {
        let conn = Connection::open(dest)?;
        if let Some(secret) = secret {
            conn.execute_batch(&secret.create_sql())?;
        }
        let result = conn.execute_batch(&format!(
            "IMPORT DATABASE {}; CHECKPOINT;",
            quote_literal(location)
        ));
        if let Some(secret) = secret {
            conn.execute_batch(&RemoteSecret::drop_sql(&secret.name))?;
        }
        result?;
        conn.close().map_err(|(_, e)| StoreError::from(e))
    }
}
