//! In-memory analytical store
//!
//! Keeps tables in memory and, when opened on a path, mirrors them to a
//! JSON file after every change. Supports append fault injection so
//! pipeline tests can fail one table while others commit.

use crate::schema::types::{CellValue, ColumnDescriptor, ColumnType};
use crate::store::analytical::{AnalyticalStore, RemoteSecret, StoreError, EXPORT_MANIFEST};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// Table listing written next to exported table files
const EXPORT_SCHEMA: &str = "schema.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemoryTable {
    columns: Vec<ColumnDescriptor>,
    rows: Vec<Vec<CellValue>>,
}

/// Tables keyed by name
type Tables = BTreeMap<String, MemoryTable>;

/// Analytical store backed by memory and an optional JSON file
#[derive(Debug, Default)]
pub struct MemoryAnalyticalStore {
    tables: RwLock<Tables>,
    path: Option<PathBuf>,
    /// table -> error message returned by the next appends
    append_faults: Mutex<HashMap<String, String>>,
    secrets: Mutex<BTreeSet<String>>,
}

impl MemoryAnalyticalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a file-backed store, loading existing contents
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let tables = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(MemoryAnalyticalStore {
            tables: RwLock::new(tables),
            path: Some(path.to_path_buf()),
            ..Default::default()
        })
    }

    /// Make appends to `table` fail until cleared
    pub fn fail_appends(&self, table: &str, message: &str) {
        self.append_faults
            .lock()
            .insert(table.to_string(), message.to_string());
    }

    pub fn clear_faults(&self) {
        self.append_faults.lock().clear();
    }

    /// Rows of `table` (for testing)
    pub fn rows(&self, table: &str) -> Vec<Vec<CellValue>> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map(|t| t.rows.len()).unwrap_or(0)
    }

    /// Values of one column across all rows (for testing)
    pub fn column_values(&self, table: &str, column: &str) -> Vec<CellValue> {
        let tables = self.tables.read();
        let Some(t) = tables.get(table) else {
            return Vec::new();
        };
        let Some(idx) = t.columns.iter().position(|c| c.name == column) else {
            return Vec::new();
        };
        t.rows.iter().map(|r| r[idx].clone()).collect()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    /// Secrets currently registered (for testing)
    pub fn active_secrets(&self) -> Vec<String> {
        self.secrets.lock().iter().cloned().collect()
    }

    fn persist(&self, tables: &Tables) -> Result<(), StoreError> {
        if let Some(path) = &self.path {
            write_json_atomic(path, tables)?;
        }
        Ok(())
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Apply the store's implicit casts and constraints to one cell
fn admit(
    table: &str,
    column: &ColumnDescriptor,
    cell: &CellValue,
) -> Result<CellValue, StoreError> {
    let mismatch = || StoreError::TypeMismatch {
        table: table.to_string(),
        column: column.name.clone(),
        found: cell.kind(),
    };
    match (column.column_type, cell) {
        (_, CellValue::Null) if !column.nullable => Err(StoreError::NotNullViolation {
            table: table.to_string(),
            column: column.name.clone(),
        }),
        (_, CellValue::Null) => Ok(CellValue::Null),
        (ColumnType::Boolean, CellValue::Bool(_))
        | (ColumnType::Double, CellValue::Number(_))
        | (ColumnType::Date, CellValue::Date(_))
        | (ColumnType::Timestamp, CellValue::Timestamp(_))
        | (ColumnType::Json, CellValue::Json(_))
        | (ColumnType::Varchar, CellValue::String(_)) => Ok(cell.clone()),
        (ColumnType::Json, CellValue::String(s)) => {
            serde_json::from_str::<serde_json::Value>(s).map_err(|_| mismatch())?;
            Ok(CellValue::Json(s.clone()))
        }
        (ColumnType::Varchar, CellValue::Json(s)) => Ok(CellValue::String(s.clone())),
        (ColumnType::Varchar, CellValue::Bool(b)) => Ok(CellValue::String(b.to_string())),
        (ColumnType::Varchar, CellValue::Number(n)) => Ok(CellValue::String(n.to_string())),
        (ColumnType::Timestamp, CellValue::Date(d)) => d
            .and_hms_opt(0, 0, 0)
            .map(|n| CellValue::Timestamp(n.and_utc()))
            .ok_or_else(mismatch),
        (ColumnType::Date, CellValue::Timestamp(t)) => Ok(CellValue::Date(t.date_naive())),
        _ => Err(mismatch()),
    }
}

impl AnalyticalStore for MemoryAnalyticalStore {
    fn describe_table(&self, table: &str) -> Result<Option<Vec<ColumnDescriptor>>, StoreError> {
        Ok(self.tables.read().get(table).map(|t| t.columns.clone()))
    }

    fn create_table(&self, table: &str, columns: &[ColumnDescriptor]) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        tables.entry(table.to_string()).or_insert_with(|| MemoryTable {
            columns: columns.to_vec(),
            rows: Vec::new(),
        });
        self.persist(&tables)
    }

    fn add_column(&self, table: &str, column: &ColumnDescriptor) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        if t.columns.iter().any(|c| c.name == column.name) {
            return Ok(());
        }
        t.columns.push(column.clone());
        for row in &mut t.rows {
            row.push(CellValue::Null);
        }
        self.persist(&tables)
    }

    fn append_rows(&self, table: &str, rows: &[Vec<CellValue>]) -> Result<usize, StoreError> {
        if let Some(message) = self.append_faults.lock().get(table) {
            return Err(StoreError::Backend(message.clone()));
        }

        let mut tables = self.tables.write();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;

        // Validate everything before touching the table
        let mut admitted = Vec::with_capacity(rows.len());
        for row in rows {
            if row.len() != t.columns.len() {
                return Err(StoreError::RowShape {
                    table: table.to_string(),
                    expected: t.columns.len(),
                    found: row.len(),
                });
            }
            let cells = t
                .columns
                .iter()
                .zip(row)
                .map(|(column, cell)| admit(table, column, cell))
                .collect::<Result<Vec<_>, _>>()?;
            admitted.push(cells);
        }

        t.rows.extend(admitted);
        self.persist(&tables)?;
        Ok(rows.len())
    }

    fn export_database(&self, location: &str) -> Result<(), StoreError> {
        if location.contains("://") {
            return Err(StoreError::Location(format!(
                "memory store exports to local directories only: {}",
                location
            )));
        }
        let dir = Path::new(location);
        std::fs::create_dir_all(dir)?;

        let tables = self.tables.read();
        let mut listing = Vec::with_capacity(tables.len());
        for (idx, (name, table)) in tables.iter().enumerate() {
            let file = format!("table_{:04}.json", idx);
            std::fs::write(dir.join(&file), serde_json::to_vec(table)?)?;
            listing.push((name.clone(), file));
        }
        std::fs::write(dir.join(EXPORT_SCHEMA), serde_json::to_vec(&listing)?)?;

        let manifest: String = listing
            .iter()
            .map(|(name, file)| format!("-- {} {}\n", file, name))
            .collect();
        std::fs::write(dir.join(EXPORT_MANIFEST), manifest)?;
        Ok(())
    }

    fn create_secret(&self, secret: &RemoteSecret) -> Result<(), StoreError> {
        self.secrets.lock().insert(secret.name.clone());
        Ok(())
    }

    fn drop_secret(&self, name: &str) -> Result<(), StoreError> {
        self.secrets.lock().remove(name);
        Ok(())
    }

    fn import_database(
        dest: &Path,
        location: &str,
        _secret: Option<&RemoteSecret>,
    ) -> Result<(), StoreError> {
        if location.contains("://") {
            return Err(StoreError::Location(format!(
                "memory store imports from local directories only: {}",
                location
            )));
        }
        let dir = Path::new(location);
        if !dir.join(EXPORT_MANIFEST).exists() {
            return Err(StoreError::Location(format!(
                "{} has no {}",
                location, EXPORT_MANIFEST
            )));
        }
        let listing: Vec<(String, String)> =
            serde_json::from_slice(&std::fs::read(dir.join(EXPORT_SCHEMA))?)?;
        let mut tables = Tables::new();
        for (name, file) in listing {
            let table: MemoryTable = serde_json::from_slice(&std::fs::read(dir.join(file))?)?;
            tables.insert(name, table);
        }
        write_json_atomic(dest, &tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::system_columns;
    use chrono::Utc;

    fn events_store() -> MemoryAnalyticalStore {
        let store = MemoryAnalyticalStore::new();
        let mut cols = system_columns();
        cols.push(ColumnDescriptor::new("n", ColumnType::Double));
        store.create_table("events", &cols).unwrap();
        store
    }

    fn row(id: &str, n: CellValue) -> Vec<CellValue> {
        vec![
            CellValue::String(id.to_string()),
            CellValue::Timestamp(Utc::now()),
            n,
        ]
    }

    #[test]
    fn test_append_is_all_or_nothing() {
        let store = events_store();
        let rows = vec![
            row("1", CellValue::Number(1.0)),
            row("2", CellValue::Bool(true)),
        ];
        let err = store.append_rows("events", &rows).unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { .. }));
        assert_eq!(store.row_count("events"), 0);
    }

    #[test]
    fn test_not_null_enforced() {
        let store = MemoryAnalyticalStore::new();
        let mut col = ColumnDescriptor::new("must", ColumnType::Varchar);
        col.nullable = false;
        store.create_table("t", &[col]).unwrap();
        let err = store.append_rows("t", &[vec![CellValue::Null]]).unwrap_err();
        assert!(matches!(err, StoreError::NotNullViolation { .. }));
    }

    #[test]
    fn test_add_column_backfills_nulls() {
        let store = events_store();
        store
            .append_rows("events", &[row("1", CellValue::Number(1.0))])
            .unwrap();
        store
            .add_column("events", &ColumnDescriptor::new("extra", ColumnType::Json))
            .unwrap();
        assert_eq!(store.column_values("events", "extra"), vec![CellValue::Null]);
    }

    #[test]
    fn test_fault_injection() {
        let store = events_store();
        store.fail_appends("events", "disk full");
        assert!(store
            .append_rows("events", &[row("1", CellValue::Null)])
            .is_err());
        store.clear_faults();
        assert_eq!(
            store
                .append_rows("events", &[row("1", CellValue::Null)])
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_file_backed_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analytics.json");
        {
            let store = MemoryAnalyticalStore::open(&path).unwrap();
            store
                .create_table("t", &[ColumnDescriptor::new("a", ColumnType::Varchar)])
                .unwrap();
            store
                .append_rows("t", &[vec![CellValue::String("x".into())]])
                .unwrap();
        }
        let reopened = MemoryAnalyticalStore::open(&path).unwrap();
        assert_eq!(reopened.row_count("t"), 1);
    }

    #[test]
    fn test_export_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = events_store();
        store
            .append_rows("events", &[row("1", CellValue::Number(2.0))])
            .unwrap();

        let export = dir.path().join("export");
        store.export_database(export.to_str().unwrap()).unwrap();
        assert!(export.join(EXPORT_MANIFEST).exists());

        let dest = dir.path().join("restored.json");
        MemoryAnalyticalStore::import_database(&dest, export.to_str().unwrap(), None).unwrap();
        let restored = MemoryAnalyticalStore::open(&dest).unwrap();
        assert_eq!(restored.rows("events"), store.rows("events"));
    }

    #[test]
    fn test_import_requires_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("restored.json");
        let err =
            MemoryAnalyticalStore::import_database(&dest, dir.path().to_str().unwrap(), None)
                .unwrap_err();
        assert!(matches!(err, StoreError::Location(_)));
        assert!(!dest.exists());
    }
}
