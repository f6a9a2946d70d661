//! Column and Table Schema Types
//!
//! Value types shared by inference, coercion, the schema cache and the
//! analytical store.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Identity column present in every table created by the pipeline
pub const ID_COLUMN: &str = "_id";

/// Event-time column present in every table created by the pipeline
pub const TIMESTAMP_COLUMN: &str = "_ts";

/// Logical column type
///
/// Ordered from narrowest to widest for primitive promotion;
/// `Json` absorbs everything that does not fit a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Boolean,
    Double,
    Date,
    Timestamp,
    Varchar,
    Json,
}

impl ColumnType {
    /// SQL type name used in DDL
    pub fn sql_name(&self) -> &'static str {
        match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Double => "DOUBLE",
            ColumnType::Date => "DATE",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Varchar => "VARCHAR",
            ColumnType::Json => "JSON",
        }
    }

    /// Map a type string reported by the store onto a logical type
    ///
    /// Tables may be created outside the pipeline, so anything numeric
    /// collapses to `Double` and anything unrecognised to `Varchar`.
    pub fn from_declared(declared: &str) -> ColumnType {
        let upper = declared.trim().to_ascii_uppercase();
        if upper.starts_with("TIMESTAMP") || upper == "DATETIME" {
            ColumnType::Timestamp
        } else if upper == "DATE" {
            ColumnType::Date
        } else if upper == "JSON" {
            ColumnType::Json
        } else if upper == "BOOLEAN" || upper == "BOOL" {
            ColumnType::Boolean
        } else if is_numeric_declaration(&upper) {
            ColumnType::Double
        } else {
            ColumnType::Varchar
        }
    }
}

fn is_numeric_declaration(upper: &str) -> bool {
    const NUMERIC: [&str; 12] = [
        "DOUBLE", "FLOAT", "REAL", "DECIMAL", "NUMERIC", "INTEGER", "INT", "BIGINT", "SMALLINT",
        "TINYINT", "HUGEINT", "UBIGINT",
    ];
    !upper.starts_with("INTERVAL") && NUMERIC.iter().any(|n| upper.starts_with(n))
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.sql_name())
    }
}

/// A single column as the store reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub column_type: ColumnType,
    /// Type string exactly as declared in the store
    pub declared_type: String,
    pub nullable: bool,
}

impl ColumnDescriptor {
    /// Column the pipeline is about to create
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        ColumnDescriptor {
            name: name.into(),
            column_type,
            declared_type: column_type.sql_name().to_string(),
            nullable: true,
        }
    }

    /// Column read back through store introspection
    pub fn from_store(name: impl Into<String>, declared_type: &str, nullable: bool) -> Self {
        ColumnDescriptor {
            name: name.into(),
            column_type: ColumnType::from_declared(declared_type),
            declared_type: declared_type.to_string(),
            nullable,
        }
    }

    /// True for `_id` and `_ts`
    pub fn is_system(&self) -> bool {
        is_system_column(&self.name)
    }
}

/// True for the two columns the pipeline always populates itself
pub fn is_system_column(name: &str) -> bool {
    same_name(name, ID_COLUMN) || same_name(name, TIMESTAMP_COLUMN)
}

/// Identifier equality as the store applies it (ASCII case-insensitive)
pub fn same_name(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Columns every new table starts with
pub fn system_columns() -> Vec<ColumnDescriptor> {
    vec![
        ColumnDescriptor::new(ID_COLUMN, ColumnType::Varchar),
        ColumnDescriptor::new(TIMESTAMP_COLUMN, ColumnType::Timestamp),
    ]
}

/// Cached view of one table's columns
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub table: String,
    /// Columns in store ordinal order
    pub columns: Vec<ColumnDescriptor>,
    pub refreshed_at: Instant,
}

impl TableSchema {
    pub fn new(table: impl Into<String>, columns: Vec<ColumnDescriptor>) -> Self {
        TableSchema {
            table: table.into(),
            columns,
            refreshed_at: Instant::now(),
        }
    }

    /// Column called `name`, preferring an exact spelling match
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .or_else(|| self.columns.iter().find(|c| same_name(&c.name, name)))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.refreshed_at.elapsed() >= ttl
    }
}

/// A single cell ready to be appended to the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    /// Serialized JSON text
    Json(String),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Short kind name used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            CellValue::Null => "null",
            CellValue::Bool(_) => "boolean",
            CellValue::Number(_) => "number",
            CellValue::String(_) => "string",
            CellValue::Date(_) => "date",
            CellValue::Timestamp(_) => "timestamp",
            CellValue::Json(_) => "json",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::String(s) | CellValue::Json(s) => Some(s),
            _ => None,
        }
    }
}
