//! Analytical Store Abstraction
//!
//! The columnar store rows end up in. Operations are synchronous; async
//! callers run them on the blocking pool.
//!
//! Implementations:
//! - `DuckDbStore`: embedded DuckDB file (feature `duckdb`)
//! - `MemoryAnalyticalStore`: JSON-file backed store for tests

use crate::schema::types::{CellValue, ColumnDescriptor};
use crate::store::ident::{quote_identifier, quote_literal};
use std::io::Error as IoError;
use std::path::Path;

/// File an export writes last; its presence marks the export complete
pub const EXPORT_MANIFEST: &str = "load.sql";

/// Error type for store operations
#[derive(Debug)]
pub enum StoreError {
    /// Error reported by the database engine
    Backend(String),
    /// I/O error
    Io(IoError),
    /// Table does not exist
    TableNotFound(String),
    /// Row shape does not match the table
    RowShape {
        table: String,
        expected: usize,
        found: usize,
    },
    /// Value cannot be stored in its column
    TypeMismatch {
        table: String,
        column: String,
        found: &'static str,
    },
    /// NULL written to a NOT NULL column
    NotNullViolation { table: String, column: String },
    /// Export or import location is unusable
    Location(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Backend(msg) => write!(f, "Store error: {}", msg),
            StoreError::Io(e) => write!(f, "I/O error: {}", e),
            StoreError::TableNotFound(t) => write!(f, "Table not found: {}", t),
            StoreError::RowShape {
                table,
                expected,
                found,
            } => write!(
                f,
                "Row for {} has {} values, table has {} columns",
                table, found, expected
            ),
            StoreError::TypeMismatch {
                table,
                column,
                found,
            } => write!(f, "Cannot store {} in {}.{}", found, table, column),
            StoreError::NotNullViolation { table, column } => {
                write!(f, "NULL in NOT NULL column {}.{}", table, column)
            }
            StoreError::Location(msg) => write!(f, "Invalid location: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<IoError> for StoreError {
    fn from(e: IoError) -> Self {
        StoreError::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Object-storage credentials handed to the store for direct export/import
///
/// Created right before a remote operation and dropped right after.
#[derive(Clone)]
pub struct RemoteSecret {
    pub name: String,
    pub key_id: Option<String>,
    pub secret: Option<String>,
    pub region: String,
    /// host[:port] without scheme
    pub endpoint: Option<String>,
    pub use_ssl: bool,
    pub url_style_path: bool,
    /// URL prefix the secret is restricted to
    pub scope: String,
}

impl RemoteSecret {
    /// `CREATE OR REPLACE SECRET` statement for this secret
    pub fn create_sql(&self) -> String {
        let mut parts = vec![
            "TYPE S3".to_string(),
            format!("REGION {}", quote_literal(&self.region)),
        ];
        match (&self.key_id, &self.secret) {
            (Some(key_id), Some(secret)) => {
                parts.push(format!("KEY_ID {}", quote_literal(key_id)));
                parts.push(format!("SECRET {}", quote_literal(secret)));
            }
            _ => parts.push("PROVIDER CREDENTIAL_CHAIN".to_string()),
        }
        if let Some(endpoint) = &self.endpoint {
            parts.push(format!("ENDPOINT {}", quote_literal(endpoint)));
        }
        parts.push(format!("USE_SSL {}", self.use_ssl));
        if self.url_style_path {
            parts.push("URL_STYLE 'path'".to_string());
        }
        parts.push(format!("SCOPE {}", quote_literal(&self.scope)));
        format!(
            "CREATE OR REPLACE SECRET {} ({})",
            quote_identifier(&self.name),
            parts.join(", ")
        )
    }

    pub fn drop_sql(name: &str) -> String {
        format!("DROP SECRET IF EXISTS {}", quote_identifier(name))
    }
}

impl std::fmt::Debug for RemoteSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSecret")
            .field("name", &self.name)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Columnar store abstraction
pub trait AnalyticalStore: Send + Sync + 'static {
    /// Columns of `table` in ordinal order, or `None` if it does not exist
    fn describe_table(&self, table: &str) -> Result<Option<Vec<ColumnDescriptor>>, StoreError>;

    /// Create `table` with the given columns if it does not already exist
    fn create_table(&self, table: &str, columns: &[ColumnDescriptor]) -> Result<(), StoreError>;

    /// Append a nullable column if it is not already present
    fn add_column(&self, table: &str, column: &ColumnDescriptor) -> Result<(), StoreError>;

    /// Append rows in a single transaction
    ///
    /// Every row carries one value per table column, in column order.
    /// Either all rows become visible or none do.
    fn append_rows(&self, table: &str, rows: &[Vec<CellValue>]) -> Result<usize, StoreError>;

    /// Export every table to `location`, manifest last
    fn export_database(&self, location: &str) -> Result<(), StoreError>;

    /// Register object-storage credentials for remote locations
    fn create_secret(&self, secret: &RemoteSecret) -> Result<(), StoreError>;

    /// Remove previously registered credentials
    fn drop_secret(&self, name: &str) -> Result<(), StoreError>;

    /// Build a fresh store file at `dest` from an export at `location`
    fn import_database(
        dest: &Path,
        location: &str,
        secret: Option<&RemoteSecret>,
    ) -> Result<(), StoreError>
    where
        Self: Sized;
}
