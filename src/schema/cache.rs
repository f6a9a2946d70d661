//! Schema Cache
//!
//! Remembers the column layout of each table so the hot path does not
//! introspect the store per batch. Owned by the single materializer
//! task, so no locking.
//!
//! ## Resolution (TigerStyle: explicit steps)
//!
//! 1. Use the cached schema if it is younger than the TTL
//! 2. Otherwise introspect; create the table if it does not exist
//! 3. If the batch carries fields the schema lacks and the schema came
//!    from cache, re-introspect once before evolving
//! 4. Add each still-missing field as a nullable column, then re-read

use crate::schema::inference::FieldSamples;
use crate::schema::types::{system_columns, ColumnDescriptor, TableSchema};
use crate::store::{AnalyticalStore, StoreError};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Error resolving a table schema
#[derive(Debug)]
pub enum SchemaError {
    /// Store introspection or DDL failed
    Store(StoreError),
    /// Table still missing after it was created
    TableVanished(String),
    /// Column still missing after it was added
    ColumnVanished { table: String, column: String },
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaError::Store(e) => write!(f, "Schema store error: {}", e),
            SchemaError::TableVanished(t) => write!(f, "Table {} missing after create", t),
            SchemaError::ColumnVanished { table, column } => {
                write!(f, "Column {}.{} missing after add", table, column)
            }
        }
    }
}

impl std::error::Error for SchemaError {}

impl From<StoreError> for SchemaError {
    fn from(e: StoreError) -> Self {
        SchemaError::Store(e)
    }
}

/// Per-table schema cache with a freshness TTL
#[derive(Debug)]
pub struct SchemaCache {
    tables: HashMap<String, TableSchema>,
    ttl: Duration,
}

impl SchemaCache {
    pub fn new(ttl: Duration) -> Self {
        SchemaCache {
            tables: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, table: &str) -> Option<&TableSchema> {
        self.tables.get(table)
    }

    /// Forget one table; the next resolve introspects it again
    pub fn invalidate(&mut self, table: &str) {
        self.tables.remove(table);
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Schema of `table` covering every field present in `payloads`
    pub fn resolve<S>(
        &mut self,
        store: &S,
        table: &str,
        payloads: &[Map<String, Value>],
    ) -> Result<&TableSchema, SchemaError>
    where
        S: AnalyticalStore + ?Sized,
    {
        let samples = FieldSamples::collect(payloads);

        let mut from_cache = true;
        let cached_fresh = self
            .tables
            .get(table)
            .map(|s| !s.is_stale(self.ttl))
            .unwrap_or(false);
        if !cached_fresh {
            self.refresh_or_create(store, table, &samples)?;
            from_cache = false;
        }

        let mut missing = self.missing_fields(table, &samples);
        if !missing.is_empty() && from_cache {
            debug!(table, missing = missing.len(), "unknown fields, refreshing cached schema");
            self.refresh_or_create(store, table, &samples)?;
            missing = self.missing_fields(table, &samples);
        }

        if !missing.is_empty() {
            for name in &missing {
                let column = ColumnDescriptor::new(name.clone(), samples.infer(name));
                info!(table, column = %column.name, ty = %column.column_type, "adding column");
                store.add_column(table, &column)?;
            }
            self.refresh_or_create(store, table, &samples)?;
            if let Some(name) = self.missing_fields(table, &samples).into_iter().next() {
                return Err(SchemaError::ColumnVanished {
                    table: table.to_string(),
                    column: name,
                });
            }
        }

        self.tables
            .get(table)
            .ok_or_else(|| SchemaError::TableVanished(table.to_string()))
    }

    fn refresh_or_create<S>(
        &mut self,
        store: &S,
        table: &str,
        samples: &FieldSamples<'_>,
    ) -> Result<(), SchemaError>
    where
        S: AnalyticalStore + ?Sized,
    {
        let columns = match store.describe_table(table)? {
            Some(columns) => columns,
            None => {
                let mut columns = system_columns();
                columns.extend(
                    samples
                        .names()
                        .map(|name| ColumnDescriptor::new(name, samples.infer(name))),
                );
                info!(table, columns = columns.len(), "creating table");
                store.create_table(table, &columns)?;
                store
                    .describe_table(table)?
                    .ok_or_else(|| SchemaError::TableVanished(table.to_string()))?
            }
        };
        self.tables
            .insert(table.to_string(), TableSchema::new(table, columns));
        Ok(())
    }

    fn missing_fields(&self, table: &str, samples: &FieldSamples<'_>) -> Vec<String> {
        let Some(schema) = self.tables.get(table) else {
            return samples.names().map(str::to_string).collect();
        };
        samples
            .names()
            .filter(|name| !schema.has_column(name))
            .map(str::to_string)
            .collect()
    }
}
