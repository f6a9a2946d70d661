//! Row Materializer
//!
//! Turns a batch into committed rows, one table partition at a time.
//!
//! ## Per partition (TigerStyle: explicit steps)
//!
//! 1. Parse every payload as a JSON object
//! 2. Resolve the table schema, creating or evolving the table
//! 3. Build one row per message in column order
//! 4. Append all rows in one store transaction
//! 5. Ack the partition's messages only after the commit
//!
//! Any failure in steps 1-4 leaves the whole partition unacked for
//! redelivery. Other partitions in the batch are unaffected.

use crate::ingest::batcher::BatchSink;
use crate::ingest::message::{Batch, InboundMessage, TablePartition};
use crate::observability::IngestStats;
use crate::schema::{
    coerce_value, resolve_event_time, same_name, CellValue, CoercionError, SchemaCache,
    SchemaError, TableSchema, ID_COLUMN, TIMESTAMP_COLUMN,
};
use crate::store::{AnalyticalStore, StoreError};
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

/// Why a partition was not committed
#[derive(Debug)]
pub enum MaterializeError {
    /// Payload is not a JSON object
    MalformedPayload {
        table: String,
        sequence: u64,
        reason: String,
    },
    /// Non-nullable column absent from a payload
    MissingRequiredField {
        table: String,
        column: String,
        sequence: u64,
    },
    /// Field value does not fit its column
    Coercion {
        table: String,
        sequence: u64,
        source: CoercionError,
    },
    Schema(SchemaError),
    Store(StoreError),
    /// Blocking store task panicked or was cancelled
    Task(String),
}

impl std::fmt::Display for MaterializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaterializeError::MalformedPayload {
                table,
                sequence,
                reason,
            } => write!(f, "{} (seq {}): malformed payload: {}", table, sequence, reason),
            MaterializeError::MissingRequiredField {
                table,
                column,
                sequence,
            } => write!(
                f,
                "{} (seq {}): missing required column {}",
                table, sequence, column
            ),
            MaterializeError::Coercion {
                table,
                sequence,
                source,
            } => write!(f, "{} (seq {}): {}", table, sequence, source),
            MaterializeError::Schema(e) => write!(f, "{}", e),
            MaterializeError::Store(e) => write!(f, "{}", e),
            MaterializeError::Task(msg) => write!(f, "Store task failed: {}", msg),
        }
    }
}

impl std::error::Error for MaterializeError {}

impl From<SchemaError> for MaterializeError {
    fn from(e: SchemaError) -> Self {
        MaterializeError::Schema(e)
    }
}

impl From<StoreError> for MaterializeError {
    fn from(e: StoreError) -> Self {
        MaterializeError::Store(e)
    }
}

/// Outcome of one batch
#[derive(Debug, Default)]
pub struct BatchReport {
    /// (table, rows) for each committed partition
    pub committed: Vec<(String, usize)>,
    /// (table, error) for each partition left unacked
    pub failed: Vec<(String, MaterializeError)>,
}

impl BatchReport {
    pub fn rows_committed(&self) -> usize {
        self.committed.iter().map(|(_, n)| n).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Materializes batches into an analytical store
pub struct RowMaterializer<S: AnalyticalStore> {
    store: Arc<S>,
    cache: SchemaCache,
    stats: Arc<IngestStats>,
}

impl<S: AnalyticalStore> RowMaterializer<S> {
    pub fn new(store: Arc<S>, cache: SchemaCache, stats: Arc<IngestStats>) -> Self {
        RowMaterializer {
            store,
            cache,
            stats,
        }
    }

    pub fn schema_cache(&self) -> &SchemaCache {
        &self.cache
    }

    /// Commit every partition of `batch` independently
    pub async fn materialize(&mut self, batch: Batch) -> BatchReport {
        let mut report = BatchReport::default();
        for partition in batch.partition_by_table() {
            let table = partition.table.clone();
            match self.commit_partition(&partition).await {
                Ok(rows) => {
                    self.stats.record_commit(rows);
                    ack_all(&partition.messages, &self.stats).await;
                    debug!(table = %table, rows, "partition committed");
                    report.committed.push((table, rows));
                }
                Err(e) => {
                    self.stats.record_partition_failure();
                    warn!(
                        table = %table,
                        messages = partition.messages.len(),
                        error = %e,
                        "partition not committed, leaving unacked"
                    );
                    if matches!(e, MaterializeError::Store(_) | MaterializeError::Schema(_)) {
                        self.cache.invalidate(&table);
                    }
                    report.failed.push((table, e));
                }
            }
        }
        report
    }

    async fn commit_partition(
        &mut self,
        partition: &TablePartition,
    ) -> Result<usize, MaterializeError> {
        let payloads = partition
            .messages
            .iter()
            .map(|m| parse_payload(&partition.table, m))
            .collect::<Result<Vec<_>, _>>()?;

        // Schema is resolved inline on this task; the append runs on the
        // blocking pool
        let schema = self
            .cache
            .resolve(self.store.as_ref(), &partition.table, &payloads)?
            .clone();

        let rows = partition
            .messages
            .iter()
            .zip(&payloads)
            .map(|(message, payload)| build_row(&schema, message, payload))
            .collect::<Result<Vec<_>, _>>()?;

        let store = Arc::clone(&self.store);
        let table = partition.table.clone();
        tokio::task::spawn_blocking(move || store.append_rows(&table, &rows))
            .await
            .map_err(|e| MaterializeError::Task(e.to_string()))?
            .map_err(MaterializeError::from)
    }
}

impl<S: AnalyticalStore> BatchSink for RowMaterializer<S> {
    fn process_batch(
        &mut self,
        batch: Batch,
    ) -> Pin<Box<dyn Future<Output = BatchReport> + Send + '_>> {
        Box::pin(self.materialize(batch))
    }
}

async fn ack_all(messages: &[InboundMessage], stats: &IngestStats) {
    let mut failed = 0;
    for message in messages {
        if let Err(e) = message.ack().await {
            failed += 1;
            warn!(sequence = message.sequence(), error = %e, "ack failed after commit");
        }
    }
    stats.record_acks(messages.len() - failed, failed);
}

fn parse_payload(
    table: &str,
    message: &InboundMessage,
) -> Result<Map<String, Value>, MaterializeError> {
    let malformed = |reason: String| MaterializeError::MalformedPayload {
        table: table.to_string(),
        sequence: message.sequence(),
        reason,
    };
    if table.contains('\0') {
        return Err(malformed("table name contains a NUL byte".to_string()));
    }
    match serde_json::from_slice::<Value>(message.payload()) {
        Ok(Value::Object(map)) => match map.keys().find(|key| key.contains('\0')) {
            Some(key) => Err(malformed(format!("field name {:?} contains a NUL byte", key))),
            None => Ok(map),
        },
        Ok(other) => Err(malformed(format!(
            "expected object, got {}",
            crate::schema::coerce::json_kind(&other)
        ))),
        Err(e) => Err(malformed(e.to_string())),
    }
}

/// Payload field for `column`, exact spelling first, then ignoring case
fn field_value<'a>(payload: &'a Map<String, Value>, column: &str) -> Option<&'a Value> {
    payload.get(column).or_else(|| {
        payload
            .iter()
            .find(|(key, _)| same_name(key, column))
            .map(|(_, value)| value)
    })
}

/// Build one row in `schema` column order
pub fn build_row(
    schema: &TableSchema,
    message: &InboundMessage,
    payload: &Map<String, Value>,
) -> Result<Vec<CellValue>, MaterializeError> {
    let coercion = |source: CoercionError| MaterializeError::Coercion {
        table: schema.table.clone(),
        sequence: message.sequence(),
        source,
    };

    let mut row = Vec::with_capacity(schema.columns.len());
    for column in &schema.columns {
        let value = field_value(payload, &column.name).filter(|v| !v.is_null());
        let cell = match column.name.as_str() {
            ID_COLUMN => CellValue::String(match value {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => message.default_id(),
            }),
            TIMESTAMP_COLUMN => {
                resolve_event_time(&column.name, value, message.received_at()).map_err(coercion)?
            }
            _ => match value {
                Some(v) => coerce_value(column, v).map_err(coercion)?,
                None if column.nullable => CellValue::Null,
                None => {
                    return Err(MaterializeError::MissingRequiredField {
                        table: schema.table.clone(),
                        column: column.name.clone(),
                        sequence: message.sequence(),
                    })
                }
            },
        };
        row.push(cell);
    }
    Ok(row)
}
