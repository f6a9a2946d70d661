//! Schema Inference and Evolution
//!
//! Tables are created on first sight of a subject and grow a column
//! whenever a payload carries a field the table has not seen. Columns
//! are only ever appended; nothing is dropped or retyped.
//!
//! ```text
//! payloads ──► FieldSamples ──► infer_column_type ──┐
//!                                                   ▼
//!                       SchemaCache ◄──► AnalyticalStore (DDL, introspection)
//!                            │
//!                            ▼
//!                 coerce_value per column ──► CellValue rows
//! ```

pub mod cache;
pub mod coerce;
pub mod inference;
pub mod types;

pub use cache::{SchemaCache, SchemaError};
pub use coerce::{coerce_value, parse_date, parse_timestamp, resolve_event_time, CoercionError};
pub use inference::{infer_column_type, FieldSamples};
pub use types::{
    is_system_column, same_name, system_columns, CellValue, ColumnDescriptor, ColumnType,
    TableSchema, ID_COLUMN, TIMESTAMP_COLUMN,
};
