//! Stream Ingest
//!
//! Moves JSON events from a durable broker stream into an embedded
//! columnar store, evolving table schemas as new fields appear, and backs
//! the local stores up to object storage.
//!
//! ## Modules
//!
//! - [`ingest`]: batcher, row materializer, recovery supervisor, brokers
//! - [`schema`]: type inference, coercion, schema cache
//! - [`store`]: analytical and state store backends
//! - [`snapshot`]: scheduled snapshots and cold-start restore
//! - [`config`]: layered configuration
//! - [`observability`]: logging setup and counters

pub mod config;
pub mod ingest;
pub mod observability;
pub mod schema;
pub mod snapshot;
pub mod store;

pub use config::{AppConfig, ConfigError};
pub use ingest::{InMemoryBroker, RecoverySupervisor, RowMaterializer, StreamBatcher};
pub use schema::{CellValue, ColumnType, SchemaCache};
pub use store::{AnalyticalStore, MemoryAnalyticalStore};
