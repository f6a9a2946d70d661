//! Local Stores
//!
//! Two embedded databases sit in the data directory:
//!
//! - the analytical store (DuckDB) receives ingested rows
//! - the state store (SQLite) holds application state
//!
//! Both are reached through traits so the pipeline and snapshot code can
//! run against `MemoryAnalyticalStore` in tests.

pub mod analytical;
pub mod ident;
pub mod memory;
pub mod state;
#[cfg(feature = "duckdb")]
pub mod duckdb_store;

pub use analytical::{AnalyticalStore, RemoteSecret, StoreError, EXPORT_MANIFEST};
pub use ident::{quote_identifier, quote_literal};
pub use memory::MemoryAnalyticalStore;
pub use state::StateStore;
#[cfg(feature = "sqlite")]
pub use state::SqliteStateStore;
#[cfg(feature = "duckdb")]
pub use duckdb_store::DuckDbStore;
