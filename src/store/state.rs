//! Relational state store
//!
//! Application state lives in a SQLite file next to the analytical
//! store. The pipeline only needs one thing from it: a consistent copy
//! taken while it stays online.

use crate::store::analytical::StoreError;
use std::path::Path;

/// Store that can produce a point-in-time copy of itself
pub trait StateStore: Send + Sync + 'static {
    /// Write a consistent copy of the database to `dest`
    ///
    /// `dest` must not exist yet.
    fn hot_copy(&self, dest: &Path) -> Result<(), StoreError>;
}

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStateStore;

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::StateStore;
    use crate::store::analytical::StoreError;
    use parking_lot::{Mutex, MutexGuard};
    use rusqlite::{params, Connection};
    use std::path::{Path, PathBuf};

    impl From<rusqlite::Error> for StoreError {
        fn from(e: rusqlite::Error) -> Self {
            StoreError::Backend(e.to_string())
        }
    }

    /// SQLite state database
    pub struct SqliteStateStore {
        conn: Mutex<Connection>,
        path: PathBuf,
    }

    impl SqliteStateStore {
        pub fn open(path: &Path) -> Result<Self, StoreError> {
            let conn = Connection::open(path)?;
            Ok(SqliteStateStore {
                conn: Mutex::new(conn),
                path: path.to_path_buf(),
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Borrow the connection for application queries
        pub fn connection(&self) -> MutexGuard<'_, Connection> {
            self.conn.lock()
        }
    }

    impl std::fmt::Debug for SqliteStateStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SqliteStateStore")
                .field("path", &self.path)
                .finish()
        }
    }

    impl StateStore for SqliteStateStore {
        fn hot_copy(&self, dest: &Path) -> Result<(), StoreError> {
            let dest = dest.to_string_lossy().into_owned();
            self.conn.lock().execute("VACUUM INTO ?1", params![dest])?;
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_hot_copy_is_readable() {
            let dir = tempfile::tempdir().unwrap();
            let store = SqliteStateStore::open(&dir.path().join("state.db")).unwrap();
            store
                .connection()
                .execute_batch(
                    "CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT);
                     INSERT INTO kv VALUES ('a', '1'), ('b', '2');",
                )
                .unwrap();

            let copy = dir.path().join("copy.db");
            store.hot_copy(&copy).unwrap();

            let conn = Connection::open(&copy).unwrap();
            let n: i64 = conn
                .query_row("SELECT COUNT(*) FROM kv", [], |r| r.get(0))
                .unwrap();
            assert_eq!(n, 2);
        }

        #[test]
        fn test_hot_copy_refuses_existing_target() {
            let dir = tempfile::tempdir().unwrap();
            let store = SqliteStateStore::open(&dir.path().join("state.db")).unwrap();
            let copy = dir.path().join("copy.db");
            std::fs::write(&copy, b"occupied").unwrap();
            assert!(store.hot_copy(&copy).is_err());
        }
    }
}
