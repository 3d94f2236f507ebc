use std::path::PathBuf;

use covsplit::store::SqliteStore;
use tempfile::TempDir;

/// Create a fresh file-backed store, returning the store, dir handle, and db path.
/// The caller must hold onto `TempDir` to keep the temp directory alive.
pub fn setup_store() -> (SqliteStore, TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("test.db");
    let store = SqliteStore::open(&db_path).unwrap();
    (store, dir, db_path)
}
