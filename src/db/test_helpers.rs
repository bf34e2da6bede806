use tempfile::NamedTempFile;

use crate::config::DatabaseConfig;
use crate::db::DatabaseManager;

/// Fresh, migrated SQLite database backed by a temp file.
///
/// The file handle must outlive the manager; dropping it removes the database.
pub(crate) async fn sqlite_manager() -> (NamedTempFile, DatabaseManager) {
    let file = NamedTempFile::new().expect("temp sqlite file");
    let config = DatabaseConfig {
        url: None,
        conn_string: None,
        filename: Some(file.path().to_string_lossy().to_string()),
        max_connections: Some(1),
        min_connections: Some(1),
    };

    let manager = DatabaseManager::new(&config).await.expect("db manager");
    manager.migrate().await.expect("migrate");
    (file, manager)
}
