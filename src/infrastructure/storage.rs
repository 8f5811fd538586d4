use crate::infrastructure::error::InfraError;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseState {
    /// The key/value table was missing and has been created.
    Created,
    Existing,
}

/// Opens or creates the daytrack database and makes sure `kv_store` exists.
pub fn initialize_database(path: &Path) -> Result<DatabaseState, InfraError> {
    let connection = Connection::open(path)?;
    let existed = connection
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'kv_store'",
            [],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    connection.execute_batch(SCHEMA_SQL)?;
    Ok(if existed {
        DatabaseState::Existing
    } else {
        DatabaseState::Created
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_database_creates_kv_store_once() {
        let path = std::env::temp_dir().join(format!(
            "daytrack-storage-test-{}.sqlite",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        assert_eq!(initialize_database(&path).expect("first initialization"), DatabaseState::Created);
        let connection = Connection::open(&path).expect("open database");
        connection
            .execute(
                "INSERT INTO kv_store (key, value, updated_at) VALUES ('daySession', '{}', 'now')",
                [],
            )
            .expect("seed row");
        drop(connection);

        assert_eq!(initialize_database(&path).expect("second initialization"), DatabaseState::Existing);
        let connection = Connection::open(&path).expect("open database");
        let rows: i64 = connection
            .query_row("SELECT COUNT(*) FROM kv_store", [], |row| row.get(0))
            .expect("count rows");
        assert_eq!(rows, 1);
        let _ = std::fs::remove_file(&path);
    }
}
