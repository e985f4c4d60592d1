//! Table layout of the durable store.
//!
//! All statements are idempotent so the schema can be applied on every open.

use offsync_common::TableName;

/// Schema version recorded in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Prefix applied to caller-owned entity-mirror tables.
pub const ENTITY_TABLE_PREFIX: &str = "entity_";

/// Outbound mutation log and response cache.
///
/// `sync_queue.seq` is the processing order. It never goes backwards, even
/// when the wall clock does, and survives `VACUUM`.
pub const CORE_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS sync_queue (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        endpoint TEXT NOT NULL,
        method TEXT NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_attempt_at INTEGER,
        created_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sync_queue_status
        ON sync_queue(status, seq);

    CREATE TABLE IF NOT EXISTS cache (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        expires_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache(expires_at);
"#;

/// Physical SQLite name of an entity-mirror table.
pub fn entity_table(table: &TableName) -> String {
    format!("{}{}", ENTITY_TABLE_PREFIX, table.as_str())
}

/// DDL for one entity-mirror table.
pub fn entity_table_ddl(table: &TableName) -> String {
    let name = entity_table(table);
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{name}" (
            id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS "idx_{name}_created" ON "{name}"(created_at);
        "#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_table_naming() {
        let table = TableName::new("drivers").unwrap();
        assert_eq!(entity_table(&table), "entity_drivers");

        let ddl = entity_table_ddl(&table);
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS \"entity_drivers\""));
        assert!(ddl.contains("idx_entity_drivers_created"));
    }
}
