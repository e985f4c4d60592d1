//! Entity-mirror tables: local copies of remote-owned records.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use offsync_common::{Error, Result, TableName};

use crate::clock::from_millis;
use crate::database::{table_exists, LocalStore};
use crate::schema::{self, ENTITY_TABLE_PREFIX};

/// Sync status of a mirrored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitySyncStatus {
    /// Written locally, not yet confirmed by the remote.
    Pending,
    /// Matches the last confirmed remote state.
    Synced,
    /// Local and remote disagree.
    Conflict,
}

impl EntitySyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitySyncStatus::Pending => "pending",
            EntitySyncStatus::Synced => "synced",
            EntitySyncStatus::Conflict => "conflict",
        }
    }
}

impl fmt::Display for EntitySyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntitySyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(EntitySyncStatus::Pending),
            "synced" => Ok(EntitySyncStatus::Synced),
            "conflict" => Ok(EntitySyncStatus::Conflict),
            other => Err(Error::Serialization(format!(
                "Unknown entity sync status: {}",
                other
            ))),
        }
    }
}

/// A locally mirrored copy of a remote-owned object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Globally unique id (remote-assigned or locally pending).
    pub id: String,
    /// Opaque JSON owned by the calling subsystem.
    pub payload: serde_json::Value,
    pub sync_status: EntitySyncStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row as stored, before JSON and status decoding.
struct EntityRow {
    id: String,
    payload: String,
    sync_status: String,
    created_at: i64,
    updated_at: i64,
}

impl EntityRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            payload: row.get(1)?,
            sync_status: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn decode(self) -> Result<EntityRecord> {
        Ok(EntityRecord {
            id: self.id,
            payload: serde_json::from_str(&self.payload)?,
            sync_status: self.sync_status.parse()?,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidInput("Entity id cannot be empty".to_string()));
    }
    Ok(())
}

impl LocalStore {
    /// Insert or fully replace a mirrored record.
    ///
    /// On an existing id the payload is replaced wholesale, the status goes back
    /// to `pending` and `updated_at` is refreshed; `created_at` is kept.
    pub async fn upsert(
        &self,
        table: &TableName,
        id: &str,
        payload: &serde_json::Value,
    ) -> Result<EntityRecord> {
        validate_id(id)?;
        let name = schema::entity_table(table);
        let ddl = schema::entity_table_ddl(table);
        let id = id.to_string();
        let payload = serde_json::to_string(payload)?;
        let now = self.clock().now_millis();

        debug!("Upserting {} into {}", id, name);
        let row = self
            .call(move |conn| {
                conn.execute_batch(&ddl)?;
                conn.execute(
                    &format!(
                        r#"
                        INSERT INTO "{name}" (id, payload, sync_status, created_at, updated_at)
                        VALUES (?1, ?2, 'pending', ?3, ?3)
                        ON CONFLICT(id) DO UPDATE SET
                            payload = excluded.payload,
                            sync_status = 'pending',
                            updated_at = excluded.updated_at
                        "#
                    ),
                    params![id, payload, now],
                )?;
                conn.query_row(
                    &format!(
                        r#"SELECT id, payload, sync_status, created_at, updated_at
                           FROM "{name}" WHERE id = ?1"#
                    ),
                    [&id],
                    EntityRow::from_row,
                )
            })
            .await?;

        row.decode()
    }

    /// Fetch one record. A missing table or id is `Ok(None)`.
    pub async fn get(&self, table: &TableName, id: &str) -> Result<Option<EntityRecord>> {
        let name = schema::entity_table(table);
        let id = id.to_string();

        let row = self
            .call(move |conn| {
                if !table_exists(conn, &name)? {
                    return Ok(None);
                }
                conn.query_row(
                    &format!(
                        r#"SELECT id, payload, sync_status, created_at, updated_at
                           FROM "{name}" WHERE id = ?1"#
                    ),
                    [&id],
                    EntityRow::from_row,
                )
                .optional()
            })
            .await?;

        row.map(EntityRow::decode).transpose()
    }

    /// All records of a table, newest first. A missing table is an empty list.
    pub async fn list(&self, table: &TableName) -> Result<Vec<EntityRecord>> {
        let name = schema::entity_table(table);

        let rows = self
            .call(move |conn| {
                if !table_exists(conn, &name)? {
                    return Ok(Vec::new());
                }
                let mut stmt = conn.prepare(&format!(
                    r#"SELECT id, payload, sync_status, created_at, updated_at
                       FROM "{name}" ORDER BY created_at DESC, rowid DESC"#
                ))?;
                let rows = stmt
                    .query_map([], EntityRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter().map(EntityRow::decode).collect()
    }

    /// Delete a record. Returns whether a row was removed.
    pub async fn delete(&self, table: &TableName, id: &str) -> Result<bool> {
        let name = schema::entity_table(table);
        let id = id.to_string();

        self.call(move |conn| {
            if !table_exists(conn, &name)? {
                return Ok(false);
            }
            let removed = conn.execute(&format!(r#"DELETE FROM "{name}" WHERE id = ?1"#), [&id])?;
            Ok(removed > 0)
        })
        .await
    }

    /// Record the outcome of a confirmed sync without touching the payload.
    pub async fn set_status(
        &self,
        table: &TableName,
        id: &str,
        status: EntitySyncStatus,
    ) -> Result<bool> {
        let name = schema::entity_table(table);
        let id = id.to_string();
        let now = self.clock().now_millis();

        self.call(move |conn| {
            if !table_exists(conn, &name)? {
                return Ok(false);
            }
            let updated = conn.execute(
                &format!(
                    r#"UPDATE "{name}" SET sync_status = ?1, updated_at = ?2 WHERE id = ?3"#
                ),
                params![status.as_str(), now, id],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    /// Names of every entity-mirror table present in the store.
    pub async fn entity_tables(&self) -> Result<Vec<TableName>> {
        let pattern = format!("{}%", ENTITY_TABLE_PREFIX.replace('_', "\\_"));

        let names = self
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"SELECT name FROM sqlite_master
                       WHERE type = 'table' AND name LIKE ?1 ESCAPE '\'
                       ORDER BY name"#,
                )?;
                let names = stmt
                    .query_map([pattern], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(names)
            })
            .await?;

        names
            .iter()
            .filter_map(|n| n.strip_prefix(ENTITY_TABLE_PREFIX))
            .map(TableName::new)
            .collect()
    }

    /// Row count of every entity-mirror table.
    pub async fn entity_row_counts(&self) -> Result<BTreeMap<String, u64>> {
        let tables = self.entity_tables().await?;

        self.call(move |conn| {
            let mut counts = BTreeMap::new();
            for table in tables {
                let name = schema::entity_table(&table);
                let count: i64 = conn.query_row(
                    &format!(r#"SELECT COUNT(*) FROM "{name}""#),
                    [],
                    |row| row.get(0),
                )?;
                counts.insert(table.to_string(), count as u64);
            }
            Ok(counts)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;
    use serde_json::json;
    use std::sync::Arc;

    fn drivers() -> TableName {
        TableName::new("drivers").unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let store = LocalStore::in_memory_default().await.unwrap();

        let record = store
            .upsert(&drivers(), "d-1", &json!({"name": "Ana"}))
            .await
            .unwrap();
        assert_eq!(record.sync_status, EntitySyncStatus::Pending);

        let fetched = store.get(&drivers(), "d-1").await.unwrap().unwrap();
        assert_eq!(fetched.payload, json!({"name": "Ana"}));
        assert!(store.get(&drivers(), "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces_whole_record() {
        let clock = Arc::new(ManualClock::default());
        let store = LocalStore::in_memory(clock.clone()).await.unwrap();

        let first = store
            .upsert(&drivers(), "d-1", &json!({"name": "Ana", "phone": "555"}))
            .await
            .unwrap();
        store
            .set_status(&drivers(), "d-1", EntitySyncStatus::Synced)
            .await
            .unwrap();

        clock.advance(Duration::seconds(30));
        let second = store
            .upsert(&drivers(), "d-1", &json!({"name": "Ana B."}))
            .await
            .unwrap();

        // No field merge: "phone" is gone.
        assert_eq!(second.payload, json!({"name": "Ana B."}));
        assert_eq!(second.sync_status, EntitySyncStatus::Pending);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);
        assert_eq!(store.list(&drivers()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let clock = Arc::new(ManualClock::default());
        let store = LocalStore::in_memory(clock.clone()).await.unwrap();

        for id in ["a", "b", "c"] {
            store.upsert(&drivers(), id, &json!({})).await.unwrap();
            clock.advance(Duration::seconds(1));
        }

        let ids: Vec<String> = store
            .list(&drivers())
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_missing_table_reads_empty() {
        let store = LocalStore::in_memory_default().await.unwrap();
        let table = TableName::new("notifications").unwrap();

        assert!(store.list(&table).await.unwrap().is_empty());
        assert!(store.get(&table, "n-1").await.unwrap().is_none());
        assert!(!store.delete(&table, "n-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_and_counts() {
        let store = LocalStore::in_memory_default().await.unwrap();
        let locations = TableName::new("locations").unwrap();

        store.upsert(&drivers(), "d-1", &json!(1)).await.unwrap();
        store.upsert(&locations, "l-1", &json!(1)).await.unwrap();
        store.upsert(&locations, "l-2", &json!(2)).await.unwrap();

        assert!(store.delete(&locations, "l-1").await.unwrap());
        assert!(!store.delete(&locations, "l-1").await.unwrap());

        let counts = store.entity_row_counts().await.unwrap();
        assert_eq!(counts.get("drivers"), Some(&1));
        assert_eq!(counts.get("locations"), Some(&1));
        assert_eq!(counts.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_id_rejected() {
        let store = LocalStore::in_memory_default().await.unwrap();
        let err = store.upsert(&drivers(), "", &json!({})).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
