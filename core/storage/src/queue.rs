//! Durable, ordered log of outbound mutations.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

use offsync_common::{Error, MutationId, Result};

use crate::clock::from_millis;
use crate::database::LocalStore;

/// Default number of failed attempts before a mutation is given up on.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// HTTP verb a mutation is replayed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Whether requests with this verb carry a JSON body.
    pub fn has_body(&self) -> bool {
        !matches!(self, HttpMethod::Get | HttpMethod::Delete)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(Error::InvalidInput(format!("Unsupported HTTP method: {}", other))),
        }
    }
}

/// Lifecycle state of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    /// Waiting to be sent (or re-sent).
    Pending,
    /// Accepted by the remote.
    Synced,
    /// Exceeded the retry budget; kept for the caller to inspect or retry.
    FailedPermanently,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::Synced => "synced",
            MutationStatus::FailedPermanently => "failed",
        }
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MutationStatus::Pending),
            "synced" => Ok(MutationStatus::Synced),
            "failed" => Ok(MutationStatus::FailedPermanently),
            other => Err(Error::Serialization(format!("Unknown mutation status: {}", other))),
        }
    }
}

/// A durable unit of outbound work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub id: MutationId,
    /// Absolute URL, or a path resolved against the transport's base URL.
    pub endpoint: String,
    pub method: HttpMethod,
    /// JSON body sent with the request.
    pub payload: serde_json::Value,
    pub status: MutationStatus,
    /// Failed attempts so far.
    pub retry_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl QueuedMutation {
    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }
}

const SELECT_COLUMNS: &str =
    "id, endpoint, method, payload, status, retry_count, last_attempt_at, created_at";

struct MutationRow {
    id: String,
    endpoint: String,
    method: String,
    payload: String,
    status: String,
    retry_count: i64,
    last_attempt_at: Option<i64>,
    created_at: i64,
}

impl MutationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            endpoint: row.get(1)?,
            method: row.get(2)?,
            payload: row.get(3)?,
            status: row.get(4)?,
            retry_count: row.get(5)?,
            last_attempt_at: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn decode(self) -> Result<QueuedMutation> {
        Ok(QueuedMutation {
            id: MutationId::new(self.id)?,
            endpoint: self.endpoint,
            method: self
                .method
                .parse()
                .map_err(|e: Error| Error::Serialization(e.to_string()))?,
            payload: serde_json::from_str(&self.payload)?,
            status: self.status.parse()?,
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
            last_attempt_at: self.last_attempt_at.map(from_millis),
            created_at: from_millis(self.created_at),
        })
    }
}

/// Durable FIFO of pending writes, backed by the `sync_queue` table.
#[derive(Debug, Clone)]
pub struct MutationQueue {
    store: LocalStore,
    max_retries: u32,
}

impl MutationQueue {
    /// Create a queue over an open store.
    ///
    /// A budget of zero would fail mutations without ever sending them, so it
    /// is raised to one.
    pub fn new(store: LocalStore, max_retries: u32) -> Self {
        if max_retries == 0 {
            warn!("max_retries of 0 is not allowed, using 1");
        }
        Self {
            store,
            max_retries: max_retries.max(1),
        }
    }

    /// Failed attempts after which a mutation becomes `FailedPermanently`.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Persist a new pending mutation.
    ///
    /// Only touches the local store, so it succeeds with no network.
    pub async fn enqueue(
        &self,
        endpoint: impl Into<String>,
        method: HttpMethod,
        payload: serde_json::Value,
    ) -> Result<QueuedMutation> {
        let endpoint = endpoint.into();
        if endpoint.trim().is_empty() {
            return Err(Error::InvalidInput("Endpoint cannot be empty".to_string()));
        }

        let created_at = self.store.clock().now_millis();
        let suffix = Uuid::new_v4().simple().to_string();
        let id = MutationId::from_parts(created_at, &suffix[..12]);
        let body = serde_json::to_string(&payload)?;

        let mutation = QueuedMutation {
            id: id.clone(),
            endpoint: endpoint.clone(),
            method,
            payload,
            status: MutationStatus::Pending,
            retry_count: 0,
            last_attempt_at: None,
            created_at: from_millis(created_at),
        };

        self.store
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO sync_queue
                    (id, endpoint, method, payload, status, retry_count, last_attempt_at, created_at)
                    VALUES (?1, ?2, ?3, ?4, 'pending', 0, NULL, ?5)
                    "#,
                    params![id.as_str(), endpoint, method.as_str(), body, created_at],
                )
            })
            .await?;

        debug!("Queued {} {} as {}", mutation.method, mutation.endpoint, mutation.id);
        Ok(mutation)
    }

    /// Pending mutations in enqueue order.
    pub async fn list_pending(&self) -> Result<Vec<QueuedMutation>> {
        self.list_with_status(MutationStatus::Pending).await
    }

    /// Mutations that exhausted their retries, in enqueue order.
    pub async fn list_failed(&self) -> Result<Vec<QueuedMutation>> {
        self.list_with_status(MutationStatus::FailedPermanently).await
    }

    async fn list_with_status(&self, status: MutationStatus) -> Result<Vec<QueuedMutation>> {
        let rows = self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM sync_queue WHERE status = ?1 ORDER BY seq ASC",
                    SELECT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([status.as_str()], MutationRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter().map(MutationRow::decode).collect()
    }

    /// Look up one mutation.
    pub async fn get(&self, id: &MutationId) -> Result<Option<QueuedMutation>> {
        let id = id.as_str().to_string();
        let row = self
            .store
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM sync_queue WHERE id = ?1", SELECT_COLUMNS),
                    [&id],
                    MutationRow::from_row,
                )
                .optional()
            })
            .await?;

        row.map(MutationRow::decode).transpose()
    }

    /// Mark a mutation as accepted by the remote.
    ///
    /// Idempotent: returns `false` when the mutation was already synced.
    pub async fn mark_synced(&self, id: &MutationId) -> Result<bool> {
        let key = id.as_str().to_string();
        let now = self.store.clock().now_millis();

        let updated = self
            .store
            .call(move |conn| {
                conn.execute(
                    r#"
                    UPDATE sync_queue SET status = 'synced', last_attempt_at = ?1
                    WHERE id = ?2 AND status != 'synced'
                    "#,
                    params![now, key],
                )
            })
            .await?;

        if updated > 0 {
            debug!("Mutation {} synced", id);
        }
        Ok(updated > 0)
    }

    /// Record a failed attempt.
    ///
    /// Increments `retry_count` and stamps `last_attempt_at`. Once the count
    /// reaches `max_retries` the mutation becomes `FailedPermanently`. Only
    /// pending mutations are affected; the returned record reflects the row
    /// after the update.
    ///
    /// # Errors
    /// - `NotFound` if no mutation has this id
    pub async fn mark_failed(&self, id: &MutationId) -> Result<QueuedMutation> {
        let key = id.as_str().to_string();
        let now = self.store.clock().now_millis();
        let max = i64::from(self.max_retries);

        let row = self
            .store
            .call(move |conn| {
                conn.execute(
                    r#"
                    UPDATE sync_queue SET
                        retry_count = retry_count + 1,
                        last_attempt_at = ?1,
                        status = CASE WHEN retry_count + 1 >= ?2 THEN 'failed' ELSE status END
                    WHERE id = ?3 AND status = 'pending'
                    "#,
                    params![now, max, key],
                )?;
                conn.query_row(
                    &format!("SELECT {} FROM sync_queue WHERE id = ?1", SELECT_COLUMNS),
                    [&key],
                    MutationRow::from_row,
                )
                .optional()
            })
            .await?;

        let mutation = row
            .ok_or_else(|| Error::NotFound(format!("Queued mutation {}", id)))?
            .decode()?;

        match mutation.status {
            MutationStatus::FailedPermanently => warn!(
                "Mutation {} ({} {}) failed permanently after {} attempts",
                mutation.id, mutation.method, mutation.endpoint, mutation.retry_count
            ),
            _ => debug!(
                "Mutation {} failed, attempt {}/{}",
                mutation.id, mutation.retry_count, self.max_retries
            ),
        }
        Ok(mutation)
    }

    /// Put a permanently failed mutation back in line with a fresh retry budget.
    ///
    /// Returns `false` if the mutation is not in the failed state.
    pub async fn retry_failed(&self, id: &MutationId) -> Result<bool> {
        let key = id.as_str().to_string();
        let updated = self
            .store
            .call(move |conn| {
                conn.execute(
                    r#"
                    UPDATE sync_queue SET status = 'pending', retry_count = 0
                    WHERE id = ?1 AND status = 'failed'
                    "#,
                    [&key],
                )
            })
            .await?;

        if updated > 0 {
            info!("Mutation {} re-queued for retry", id);
        }
        Ok(updated > 0)
    }

    /// Delete every synced mutation. Returns the number of rows removed.
    pub async fn purge_synced(&self) -> Result<usize> {
        let removed = self
            .store
            .call(|conn| conn.execute("DELETE FROM sync_queue WHERE status = 'synced'", []))
            .await?;
        debug!("Purged {} synced mutations", removed);
        Ok(removed)
    }

    /// Number of mutations in each status.
    pub async fn count_by_status(&self) -> Result<HashMap<MutationStatus, u64>> {
        let rows = self
            .store
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        let mut counts = HashMap::new();
        for (status, count) in rows {
            counts.insert(status.parse::<MutationStatus>()?, count as u64);
        }
        Ok(counts)
    }
}
