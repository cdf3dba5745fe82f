//! Mailbox/inbox store: one SQLite database per (tenant, user) pair, storing
//! references (not full node content) with full-text search over a
//! generated snippet. Grounded on
//! `dbaas/entdb_server/apply/mailbox_store.py`, including its FTS5
//! external-content table and sync triggers, its "catch query syntax
//! errors, log a warning, return empty" search contract, and its
//! read-ops-return-empty/write-ops-create-lazily behavior when a user's
//! mailbox database does not yet exist.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{EntDbError, Result};
use crate::model::sanitize_id;

use super::schema_sql::MAILBOX_DDL;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MailboxItem {
    pub item_id: String,
    pub ref_id: String,
    pub source_type_id: i64,
    pub source_node_id: String,
    pub thread_id: Option<String>,
    pub ts_ms: i64,
    pub state: Map<String, Value>,
    pub snippet: String,
    pub metadata: Map<String, Value>,
}

/// One full-text search hit: the item plus its FTS rank and a highlighted
/// snippet, mirroring the Python `SearchResult` dataclass.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchResult {
    pub item: MailboxItem,
    pub rank: f64,
    pub highlights: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MailboxStoreConfig {
    pub data_dir: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for MailboxStoreConfig {
    fn default() -> Self {
        Self { data_dir: PathBuf::from("/var/lib/entdb/mailboxes"), busy_timeout_ms: 5000 }
    }
}

/// Per-(tenant,user) pool cache, mirroring `CanonicalStore`'s. Unlike the
/// canonical store, most operations open their database with "do not
/// create" semantics: a missing mailbox is not an error, it just means the
/// user has no items yet.
pub struct MailboxStore {
    config: MailboxStoreConfig,
    pools: Mutex<HashMap<(String, String), SqlitePool>>,
}

impl MailboxStore {
    pub fn new(config: MailboxStoreConfig) -> Self {
        Self { config, pools: Mutex::new(HashMap::new()) }
    }

    pub fn db_path(&self, tenant_id: &str, user_id: &str) -> PathBuf {
        self.config
            .data_dir
            .join(format!("mailbox_{}_{}.db", sanitize_id(tenant_id), sanitize_id(user_id)))
    }

    pub async fn mailbox_exists(&self, tenant_id: &str, user_id: &str) -> bool {
        self.db_path(tenant_id, user_id).exists()
    }

    async fn open_pool(&self, path: &Path) -> Result<SqlitePool> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| EntDbError::Internal(format!("invalid sqlite path: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_millis(self.config.busy_timeout_ms))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(opts).await?;
        for stmt in MAILBOX_DDL {
            sqlx::query(stmt).execute(&pool).await?;
        }
        Ok(pool)
    }

    /// Returns the cached pool for a (tenant, user) pair. When `create` is
    /// false and no database file exists yet, returns `None` rather than
    /// creating one, matching `_get_connection(..., create=False)`'s
    /// `FileNotFoundError` contract translated into an `Option`.
    async fn pool(&self, tenant_id: &str, user_id: &str, create: bool) -> Result<Option<SqlitePool>> {
        let key = (tenant_id.to_string(), user_id.to_string());
        {
            let pools = self.pools.lock().await;
            if let Some(pool) = pools.get(&key) {
                return Ok(Some(pool.clone()));
            }
        }
        let path = self.db_path(tenant_id, user_id);
        if !create && !path.exists() {
            return Ok(None);
        }
        let pool = self.open_pool(&path).await?;
        let mut pools = self.pools.lock().await;
        pools.insert(key, pool.clone());
        Ok(Some(pool))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add_item(
        &self,
        tenant_id: &str,
        user_id: &str,
        source_type_id: i64,
        source_node_id: &str,
        snippet: &str,
        ref_id: Option<&str>,
        thread_id: Option<&str>,
        metadata: Map<String, Value>,
        ts_ms: i64,
    ) -> Result<MailboxItem> {
        let pool = self.pool(tenant_id, user_id, true).await?.expect("pool(create=true) always returns Some");
        let item_id = uuid::Uuid::new_v4().to_string();
        let ref_id = ref_id.unwrap_or(source_node_id).to_string();
        let mut state = Map::new();
        state.insert("read".into(), Value::Bool(false));

        sqlx::query(
            "INSERT INTO mailbox_items (item_id, ref_id, source_type_id, source_node_id, thread_id, ts, state_json, snippet, metadata_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&item_id)
        .bind(&ref_id)
        .bind(source_type_id)
        .bind(source_node_id)
        .bind(thread_id)
        .bind(ts_ms)
        .bind(serde_json::to_string(&state)?)
        .bind(snippet)
        .bind(serde_json::to_string(&metadata)?)
        .execute(&pool)
        .await?;

        Ok(MailboxItem {
            item_id,
            ref_id,
            source_type_id,
            source_node_id: source_node_id.to_string(),
            thread_id: thread_id.map(|s| s.to_string()),
            ts_ms,
            state,
            snippet: snippet.to_string(),
            metadata,
        })
    }

    pub async fn get_item(&self, tenant_id: &str, user_id: &str, item_id: &str) -> Result<Option<MailboxItem>> {
        let Some(pool) = self.pool(tenant_id, user_id, false).await? else {
            return Ok(None);
        };
        let row = sqlx::query(
            "SELECT item_id, ref_id, source_type_id, source_node_id, thread_id, ts, state_json, snippet, metadata_json \
             FROM mailbox_items WHERE item_id = ?1",
        )
        .bind(item_id)
        .fetch_optional(&pool)
        .await?;
        row.map(row_to_item).transpose()
    }

    /// List items with optional filters, newest first. A missing mailbox
    /// database yields an empty list rather than an error.
    pub async fn list_items(
        &self,
        tenant_id: &str,
        user_id: &str,
        limit: i64,
        offset: i64,
        thread_id: Option<&str>,
        source_type_id: Option<i64>,
        unread_only: bool,
    ) -> Result<Vec<MailboxItem>> {
        let Some(pool) = self.pool(tenant_id, user_id, false).await? else {
            return Ok(Vec::new());
        };

        let mut sql = String::from(
            "SELECT item_id, ref_id, source_type_id, source_node_id, thread_id, ts, state_json, snippet, metadata_json \
             FROM mailbox_items WHERE 1=1",
        );
        if thread_id.is_some() {
            sql.push_str(" AND thread_id = ?1");
        }
        if source_type_id.is_some() {
            sql.push_str(" AND source_type_id = ?2");
        }
        if unread_only {
            sql.push_str(" AND json_extract(state_json, '$.read') = 0");
        }
        sql.push_str(" ORDER BY ts DESC LIMIT ?3 OFFSET ?4");

        let mut query = sqlx::query(&sql);
        query = query.bind(thread_id.unwrap_or_default());
        query = query.bind(source_type_id.unwrap_or_default());
        query = query.bind(limit);
        query = query.bind(offset);

        let rows = query.fetch_all(&pool).await?;
        rows.into_iter().map(row_to_item).collect()
    }

    /// Shallow-merges `state_patch` into the item's existing state. Missing
    /// mailbox or missing item both yield `None`.
    pub async fn update_state(
        &self,
        tenant_id: &str,
        user_id: &str,
        item_id: &str,
        state_patch: Map<String, Value>,
    ) -> Result<Option<MailboxItem>> {
        let Some(pool) = self.pool(tenant_id, user_id, false).await? else {
            return Ok(None);
        };
        let mut tx = pool.begin().await?;
        let row = sqlx::query(
            "SELECT item_id, ref_id, source_type_id, source_node_id, thread_id, ts, state_json, snippet, metadata_json \
             FROM mailbox_items WHERE item_id = ?1",
        )
        .bind(item_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let mut item = row_to_item(row)?;
        for (k, v) in state_patch {
            item.state.insert(k, v);
        }
        sqlx::query("UPDATE mailbox_items SET state_json = ?1 WHERE item_id = ?2")
            .bind(serde_json::to_string(&item.state)?)
            .bind(item_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(item))
    }

    pub async fn delete_item(&self, tenant_id: &str, user_id: &str, item_id: &str) -> Result<bool> {
        let Some(pool) = self.pool(tenant_id, user_id, false).await? else {
            return Ok(false);
        };
        let result = sqlx::query("DELETE FROM mailbox_items WHERE item_id = ?1")
            .bind(item_id)
            .execute(&pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_by_source(&self, tenant_id: &str, user_id: &str, source_node_id: &str) -> Result<u64> {
        let Some(pool) = self.pool(tenant_id, user_id, false).await? else {
            return Ok(0);
        };
        let result = sqlx::query("DELETE FROM mailbox_items WHERE source_node_id = ?1")
            .bind(source_node_id)
            .execute(&pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_thread(&self, tenant_id: &str, user_id: &str, thread_id: &str) -> Result<Vec<MailboxItem>> {
        let Some(pool) = self.pool(tenant_id, user_id, false).await? else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            "SELECT item_id, ref_id, source_type_id, source_node_id, thread_id, ts, state_json, snippet, metadata_json \
             FROM mailbox_items WHERE thread_id = ?1 ORDER BY ts ASC",
        )
        .bind(thread_id)
        .fetch_all(&pool)
        .await?;
        rows.into_iter().map(row_to_item).collect()
    }

    /// Full-text search over item snippets, ordered by ascending FTS rank.
    /// FTS5 query syntax errors (stray `"`, unbalanced `NOT`/`AND`, etc.)
    /// are caught and logged rather than propagated, matching
    /// `mailbox_store.py::search`'s "bad query returns no results, not a
    /// 500" contract — but only for errors that are actually FTS5 syntax
    /// errors; any other database error still propagates.
    pub async fn search(
        &self,
        tenant_id: &str,
        user_id: &str,
        query: &str,
        source_type_ids: Option<&[i64]>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SearchResult>> {
        let Some(pool) = self.pool(tenant_id, user_id, false).await? else {
            return Ok(Vec::new());
        };

        let mut sql = String::from(
            "SELECT m.item_id, m.ref_id, m.source_type_id, m.source_node_id, m.thread_id, m.ts, \
                    m.state_json, m.snippet, m.metadata_json, fts.rank as fts_rank, \
                    highlight(fts_mailbox, 0, '<b>', '</b>') as highlights \
             FROM mailbox_items m JOIN fts_mailbox fts ON m.rowid = fts.rowid \
             WHERE fts_mailbox MATCH ?1",
        );
        if let Some(ids) = source_type_ids {
            if !ids.is_empty() {
                let placeholders = (0..ids.len()).map(|i| format!("?{}", i + 2)).collect::<Vec<_>>().join(",");
                sql.push_str(&format!(" AND m.source_type_id IN ({placeholders})"));
            }
        }
        let next_param = 2 + source_type_ids.map(|ids| ids.len()).unwrap_or(0);
        sql.push_str(&format!(" ORDER BY fts.rank LIMIT ?{next_param} OFFSET ?{}", next_param + 1));

        let mut q = sqlx::query(&sql).bind(query);
        if let Some(ids) = source_type_ids {
            for id in ids {
                q = q.bind(*id);
            }
        }
        q = q.bind(limit).bind(offset);

        match q.fetch_all(&pool).await {
            Ok(rows) => rows
                .into_iter()
                .map(|row| {
                    let rank: f64 = row.try_get("fts_rank")?;
                    let highlights: Option<String> = row.try_get("highlights")?;
                    let item = row_to_item(row)?;
                    Ok(SearchResult { item, rank, highlights })
                })
                .collect(),
            Err(sqlx::Error::Database(dbe)) if dbe.message().to_lowercase().contains("fts5") => {
                warn!(query, error = %dbe.message(), "mailbox fts5 query failed, returning empty result");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Bulk-marks items read in a single `UPDATE ... WHERE item_id IN
    /// (...)`, matching `mailbox_store.py::mark_read`'s bulk JSON mutation.
    /// Returns the number of rows updated.
    pub async fn mark_read(&self, tenant_id: &str, user_id: &str, item_ids: &[String]) -> Result<u64> {
        if item_ids.is_empty() {
            return Ok(0);
        }
        let Some(pool) = self.pool(tenant_id, user_id, false).await? else {
            return Ok(0);
        };
        let placeholders = (1..=item_ids.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(",");
        let sql = format!(
            "UPDATE mailbox_items SET state_json = json_set(state_json, '$.read', json('true')) \
             WHERE item_id IN ({placeholders})"
        );
        let mut q = sqlx::query(&sql);
        for id in item_ids {
            q = q.bind(id);
        }
        let result = q.execute(&pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn get_unread_count(&self, tenant_id: &str, user_id: &str) -> Result<i64> {
        let Some(pool) = self.pool(tenant_id, user_id, false).await? else {
            return Ok(0);
        };
        let row = sqlx::query("SELECT COUNT(*) as c FROM mailbox_items WHERE json_extract(state_json, '$.read') = 0")
            .fetch_one(&pool)
            .await?;
        Ok(row.try_get::<i64, _>("c")?)
    }

    pub async fn rebuild_fts_index(&self, tenant_id: &str, user_id: &str) -> Result<()> {
        let pool = self.pool(tenant_id, user_id, true).await?.expect("pool(create=true) always returns Some");
        sqlx::query("INSERT INTO fts_mailbox(fts_mailbox) VALUES ('rebuild')").execute(&pool).await?;
        Ok(())
    }
}

fn row_to_item(row: sqlx::sqlite::SqliteRow) -> Result<MailboxItem> {
    let state_json: String = row.try_get("state_json")?;
    let metadata_json: String = row.try_get("metadata_json")?;
    Ok(MailboxItem {
        item_id: row.try_get("item_id")?,
        ref_id: row.try_get("ref_id")?,
        source_type_id: row.try_get("source_type_id")?,
        source_node_id: row.try_get("source_node_id")?,
        thread_id: row.try_get("thread_id")?,
        ts_ms: row.try_get("ts")?,
        state: serde_json::from_str(&state_json)?,
        snippet: row.try_get("snippet")?,
        metadata: serde_json::from_str(&metadata_json)?,
    })
}

/// Builds the default search snippet from a node's fanout fields, matching
/// `mailbox_store.py::_default_snippet`: the first 3 string-valued fields in
/// declaration order, space-joined and truncated to 280 chars.
pub fn default_snippet(payload: &Map<String, Value>, field_order: &[String]) -> String {
    let mut parts = Vec::new();
    for name in field_order {
        if let Some(Value::String(s)) = payload.get(name) {
            parts.push(s.clone());
            if parts.len() == 3 {
                break;
            }
        }
    }
    let joined = parts.join(" ");
    if joined.len() > 280 {
        joined.chars().take(280).collect()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> MailboxStoreConfig {
        MailboxStoreConfig { data_dir: dir.path().to_path_buf(), busy_timeout_ms: 1000 }
    }

    #[tokio::test]
    async fn add_and_get_item_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = MailboxStore::new(test_config(&dir));
        let item = store
            .add_item("t1", "user:alice", 2, "node-1", "Finish the report", Some("task-1"), Some("thread-1"), Map::new(), 1000)
            .await
            .unwrap();
        let fetched = store.get_item("t1", "user:alice", &item.item_id).await.unwrap().unwrap();
        assert_eq!(fetched.snippet, "Finish the report");
    }

    #[tokio::test]
    async fn mailboxes_are_isolated_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let store = MailboxStore::new(test_config(&dir));
        store
            .add_item("t1", "user:alice", 2, "node-1", "alice's item", None, None, Map::new(), 1000)
            .await
            .unwrap();
        store
            .add_item("t1", "user:bob", 2, "node-2", "bob's item", None, None, Map::new(), 1000)
            .await
            .unwrap();

        let alice_items = store.list_items("t1", "user:alice", 50, 0, None, None, false).await.unwrap();
        assert_eq!(alice_items.len(), 1);
        assert_eq!(alice_items[0].snippet, "alice's item");

        let bob_items = store.list_items("t1", "user:bob", 50, 0, None, None, false).await.unwrap();
        assert_eq!(bob_items.len(), 1);
        assert_eq!(bob_items[0].snippet, "bob's item");
    }

    #[tokio::test]
    async fn read_ops_on_missing_mailbox_return_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MailboxStore::new(test_config(&dir));
        assert!(store.list_items("t1", "user:nobody", 50, 0, None, None, false).await.unwrap().is_empty());
        assert!(store.get_item("t1", "user:nobody", "missing").await.unwrap().is_none());
        assert_eq!(store.get_unread_count("t1", "user:nobody").await.unwrap(), 0);
        assert!(!store.mailbox_exists("t1", "user:nobody").await);
    }

    #[tokio::test]
    async fn search_finds_matching_snippet() {
        let dir = tempfile::tempdir().unwrap();
        let store = MailboxStore::new(test_config(&dir));
        store
            .add_item("t1", "user:alice", 2, "node-1", "quarterly report is due", None, None, Map::new(), 1000)
            .await
            .unwrap();
        store
            .add_item("t1", "user:alice", 2, "node-2", "lunch plans", None, None, Map::new(), 1001)
            .await
            .unwrap();

        let results = store.search("t1", "user:alice", "report", None, 10, 0).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].item.source_node_id, "node-1");
        assert!(results[0].highlights.as_deref().unwrap_or_default().contains("<b>"));
    }

    #[tokio::test]
    async fn search_filters_by_source_type_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = MailboxStore::new(test_config(&dir));
        store
            .add_item("t1", "user:alice", 2, "node-1", "quarterly report", None, None, Map::new(), 1000)
            .await
            .unwrap();
        store
            .add_item("t1", "user:alice", 9, "node-2", "annual report", None, None, Map::new(), 1001)
            .await
            .unwrap();

        let results = store.search("t1", "user:alice", "report", Some(&[9]), 10, 0).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].item.source_node_id, "node-2");
    }

    #[tokio::test]
    async fn search_with_malformed_query_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MailboxStore::new(test_config(&dir));
        store
            .add_item("t1", "user:alice", 2, "node-1", "hello world", None, None, Map::new(), 1000)
            .await
            .unwrap();

        let results = store.search("t1", "user:alice", "\"unterminated", None, 10, 0).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn mark_read_is_bulk_and_updates_unread_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = MailboxStore::new(test_config(&dir));
        let a = store.add_item("t1", "user:alice", 2, "node-1", "a", None, None, Map::new(), 1000).await.unwrap();
        let b = store.add_item("t1", "user:alice", 2, "node-2", "b", None, None, Map::new(), 1001).await.unwrap();
        assert_eq!(store.get_unread_count("t1", "user:alice").await.unwrap(), 2);

        let updated = store.mark_read("t1", "user:alice", &[a.item_id.clone(), b.item_id.clone()]).await.unwrap();
        assert_eq!(updated, 2);
        assert_eq!(store.get_unread_count("t1", "user:alice").await.unwrap(), 0);
    }

    #[test]
    fn default_snippet_truncates_to_three_fields() {
        let mut payload = Map::new();
        payload.insert("a".into(), Value::String("one".into()));
        payload.insert("b".into(), Value::String("two".into()));
        payload.insert("c".into(), Value::String("three".into()));
        payload.insert("d".into(), Value::String("four".into()));
        let order = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()];
        assert_eq!(default_snippet(&payload, &order), "one two three");
    }
}
