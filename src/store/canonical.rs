//! Per-tenant canonical store: nodes, edges, visibility index, and the
//! applied-events ledger. Connection setup is grounded on angzarr's
//! `src/bin/angzarr_topology.rs` (WAL journal mode, busy timeout,
//! `create_if_missing`); transaction handling and the visible-nodes query
//! are grounded on `dbaas/entdb_server/apply/canonical_store.py`.

use sea_query::{Asterisk, Cond, Expr, Iden, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{EntDbError, Result};
use crate::model::{AclEntry, Edge, Node, sanitize_id};
use crate::stream::StreamPos;

use super::schema_sql::CANONICAL_DDL;

#[derive(Iden)]
enum Nodes {
    Table,
    TenantId,
    NodeId,
    TypeId,
    PayloadJson,
    CreatedAt,
    UpdatedAt,
    OwnerActor,
    AclBlob,
}

#[derive(Iden)]
enum Edges {
    Table,
    TenantId,
    EdgeTypeId,
    FromNodeId,
    ToNodeId,
    PropsJson,
    CreatedAt,
}

#[derive(Iden)]
enum NodeVisibility {
    Table,
    TenantId,
    NodeId,
    Principal,
}

#[derive(Iden)]
enum AppliedEvents {
    Table,
    TenantId,
    IdempotencyKey,
    StreamPos,
    AppliedAt,
}

/// Configuration for opening tenant database pools, mirroring
/// `StorageConfig` (§6.1).
#[derive(Debug, Clone)]
pub struct CanonicalStoreConfig {
    pub data_dir: PathBuf,
    pub busy_timeout_ms: u64,
    pub cache_size_pages: i64,
}

impl Default for CanonicalStoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/entdb"),
            busy_timeout_ms: 5000,
            cache_size_pages: -64000,
        }
    }
}

pub struct CanonicalStore {
    config: CanonicalStoreConfig,
    pools: Mutex<HashMap<String, SqlitePool>>,
}

impl CanonicalStore {
    pub fn new(config: CanonicalStoreConfig) -> Self {
        Self { config, pools: Mutex::new(HashMap::new()) }
    }

    pub fn db_path(&self, tenant_id: &str) -> PathBuf {
        self.config.data_dir.join(format!("tenant_{}.db", sanitize_id(tenant_id)))
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
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
        sqlx::query(&format!("PRAGMA cache_size = {}", self.config.cache_size_pages))
            .execute(&pool)
            .await?;
        for stmt in CANONICAL_DDL {
            sqlx::query(stmt).execute(&pool).await?;
        }
        Ok(pool)
    }

    /// Returns the cached pool for a tenant, opening and initializing the
    /// database on first access ("missing tenant -> on-demand schema
    /// initialization").
    pub async fn pool(&self, tenant_id: &str) -> Result<SqlitePool> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(tenant_id) {
            return Ok(pool.clone());
        }
        let path = self.db_path(tenant_id);
        let pool = self.open_pool(&path).await?;
        pools.insert(tenant_id.to_string(), pool.clone());
        Ok(pool)
    }

    pub async fn tenant_exists(&self, tenant_id: &str) -> bool {
        self.db_path(tenant_id).exists()
    }

    pub async fn initialize_tenant(&self, tenant_id: &str) -> Result<()> {
        self.pool(tenant_id).await.map(|_| ())
    }

    pub async fn check_idempotency(&self, tenant_id: &str, idempotency_key: &str) -> Result<bool> {
        let pool = self.pool(tenant_id).await?;
        let row = sqlx::query(
            "SELECT 1 FROM applied_events WHERE tenant_id = ?1 AND idempotency_key = ?2",
        )
        .bind(tenant_id)
        .bind(idempotency_key)
        .fetch_optional(&pool)
        .await?;
        Ok(row.is_some())
    }

    async fn record_applied_event_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        tenant_id: &str,
        idempotency_key: &str,
        pos: &StreamPos,
        applied_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO applied_events (tenant_id, idempotency_key, stream_pos, applied_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(tenant_id)
        .bind(idempotency_key)
        .bind(pos.to_string())
        .bind(applied_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn record_applied_event(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
        pos: &StreamPos,
        applied_at: i64,
    ) -> Result<()> {
        let pool = self.pool(tenant_id).await?;
        let mut tx = pool.begin().await?;
        Self::record_applied_event_tx(&mut tx, tenant_id, idempotency_key, pos, applied_at).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_last_applied_position(&self, tenant_id: &str) -> Result<Option<i64>> {
        let pool = self.pool(tenant_id).await?;
        let row = sqlx::query(
            "SELECT stream_pos FROM applied_events WHERE tenant_id = ?1 ORDER BY applied_at DESC LIMIT 1",
        )
        .bind(tenant_id)
        .fetch_optional(&pool)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let pos_str: String = row.try_get("stream_pos")?;
                let offset = pos_str.rsplit(':').next().and_then(|s| s.parse::<i64>().ok());
                Ok(offset)
            }
        }
    }

    /// Creates a node and its visibility rows in one transaction. Only the
    /// applier and restore tool call this; both pass an explicit
    /// `created_at` so replay reproduces the original timestamps.
    pub async fn create_node(
        &self,
        tenant_id: &str,
        type_id: i64,
        payload: serde_json::Map<String, serde_json::Value>,
        owner_actor: &str,
        node_id: Option<String>,
        acl: Vec<AclEntry>,
        created_at: i64,
    ) -> Result<Node> {
        let node_id = node_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let pool = self.pool(tenant_id).await?;
        let mut tx = pool.begin().await?;

        let payload_json = serde_json::to_string(&payload)?;
        let acl_blob = serde_json::to_string(&acl)?;

        sqlx::query(
            "INSERT INTO nodes (tenant_id, node_id, type_id, payload_json, created_at, updated_at, owner_actor, acl_blob) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?7)",
        )
        .bind(tenant_id)
        .bind(&node_id)
        .bind(type_id)
        .bind(&payload_json)
        .bind(created_at)
        .bind(owner_actor)
        .bind(&acl_blob)
        .execute(&mut *tx)
        .await?;

        Self::update_visibility_tx(&mut tx, tenant_id, &node_id, owner_actor, &acl).await?;

        tx.commit().await?;

        Ok(Node {
            tenant_id: tenant_id.to_string(),
            node_id,
            type_id,
            payload,
            owner_actor: owner_actor.to_string(),
            acl,
            created_at_ms: created_at,
            updated_at_ms: created_at,
        })
    }

    async fn update_visibility_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        tenant_id: &str,
        node_id: &str,
        owner_actor: &str,
        acl: &[AclEntry],
    ) -> Result<()> {
        sqlx::query("DELETE FROM node_visibility WHERE tenant_id = ?1 AND node_id = ?2")
            .bind(tenant_id)
            .bind(node_id)
            .execute(&mut **tx)
            .await?;

        sqlx::query(
            "INSERT OR IGNORE INTO node_visibility (tenant_id, node_id, principal) VALUES (?1, ?2, ?3)",
        )
        .bind(tenant_id)
        .bind(node_id)
        .bind(owner_actor)
        .execute(&mut **tx)
        .await?;

        for entry in acl {
            if entry.principal == owner_actor {
                continue;
            }
            sqlx::query(
                "INSERT OR IGNORE INTO node_visibility (tenant_id, node_id, principal) VALUES (?1, ?2, ?3)",
            )
            .bind(tenant_id)
            .bind(node_id)
            .bind(&entry.principal)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    pub async fn get_node(&self, tenant_id: &str, node_id: &str) -> Result<Option<Node>> {
        let pool = self.pool(tenant_id).await?;
        let row = sqlx::query(
            "SELECT node_id, type_id, payload_json, created_at, updated_at, owner_actor, acl_blob \
             FROM nodes WHERE tenant_id = ?1 AND node_id = ?2",
        )
        .bind(tenant_id)
        .bind(node_id)
        .fetch_optional(&pool)
        .await?;
        row.map(|r| row_to_node(tenant_id, r)).transpose()
    }

    pub async fn update_node(
        &self,
        tenant_id: &str,
        node_id: &str,
        patch: serde_json::Map<String, serde_json::Value>,
        updated_at: i64,
    ) -> Result<Option<Node>> {
        let pool = self.pool(tenant_id).await?;
        let mut tx = pool.begin().await?;

        let row = sqlx::query(
            "SELECT node_id, type_id, payload_json, created_at, updated_at, owner_actor, acl_blob \
             FROM nodes WHERE tenant_id = ?1 AND node_id = ?2",
        )
        .bind(tenant_id)
        .bind(node_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let mut node = row_to_node(tenant_id, row)?;
        for (k, v) in patch {
            node.payload.insert(k, v);
        }
        node.updated_at_ms = updated_at;

        sqlx::query("UPDATE nodes SET payload_json = ?1, updated_at = ?2 WHERE tenant_id = ?3 AND node_id = ?4")
            .bind(serde_json::to_string(&node.payload)?)
            .bind(updated_at)
            .bind(tenant_id)
            .bind(node_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(node))
    }

    pub async fn delete_node(&self, tenant_id: &str, node_id: &str) -> Result<bool> {
        let pool = self.pool(tenant_id).await?;
        let mut tx = pool.begin().await?;

        let result = sqlx::query("DELETE FROM nodes WHERE tenant_id = ?1 AND node_id = ?2")
            .bind(tenant_id)
            .bind(node_id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "DELETE FROM edges WHERE tenant_id = ?1 AND (from_node_id = ?2 OR to_node_id = ?2)",
        )
        .bind(tenant_id)
        .bind(node_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM node_visibility WHERE tenant_id = ?1 AND node_id = ?2")
            .bind(tenant_id)
            .bind(node_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn get_nodes_by_type(
        &self,
        tenant_id: &str,
        type_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Node>> {
        let pool = self.pool(tenant_id).await?;
        let rows = sqlx::query(
            "SELECT node_id, type_id, payload_json, created_at, updated_at, owner_actor, acl_blob \
             FROM nodes WHERE tenant_id = ?1 AND type_id = ?2 ORDER BY created_at DESC LIMIT ?3 OFFSET ?4",
        )
        .bind(tenant_id)
        .bind(type_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&pool)
        .await?;
        rows.into_iter().map(|r| row_to_node(tenant_id, r)).collect()
    }

    pub async fn create_edge(
        &self,
        tenant_id: &str,
        edge_type_id: i64,
        from_node_id: &str,
        to_node_id: &str,
        props: serde_json::Map<String, serde_json::Value>,
        created_at: i64,
    ) -> Result<Edge> {
        let pool = self.pool(tenant_id).await?;
        let props_json = serde_json::to_string(&props)?;
        sqlx::query(
            "INSERT INTO edges (tenant_id, edge_type_id, from_node_id, to_node_id, props_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT (tenant_id, edge_type_id, from_node_id, to_node_id) \
             DO UPDATE SET props_json = excluded.props_json, created_at = excluded.created_at",
        )
        .bind(tenant_id)
        .bind(edge_type_id)
        .bind(from_node_id)
        .bind(to_node_id)
        .bind(&props_json)
        .bind(created_at)
        .execute(&pool)
        .await?;
        Ok(Edge {
            tenant_id: tenant_id.to_string(),
            edge_type_id,
            from_node_id: from_node_id.to_string(),
            to_node_id: to_node_id.to_string(),
            props,
            created_at_ms: created_at,
        })
    }

    pub async fn delete_edge(
        &self,
        tenant_id: &str,
        edge_type_id: i64,
        from_node_id: &str,
        to_node_id: &str,
    ) -> Result<bool> {
        let pool = self.pool(tenant_id).await?;
        let result = sqlx::query(
            "DELETE FROM edges WHERE tenant_id = ?1 AND edge_type_id = ?2 AND from_node_id = ?3 AND to_node_id = ?4",
        )
        .bind(tenant_id)
        .bind(edge_type_id)
        .bind(from_node_id)
        .bind(to_node_id)
        .execute(&pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_edges_from(
        &self,
        tenant_id: &str,
        node_id: &str,
        edge_type_id: Option<i64>,
    ) -> Result<Vec<Edge>> {
        let pool = self.pool(tenant_id).await?;
        let rows = match edge_type_id {
            Some(t) => {
                sqlx::query(
                    "SELECT edge_type_id, from_node_id, to_node_id, props_json, created_at FROM edges \
                     WHERE tenant_id = ?1 AND from_node_id = ?2 AND edge_type_id = ?3",
                )
                .bind(tenant_id)
                .bind(node_id)
                .bind(t)
                .fetch_all(&pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT edge_type_id, from_node_id, to_node_id, props_json, created_at FROM edges \
                     WHERE tenant_id = ?1 AND from_node_id = ?2",
                )
                .bind(tenant_id)
                .bind(node_id)
                .fetch_all(&pool)
                .await?
            }
        };
        rows.into_iter().map(|r| row_to_edge(tenant_id, r)).collect()
    }

    pub async fn get_edges_to(
        &self,
        tenant_id: &str,
        node_id: &str,
        edge_type_id: Option<i64>,
    ) -> Result<Vec<Edge>> {
        let pool = self.pool(tenant_id).await?;
        let rows = match edge_type_id {
            Some(t) => {
                sqlx::query(
                    "SELECT edge_type_id, from_node_id, to_node_id, props_json, created_at FROM edges \
                     WHERE tenant_id = ?1 AND to_node_id = ?2 AND edge_type_id = ?3",
                )
                .bind(tenant_id)
                .bind(node_id)
                .bind(t)
                .fetch_all(&pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT edge_type_id, from_node_id, to_node_id, props_json, created_at FROM edges \
                     WHERE tenant_id = ?1 AND to_node_id = ?2",
                )
                .bind(tenant_id)
                .bind(node_id)
                .fetch_all(&pool)
                .await?
            }
        };
        rows.into_iter().map(|r| row_to_edge(tenant_id, r)).collect()
    }

    /// `nodes` joined with `node_visibility` where the principal owns the
    /// node, appears in its visibility rows, or `tenant:*` is present.
    /// Built with `sea_query` rather than a raw string, grounded on
    /// angzarr's `SqliteEventStore` query-building style.
    pub async fn get_visible_nodes(
        &self,
        tenant_id: &str,
        principal: &str,
        type_id: Option<i64>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Node>> {
        let pool = self.pool(tenant_id).await?;

        let mut query = Query::select();
        query
            .column((Nodes::Table, Asterisk))
            .from(Nodes::Table)
            .left_join(
                NodeVisibility::Table,
                Expr::col((Nodes::Table, Nodes::TenantId))
                    .equals((NodeVisibility::Table, NodeVisibility::TenantId))
                    .and(
                        Expr::col((Nodes::Table, Nodes::NodeId))
                            .equals((NodeVisibility::Table, NodeVisibility::NodeId)),
                    ),
            )
            .and_where(Expr::col((Nodes::Table, Nodes::TenantId)).eq(tenant_id))
            .and_where(
                Cond::any()
                    .add(Expr::col((Nodes::Table, Nodes::OwnerActor)).eq(principal))
                    .add(Expr::col((NodeVisibility::Table, NodeVisibility::Principal)).eq(principal))
                    .add(Expr::col((NodeVisibility::Table, NodeVisibility::Principal)).eq("tenant:*")),
            )
            .order_by((Nodes::Table, Nodes::CreatedAt), Order::Desc)
            .limit(limit as u64)
            .offset(offset as u64);

        if let Some(t) = type_id {
            query.and_where(Expr::col((Nodes::Table, Nodes::TypeId)).eq(t));
        }

        let sql = query.distinct().to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&sql).fetch_all(&pool).await?;
        rows.into_iter().map(|r| row_to_node(tenant_id, r)).collect()
    }

    /// Online-safe, consistent point-in-time copy via SQLite's `VACUUM
    /// INTO`, the closest available substitute for the native backup API
    /// (see DESIGN.md for why).
    pub async fn backup_to(&self, tenant_id: &str, dest: &Path) -> Result<()> {
        let pool = self.pool(tenant_id).await?;
        sqlx::query(&format!("VACUUM INTO '{}'", dest.display())).execute(&pool).await?;
        Ok(())
    }

    pub async fn integrity_check(&self, tenant_id: &str) -> Result<bool> {
        let pool = self.pool(tenant_id).await?;
        let row = sqlx::query("PRAGMA integrity_check").fetch_one(&pool).await?;
        let result: String = row.try_get(0)?;
        Ok(result == "ok")
    }
}

fn row_to_node(tenant_id: &str, row: sqlx::sqlite::SqliteRow) -> Result<Node> {
    let payload_json: String = row.try_get("payload_json")?;
    let acl_blob: String = row.try_get("acl_blob")?;
    Ok(Node {
        tenant_id: tenant_id.to_string(),
        node_id: row.try_get("node_id")?,
        type_id: row.try_get("type_id")?,
        payload: serde_json::from_str(&payload_json)?,
        owner_actor: row.try_get("owner_actor")?,
        acl: serde_json::from_str(&acl_blob)?,
        created_at_ms: row.try_get("created_at")?,
        updated_at_ms: row.try_get("updated_at")?,
    })
}

fn row_to_edge(tenant_id: &str, row: sqlx::sqlite::SqliteRow) -> Result<Edge> {
    let props_json: String = row.try_get("props_json")?;
    Ok(Edge {
        tenant_id: tenant_id.to_string(),
        edge_type_id: row.try_get("edge_type_id")?,
        from_node_id: row.try_get("from_node_id")?,
        to_node_id: row.try_get("to_node_id")?,
        props: serde_json::from_str(&props_json)?,
        created_at_ms: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (CanonicalStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = CanonicalStore::new(CanonicalStoreConfig {
            data_dir: dir.path().to_path_buf(),
            busy_timeout_ms: 5000,
            cache_size_pages: -2000,
        });
        (store, dir)
    }

    #[tokio::test]
    async fn create_and_get_node_round_trips() {
        let (store, _dir) = test_store();
        let mut payload = serde_json::Map::new();
        payload.insert("email".into(), "a@x.com".into());
        let node = store
            .create_node("t1", 1, payload, "user:alice", None, vec![], 1000)
            .await
            .unwrap();
        let fetched = store.get_node("t1", &node.node_id).await.unwrap().unwrap();
        assert_eq!(fetched.owner_actor, "user:alice");
    }

    #[tokio::test]
    async fn visibility_soundness() {
        let (store, _dir) = test_store();
        let mut payload = serde_json::Map::new();
        payload.insert("subject".into(), "Hi".into());
        let acl = vec![AclEntry { principal: "user:bob".into(), permission: "read".into() }];
        let node = store
            .create_node("t1", 3, payload, "user:alice", None, acl, 1000)
            .await
            .unwrap();

        let visible_to_bob = store.get_visible_nodes("t1", "user:bob", None, 10, 0).await.unwrap();
        assert_eq!(visible_to_bob.len(), 1);
        assert_eq!(visible_to_bob[0].node_id, node.node_id);

        let visible_to_carol = store.get_visible_nodes("t1", "user:carol", None, 10, 0).await.unwrap();
        assert!(visible_to_carol.is_empty());
    }

    #[tokio::test]
    async fn delete_node_cascades_edges_and_visibility() {
        let (store, _dir) = test_store();
        let mut payload = serde_json::Map::new();
        payload.insert("title".into(), "T".into());
        let task = store.create_node("t1", 2, payload, "user:alice", None, vec![], 1000).await.unwrap();
        store
            .create_edge("t1", 100, &task.node_id, "user:alice", serde_json::Map::new(), 1000)
            .await
            .unwrap();

        let deleted = store.delete_node("t1", &task.node_id).await.unwrap();
        assert!(deleted);
        let edges = store.get_edges_from("t1", &task.node_id, None).await.unwrap();
        assert!(edges.is_empty());
    }

    #[tokio::test]
    async fn applied_events_ledger_dedup() {
        let (store, _dir) = test_store();
        let pos = StreamPos { topic: "entdb-wal".into(), partition: 0, offset: 5, timestamp_ms: 0 };
        assert!(!store.check_idempotency("t1", "k1").await.unwrap());
        store.record_applied_event("t1", "k1", &pos, 1000).await.unwrap();
        assert!(store.check_idempotency("t1", "k1").await.unwrap());
        assert_eq!(store.get_last_applied_position("t1").await.unwrap(), Some(5));
    }
}
