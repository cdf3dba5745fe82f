//! Applier: consumes the log and materializes transaction events into the
//! canonical store, with idempotent dedup and mailbox fanout. Grounded on
//! `dbaas/entdb_server/apply/applier.py`'s `Applier._process_record`/
//! `apply_event`, restructured as a free function (`apply_single_event`) so
//! the restore tool can reuse the exact same operation semantics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::model::{ApplyResult, NodeRef, Operation, TransactionEvent};
use crate::store::CanonicalStore;
use crate::store::mailbox::MailboxStore;
use crate::stream::{LogStream, StreamRecord};

/// Field-name priority list used to build a mailbox snippet from a created
/// node's payload, in the original's declared order.
pub const FANOUT_SNIPPET_FIELDS: &[&str] =
    &["title", "name", "subject", "content", "body", "text", "description"];

#[derive(Debug, Clone, Default)]
pub struct ApplierStats {
    pub running: bool,
    pub processed_count: u64,
    pub error_count: u64,
    pub last_position: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApplierConfig {
    pub topic: String,
    pub consumer_group: String,
    pub batch_size: usize,
    pub commit_interval_ms: u64,
    pub retry_delay_ms: u64,
    pub max_retries: u32,
    /// If set, every applied event's `schema_fingerprint` (when present)
    /// must match this value or the event is rejected.
    pub pinned_fingerprint: Option<String>,
    /// Node type ids for which every created node fans out to mailbox
    /// items regardless of an explicit `fanout_to`.
    pub fanout_node_types: Vec<i64>,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            topic: "entdb-wal".to_string(),
            consumer_group: "entdb-applier".to_string(),
            batch_size: 100,
            commit_interval_ms: 1000,
            retry_delay_ms: 100,
            max_retries: 3,
            pinned_fingerprint: None,
            fanout_node_types: Vec::new(),
        }
    }
}

pub struct Applier {
    log: Arc<dyn LogStream>,
    store: Arc<CanonicalStore>,
    mailbox: Arc<MailboxStore>,
    config: ApplierConfig,
    running: AtomicBool,
    processed_count: AtomicU64,
    error_count: AtomicU64,
    last_offset: AtomicI64,
}

impl Applier {
    pub fn new(
        log: Arc<dyn LogStream>,
        store: Arc<CanonicalStore>,
        mailbox: Arc<MailboxStore>,
        config: ApplierConfig,
    ) -> Self {
        Self {
            log,
            store,
            mailbox,
            config,
            running: AtomicBool::new(false),
            processed_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_offset: AtomicI64::new(-1),
        }
    }

    pub fn stats(&self) -> ApplierStats {
        let offset = self.last_offset.load(Ordering::Relaxed);
        ApplierStats {
            running: self.running.load(Ordering::Relaxed),
            processed_count: self.processed_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_position: if offset < 0 { None } else { Some(offset.to_string()) },
        }
    }

    /// Drives the subscribe loop: `commit`s after every record regardless
    /// of success, matching the "still acked" failure model. Only stream
    /// I/O errors propagate and terminate the loop.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        use futures::StreamExt;

        self.running.store(true, Ordering::Relaxed);
        let mut stream = self
            .log
            .clone()
            .subscribe(&self.config.topic, &self.config.consumer_group, None)
            .await?;

        while let Some(record) = stream.next().await {
            let result = self.apply_event(&record).await;
            match &result {
                r if r.success => {
                    self.processed_count.fetch_add(1, Ordering::Relaxed);
                }
                _ => {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        tenant_id = %result.tenant_id,
                        idempotency_key = %result.idempotency_key,
                        error = ?result.error,
                        "apply_event failed"
                    );
                }
            }
            self.last_offset.store(record.position.offset, Ordering::Relaxed);
            self.log.commit(&self.config.consumer_group, &record).await?;
        }

        self.running.store(false, Ordering::Relaxed);
        Ok(())
    }

    pub async fn apply_event(&self, record: &StreamRecord) -> ApplyResult {
        let value: Value = match record.value_json() {
            Ok(v) => v,
            Err(e) => {
                return ApplyResult::failure("unknown", record.key.clone(), format!("malformed json: {e}"));
            }
        };
        let event = match TransactionEvent::from_value(value) {
            Ok(e) => e,
            Err(e) => return ApplyResult::failure("unknown", record.key.clone(), e.to_string()),
        };

        if let Err(e) = self.store.initialize_tenant(&event.tenant_id).await {
            return ApplyResult::failure(&event.tenant_id, &event.idempotency_key, e.to_string());
        }

        match self.store.check_idempotency(&event.tenant_id, &event.idempotency_key).await {
            Ok(true) => return ApplyResult::skipped(&event.tenant_id, &event.idempotency_key),
            Ok(false) => {}
            Err(e) => return ApplyResult::failure(&event.tenant_id, &event.idempotency_key, e.to_string()),
        }

        if let (Some(pinned), Some(actual)) = (&self.config.pinned_fingerprint, &event.schema_fingerprint) {
            if pinned != actual {
                return ApplyResult::failure(
                    &event.tenant_id,
                    &event.idempotency_key,
                    format!("schema fingerprint mismatch: pinned={pinned} event={actual}"),
                );
            }
        }

        match apply_single_event(&self.store, &self.mailbox, &event, &self.config.fanout_node_types).await {
            Ok((created_nodes, created_edges)) => {
                let mut result = ApplyResult::skipped(&event.tenant_id, &event.idempotency_key);
                result.skipped = false;
                result.created_nodes = created_nodes;
                result.created_edges = created_edges;
                result
            }
            Err(e) => {
                error!(tenant_id = %event.tenant_id, idempotency_key = %event.idempotency_key, error = %e, "event application failed, rolled back");
                ApplyResult::failure(&event.tenant_id, &event.idempotency_key, e.to_string())
            }
        }
    }
}

/// Applies every op of a transaction event against `store`, recording the
/// applied-events row as the final step. Shared by `Applier::apply_event`
/// and the restore tool's replay loop so both carry identical alias /
/// fanout / visibility semantics.
pub async fn apply_single_event(
    store: &CanonicalStore,
    mailbox: &MailboxStore,
    event: &TransactionEvent,
    fanout_node_types: &[i64],
) -> Result<(Vec<String>, usize)> {
    let mut aliases: HashMap<String, String> = HashMap::new();
    let mut created_nodes = Vec::new();
    let mut created_edges = 0usize;

    for op in &event.ops {
        match op {
            Operation::CreateNode { type_id, node_id, payload, acl, alias, fanout_to } => {
                let node = store
                    .create_node(
                        &event.tenant_id,
                        *type_id,
                        payload.clone(),
                        &event.actor,
                        node_id.clone(),
                        acl.clone(),
                        event.ts_ms,
                    )
                    .await?;
                if let Some(alias) = alias {
                    aliases.insert(alias.clone(), node.node_id.clone());
                }
                created_nodes.push(node.node_id.clone());

                let fans_out = fanout_node_types.contains(type_id) || !fanout_to.is_empty();
                if fans_out {
                    fanout_mailbox(mailbox, &event.tenant_id, &node, fanout_to, event.ts_ms).await?;
                }
            }
            Operation::UpdateNode { node_ref, patch, .. } => {
                let node_id = resolve_ref(node_ref, &aliases)?;
                store.update_node(&event.tenant_id, &node_id, patch.clone(), event.ts_ms).await?;
            }
            Operation::DeleteNode { node_ref, .. } => {
                let node_id = resolve_ref(node_ref, &aliases)?;
                store.delete_node(&event.tenant_id, &node_id).await?;
            }
            Operation::CreateEdge { edge_id, from_ref, to_ref, props } => {
                let from_id = resolve_ref(from_ref, &aliases)?;
                let to_id = resolve_ref(to_ref, &aliases)?;
                store
                    .create_edge(&event.tenant_id, *edge_id, &from_id, &to_id, props.clone(), event.ts_ms)
                    .await?;
                created_edges += 1;
            }
            Operation::DeleteEdge { edge_id, from_ref, to_ref } => {
                let from_id = resolve_ref(from_ref, &aliases)?;
                let to_id = resolve_ref(to_ref, &aliases)?;
                store.delete_edge(&event.tenant_id, *edge_id, &from_id, &to_id).await?;
            }
        }
    }

    let pos = crate::stream::StreamPos {
        topic: "entdb-wal".to_string(),
        partition: 0,
        offset: event.ts_ms,
        timestamp_ms: event.ts_ms,
    };
    store
        .record_applied_event(&event.tenant_id, &event.idempotency_key, &pos, event.ts_ms)
        .await?;

    Ok((created_nodes, created_edges))
}

/// Resolves a `NodeRef` against the in-transaction alias map. Thin wrapper
/// over `NodeRef::resolve` kept at this layer so call sites read the same
/// as the Python `_resolve_ref`.
pub fn resolve_ref(node_ref: &NodeRef, aliases: &HashMap<String, String>) -> Result<String> {
    let as_btree: std::collections::BTreeMap<String, String> =
        aliases.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    node_ref.resolve(&as_btree)
}

async fn fanout_mailbox(
    mailbox: &MailboxStore,
    tenant_id: &str,
    node: &crate::model::Node,
    explicit_recipients: &[String],
    ts_ms: i64,
) -> Result<()> {
    let mut recipients: Vec<String> = explicit_recipients.to_vec();
    for entry in &node.acl {
        if entry.principal.starts_with("user:") && !recipients.contains(&entry.principal) {
            recipients.push(entry.principal.clone());
        }
    }
    if recipients.is_empty() {
        return Ok(());
    }

    let snippet = generate_snippet(&node.payload);
    for recipient in &recipients {
        mailbox
            .add_item(
                tenant_id,
                recipient,
                node.type_id,
                &node.node_id,
                &snippet,
                None,
                None,
                serde_json::Map::new(),
                ts_ms,
            )
            .await?;
    }
    info!(node_id = %node.node_id, recipients = recipients.len(), "mailbox fanout complete");
    Ok(())
}

/// Joins the payload values of the first present fanout field names,
/// truncated to 1000 characters on a UTF-8 char boundary.
pub fn generate_snippet(payload: &serde_json::Map<String, Value>) -> String {
    let mut parts = Vec::new();
    for name in FANOUT_SNIPPET_FIELDS {
        if let Some(Value::String(s)) = payload.get(*name) {
            parts.push(s.clone());
        }
    }
    let joined = parts.join(" ");
    if joined.chars().count() > 1000 {
        joined.chars().take(1000).collect()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn generate_snippet_prefers_title_over_body() {
        let mut payload = serde_json::Map::new();
        payload.insert("title".into(), json!("Hello"));
        payload.insert("body".into(), json!("World"));
        assert_eq!(generate_snippet(&payload), "Hello");
    }

    #[test]
    fn generate_snippet_truncates_at_1000_chars() {
        let mut payload = serde_json::Map::new();
        payload.insert("content".into(), json!("x".repeat(2000)));
        let snippet = generate_snippet(&payload);
        assert_eq!(snippet.chars().count(), 1000);
    }

    #[test]
    fn resolve_ref_handles_alias_with_trailing_id_segment() {
        let mut aliases = HashMap::new();
        aliases.insert("t".to_string(), "node-1".to_string());
        let r = NodeRef::Id("$t.id".to_string());
        assert_eq!(resolve_ref(&r, &aliases).unwrap(), "node-1");
    }

    #[tokio::test]
    async fn apply_single_event_creates_node_and_records_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let store = CanonicalStore::new(crate::store::CanonicalStoreConfig {
            data_dir: dir.path().to_path_buf(),
            busy_timeout_ms: 5000,
            cache_size_pages: -2000,
        });
        let mailbox = MailboxStore::new(crate::store::MailboxStoreConfig {
            data_dir: dir.path().join("mailboxes"),
            busy_timeout_ms: 5000,
        });

        let mut payload = serde_json::Map::new();
        payload.insert("title".into(), json!("hi"));
        let event = TransactionEvent {
            tenant_id: "t1".to_string(),
            actor: "user:alice".to_string(),
            idempotency_key: "k1".to_string(),
            schema_fingerprint: None,
            ts_ms: 1000,
            ops: vec![Operation::CreateNode {
                type_id: 1,
                node_id: None,
                payload,
                acl: vec![],
                alias: Some("n".to_string()),
                fanout_to: vec![],
            }],
        };

        let (created, edges) = apply_single_event(&store, &mailbox, &event, &[]).await.unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(edges, 0);
        assert!(store.check_idempotency("t1", "k1").await.unwrap());
        let _ = BTreeMap::<String, String>::new();
    }
}
