//! Raw DDL constants for the canonical and mailbox stores, grounded
//! verbatim on `canonical_store.py::_create_schema` and
//! `mailbox_store.py::_ensure_schema`, following angzarr's
//! `src/storage/schema.rs` convention of module-level `CREATE_*_TABLE`
//! string constants rather than a migration framework.

pub const CREATE_NODES_TABLE: &str = "
CREATE TABLE IF NOT EXISTS nodes (
    tenant_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    type_id INTEGER NOT NULL,
    payload_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    owner_actor TEXT NOT NULL,
    acl_blob TEXT NOT NULL,
    PRIMARY KEY (tenant_id, node_id)
)";

pub const CREATE_NODES_TYPE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_nodes_type ON nodes (tenant_id, type_id)";
pub const CREATE_NODES_OWNER_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_nodes_owner ON nodes (tenant_id, owner_actor)";
pub const CREATE_NODES_UPDATED_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_nodes_updated ON nodes (tenant_id, updated_at DESC)";

pub const CREATE_EDGES_TABLE: &str = "
CREATE TABLE IF NOT EXISTS edges (
    tenant_id TEXT NOT NULL,
    edge_type_id INTEGER NOT NULL,
    from_node_id TEXT NOT NULL,
    to_node_id TEXT NOT NULL,
    props_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (tenant_id, edge_type_id, from_node_id, to_node_id)
)";

pub const CREATE_EDGES_FROM_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_edges_from ON edges (tenant_id, from_node_id)";
pub const CREATE_EDGES_TO_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_edges_to ON edges (tenant_id, to_node_id)";
pub const CREATE_EDGES_TYPE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_edges_type ON edges (tenant_id, edge_type_id)";

pub const CREATE_NODE_VISIBILITY_TABLE: &str = "
CREATE TABLE IF NOT EXISTS node_visibility (
    tenant_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    principal TEXT NOT NULL,
    PRIMARY KEY (tenant_id, node_id, principal)
)";

pub const CREATE_VISIBILITY_PRINCIPAL_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_visibility_principal ON node_visibility (tenant_id, principal, node_id)";

pub const CREATE_APPLIED_EVENTS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS applied_events (
    tenant_id TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    stream_pos TEXT NOT NULL,
    applied_at INTEGER NOT NULL,
    UNIQUE (tenant_id, idempotency_key)
)";

pub const CREATE_APPLIED_EVENTS_KEY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_applied_events_key ON applied_events (tenant_id, idempotency_key)";

pub const CREATE_SCHEMA_VERSION_TABLE: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL,
    applied_at INTEGER NOT NULL
)";

pub const CANONICAL_DDL: &[&str] = &[
    CREATE_NODES_TABLE,
    CREATE_NODES_TYPE_INDEX,
    CREATE_NODES_OWNER_INDEX,
    CREATE_NODES_UPDATED_INDEX,
    CREATE_EDGES_TABLE,
    CREATE_EDGES_FROM_INDEX,
    CREATE_EDGES_TO_INDEX,
    CREATE_EDGES_TYPE_INDEX,
    CREATE_NODE_VISIBILITY_TABLE,
    CREATE_VISIBILITY_PRINCIPAL_INDEX,
    CREATE_APPLIED_EVENTS_TABLE,
    CREATE_APPLIED_EVENTS_KEY_INDEX,
    CREATE_SCHEMA_VERSION_TABLE,
];

pub const CREATE_MAILBOX_ITEMS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS mailbox_items (
    item_id TEXT PRIMARY KEY,
    ref_id TEXT NOT NULL,
    source_type_id INTEGER NOT NULL,
    source_node_id TEXT NOT NULL,
    thread_id TEXT,
    ts INTEGER NOT NULL,
    state_json TEXT NOT NULL,
    snippet TEXT NOT NULL,
    metadata_json TEXT NOT NULL
)";

pub const CREATE_MAILBOX_TS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_mailbox_ts ON mailbox_items (ts DESC)";
pub const CREATE_MAILBOX_THREAD_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_mailbox_thread ON mailbox_items (thread_id)";
pub const CREATE_MAILBOX_SOURCE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_mailbox_source ON mailbox_items (source_node_id)";
pub const CREATE_MAILBOX_TYPE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_mailbox_type ON mailbox_items (source_type_id)";

pub const CREATE_FTS_MAILBOX_TABLE: &str =
    "CREATE VIRTUAL TABLE IF NOT EXISTS fts_mailbox USING fts5(snippet, content='mailbox_items', content_rowid='rowid')";

pub const CREATE_MAILBOX_AI_TRIGGER: &str = "
CREATE TRIGGER IF NOT EXISTS mailbox_ai AFTER INSERT ON mailbox_items BEGIN
    INSERT INTO fts_mailbox(rowid, snippet) VALUES (new.rowid, new.snippet);
END";

pub const CREATE_MAILBOX_AD_TRIGGER: &str = "
CREATE TRIGGER IF NOT EXISTS mailbox_ad AFTER DELETE ON mailbox_items BEGIN
    INSERT INTO fts_mailbox(fts_mailbox, rowid, snippet) VALUES ('delete', old.rowid, old.snippet);
END";

pub const CREATE_MAILBOX_AU_TRIGGER: &str = "
CREATE TRIGGER IF NOT EXISTS mailbox_au AFTER UPDATE ON mailbox_items BEGIN
    INSERT INTO fts_mailbox(fts_mailbox, rowid, snippet) VALUES ('delete', old.rowid, old.snippet);
    INSERT INTO fts_mailbox(rowid, snippet) VALUES (new.rowid, new.snippet);
END";

pub const MAILBOX_DDL: &[&str] = &[
    CREATE_MAILBOX_ITEMS_TABLE,
    CREATE_MAILBOX_TS_INDEX,
    CREATE_MAILBOX_THREAD_INDEX,
    CREATE_MAILBOX_SOURCE_INDEX,
    CREATE_MAILBOX_TYPE_INDEX,
    CREATE_FTS_MAILBOX_TABLE,
    CREATE_MAILBOX_AI_TRIGGER,
    CREATE_MAILBOX_AD_TRIGGER,
    CREATE_MAILBOX_AU_TRIGGER,
];
