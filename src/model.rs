//! Core data model: nodes, edges, schema definitions, and the
//! transaction-event wire shape consumed by the applier and restore tool.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{EntDbError, Result};

/// A single ACL entry: a principal (e.g. `user:alice`, `tenant:*`) and the
/// permission it is granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub principal: String,
    pub permission: String,
}

/// Field value kinds a `FieldDef` may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Str,
    Int,
    Float,
    Bool,
    Timestamp,
    Json,
    Bytes,
    Enum,
    Ref,
    ListStr,
    ListInt,
    ListRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub field_id: u16,
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    /// Ordered values, present only for `kind == Enum`.
    #[serde(default)]
    pub enum_values: Vec<String>,
    /// Referenced node type, present only for `kind == Ref`.
    #[serde(default)]
    pub ref_type_id: Option<i64>,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default)]
    pub searchable: bool,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeType {
    pub type_id: i64,
    pub name: String,
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default_acl: Vec<AclEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeType {
    pub edge_id: i64,
    pub name: String,
    pub from_type_id: i64,
    pub to_type_id: i64,
    #[serde(default)]
    pub props: Vec<FieldDef>,
    #[serde(default)]
    pub unique_per_from: bool,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub description: String,
}

/// A materialized node row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub tenant_id: String,
    pub node_id: String,
    pub type_id: i64,
    pub payload: Map<String, Value>,
    pub owner_actor: String,
    pub acl: Vec<AclEntry>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// A materialized edge row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub tenant_id: String,
    pub edge_type_id: i64,
    pub from_node_id: String,
    pub to_node_id: String,
    pub props: Map<String, Value>,
    pub created_at_ms: i64,
}

/// One of the ways an operation may reference a node: a dict ref
/// (`{"ref": "$alias.id"}`), an opaque id or bare alias string (`$alias` or
/// `$alias.id`), or a typed reference carrying its own type_id. `RefDict`
/// is tried first since it is the only variant that matches a JSON object
/// carrying a `ref` key; `Typed` is tried before `Id` since it is the only
/// variant that matches a JSON object carrying `type_id`/`id` keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeRef {
    RefDict {
        #[serde(rename = "ref")]
        r#ref: String,
    },
    Typed {
        type_id: i64,
        id: String,
    },
    Id(String),
}

impl NodeRef {
    /// True if this ref is an alias reference (`$...`) rather than a
    /// resolved opaque id.
    pub fn is_alias(&self) -> bool {
        match self {
            NodeRef::Id(s) => s.starts_with('$'),
            NodeRef::RefDict { r#ref } => r#ref.starts_with('$'),
            NodeRef::Typed { .. } => false,
        }
    }

    /// Resolve this ref to a concrete node_id, looking up aliases created
    /// earlier in the same transaction event. The leading `$` is stripped;
    /// the first dot-separated segment is the alias key; a trailing `.id`
    /// segment is accepted and ignored (an ergonomic hint only, per the
    /// transaction-event alias grammar). The dict-ref form (`{"ref": ...}`)
    /// resolves identically to a bare alias string.
    pub fn resolve(&self, aliases: &BTreeMap<String, String>) -> Result<String> {
        match self {
            NodeRef::Typed { id, .. } => Ok(id.clone()),
            NodeRef::Id(raw) => resolve_raw_ref(raw, aliases),
            NodeRef::RefDict { r#ref } => resolve_raw_ref(r#ref, aliases),
        }
    }
}

fn resolve_raw_ref(raw: &str, aliases: &BTreeMap<String, String>) -> Result<String> {
    if let Some(stripped) = raw.strip_prefix('$') {
        let alias_key = stripped.split('.').next().unwrap_or(stripped);
        aliases
            .get(alias_key)
            .cloned()
            .ok_or_else(|| EntDbError::InvalidArgument(format!("unresolved alias: {raw}")))
    } else {
        Ok(raw.to_string())
    }
}

/// Operations a `TransactionEvent` may carry, dispatched by tag in the
/// applier and the restore tool's replay loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    CreateNode {
        type_id: i64,
        #[serde(default)]
        node_id: Option<String>,
        payload: Map<String, Value>,
        #[serde(default)]
        acl: Vec<AclEntry>,
        #[serde(default)]
        alias: Option<String>,
        #[serde(default)]
        fanout_to: Vec<String>,
    },
    UpdateNode {
        type_id: i64,
        node_ref: NodeRef,
        patch: Map<String, Value>,
    },
    DeleteNode {
        type_id: i64,
        node_ref: NodeRef,
    },
    CreateEdge {
        edge_id: i64,
        from_ref: NodeRef,
        to_ref: NodeRef,
        #[serde(default)]
        props: Map<String, Value>,
    },
    DeleteEdge {
        edge_id: i64,
        from_ref: NodeRef,
        to_ref: NodeRef,
    },
}

/// The atomic unit of work written to the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub tenant_id: String,
    pub actor: String,
    pub idempotency_key: String,
    #[serde(default)]
    pub schema_fingerprint: Option<String>,
    pub ts_ms: i64,
    pub ops: Vec<Operation>,
}

impl TransactionEvent {
    /// Parse from a raw JSON value, validating the minimal required fields.
    /// Mirrors the tolerant `TransactionEvent.from_dict` validation in the
    /// original applier: missing required fields are reported as an error
    /// rather than panicking, so a malformed record can be turned into a
    /// failed `ApplyResult` instead of crashing the applier loop.
    pub fn from_value(value: Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| {
            EntDbError::InvalidArgument("transaction event is not a JSON object".into())
        })?;
        for field in ["tenant_id", "actor", "idempotency_key"] {
            if !obj.contains_key(field) {
                return Err(EntDbError::InvalidArgument(format!(
                    "transaction event missing required field: {field}"
                )));
            }
        }
        serde_json::from_value(Value::Object(obj.clone()))
            .map_err(|e| EntDbError::InvalidArgument(format!("malformed transaction event: {e}")))
    }
}

/// Result of applying one `TransactionEvent`.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
    pub success: bool,
    pub skipped: bool,
    pub tenant_id: String,
    pub idempotency_key: String,
    pub created_nodes: Vec<String>,
    pub created_edges: usize,
    pub error: Option<String>,
}

impl ApplyResult {
    pub fn skipped(tenant_id: impl Into<String>, idempotency_key: impl Into<String>) -> Self {
        Self {
            success: true,
            skipped: true,
            tenant_id: tenant_id.into(),
            idempotency_key: idempotency_key.into(),
            created_nodes: Vec::new(),
            created_edges: 0,
            error: None,
        }
    }

    pub fn failure(
        tenant_id: impl Into<String>,
        idempotency_key: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            skipped: false,
            tenant_id: tenant_id.into(),
            idempotency_key: idempotency_key.into(),
            created_nodes: Vec::new(),
            created_edges: 0,
            error: Some(error.into()),
        }
    }
}

/// Sanitize a tenant or user id for use as part of a filesystem path:
/// alphanumerics and `-_` pass through unchanged, everything else (notably
/// the `:` in `user:id`) is rewritten to `_`.
pub fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_alias_strips_dollar_and_id_suffix() {
        let mut aliases = BTreeMap::new();
        aliases.insert("t".to_string(), "node-123".to_string());
        let r = NodeRef::Id("$t.id".to_string());
        assert_eq!(r.resolve(&aliases).unwrap(), "node-123");
    }

    #[test]
    fn resolve_opaque_id_passes_through() {
        let aliases = BTreeMap::new();
        let r = NodeRef::Id("node-456".to_string());
        assert_eq!(r.resolve(&aliases).unwrap(), "node-456");
    }

    #[test]
    fn resolve_unknown_alias_is_invalid_argument() {
        let aliases = BTreeMap::new();
        let r = NodeRef::Id("$missing".to_string());
        assert!(matches!(r.resolve(&aliases), Err(EntDbError::InvalidArgument(_))));
    }

    #[test]
    fn sanitize_id_rewrites_colon() {
        assert_eq!(sanitize_id("user:alice"), "user_alice");
        assert_eq!(sanitize_id("t1"), "t1");
    }

    #[test]
    fn transaction_event_from_value_requires_fields() {
        let v = serde_json::json!({"actor": "user:alice"});
        assert!(TransactionEvent::from_value(v).is_err());
    }
}
