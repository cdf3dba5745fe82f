//! Schema registry: holds node/edge type definitions, computes a
//! fingerprint at freeze time, and validates cross-references.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use crate::error::{EntDbError, Result};
use crate::model::{EdgeType, FieldKind, NodeType};

#[derive(Default)]
struct RegistryInner {
    node_types: HashMap<i64, NodeType>,
    node_names: HashMap<String, i64>,
    edge_types: HashMap<i64, EdgeType>,
    edge_names: HashMap<String, i64>,
}

/// Process-local (not global) schema registry. Registration is serialized
/// behind a `RwLock`; after `freeze()` the fingerprint is cached in a
/// `OnceLock` so reads never take the lock again.
pub struct Registry {
    inner: RwLock<RegistryInner>,
    frozen: RwLock<bool>,
    fingerprint: OnceLock<String>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            frozen: RwLock::new(false),
            fingerprint: OnceLock::new(),
        }
    }

    pub fn is_frozen(&self) -> bool {
        *self.frozen.read().unwrap()
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.get().map(|s| s.as_str())
    }

    pub fn register_node_type(&self, t: NodeType) -> Result<()> {
        if self.is_frozen() {
            return Err(EntDbError::Internal("registry is frozen".into()));
        }
        let mut inner = self.inner.write().unwrap();
        if inner.node_types.contains_key(&t.type_id) || inner.node_names.contains_key(&t.name) {
            return Err(EntDbError::InvalidArgument(format!(
                "duplicate node type registration: {} ({})",
                t.name, t.type_id
            )));
        }
        inner.node_names.insert(t.name.clone(), t.type_id);
        inner.node_types.insert(t.type_id, t);
        Ok(())
    }

    pub fn register_edge_type(&self, t: EdgeType) -> Result<()> {
        if self.is_frozen() {
            return Err(EntDbError::Internal("registry is frozen".into()));
        }
        let mut inner = self.inner.write().unwrap();
        if inner.edge_types.contains_key(&t.edge_id) || inner.edge_names.contains_key(&t.name) {
            return Err(EntDbError::InvalidArgument(format!(
                "duplicate edge type registration: {} ({})",
                t.name, t.edge_id
            )));
        }
        inner.edge_names.insert(t.name.clone(), t.edge_id);
        inner.edge_types.insert(t.edge_id, t);
        Ok(())
    }

    pub fn get_node_type(&self, id: i64) -> Option<NodeType> {
        self.inner.read().unwrap().node_types.get(&id).cloned()
    }

    pub fn get_node_type_by_name(&self, name: &str) -> Option<NodeType> {
        let inner = self.inner.read().unwrap();
        inner.node_names.get(name).and_then(|id| inner.node_types.get(id)).cloned()
    }

    pub fn get_edge_type(&self, id: i64) -> Option<EdgeType> {
        self.inner.read().unwrap().edge_types.get(&id).cloned()
    }

    pub fn node_types(&self) -> Vec<NodeType> {
        let mut v: Vec<_> = self.inner.read().unwrap().node_types.values().cloned().collect();
        v.sort_by_key(|t| t.type_id);
        v
    }

    pub fn edge_types(&self) -> Vec<EdgeType> {
        let mut v: Vec<_> = self.inner.read().unwrap().edge_types.values().cloned().collect();
        v.sort_by_key(|t| t.edge_id);
        v
    }

    /// JSON representation of the registry: node types sorted by type_id,
    /// edge types sorted by edge_id. Object key order otherwise follows
    /// struct declaration order; use [`Registry::canonical_json`] where an
    /// order-independent representation is required (the fingerprint,
    /// `entdb-schema snapshot`'s output).
    pub fn to_canonical_json(&self) -> serde_json::Value {
        serde_json::json!({
            "node_types": self.node_types(),
            "edge_types": self.edge_types(),
        })
    }

    /// `to_canonical_json` with every object's keys recursively sorted
    /// alphabetically, matching `registry.py`'s
    /// `json.dumps(schema_dict, sort_keys=True, separators=(',', ':'))`.
    /// Two schemas that differ only in field declaration order serialize
    /// identically through this path, which `to_canonical_json` alone does
    /// not guarantee.
    pub fn canonical_json(&self) -> serde_json::Value {
        sort_json_keys(self.to_canonical_json())
    }

    /// Builds an unfrozen registry from the `{"node_types": [...],
    /// "edge_types": [...]}` shape `to_canonical_json` produces. Used by
    /// `entdb-schema` to load a baseline schema file for `check`/`diff`.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        #[derive(serde::Deserialize)]
        struct Shape {
            #[serde(default)]
            node_types: Vec<NodeType>,
            #[serde(default)]
            edge_types: Vec<EdgeType>,
        }
        let shape: Shape = serde_json::from_value(value.clone())
            .map_err(|e| EntDbError::InvalidArgument(format!("invalid schema json: {e}")))?;

        let registry = Self::new();
        for nt in shape.node_types {
            registry.register_node_type(nt)?;
        }
        for et in shape.edge_types {
            registry.register_edge_type(et)?;
        }
        Ok(registry)
    }

    /// Latches the registry and computes its fingerprint. Calling this
    /// twice is an error — freeze is not idempotent.
    pub fn freeze(&self) -> Result<String> {
        let mut frozen = self.frozen.write().unwrap();
        if *frozen {
            return Err(EntDbError::Internal("registry already frozen".into()));
        }
        let canonical = serde_json::to_string(&self.canonical_json())?;
        let digest = Sha256::digest(canonical.as_bytes());
        let fingerprint = format!("sha256:{}", hex::encode(digest));
        let _ = self.fingerprint.set(fingerprint.clone());
        *frozen = true;
        Ok(fingerprint)
    }

    /// Cross-reference validation: edge from/to type ids and ref-kind
    /// field ref_type_ids must name a registered node type. Returns a list
    /// of human-readable error strings rather than failing fast, so a
    /// caller can report every problem at once.
    pub fn validate_all(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        let mut errors = Vec::new();
        for edge in inner.edge_types.values() {
            if !inner.node_types.contains_key(&edge.from_type_id) {
                errors.push(format!(
                    "EdgeType:{} references unregistered from_type_id {}",
                    edge.name, edge.from_type_id
                ));
            }
            if !inner.node_types.contains_key(&edge.to_type_id) {
                errors.push(format!(
                    "EdgeType:{} references unregistered to_type_id {}",
                    edge.name, edge.to_type_id
                ));
            }
        }
        for node in inner.node_types.values() {
            for field in &node.fields {
                if field.kind == FieldKind::Ref {
                    match field.ref_type_id {
                        Some(rt) if inner.node_types.contains_key(&rt) => {}
                        Some(rt) => errors.push(format!(
                            "NodeType:{}.field:{} references unregistered ref_type_id {}",
                            node.name, field.name, rt
                        )),
                        None => errors.push(format!(
                            "NodeType:{}.field:{} is kind=ref but has no ref_type_id",
                            node.name, field.name
                        )),
                    }
                }
            }
        }
        errors
    }
}

/// Recursively rebuilds a JSON value with every object's keys inserted in
/// sorted order. `serde_json::Map` iterates in insertion order (this crate
/// builds with the `preserve_order` feature), so inserting already-sorted
/// keys is sufficient to make both iteration and serialization sorted.
fn sort_json_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), sort_json_keys(map[key].clone()));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sort_json_keys).collect())
        }
        other => other,
    }
}

/// Process-wide singleton, by convention only (per the design note on
/// global mutable state): components are expected to take an explicit
/// `Arc<Registry>` rather than reach for this; it exists for small CLIs
/// and examples where threading an instance through is not worth it.
static GLOBAL: OnceLock<Registry> = OnceLock::new();

pub fn global() -> &'static Registry {
    GLOBAL.get_or_init(Registry::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldDef;

    fn node_type(type_id: i64, name: &str) -> NodeType {
        NodeType {
            type_id,
            name: name.to_string(),
            fields: vec![FieldDef {
                field_id: 1,
                name: "email".to_string(),
                kind: FieldKind::Str,
                required: true,
                default: None,
                enum_values: vec![],
                ref_type_id: None,
                indexed: false,
                searchable: false,
                deprecated: false,
                description: String::new(),
            }],
            deprecated: false,
            description: String::new(),
            default_acl: vec![],
        }
    }

    #[test]
    fn freeze_is_not_idempotent() {
        let r = Registry::new();
        r.register_node_type(node_type(1, "User")).unwrap();
        r.freeze().unwrap();
        assert!(r.freeze().is_err());
    }

    #[test]
    fn registration_after_freeze_fails() {
        let r = Registry::new();
        r.freeze().unwrap();
        assert!(r.register_node_type(node_type(1, "User")).is_err());
    }

    #[test]
    fn duplicate_type_id_rejected() {
        let r = Registry::new();
        r.register_node_type(node_type(1, "User")).unwrap();
        assert!(r.register_node_type(node_type(1, "Other")).is_err());
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = Registry::new();
        a.register_node_type(node_type(1, "User")).unwrap();
        let fa = a.freeze().unwrap();

        let b = Registry::new();
        b.register_node_type(node_type(1, "User")).unwrap();
        let fb = b.freeze().unwrap();

        assert_eq!(fa, fb);
        assert!(fa.starts_with("sha256:"));
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let r = Registry::new();
        r.register_node_type(node_type(1, "User")).unwrap();
        let canonical = r.canonical_json();
        let rendered = serde_json::to_string(&canonical).unwrap();

        // "edge_types" sorts before "node_types"; within a field object,
        // "default" sorts before "deprecated", before "description", etc.
        let edge_types_pos = rendered.find("\"edge_types\"").unwrap();
        let node_types_pos = rendered.find("\"node_types\"").unwrap();
        assert!(edge_types_pos < node_types_pos);

        let default_pos = rendered.find("\"default\"").unwrap();
        let kind_pos = rendered.find("\"kind\"").unwrap();
        assert!(default_pos < kind_pos);
        assert!(!rendered.contains(' '), "canonical JSON must have no whitespace");
    }

    #[test]
    fn validate_all_flags_unregistered_ref_type() {
        let r = Registry::new();
        let mut nt = node_type(1, "User");
        nt.fields[0].kind = FieldKind::Ref;
        nt.fields[0].ref_type_id = Some(99);
        r.register_node_type(nt).unwrap();
        let errors = r.validate_all();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("ref_type_id 99"));
    }
}
