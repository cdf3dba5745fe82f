//! Compatibility checker: diffs two frozen registries and classifies each
//! change as breaking or non-breaking per the protobuf-like evolution
//! rules in the data model.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::model::{EdgeType, FieldDef, NodeType};
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    NodeTypeAdded,
    EdgeTypeAdded,
    FieldAdded,
    PropAdded,
    TypeDeprecated,
    FieldDeprecated,
    DescriptionChanged,
    NameChanged,
    EnumValueAdded,
    IndexAdded,
    SearchableAdded,

    NodeTypeRemoved,
    EdgeTypeRemoved,
    FieldRemoved,
    PropRemoved,
    FieldKindChanged,
    TypeIdReused,
    EdgeIdReused,
    FieldIdReused,
    EnumValueRemoved,
    EnumValueReordered,
    FromTypeChanged,
    ToTypeChanged,
    RequiredAdded,
}

impl ChangeKind {
    pub fn is_breaking(&self) -> bool {
        use ChangeKind::*;
        matches!(
            self,
            NodeTypeRemoved
                | EdgeTypeRemoved
                | FieldRemoved
                | PropRemoved
                | FieldKindChanged
                | TypeIdReused
                | EdgeIdReused
                | FieldIdReused
                | EnumValueRemoved
                | EnumValueReordered
                | FromTypeChanged
                | ToTypeChanged
                | RequiredAdded
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaChange {
    pub kind: ChangeKind,
    pub path: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub message: String,
}

impl SchemaChange {
    fn new(
        kind: ChangeKind,
        path: impl Into<String>,
        old_value: Option<Value>,
        new_value: Option<Value>,
        message: impl Into<String>,
    ) -> Self {
        Self { kind, path, old_value: old_value, new_value, message: message.into() }
    }

    pub fn is_breaking(&self) -> bool {
        self.kind.is_breaking()
    }
}

impl std::fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = if self.is_breaking() { "BREAKING" } else { "OK" };
        write!(f, "[{}] {:?}: {} - {}", tag, self.kind, self.path, self.message)
    }
}

/// Diff two frozen registries. Registries need not be frozen to be
/// compared, but the CLI only ever calls this after `freeze()` on both.
pub fn check_compatibility(old: &Registry, new: &Registry) -> Vec<SchemaChange> {
    let mut changes = Vec::new();
    check_node_types(old, new, &mut changes);
    check_edge_types(old, new, &mut changes);
    changes
}

fn check_node_types(old: &Registry, new: &Registry, out: &mut Vec<SchemaChange>) {
    let old_by_id: HashMap<i64, NodeType> =
        old.node_types().into_iter().map(|t| (t.type_id, t)).collect();
    let new_by_id: HashMap<i64, NodeType> =
        new.node_types().into_iter().map(|t| (t.type_id, t)).collect();

    for (id, new_t) in &new_by_id {
        if !old_by_id.contains_key(id) {
            out.push(SchemaChange::new(
                ChangeKind::NodeTypeAdded,
                format!("NodeType:{}", new_t.name),
                None,
                Some(serde_json::to_value(new_t).unwrap()),
                "node type added",
            ));
        }
    }
    for (id, old_t) in &old_by_id {
        match new_by_id.get(id) {
            None => out.push(SchemaChange::new(
                ChangeKind::NodeTypeRemoved,
                format!("NodeType:{}", old_t.name),
                Some(serde_json::to_value(old_t).unwrap()),
                None,
                "node type removed",
            )),
            Some(new_t) => check_node_type_diff(old_t, new_t, out),
        }
    }
}

fn check_node_type_diff(old_t: &NodeType, new_t: &NodeType, out: &mut Vec<SchemaChange>) {
    let path = format!("NodeType:{}", old_t.name);
    if old_t.name != new_t.name {
        out.push(SchemaChange::new(
            ChangeKind::NameChanged,
            path.clone(),
            Some(old_t.name.clone().into()),
            Some(new_t.name.clone().into()),
            "name changed",
        ));
    }
    // A type_id deprecated under one name and reoccupied by a different
    // name is treated as id reuse rather than a rename, even though the
    // name-changed check above already fired for the same pair.
    if old_t.deprecated && old_t.name.to_lowercase() != new_t.name.to_lowercase() {
        out.push(SchemaChange::new(
            ChangeKind::TypeIdReused,
            format!("NodeType:{}", new_t.name),
            Some(old_t.name.clone().into()),
            Some(new_t.name.clone().into()),
            format!(
                "type_id {} was deprecated as '{}' but reused for '{}'",
                new_t.type_id, old_t.name, new_t.name
            ),
        ));
    }
    if !old_t.deprecated && new_t.deprecated {
        out.push(SchemaChange::new(
            ChangeKind::TypeDeprecated,
            path.clone(),
            Some(false.into()),
            Some(true.into()),
            "type deprecated",
        ));
    }
    if old_t.description != new_t.description {
        out.push(SchemaChange::new(
            ChangeKind::DescriptionChanged,
            path.clone(),
            Some(old_t.description.clone().into()),
            Some(new_t.description.clone().into()),
            "description changed",
        ));
    }
    check_fields(&path, &old_t.fields, &new_t.fields, out);
}

fn check_edge_types(old: &Registry, new: &Registry, out: &mut Vec<SchemaChange>) {
    let old_by_id: HashMap<i64, EdgeType> =
        old.edge_types().into_iter().map(|t| (t.edge_id, t)).collect();
    let new_by_id: HashMap<i64, EdgeType> =
        new.edge_types().into_iter().map(|t| (t.edge_id, t)).collect();

    for (id, new_t) in &new_by_id {
        if !old_by_id.contains_key(id) {
            out.push(SchemaChange::new(
                ChangeKind::EdgeTypeAdded,
                format!("EdgeType:{}", new_t.name),
                None,
                Some(serde_json::to_value(new_t).unwrap()),
                "edge type added",
            ));
        }
    }
    for (id, old_t) in &old_by_id {
        match new_by_id.get(id) {
            None => out.push(SchemaChange::new(
                ChangeKind::EdgeTypeRemoved,
                format!("EdgeType:{}", old_t.name),
                Some(serde_json::to_value(old_t).unwrap()),
                None,
                "edge type removed",
            )),
            Some(new_t) => check_edge_type_diff(old_t, new_t, out),
        }
    }
}

fn check_edge_type_diff(old_t: &EdgeType, new_t: &EdgeType, out: &mut Vec<SchemaChange>) {
    let path = format!("EdgeType:{}", old_t.name);
    if old_t.deprecated && old_t.name.to_lowercase() != new_t.name.to_lowercase() {
        out.push(SchemaChange::new(
            ChangeKind::EdgeIdReused,
            format!("EdgeType:{}", new_t.name),
            Some(old_t.name.clone().into()),
            Some(new_t.name.clone().into()),
            format!(
                "edge_id {} was deprecated as '{}' but reused for '{}'",
                new_t.edge_id, old_t.name, new_t.name
            ),
        ));
    }
    if old_t.from_type_id != new_t.from_type_id {
        out.push(SchemaChange::new(
            ChangeKind::FromTypeChanged,
            path.clone(),
            Some(old_t.from_type_id.into()),
            Some(new_t.from_type_id.into()),
            "from_type_id changed",
        ));
    }
    if old_t.to_type_id != new_t.to_type_id {
        out.push(SchemaChange::new(
            ChangeKind::ToTypeChanged,
            path.clone(),
            Some(old_t.to_type_id.into()),
            Some(new_t.to_type_id.into()),
            "to_type_id changed",
        ));
    }
    if !old_t.deprecated && new_t.deprecated {
        out.push(SchemaChange::new(
            ChangeKind::TypeDeprecated,
            path.clone(),
            Some(false.into()),
            Some(true.into()),
            "type deprecated",
        ));
    }
    check_fields(&path, &old_t.props, &new_t.props, out);
}

fn check_fields(parent_path: &str, old: &[FieldDef], new: &[FieldDef], out: &mut Vec<SchemaChange>) {
    let old_by_id: HashMap<u16, &FieldDef> = old.iter().map(|f| (f.field_id, f)).collect();
    let new_by_id: HashMap<u16, &FieldDef> = new.iter().map(|f| (f.field_id, f)).collect();
    let field_label = if parent_path.starts_with("EdgeType") { "prop" } else { "field" };

    for (id, new_f) in &new_by_id {
        if !old_by_id.contains_key(id) {
            let kind = if field_label == "prop" { ChangeKind::PropAdded } else { ChangeKind::FieldAdded };
            out.push(SchemaChange::new(
                kind,
                format!("{parent_path}.{field_label}:{}", new_f.name),
                None,
                Some(serde_json::to_value(new_f).unwrap()),
                format!("{field_label} added"),
            ));
        }
    }
    for (id, old_f) in &old_by_id {
        match new_by_id.get(id) {
            None => {
                let kind = if field_label == "prop" { ChangeKind::PropRemoved } else { ChangeKind::FieldRemoved };
                out.push(SchemaChange::new(
                    kind,
                    format!("{parent_path}.{field_label}:{}", old_f.name),
                    Some(serde_json::to_value(old_f).unwrap()),
                    None,
                    format!("{field_label} removed"),
                ));
            }
            Some(new_f) => check_field_diff(parent_path, field_label, old_f, new_f, out),
        }
    }
}

fn check_field_diff(
    parent_path: &str,
    field_label: &str,
    old_f: &FieldDef,
    new_f: &FieldDef,
    out: &mut Vec<SchemaChange>,
) {
    let path = format!("{parent_path}.{field_label}:{}", old_f.name);
    if old_f.name != new_f.name {
        out.push(SchemaChange::new(
            ChangeKind::NameChanged,
            path.clone(),
            Some(old_f.name.clone().into()),
            Some(new_f.name.clone().into()),
            "name changed",
        ));
    }
    if old_f.kind != new_f.kind {
        out.push(SchemaChange::new(
            ChangeKind::FieldKindChanged,
            path.clone(),
            Some(serde_json::to_value(old_f.kind).unwrap()),
            Some(serde_json::to_value(new_f.kind).unwrap()),
            "field kind changed",
        ));
    }
    if !old_f.required && new_f.required {
        out.push(SchemaChange::new(
            ChangeKind::RequiredAdded,
            path.clone(),
            Some(false.into()),
            Some(true.into()),
            "optional field made required",
        ));
    }
    if !old_f.deprecated && new_f.deprecated {
        out.push(SchemaChange::new(
            ChangeKind::FieldDeprecated,
            path.clone(),
            Some(false.into()),
            Some(true.into()),
            "field deprecated",
        ));
    }
    if !old_f.indexed && new_f.indexed {
        out.push(SchemaChange::new(
            ChangeKind::IndexAdded,
            path.clone(),
            Some(false.into()),
            Some(true.into()),
            "index enabled",
        ));
    }
    if !old_f.searchable && new_f.searchable {
        out.push(SchemaChange::new(
            ChangeKind::SearchableAdded,
            path.clone(),
            Some(false.into()),
            Some(true.into()),
            "searchable enabled",
        ));
    }
    if old_f.description != new_f.description {
        out.push(SchemaChange::new(
            ChangeKind::DescriptionChanged,
            path.clone(),
            Some(old_f.description.clone().into()),
            Some(new_f.description.clone().into()),
            "description changed",
        ));
    }
    check_enum_values(&path, &old_f.enum_values, &new_f.enum_values, out);
}

fn check_enum_values(path: &str, old: &[String], new: &[String], out: &mut Vec<SchemaChange>) {
    if old == new {
        return;
    }
    let old_set: std::collections::HashSet<&String> = old.iter().collect();
    let new_set: std::collections::HashSet<&String> = new.iter().collect();

    let removed: Vec<&String> = old.iter().filter(|v| !new_set.contains(v)).collect();
    let added: Vec<&String> = new.iter().filter(|v| !old_set.contains(v)).collect();

    if !removed.is_empty() {
        out.push(SchemaChange::new(
            ChangeKind::EnumValueRemoved,
            path.to_string(),
            Some(serde_json::to_value(&removed).unwrap()),
            None,
            "enum value(s) removed",
        ));
        return;
    }
    if !added.is_empty() {
        out.push(SchemaChange::new(
            ChangeKind::EnumValueAdded,
            path.to_string(),
            None,
            Some(serde_json::to_value(&added).unwrap()),
            "enum value(s) added",
        ));
        return;
    }
    // Same set, different order.
    out.push(SchemaChange::new(
        ChangeKind::EnumValueReordered,
        path.to_string(),
        Some(serde_json::to_value(old).unwrap()),
        Some(serde_json::to_value(new).unwrap()),
        "enum values reordered",
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldKind;

    fn field(id: u16, name: &str, kind: FieldKind) -> FieldDef {
        FieldDef {
            field_id: id,
            name: name.to_string(),
            kind,
            required: false,
            default: None,
            enum_values: vec![],
            ref_type_id: None,
            indexed: false,
            searchable: false,
            deprecated: false,
            description: String::new(),
        }
    }

    fn registry_with_email_kind(kind: FieldKind) -> Registry {
        let r = Registry::new();
        r.register_node_type(NodeType {
            type_id: 1,
            name: "User".to_string(),
            fields: vec![field(1, "email", kind)],
            deprecated: false,
            description: String::new(),
            default_acl: vec![],
        })
        .unwrap();
        r.freeze().unwrap();
        r
    }

    #[test]
    fn field_kind_change_is_breaking() {
        let old = registry_with_email_kind(FieldKind::Str);
        let new = registry_with_email_kind(FieldKind::Int);
        let changes = check_compatibility(&old, &new);
        let kind_change = changes.iter().find(|c| c.kind == ChangeKind::FieldKindChanged);
        assert!(kind_change.is_some());
        assert!(kind_change.unwrap().is_breaking());
    }

    #[test]
    fn adding_a_node_type_is_non_breaking() {
        let old = Registry::new();
        old.freeze().unwrap();

        let new = Registry::new();
        new.register_node_type(NodeType {
            type_id: 1,
            name: "User".to_string(),
            fields: vec![],
            deprecated: false,
            description: String::new(),
            default_acl: vec![],
        })
        .unwrap();
        new.freeze().unwrap();

        let changes = check_compatibility(&old, &new);
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].is_breaking());
        assert_eq!(changes[0].kind, ChangeKind::NodeTypeAdded);
    }

    #[test]
    fn type_id_reused_under_different_name_is_breaking() {
        let old = Registry::new();
        old.register_node_type(NodeType {
            type_id: 1,
            name: "Task".to_string(),
            fields: vec![],
            deprecated: true,
            description: String::new(),
            default_acl: vec![],
        })
        .unwrap();
        old.freeze().unwrap();

        let new = Registry::new();
        new.register_node_type(NodeType {
            type_id: 1,
            name: "Ticket".to_string(),
            fields: vec![],
            deprecated: false,
            description: String::new(),
            default_acl: vec![],
        })
        .unwrap();
        new.freeze().unwrap();

        let changes = check_compatibility(&old, &new);
        let reused = changes.iter().find(|c| c.kind == ChangeKind::TypeIdReused);
        assert!(reused.is_some());
        assert!(reused.unwrap().is_breaking());
    }

    #[test]
    fn deprecated_type_renamed_to_same_name_different_case_is_not_reuse() {
        let old = Registry::new();
        old.register_node_type(NodeType {
            type_id: 1,
            name: "Task".to_string(),
            fields: vec![],
            deprecated: true,
            description: String::new(),
            default_acl: vec![],
        })
        .unwrap();
        old.freeze().unwrap();

        let new = Registry::new();
        new.register_node_type(NodeType {
            type_id: 1,
            name: "task".to_string(),
            fields: vec![],
            deprecated: true,
            description: String::new(),
            default_acl: vec![],
        })
        .unwrap();
        new.freeze().unwrap();

        let changes = check_compatibility(&old, &new);
        assert!(!changes.iter().any(|c| c.kind == ChangeKind::TypeIdReused));
    }

    #[test]
    fn removing_a_field_is_breaking() {
        let old = registry_with_email_kind(FieldKind::Str);
        let new = Registry::new();
        new.register_node_type(NodeType {
            type_id: 1,
            name: "User".to_string(),
            fields: vec![],
            deprecated: false,
            description: String::new(),
            default_acl: vec![],
        })
        .unwrap();
        new.freeze().unwrap();
        let changes = check_compatibility(&old, &new);
        assert!(changes.iter().any(|c| c.kind == ChangeKind::FieldRemoved && c.is_breaking()));
    }
}
