//! Property tests for the two areas of the spec whose input space is large
//! enough to benefit from it: node-ref alias resolution and schema
//! breaking/non-breaking classification. Grounded on the existing
//! `resolve_ref`/`check_compatibility` unit tests in `applier.rs`/
//! `compat.rs`, generalized over arbitrary inputs with `proptest`.

use std::collections::BTreeMap;

use entdb::compat::check_compatibility;
use entdb::model::{AclEntry, FieldDef, FieldKind, NodeRef, NodeType};
use entdb::registry::Registry;
use proptest::prelude::*;

fn alias_key() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9_]{0,15}"
}

fn opaque_id() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9-]{1,32}"
}

fn field_kind() -> impl Strategy<Value = FieldKind> {
    prop_oneof![
        Just(FieldKind::Str),
        Just(FieldKind::Int),
        Just(FieldKind::Float),
        Just(FieldKind::Bool),
        Just(FieldKind::Timestamp),
        Just(FieldKind::Json),
        Just(FieldKind::Bytes),
        Just(FieldKind::Enum),
        Just(FieldKind::ListStr),
        Just(FieldKind::ListInt),
    ]
}

fn node_type_with_field(kind: FieldKind) -> NodeType {
    NodeType {
        type_id: 1,
        name: "Thing".to_string(),
        fields: vec![FieldDef {
            field_id: 1,
            name: "value".to_string(),
            kind,
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

proptest! {
    /// A `$<alias>` ref always resolves to whatever node id was registered
    /// under that alias, regardless of alias spelling or a trailing `.id`
    /// hint segment.
    #[test]
    fn alias_ref_resolves_to_registered_node_id(alias in alias_key(), node_id in opaque_id(), with_id_suffix in any::<bool>()) {
        let mut aliases = BTreeMap::new();
        aliases.insert(alias.clone(), node_id.clone());

        let raw = if with_id_suffix { format!("${alias}.id") } else { format!("${alias}") };
        let r = NodeRef::Id(raw);
        prop_assert_eq!(r.resolve(&aliases).unwrap(), node_id);
    }

    /// A ref referencing an alias that was never registered is always an
    /// error, never silently resolved to something else.
    #[test]
    fn unresolved_alias_is_always_an_error(alias in alias_key()) {
        let aliases: BTreeMap<String, String> = BTreeMap::new();
        let r = NodeRef::Id(format!("${alias}"));
        prop_assert!(r.resolve(&aliases).is_err());
    }

    /// A non-alias ref (no leading `$`) always resolves to itself,
    /// independent of the alias map's contents.
    #[test]
    fn opaque_ref_resolves_to_itself(node_id in opaque_id()) {
        prop_assume!(!node_id.starts_with('$'));
        let aliases: BTreeMap<String, String> = BTreeMap::new();
        let r = NodeRef::Id(node_id.clone());
        prop_assert_eq!(r.resolve(&aliases).unwrap(), node_id);
    }

    /// Any pairwise change of a field's kind is classified breaking,
    /// regardless of which two distinct kinds are involved.
    #[test]
    fn any_field_kind_change_is_breaking(old_kind in field_kind(), new_kind in field_kind()) {
        prop_assume!(old_kind != new_kind);

        let old = Registry::new();
        old.register_node_type(node_type_with_field(old_kind)).unwrap();
        let new = Registry::new();
        new.register_node_type(node_type_with_field(new_kind)).unwrap();

        let changes = check_compatibility(&old, &new);
        let kind_change = changes.iter().find(|c| c.kind == entdb::compat::ChangeKind::FieldKindChanged);
        prop_assert!(kind_change.is_some());
        prop_assert!(kind_change.unwrap().is_breaking());
    }

    /// Adding a brand-new node type to the schema is never breaking,
    /// regardless of its type_id or name.
    #[test]
    fn adding_a_node_type_is_never_breaking(type_id in 1i64..10_000, name in "[A-Z][a-zA-Z0-9]{0,15}") {
        let old = Registry::new();
        let new = Registry::new();
        new.register_node_type(NodeType {
            type_id,
            name,
            fields: vec![],
            deprecated: false,
            description: String::new(),
            default_acl: Vec::<AclEntry>::new(),
        }).unwrap();

        let changes = check_compatibility(&old, &new);
        prop_assert!(changes.iter().all(|c| !c.is_breaking()));
    }
}
