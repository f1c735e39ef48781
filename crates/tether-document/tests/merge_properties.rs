use proptest::prelude::*;
use serde_json::{Map, Value};
use tether_document::{simulate, ConfigDocument, Patch};

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(|n| Value::from(n)),
        "[a-z0-9-]{0,8}".prop_map(Value::String),
    ]
}

fn json_value() -> impl Strategy<Value = Value> {
    leaf().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..3).prop_map(Value::Array),
            prop::collection::btree_map("[a-c]", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect::<Map<_, _>>())),
        ]
    })
}

fn object() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-d]", json_value(), 0..4)
        .prop_map(|m| Value::Object(m.into_iter().collect::<Map<_, _>>()))
}

proptest! {
    #[test]
    fn empty_patch_is_identity(current in object()) {
        let doc = ConfigDocument::from_value(current).unwrap();
        let patch = Patch::parse("{}").unwrap();
        prop_assert_eq!(simulate(&doc, &patch), doc);
    }

    #[test]
    fn merge_is_idempotent(current in object(), patch in object()) {
        let doc = ConfigDocument::from_value(current).unwrap();
        let patch = Patch::from_value(patch).unwrap();
        let once = simulate(&doc, &patch);
        let twice = simulate(&once, &patch);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn patched_leaves_win(current in object(), patch in object()) {
        let doc = ConfigDocument::from_value(current).unwrap();
        let patch = Patch::from_value(patch).unwrap();
        let candidate = simulate(&doc, &patch).into_value();
        for (key, value) in patch.body() {
            if !value.is_object() {
                prop_assert_eq!(&candidate[key], value);
            }
        }
    }

    #[test]
    fn canonical_hash_survives_reparse(current in object()) {
        let doc = ConfigDocument::from_value(current).unwrap();
        let reparsed = ConfigDocument::parse(&doc.to_pretty_json()).unwrap();
        prop_assert_eq!(doc.canonical_hash(), reparsed.canonical_hash());
    }
}
