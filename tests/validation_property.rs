use proptest::prelude::*;
use serde_json::{json, Value};

use modhost::module::{ModuleError, ModuleRef};

fn non_string_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        prop::collection::vec("[a-z]{0,4}", 0..3).prop_map(|v| json!(v)),
        "[a-z]{1,4}".prop_map(|k| json!({ k: "1.0.0" })),
    ]
}

proptest! {
    #[test]
    fn non_string_dependency_is_always_rejected(
        dep in "[a-z][a-z0-9-]{0,12}",
        value in non_string_value(),
    ) {
        let declaration = json!({
            "name": "candidate",
            "dependencies": { dep: value },
        });
        let result = ModuleRef::from_value(&declaration);
        prop_assert!(matches!(result, Err(ModuleError::Validation(_))));
    }

    #[test]
    fn string_dependencies_are_accepted(
        deps in prop::collection::btree_map("[a-z][a-z0-9-]{0,12}", "\\^?[0-9]\\.[0-9]\\.[0-9]", 0..6),
    ) {
        let declaration = json!({ "name": "candidate", "dependencies": deps.clone() });
        match ModuleRef::from_value(&declaration) {
            Ok(ModuleRef::Inline(descriptor)) => prop_assert_eq!(descriptor.dependencies, deps),
            other => prop_assert!(false, "unexpected {:?}", other),
        }
    }

    #[test]
    fn parent_segments_never_pass_as_local_paths(
        prefix in "(/[a-z]{1,6}){0,3}",
        suffix in "(/[a-z]{1,6}){0,3}",
    ) {
        let path = format!("{}/..{}", prefix, suffix);
        prop_assert!(ModuleRef::from_value(&json!(path)).is_err());
    }
}
