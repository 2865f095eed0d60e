//! ModuleStore materialization tests

mod common;

use common::*;
use modhost::module::{ModuleError, ModuleKind, ModuleRef};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_named_module_is_fetched_and_bundled() {
    let fixture = StoreFixture::new();
    let module = ModuleRef::Named("three".to_string());

    let artifact = fixture
        .store
        .ensure_materialized(&module, ModuleKind::Plugin)
        .await
        .unwrap();

    assert_eq!(artifact.name, "three");
    assert!(artifact.has_client);
    assert_eq!(artifact.path, fixture.artifact_path(ModuleKind::Plugin, "three"));
    assert_eq!(
        std::fs::read_to_string(&artifact.path).unwrap(),
        "// three\n"
    );
    assert_eq!(fixture.package_manager.calls(), vec!["add three".to_string()]);
    assert_eq!(fixture.bundler.builds(), 1);
}

#[tokio::test]
async fn test_existing_artifact_short_circuits() {
    let fixture = StoreFixture::new();
    let module = ModuleRef::Named("three".to_string());
    fixture
        .store
        .ensure_materialized(&module, ModuleKind::Plugin)
        .await
        .unwrap();

    let scheduled = fixture.store.queue().scheduled();
    let again = fixture
        .store
        .ensure_materialized(&module, ModuleKind::Plugin)
        .await
        .unwrap();

    assert!(again.has_client);
    assert_eq!(fixture.store.queue().scheduled(), scheduled);
    assert_eq!(fixture.package_manager.calls().len(), 1);
    assert_eq!(fixture.bundler.builds(), 1);
}

#[tokio::test]
async fn test_inline_module_writes_files() {
    let fixture = StoreFixture::new();
    let module = ModuleRef::from_value(&json!({
        "name": "inline-sky",
        "dependencies": { "three": "^0.84.0" },
        "files": {
            "client.js": "module.exports = () => 'sky';",
            "lib/colors.js": "module.exports = ['blue'];",
        },
    }))
    .unwrap();

    let artifact = fixture
        .store
        .ensure_materialized(&module, ModuleKind::Plugin)
        .await
        .unwrap();

    let install_dir = fixture.store.install_dir(ModuleKind::Plugin, "inline-sky");
    assert_eq!(
        std::fs::read_to_string(install_dir.join("lib/colors.js")).unwrap(),
        "module.exports = ['blue'];"
    );

    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(install_dir.join("package.json")).unwrap())
            .unwrap();
    assert_eq!(written["name"], "inline-sky");
    assert_eq!(written["version"], "0.0.1");
    assert_eq!(written["dependencies"]["three"], "^0.84.0");
    assert!(written.get("files").is_none());

    assert_eq!(
        std::fs::read_to_string(&artifact.path).unwrap(),
        "module.exports = () => 'sky';"
    );
    assert_eq!(
        fixture.package_manager.calls(),
        vec!["install inline-sky".to_string()]
    );
}

#[tokio::test]
async fn test_client_less_module_gets_empty_artifact() {
    let fixture = StoreFixture::new();
    let module = ModuleRef::from_value(&json!({ "name": "server-only", "client": "" })).unwrap();

    let artifact = fixture
        .store
        .ensure_materialized(&module, ModuleKind::Engine)
        .await
        .unwrap();

    assert!(!artifact.has_client);
    assert_eq!(std::fs::metadata(&artifact.path).unwrap().len(), 0);
    assert_eq!(fixture.bundler.builds(), 0);
}

#[tokio::test]
async fn test_local_module_is_copied_once() {
    let fixture = StoreFixture::new();
    fixture.create_local_module("mods/sky", "sky", "module.exports = 'local';");
    let module = ModuleRef::from_value(&json!("/mods/sky")).unwrap();

    let artifact = fixture
        .store
        .ensure_materialized(&module, ModuleKind::Plugin)
        .await
        .unwrap();

    assert_eq!(artifact.name, "_mods_sky");
    let install_dir = fixture.store.install_dir(ModuleKind::Plugin, "sky");
    assert!(install_dir.join("client.js").exists());
    assert_eq!(
        std::fs::read_to_string(&artifact.path).unwrap(),
        "module.exports = 'local';"
    );

    // Rebuild: the install location already holds the module, so it is not
    // copied again; local edits only land after a remove
    std::fs::write(
        fixture.local_dir.join("mods/sky/client.js"),
        "module.exports = 'edited';",
    )
    .unwrap();
    std::fs::remove_file(&artifact.path).unwrap();
    fixture
        .store
        .ensure_materialized(&module, ModuleKind::Plugin)
        .await
        .unwrap();
    assert_eq!(
        std::fs::read_to_string(&artifact.path).unwrap(),
        "module.exports = 'local';"
    );
}

#[tokio::test]
async fn test_missing_local_module_is_not_found() {
    let fixture = StoreFixture::new();
    let module = ModuleRef::from_value(&json!("/mods/absent")).unwrap();
    let err = fixture
        .store
        .ensure_materialized(&module, ModuleKind::Plugin)
        .await
        .unwrap_err();
    assert!(matches!(err, ModuleError::NotFound(_)));
    assert!(!fixture.work_dir.join("plugins").exists());
}

#[tokio::test]
async fn test_malformed_reference_has_no_side_effects() {
    let fixture = StoreFixture::new();

    let err = ModuleRef::from_value(&json!({
        "name": "broken",
        "dependencies": { "three": 84 },
    }))
    .unwrap_err();
    assert!(matches!(err, ModuleError::Validation(_)));

    assert!(ModuleRef::from_value(&json!(["not", "a", "module"])).is_err());
    assert!(ModuleRef::from_value(&json!("/../escape")).is_err());

    assert!(!fixture.work_dir.exists());
    assert!(fixture.package_manager.calls().is_empty());
}

#[tokio::test]
async fn test_inline_files_cannot_replace_descriptor() {
    let fixture = StoreFixture::new();

    let err = ModuleRef::from_value(&json!({
        "name": "sneaky",
        "files": {
            "./package.json": "{\"name\":\"other\",\"client\":\"evil.js\"}",
            "client.js": "module.exports = 'sneaky';",
        },
    }))
    .unwrap_err();

    assert!(matches!(err, ModuleError::Validation(_)));
    assert!(!fixture.store.install_dir(ModuleKind::Plugin, "sneaky").exists());
    assert!(fixture.package_manager.calls().is_empty());
}

#[tokio::test]
async fn test_tool_failure_propagates() {
    let fixture = StoreFixture::new();
    fixture.package_manager.fail_installs_with(ModuleError::Tool {
        tool: "yarn install".to_string(),
        code: Some(1),
    });
    let module = ModuleRef::from_value(&json!({ "name": "doomed" })).unwrap();

    let err = fixture
        .store
        .ensure_materialized(&module, ModuleKind::Plugin)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ModuleError::Tool {
            tool: "yarn install".to_string(),
            code: Some(1),
        }
    );
    assert!(!fixture.artifact_path(ModuleKind::Plugin, "doomed").exists());
    assert_eq!(fixture.bundler.builds(), 0);
}

#[tokio::test]
async fn test_remove_is_idempotent() {
    let fixture = StoreFixture::new();
    let module = ModuleRef::Named("three".to_string());
    fixture
        .store
        .ensure_materialized(&module, ModuleKind::Plugin)
        .await
        .unwrap();

    fixture
        .store
        .remove_materialized(&module, ModuleKind::Plugin)
        .await
        .unwrap();
    assert!(!fixture.artifact_path(ModuleKind::Plugin, "three").exists());
    assert!(!fixture.store.install_dir(ModuleKind::Plugin, "three").exists());

    fixture
        .store
        .remove_materialized(&module, ModuleKind::Plugin)
        .await
        .unwrap();

    // Never materialized at all
    fixture
        .store
        .remove_materialized(&ModuleRef::Named("ghost".to_string()), ModuleKind::Engine)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_list_artifacts_is_sorted_per_kind() {
    let fixture = StoreFixture::new();
    assert!(fixture
        .store
        .list_artifacts(ModuleKind::Plugin)
        .await
        .unwrap()
        .is_empty());

    for name in ["zeta", "alpha"] {
        fixture
            .store
            .ensure_materialized(&ModuleRef::Named(name.to_string()), ModuleKind::Plugin)
            .await
            .unwrap();
    }
    fixture
        .store
        .ensure_materialized(&ModuleRef::Named("physics".to_string()), ModuleKind::Engine)
        .await
        .unwrap();

    assert_eq!(
        fixture.store.list_artifacts(ModuleKind::Plugin).await.unwrap(),
        vec!["alpha".to_string(), "zeta".to_string()]
    );
    assert_eq!(
        fixture.store.list_artifacts(ModuleKind::Engine).await.unwrap(),
        vec!["physics".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_materialization_is_serialized() {
    let concurrency = Arc::new(Concurrency::default());
    let fixture = StoreFixture::with_package_manager(FakePackageManager::with_delay(
        Duration::from_millis(5),
        Arc::clone(&concurrency),
    ));

    let mut handles = Vec::new();
    for name in ["a", "b", "c", "a", "b", "c"] {
        let store = Arc::clone(&fixture.store);
        handles.push(tokio::spawn(async move {
            store
                .ensure_materialized(&ModuleRef::Named(name.to_string()), ModuleKind::Plugin)
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap().has_client);
    }

    assert_eq!(concurrency.peak(), 1);
    // Racing requests for the same module may both fetch, but only one builds
    assert_eq!(fixture.bundler.builds(), 3);
}
