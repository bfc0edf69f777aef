//! Promise files and run configs loaded from disk, driving whole runs.

use converge_core::{MemoryReporter, Outcome, PromiseFile, RunConfig, RunContext, reconcile_all};
use converge_fs::{ChangeKind, ConfigStore};
use converge_test_utils::TestTree;
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn load_run(tree: &TestTree, promises: &str, config: &str) -> (PromiseFile, RunConfig) {
    let store = ConfigStore::new();
    (
        store.load(&tree.path(promises)).unwrap(),
        store.load(&tree.path(config)).unwrap(),
    )
}

#[test]
fn yaml_promises_run_in_a_sandbox() {
    let tree = TestTree::new().file("live/old.log", "stale").dir("live/etc");
    let yaml = format!(
        "promises:\n  - path: {motd}\n    create: true\n  - path: {log}\n    delete: {{}}\n",
        motd = tree.path("live/etc/motd").display(),
        log = tree.path("live/old.log").display(),
    );
    let config = format!("sandbox_root = \"{}\"\n", tree.path("stage").display());
    let tree = tree.file("promises.yaml", &yaml).file("run.toml", &config);

    let (promises, config) = load_run(&tree, "promises.yaml", "run.toml");
    assert_eq!(promises.promises.len(), 2);

    let ctx = RunContext::from_config(&config).unwrap();
    assert_eq!(reconcile_all(&ctx, &promises.promises), Outcome::Changed);
    ctx.finish().unwrap();

    tree.assert_missing("live/etc/motd");
    tree.assert_contents("live/old.log", "stale");

    let kinds: Vec<ChangeKind> = ctx.fs.journal().into_iter().map(|c| c.kind).collect();
    assert_eq!(kinds, vec![ChangeKind::CreateFile, ChangeKind::Remove]);
}

#[test]
fn change_database_persists_between_runs() {
    let tree = TestTree::new().file("watched/app.bin", "v1");
    let promises = format!(
        "[[promises]]\npath = \"{}\"\n\n[promises.changes]\nhash = true\n",
        tree.path("watched/app.bin").display()
    );
    let config = format!("change_db = \"{}\"\n", tree.path("state/changes.toml").display());
    let tree = tree.file("promises.toml", &promises).file("run.toml", &config);
    let (promises, config) = load_run(&tree, "promises.toml", "run.toml");

    let first = RunContext::from_config(&config).unwrap();
    assert_eq!(reconcile_all(&first, &promises.promises), Outcome::NoChange);
    first.finish().unwrap();
    tree.assert_exists("state/changes.toml");

    std::fs::write(tree.path("watched/app.bin"), "version two").unwrap();

    let reporter = Arc::new(MemoryReporter::new());
    let second = RunContext::from_config(&config).unwrap().with_reporter(reporter.clone());
    assert_eq!(reconcile_all(&second, &promises.promises), Outcome::Warned);
    second.finish().unwrap();
    let messages: Vec<String> = reporter.entries().into_iter().map(|e| e.message).collect();
    assert!(messages.iter().any(|m| m.starts_with("changed:")), "messages: {messages:?}");

    let third = RunContext::from_config(&config).unwrap();
    assert_eq!(reconcile_all(&third, &promises.promises), Outcome::NoChange);
}

#[test]
fn single_copy_destination_is_written_once_per_run() {
    let tree = TestTree::new().file("one", "first").file("two", "second");
    let dest = tree.path("out/conf");
    let promises = format!(
        r#"{{"promises": [
            {{"path": "{dest}", "copy": {{"source": "{one}"}}}},
            {{"path": "{dest}", "copy": {{"source": "{two}", "force_update": true}}}}
        ]}}"#,
        dest = dest.display(),
        one = tree.path("one").display(),
        two = tree.path("two").display(),
    );
    let tree = tree
        .file("promises.json", &promises)
        .file("run.toml", "single_copy = [\".*/out/conf\"]\n");
    let (promises, config) = load_run(&tree, "promises.json", "run.toml");

    let ctx = RunContext::from_config(&config).unwrap();
    assert_eq!(reconcile_all(&ctx, &promises.promises), Outcome::Changed);
    tree.assert_contents("out/conf", "first");
}
