use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use taskgate::sandbox::{evict, SandboxManager};
use taskgate::state::{CounterIdGenerator, SessionRecord, SessionRegistry};

fn make_boxes(root: &Path, names: &[&str]) {
    for name in names {
        let dir = root.join(name);
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("nested/file"), b"data").unwrap();
    }
}

fn remaining(root: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(root)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn keeps_newest_entries() {
    let dir = tempfile::tempdir().unwrap();
    make_boxes(dir.path(), &["004", "000", "002", "001", "003"]);

    let report = evict(dir.path(), 2, |_| false);

    assert_eq!(report.removed, vec!["000", "001", "002"]);
    assert_eq!(remaining(dir.path()), vec!["003", "004"]);
}

#[test]
fn zero_keep_deletes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    make_boxes(dir.path(), &["000", "001", "002"]);

    let report = evict(dir.path(), 0, |_| false);

    assert!(report.removed.is_empty());
    assert_eq!(remaining(dir.path()).len(), 3);
}

#[test]
fn active_sandboxes_survive_and_are_not_replaced() {
    let dir = tempfile::tempdir().unwrap();
    make_boxes(dir.path(), &["000", "001", "002", "003", "004"]);
    let active: HashSet<&str> = ["000", "002", "004"].into_iter().collect();

    let report = evict(dir.path(), 2, |name| active.contains(name));

    assert_eq!(report.removed, vec!["001"]);
    assert_eq!(report.skipped, vec!["000", "002"]);
    assert_eq!(remaining(dir.path()), vec!["000", "002", "003", "004"]);
}

#[test]
fn fewer_entries_than_keep() {
    let dir = tempfile::tempdir().unwrap();
    make_boxes(dir.path(), &["000"]);

    let report = evict(dir.path(), 5, |_| false);

    assert!(report.removed.is_empty());
    assert_eq!(remaining(dir.path()), vec!["000"]);
}

#[test]
fn manager_consults_registry() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(SessionRegistry::new(Box::new(CounterIdGenerator::new("s"))));
    let manager = SandboxManager::new(dir.path(), 1, registry.clone());
    for name in ["a", "b", "c"] {
        manager.ensure_sandbox(name, None).unwrap();
    }
    registry
        .admit(SessionRecord {
            id: registry.next_id(),
            sandbox: "a".into(),
            profile: None,
            max_sessions: 0,
            user: "alice".into(),
            uid: 1000,
            gid: 1000,
            created_at: Instant::now(),
        })
        .unwrap();

    let report = manager.evict();

    assert_eq!(report.skipped, vec!["a"]);
    assert_eq!(report.removed, vec!["b"]);
    assert_eq!(remaining(dir.path()), vec!["a", "c"]);
}
