use std::fs::{self, File};
use std::time::{Duration, SystemTime};

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use sync_core::{FaultClass, Timestamp};
use sync_engine::{ensure_dir, AtomicFileWriter, CacheStore, RollbackStrategy, WipeNewerThan};
use tempfile::TempDir;

fn backdate(path: &std::path::Path, age: Duration) {
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - age).unwrap();
}

#[test]
fn rewriting_an_id_keeps_only_latest_payload() {
    let temp = TempDir::new().unwrap();
    let cache = CacheStore::new(temp.path(), "contacts");

    let first = cache.write(5, &json!({"id": 5, "name": "old"})).unwrap();
    let second = cache.write(5, &json!({"id": 5, "name": "new"})).unwrap();

    assert_eq!(first, second);
    assert_eq!(cache.ids().unwrap(), vec![5]);
    assert_eq!(fs::read_dir(cache.dir()).unwrap().count(), 1);
    let stored: Value = cache.read(5).unwrap().unwrap();
    assert_eq!(stored["name"], "new");
}

#[test]
fn read_all_is_sorted_and_skips_foreign_files() {
    let temp = TempDir::new().unwrap();
    let cache = CacheStore::new(temp.path(), "companies");
    for id in [30, 4, 12] {
        cache.write(id, &json!({"id": id})).unwrap();
    }
    fs::write(cache.dir().join("notes.txt"), "ignore me").unwrap();

    let entries = cache.read_all::<Value>().unwrap();
    let ids: Vec<u64> = entries.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![4, 12, 30]);
    assert_eq!(entries[0].payload, json!({"id": 4}));
    assert!(cache.read::<Value>(99).unwrap().is_none());
}

#[test]
fn remove_all_empties_collection_including_children() {
    let temp = TempDir::new().unwrap();
    let cache = CacheStore::new(temp.path(), "deals");
    cache.write(1, &json!({"id": 1})).unwrap();
    cache.child(1).write(77, &json!({"id": 77})).unwrap();

    assert_eq!(cache.remove_all().unwrap(), 1);
    assert!(!cache.dir().exists());
    assert!(cache.is_empty().unwrap());
    // Removing an absent collection is a no-op.
    assert_eq!(cache.remove_all().unwrap(), 0);
}

#[test]
fn remove_modified_after_spares_older_entries() {
    let temp = TempDir::new().unwrap();
    let cache = CacheStore::new(temp.path(), "contacts");
    let child = cache.child(3);

    for id in [1, 2, 3] {
        let path = cache.write(id, &json!({"id": id})).unwrap();
        backdate(&path, Duration::from_secs(3_600));
    }
    let old_child = child.write(10, &json!({"id": 10})).unwrap();
    backdate(&old_child, Duration::from_secs(3_600));

    let cutoff = Timestamp::from_system_time(SystemTime::now() - Duration::from_secs(60));
    cache.write(2, &json!({"id": 2, "rewritten": true})).unwrap();
    cache.write(4, &json!({"id": 4})).unwrap();
    child.write(11, &json!({"id": 11})).unwrap();

    assert_eq!(cache.remove_modified_after(cutoff).unwrap(), 3);
    assert_eq!(cache.ids().unwrap(), vec![1, 3]);
    assert_eq!(child.ids().unwrap(), vec![10]);
}

#[test]
fn entry_written_just_before_completed_survives_rollback() {
    let temp = TempDir::new().unwrap();
    let cache = CacheStore::new(temp.path(), "contacts");

    // Enough rounds that some writes land in the same millisecond as `completed`.
    for round in 0..50 {
        cache.write(1, &json!({"id": 1, "round": round})).unwrap();
        let completed = Timestamp::now();
        let report = WipeNewerThan(completed).rollback(&cache).unwrap();
        assert_eq!(report.removed, 0, "round {round}");
        assert_eq!(cache.ids().unwrap(), vec![1]);
    }
}

#[test]
fn unwritable_collection_path_is_a_directory_fault() {
    let temp = TempDir::new().unwrap();
    let blocker = temp.path().join("contacts");
    fs::write(&blocker, "not a directory").unwrap();

    let err = CacheStore::new(temp.path(), "contacts").ensure().unwrap_err();
    assert_eq!(err.fault_class(), FaultClass::CreateDirectory);
    assert!(ensure_dir(&temp.path().join("fresh")).is_ok());
}

#[test]
fn atomic_writer_leaves_no_partial_file_on_error() {
    let temp = TempDir::new().unwrap();
    let file_path = temp.path().join("not_a_dir");
    fs::write(&file_path, "x").unwrap();

    let writer = AtomicFileWriter::new(file_path.clone());
    assert!(writer.write("1.json", b"{}").is_err());
    assert!(!file_path.with_file_name("1.json").exists());
}
