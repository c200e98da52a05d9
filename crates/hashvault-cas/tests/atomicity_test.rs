//! Integration tests for write atomicity.
//!
//! The committed namespace must only ever contain fully written blobs:
//! an aborted staged write leaves no trace at the shard path and no
//! orphaned temp file.

use std::fs;
use std::io::Write;

use tempfile::TempDir;

use hashvault_cas::{shard_path, ContentHash, FileStore};

fn temp_files_in(root: &std::path::Path) -> usize {
    fs::read_dir(root)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
        .count()
}

#[test]
fn abandoned_staged_write_leaves_nothing_behind() {
    let temp = TempDir::new().unwrap();
    let store = FileStore::new(temp.path()).unwrap();

    let data = b"partial write that never commits";
    let hash = ContentHash::of(data);

    {
        let mut staged = store.stage().unwrap();
        staged.write_all(&data[..10]).unwrap();
        // Simulated failure: the handle is dropped without commit.
    }

    assert!(!store.contains(&hash), "no partial blob may become visible");
    assert!(!shard_path(temp.path(), &hash).exists());
    assert_eq!(temp_files_in(temp.path()), 0, "staging temp file must be removed");
}

#[test]
fn commit_is_all_or_nothing_per_key() {
    let temp = TempDir::new().unwrap();
    let store = FileStore::new(temp.path()).unwrap();

    let data = b"fully committed";
    let hash = ContentHash::of(data);

    let mut staged = store.stage().unwrap();
    staged.write_all(data).unwrap();
    store.commit(&hash, staged).unwrap();

    // The shard path holds exactly the committed bytes, and the staging
    // area is clean again.
    assert_eq!(fs::read(shard_path(temp.path(), &hash)).unwrap(), data);
    assert_eq!(temp_files_in(temp.path()), 0);
}

#[cfg(unix)]
#[test]
fn failed_overwrite_commit_surfaces_the_error() {
    use std::os::unix::fs::PermissionsExt;

    let temp = TempDir::new().unwrap();
    let store = FileStore::new(temp.path()).unwrap();

    let hash = ContentHash::of(b"key owner");
    store.put(&hash, b"old content").unwrap();

    // Make the leaf shard directory unwritable so the commit rename fails.
    let shard_dir = shard_path(temp.path(), &hash).parent().unwrap().to_path_buf();
    let old_perms = fs::metadata(&shard_dir).unwrap().permissions();
    fs::set_permissions(&shard_dir, fs::Permissions::from_mode(0o555)).unwrap();

    let mut staged = store.stage().unwrap();
    staged.write_all(b"new content").unwrap();
    let result = store.commit(&hash, staged);

    // Root bypasses directory permissions; the invariant under test is that
    // commit never reports success while the old bytes remain readable.
    match result {
        Ok(()) => assert_eq!(store.get(&hash).unwrap(), b"new content"),
        Err(_) => {
            assert_eq!(store.get(&hash).unwrap(), b"old content");
            assert_eq!(temp_files_in(temp.path()), 0, "failed commit must clean its temp file");
        }
    }

    fs::set_permissions(&shard_dir, old_perms).unwrap();
}

#[test]
fn interleaved_staged_writes_are_independent() {
    let temp = TempDir::new().unwrap();
    let store = FileStore::new(temp.path()).unwrap();

    let a = b"first blob".to_vec();
    let b = b"second blob".to_vec();
    let ha = ContentHash::of(&a);
    let hb = ContentHash::of(&b);

    let mut staged_a = store.stage().unwrap();
    let mut staged_b = store.stage().unwrap();
    staged_a.write_all(&a).unwrap();
    staged_b.write_all(&b).unwrap();

    // Commit in reverse order of staging.
    store.commit(&hb, staged_b).unwrap();
    store.commit(&ha, staged_a).unwrap();

    assert_eq!(store.get(&ha).unwrap(), a);
    assert_eq!(store.get(&hb).unwrap(), b);
}
