mod common;

use common::UsersState;
use eventfold_registry::snapshot::{self, SnapshotCache};
use eventfold_registry::{CacheError, CacheRow, RevisionToken, StateCache};
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

fn counter_row(count: u64, seq: u64) -> CacheRow<u64> {
    CacheRow::new(Arc::new(count), seq, None)
}

#[test]
fn test_save_and_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.snapshot.json");
    let row = CacheRow::new(Arc::new(7u64), 3, Some(RevisionToken::new("1-abc")));

    snapshot::save(&path, &row).unwrap();
    let loaded: CacheRow<u64> = snapshot::load(&path).unwrap().unwrap();
    assert_eq!(*loaded.state, 7);
    assert_eq!(loaded.seq, 3);
    assert_eq!(loaded.rev, Some(RevisionToken::new("1-abc")));
    assert!(!path.with_extension("json.tmp").exists());
}

#[test]
fn test_load_missing_is_none() {
    let dir = tempdir().unwrap();
    let loaded = snapshot::load::<u64>(&dir.path().join("nope.snapshot.json")).unwrap();
    assert!(loaded.is_none());
}

#[test]
fn test_load_corrupt_is_none() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.snapshot.json");
    fs::write(&path, "{ not json").unwrap();
    assert!(snapshot::load::<u64>(&path).unwrap().is_none());
}

#[tokio::test]
async fn test_cache_get_missing_row() {
    let dir = tempdir().unwrap();
    let cache = SnapshotCache::open(dir.path().join("cache")).unwrap();
    let result = StateCache::<u64>::get(&cache, "state").await;
    assert!(matches!(result, Err(CacheError::NotFound(ref id)) if id == "state"));
}

#[tokio::test]
async fn test_cache_put_then_get() {
    let dir = tempdir().unwrap();
    let cache = SnapshotCache::open(dir.path()).unwrap();

    let mut state = UsersState::default();
    state.users.insert(
        "u1".into(),
        common::User {
            username: "ada".into(),
            email: "ada@example.com".into(),
        },
    );
    let token = cache
        .put("state", CacheRow::new(Arc::new(state.clone()), 4, None))
        .await
        .unwrap();

    let row: CacheRow<UsersState> = cache.get("state").await.unwrap();
    assert_eq!(*row.state, state);
    assert_eq!(row.seq, 4);
    assert_eq!(row.rev, Some(token));
    assert!(cache.row_path("state").exists());
}

#[tokio::test]
async fn test_cache_rejects_stale_token() {
    let dir = tempdir().unwrap();
    let cache = SnapshotCache::open(dir.path()).unwrap();

    let first = cache.put("state", counter_row(1, 1)).await.unwrap();
    let second = cache
        .put("state", CacheRow::new(Arc::new(2u64), 2, Some(first.clone())))
        .await
        .unwrap();
    assert_eq!(second.generation(), 2);

    let stale = cache
        .put("state", CacheRow::new(Arc::new(3u64), 3, Some(first)))
        .await
        .unwrap_err();
    assert!(stale.is_conflict());

    let missing_token = cache.put("state", counter_row(3, 3)).await.unwrap_err();
    assert!(matches!(missing_token, CacheError::Conflict { .. }));

    let row: CacheRow<u64> = cache.get("state").await.unwrap();
    assert_eq!(*row.state, 2);
}

#[tokio::test]
async fn test_cache_token_on_missing_row_is_not_found() {
    let dir = tempdir().unwrap();
    let cache = SnapshotCache::open(dir.path()).unwrap();
    let err = cache
        .put(
            "state",
            CacheRow::new(Arc::new(1u64), 1, Some(RevisionToken::new("3-deadbeef"))),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::NotFound(_)));
}

#[tokio::test]
async fn test_rows_are_independent() {
    let dir = tempdir().unwrap();
    let cache = SnapshotCache::open(dir.path()).unwrap();
    cache.put("a", counter_row(1, 1)).await.unwrap();
    cache.put("b", counter_row(2, 2)).await.unwrap();

    let a: CacheRow<u64> = cache.get("a").await.unwrap();
    let b: CacheRow<u64> = cache.get("b").await.unwrap();
    assert_eq!((*a.state, *b.state), (1, 2));
}

#[tokio::test]
async fn test_rewrites_keep_a_single_row_file() {
    let dir = tempdir().unwrap();
    let cache = SnapshotCache::open(dir.path()).unwrap();

    let mut rev = None;
    for n in 1..=3u64 {
        rev = Some(
            cache
                .put("state", CacheRow::new(Arc::new(n), n, rev))
                .await
                .unwrap(),
        );
    }

    let mut files: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    assert_eq!(files, vec!["state.lock", "state.snapshot.json"]);

    let row: CacheRow<u64> = cache.get("state").await.unwrap();
    assert_eq!((*row.state, row.seq), (3, 3));
}
