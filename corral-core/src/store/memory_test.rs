use anyhow::{Context, Result};

use crate::error::StoreError;
use crate::store::{CoordinationStore, DataUpdater, Expected, MemoryStore, NodeMode, StoreEvent};

#[tokio::test]
async fn conditional_writes_honor_versions() -> Result<()> {
    let store = MemoryStore::new();

    let v0 = store.write("/c/a", b"one".to_vec(), Expected::Absent, NodeMode::Persistent).await?;
    let v1 = store.write("/c/a", b"two".to_vec(), Expected::Version(v0), NodeMode::Persistent).await?;
    let err = store
        .write("/c/a", b"three".to_vec(), Expected::Version(v0), NodeMode::Persistent)
        .await
        .err()
        .context("expected a stale write to fail")?;

    let store_err = err.downcast::<StoreError>().context("unexpected error type")?;
    assert!(matches!(store_err, StoreError::BadVersion { .. }), "unexpected error returned {:?}", store_err);
    let current = store.read("/c/a").await?.context("expected path to exist")?;
    assert_eq!(current.data, b"two".to_vec(), "unexpected data {:?}", current.data);
    assert_eq!(current.version, v1, "expected version {} got {}", v1, current.version);
    Ok(())
}

#[tokio::test]
async fn create_only_write_rejects_existing_path() -> Result<()> {
    let store = MemoryStore::new();
    store.write("/c/a", vec![], Expected::Any, NodeMode::Persistent).await?;

    let err = store
        .write("/c/a", vec![], Expected::Absent, NodeMode::Persistent)
        .await
        .err()
        .context("expected an error")?;

    let store_err = err.downcast::<StoreError>().context("unexpected error type")?;
    assert_eq!(store_err, StoreError::NodeExists("/c/a".into()), "unexpected error returned {:?}", store_err);
    Ok(())
}

#[tokio::test]
async fn children_include_intermediate_paths() -> Result<()> {
    let store = MemoryStore::new();
    store.write("/c/CURRENTSTATES/n1/db", vec![], Expected::Any, NodeMode::Persistent).await?;
    store.write("/c/CURRENTSTATES/n0/db", vec![], Expected::Any, NodeMode::Persistent).await?;
    store.write("/c/CURRENTSTATESX", vec![], Expected::Any, NodeMode::Persistent).await?;

    let children = store.children("/c/CURRENTSTATES").await?;

    assert_eq!(children, vec!["n0", "n1"], "unexpected children {:?}", children);
    Ok(())
}

#[tokio::test]
async fn close_session_removes_owned_ephemeral_nodes() -> Result<()> {
    let store = MemoryStore::new();
    let mut events = store.watch();
    store.write("/c/live/n0", vec![], Expected::Absent, NodeMode::Ephemeral("s0".into())).await?;
    store.write("/c/live/n1", vec![], Expected::Absent, NodeMode::Ephemeral("s1".into())).await?;

    store.close_session("s0").await?;

    assert!(store.read("/c/live/n0").await?.is_none(), "expected ephemeral node of closed session to be removed");
    assert!(store.read("/c/live/n1").await?.is_some(), "expected ephemeral node of open session to remain");
    let mut seen = vec![];
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(
        seen.contains(&StoreEvent::Deleted { path: "/c/live/n0".into() }),
        "expected a delete event for the closed session's node, got {:?}",
        seen
    );
    Ok(())
}

#[tokio::test]
async fn injected_conflict_fails_only_the_targeted_path() -> Result<()> {
    let store = MemoryStore::new();
    let paths: Vec<String> = (0..3).map(|idx| format!("/c/p{}", idx)).collect();
    for path in paths.iter() {
        store.write(path, b"0".to_vec(), Expected::Absent, NodeMode::Persistent).await?;
    }
    store.inject_bad_version("/c/p1");

    let updaters: Vec<DataUpdater> = paths.iter().map(|_| -> DataUpdater { Box::new(|_| Ok(b"1".to_vec())) }).collect();
    let results = store.batch_update(&paths, updaters, NodeMode::Persistent).await;

    assert_eq!(results, vec![true, false, true], "unexpected batch results {:?}", results);
    let p1 = store.read("/c/p1").await?.context("expected path to exist")?;
    assert_eq!(p1.data, b"0".to_vec(), "expected failed path to be unchanged");
    assert_eq!(store.write_attempts("/c/p1"), 2, "expected one create and one failed update attempt");
    Ok(())
}
