use std::time::Duration;

use bytes::Bytes;
use d_registry::config_key;
use d_registry::ChangeEvent;
use d_registry::Error;
use d_registry::KvStore;
use d_registry::MemoryStore;
use d_registry::Registry;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn registration_lifecycle() {
    let registry = Registry::with_store(MemoryStore::new());

    registry.register("svc-a", "/bin/svc-a").await.unwrap();
    assert!(matches!(
        registry.register("svc-a", "/bin/other").await,
        Err(Error::KeyConflict(_))
    ));
    assert_eq!(registry.list_registered_keys().await.unwrap(), vec!["svc-a"]);

    registry.unregister("svc-a").await.unwrap();
    assert!(registry.list_registered_keys().await.unwrap().is_empty());

    registry.close().await.unwrap();
}

#[tokio::test]
async fn config_written_out_of_band_is_visible() {
    let store = MemoryStore::new();
    let registry = Registry::with_store(store.clone());

    assert!(matches!(
        registry.get_config("db.url").await,
        Err(Error::KeyNotFound(_))
    ));

    store
        .put(config_key("db.url").as_bytes(), Bytes::from_static(b"postgres://db:5432/app"))
        .await
        .unwrap();

    assert_eq!(
        registry.get_config("db.url").await.unwrap(),
        Bytes::from_static(b"postgres://db:5432/app")
    );
}

#[tokio::test]
async fn watch_follows_config_until_cancelled() {
    let store = MemoryStore::new();
    let registry = Registry::with_store(store.clone());
    let cancel = CancellationToken::new();

    let mut changes = registry.watch("feature.flags", cancel.clone()).await.unwrap();

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            let key = config_key("feature.flags");
            for flags in ["a", "a,b", "a,b,c"] {
                store.put(key.as_bytes(), Bytes::from(flags)).await.unwrap();
            }
            store.delete(key.as_bytes()).await.unwrap();
        })
    };

    let mut seen = Vec::new();
    while seen.len() < 4 {
        let event = tokio::time::timeout(Duration::from_secs(1), changes.next())
            .await
            .expect("watch stalled")
            .expect("watch ended early")
            .unwrap();
        seen.push(event);
    }
    writer.await.unwrap();

    assert_eq!(
        seen,
        vec![
            ChangeEvent::Set(Bytes::from("a")),
            ChangeEvent::Set(Bytes::from("a,b")),
            ChangeEvent::Set(Bytes::from("a,b,c")),
            ChangeEvent::Removed,
        ]
    );

    cancel.cancel();
    assert!(changes.next().await.is_none());
}

#[tokio::test]
async fn competing_processes_share_one_store() {
    let store = MemoryStore::new();
    let first = Registry::with_store(store.clone());
    let second = Registry::with_store(store.clone());

    first.register("leader", "/srv/node-1").await.unwrap();
    assert!(matches!(
        second.register("leader", "/srv/node-2").await,
        Err(Error::KeyConflict(_))
    ));
    assert_eq!(second.registered_path("leader").await.unwrap(), "/srv/node-1");

    first.unregister("leader").await.unwrap();
    second.register("leader", "/srv/node-2").await.unwrap();
    assert_eq!(first.registered_path("leader").await.unwrap(), "/srv/node-2");
}
