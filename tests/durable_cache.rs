#![cfg(not(target_arch = "wasm32"))]

use std::path::PathBuf;
use std::sync::Arc;

use firestore_sync::firestore::core::{Query, User};
use firestore_sync::firestore::model::{DatabaseId, DocumentKey, FieldPath, Mutation, ResourcePath};
use firestore_sync::firestore::remote::MockDatastore;
use firestore_sync::firestore::value::{FirestoreValue, MapValue};
use firestore_sync::firestore::{FirestoreClient, FirestoreSettings, Source};

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn note(text: &str) -> MapValue {
    let mut map = MapValue::empty();
    map.set(&FieldPath::from_segment("text"), FirestoreValue::from(text));
    map
}

fn cache_path(name: &str) -> PathBuf {
    std::env::temp_dir()
        .join(format!("firestore-sync-tests-{}", std::process::id()))
        .join(format!("{name}.json"))
}

async fn start(path: &PathBuf, datastore: &MockDatastore) -> Arc<FirestoreClient> {
    FirestoreClient::start(
        DatabaseId::default("durable"),
        FirestoreSettings::durable(path),
        Arc::new(datastore.clone()),
        User::new("alice"),
    )
    .await
    .expect("start client")
}

#[tokio::test(flavor = "multi_thread")]
async fn acknowledged_documents_survive_a_restart() {
    let path = cache_path("acknowledged");
    let datastore = MockDatastore::new(DatabaseId::default("durable"));

    let client = start(&path, &datastore).await;
    client
        .write(vec![Mutation::set(key("notes/a"), note("hello"))])
        .await
        .unwrap();
    client.terminate().await.unwrap();

    datastore.set_network_available(false);
    let restarted = start(&path, &datastore).await;
    let cached = restarted.get_document(key("notes/a"), Source::Cache).await.unwrap();
    assert_eq!(cached.unwrap().data(), &note("hello"));

    let notes = Query::new(ResourcePath::from_string("notes").unwrap());
    let snapshot = restarted.get_documents(notes, Source::Cache).await.unwrap();
    assert_eq!(snapshot.documents.len(), 1);
    assert!(snapshot.from_cache);

    restarted.terminate().await.unwrap();
    restarted.clear_persistence().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_writes_are_sent_after_a_restart() {
    let path = cache_path("pending");
    let datastore = MockDatastore::new(DatabaseId::default("durable"));

    let client = start(&path, &datastore).await;
    client.disable_network().await.unwrap();
    let engine = Arc::clone(client.sync_engine());
    // Queue the write without waiting for the acknowledgement that cannot
    // arrive while offline.
    let _acknowledgement = client
        .queue()
        .enqueue(async move { engine.write(vec![Mutation::set(key("notes/b"), note("later"))]).await })
        .await
        .unwrap();
    client.terminate().await.unwrap();
    assert!(datastore.document(&key("notes/b")).is_none());

    let restarted = start(&path, &datastore).await;
    let pending = restarted.get_document(key("notes/b"), Source::Cache).await.unwrap();
    assert_eq!(pending.unwrap().data(), &note("later"));

    restarted.wait_for_pending_writes().await.unwrap();
    assert_eq!(datastore.document(&key("notes/b")).unwrap().data(), &note("later"));

    restarted.terminate().await.unwrap();
    restarted.clear_persistence().await.unwrap();
}
