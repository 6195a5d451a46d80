mod common;

use std::sync::Arc;

use anyhow::Result;
use common::Post;
use docstore_core::{DocumentError, DocumentStore, Filter, OwnershipGuard};
use docstore_storage_postgres::PostgresConfig;
use serde_json::{json, Map, Value};

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected an object"),
    }
}

#[tokio::test]
async fn only_the_owner_may_mutate() -> Result<()> {
    let (_container, store) = common::create_postgres_container().await?;
    store.save("posts", &Post::new("p1", "alice", "Hello")).await?;

    let err = store.update_with_ownership("posts", "p1", "mallory", &fields(json!({"title": "pwned"}))).await.unwrap_err();
    assert!(matches!(err, DocumentError::NotFoundOrUnauthorized));
    let err = store.update_with_ownership("posts", "missing", "alice", &fields(json!({"title": "x"}))).await.unwrap_err();
    assert!(matches!(err, DocumentError::NotFoundOrUnauthorized));

    store.update_with_ownership("posts", "p1", "alice", &fields(json!({"title": "Edited"}))).await?;
    store.increment_with_ownership("posts", "p1", "alice", &fields(json!({"score": 5}))).await?;
    let post: Post = store.find_one("posts", &Filter::by_object_id("p1")).await?;
    assert_eq!((post.title.as_str(), post.score, post.owner_user_id.as_str()), ("Edited", 5, "alice"));

    // identity and timestamps cannot be rewritten through the guard
    let err = store.update_with_ownership("posts", "p1", "alice", &fields(json!({"object_id": "p2"}))).await.unwrap_err();
    assert!(matches!(err, DocumentError::Translation(_)));
    Ok(())
}

#[tokio::test]
async fn soft_delete_hides_the_document_from_further_mutation() -> Result<()> {
    let (_container, store) = common::create_postgres_container().await?;
    store.save("posts", &Post::new("p1", "alice", "Hello")).await?;

    assert!(matches!(store.delete_with_ownership("posts", "p1", "bob").await, Err(DocumentError::NotFoundOrUnauthorized)));
    store.delete_with_ownership("posts", "p1", "alice").await?;

    let doc: Value = store.find_one("posts", &Filter::by_object_id("p1")).await?;
    assert_eq!(doc["deleted"], json!(true));
    assert!(doc["deleted_date"].as_i64().is_some());

    assert!(matches!(store.delete_with_ownership("posts", "p1", "alice").await, Err(DocumentError::NotFoundOrUnauthorized)));
    assert!(matches!(
        store.increment_with_ownership("posts", "p1", "alice", &fields(json!({"score": 1}))).await,
        Err(DocumentError::NotFoundOrUnauthorized)
    ));
    Ok(())
}

#[tokio::test]
async fn concurrent_increments_are_not_lost() -> Result<()> {
    let (_container, store) = common::create_postgres_container().await?;
    store.save("posts", &Post::new("p1", "alice", "Hello")).await?;
    let store = Arc::new(store);

    let mut handles = Vec::new();
    for i in 0..20 {
        let store = store.clone();
        let owner = if i % 2 == 0 { "alice" } else { "mallory" };
        handles.push(tokio::spawn(async move { store.increment_with_ownership("posts", "p1", owner, &fields(json!({"score": 1}))).await }));
    }
    let mut allowed = 0;
    for handle in handles {
        match handle.await? {
            Ok(()) => allowed += 1,
            Err(DocumentError::NotFoundOrUnauthorized) => {}
            Err(err) => return Err(err.into()),
        }
    }
    assert_eq!(allowed, 10);

    let post: Post = store.find_one("posts", &Filter::by_object_id("p1")).await?;
    assert_eq!(post.score, 10);
    Ok(())
}

#[tokio::test]
async fn owner_field_is_configurable() -> Result<()> {
    let (_container, store) = common::create_postgres_container_with(PostgresConfig::default().with_owner_field("title")).await?;
    store.save("posts", &Post::new("p1", "alice", "Hello")).await?;

    assert!(store.update_with_ownership("posts", "p1", "alice", &fields(json!({"score": 1}))).await.is_err());
    store.update_with_ownership("posts", "p1", "Hello", &fields(json!({"score": 1}))).await?;
    Ok(())
}
