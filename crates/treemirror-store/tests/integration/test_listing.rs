//! Listing and pagination against a mock store

use futures::TryStreamExt;
use treemirror_core::ports::{IRemoteStore, RemoteStoreError};
use treemirror_store::{RetryPolicy, StoreClient};
use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, ResponseTemplate};

use crate::common::{self, FILES_PATH, STORE};

#[tokio::test]
async fn test_single_page_listing() {
    let (server, client) = common::setup_store_mock().await;

    Mock::given(method("GET"))
        .and(path(FILES_PATH))
        .and(query_param("path_prefix", "/repo"))
        .and(header("authorization", "Bearer test-api-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [
                common::file_json("/repo/a.txt", "2024-03-01T10:00:00.000Z", 5),
                common::file_json("/repo/src/b.rs", "2024-03-02T10:00:00.000Z", 7)
            ],
            "next_cursor": null
        })))
        .expect(1)
        .mount(&server)
        .await;

    let records: Vec<_> = client
        .list_files(STORE, Some("/repo"))
        .try_collect()
        .await
        .expect("listing failed");

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].external_id.as_str(), "/repo/a.txt");
    assert_eq!(records[0].object_id.as_deref(), Some("obj-/repo/a.txt"));
    assert_eq!(records[0].size, Some(5));
    assert!(records[0].hash.is_some());
    assert_eq!(records[1].external_id.as_str(), "/repo/src/b.rs");
}

#[tokio::test]
async fn test_pagination_follows_cursor() {
    let (server, client) = common::setup_store_mock().await;

    Mock::given(method("GET"))
        .and(path(FILES_PATH))
        .and(query_param_is_missing("cursor"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [
                common::file_json("/repo/1.txt", "2024-03-01T10:00:00.000Z", 1),
                common::file_json("/repo/2.txt", "2024-03-01T10:00:00.000Z", 1)
            ],
            "next_cursor": "page-2"
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(FILES_PATH))
        .and(query_param("cursor", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [common::file_json("/repo/3.txt", "2024-03-01T10:00:00.000Z", 1)]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let ids: Vec<String> = client
        .list_files(STORE, Some("/repo"))
        .map_ok(|record| record.external_id.to_string())
        .try_collect()
        .await
        .expect("listing failed");

    assert_eq!(ids, vec!["/repo/1.txt", "/repo/2.txt", "/repo/3.txt"]);
}

#[tokio::test]
async fn test_listing_without_prefix() {
    let (server, client) = common::setup_store_mock().await;

    Mock::given(method("GET"))
        .and(path(FILES_PATH))
        .and(query_param_is_missing("path_prefix"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [common::file_json("notes/a.md", "2024-03-01T10:00:00.000Z", 3)]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let records: Vec<_> = client.list_files(STORE, None).try_collect().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].external_id.as_str(), "notes/a.md");
}

#[tokio::test]
async fn test_listing_is_lazy() {
    let (server, client) = common::setup_store_mock().await;

    Mock::given(method("GET"))
        .and(path(FILES_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .expect(0)
        .mount(&server)
        .await;

    let stream = client.list_files(STORE, None);
    drop(stream);
}

#[tokio::test]
async fn test_listing_unknown_store_is_not_found() {
    let (server, client) = common::setup_store_mock().await;

    Mock::given(method("GET"))
        .and(path(FILES_PATH))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(serde_json::json!({"error": "Store not found"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let result: Result<Vec<_>, _> = client.list_files(STORE, None).try_collect().await;
    match result {
        Err(RemoteStoreError::NotFound(message)) => assert!(message.contains("Store not found")),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_listing_retries_transient_errors() {
    let (server, client) = common::setup_store_mock().await;

    Mock::given(method("GET"))
        .and(path(FILES_PATH))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(FILES_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [common::file_json("/repo/a.txt", "2024-03-01T10:00:00.000Z", 5)]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let records: Vec<_> = client.list_files(STORE, None).try_collect().await.unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn test_listing_gives_up_after_retry_budget() {
    let (server, client) = common::setup_store_mock().await;

    Mock::given(method("GET"))
        .and(path(FILES_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .expect(4)
        .mount(&server)
        .await;

    let result: Result<Vec<_>, _> = client.list_files(STORE, None).try_collect().await;
    match result {
        Err(RemoteStoreError::Other(message)) => {
            assert!(message.contains("500"));
            assert!(message.contains("upstream exploded"));
        }
        other => panic!("expected Other, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_listing_is_an_error() {
    let (server, _) = common::setup_store_mock().await;
    let client = StoreClient::with_base_url(common::API_KEY, server.uri())
        .with_retry_policy(RetryPolicy::none());

    Mock::given(method("GET"))
        .and(path(FILES_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let result: Result<Vec<_>, _> = client.list_files(STORE, None).try_collect().await;
    assert!(matches!(result, Err(RemoteStoreError::Other(_))));
}
