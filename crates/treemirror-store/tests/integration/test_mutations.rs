//! Uploads and deletes against a mock store

use treemirror_core::domain::ExternalId;
use treemirror_core::ports::{IRemoteStore, RemoteStoreError, UploadBody};
use treemirror_store::client::{HASH_HEADER, MTIME_HEADER, PATH_HEADER, SIZE_HEADER};
use wiremock::matchers::{body_string, header, method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use crate::common::{self, FILES_PATH, STORE};

// ============================================================================
// Upload tests
// ============================================================================

#[tokio::test]
async fn test_streamed_upload_sends_content_and_metadata() {
    let (server, client) = common::setup_store_mock().await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.bin");
    let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&file, &content).unwrap();

    Mock::given(method("PUT"))
        .and(path(FILES_PATH))
        .and(query_param("external_id", "/repo/a.bin"))
        .and(query_param("overwrite", "true"))
        .and(header(HASH_HEADER, common::sample_digest().as_str()))
        .and(header(MTIME_HEADER, "2024-03-01T10:00:00.250Z"))
        .and(header(PATH_HEADER, "/repo/a.bin"))
        .and(header(SIZE_HEADER, "200000"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let request = common::upload_request("/repo/a.bin", common::stream_body(&file), 200_000);
    client.upload_file(STORE, request).await.expect("upload failed");

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].body, content);
}

#[tokio::test]
async fn test_text_upload() {
    let (server, client) = common::setup_store_mock().await;

    Mock::given(method("PUT"))
        .and(path(FILES_PATH))
        .and(query_param("external_id", "/repo/notes.md"))
        .and(body_string("# Notes\n"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let request = common::upload_request(
        "/repo/notes.md",
        UploadBody::Text("# Notes\n".to_string()),
        8,
    );
    client.upload_file(STORE, request).await.unwrap();
}

#[tokio::test]
async fn test_upload_payment_required_is_quota() {
    let (server, client) = common::setup_store_mock().await;

    Mock::given(method("PUT"))
        .and(path(FILES_PATH))
        .respond_with(ResponseTemplate::new(402).set_body_string("payment required"))
        .expect(1)
        .mount(&server)
        .await;

    let request = common::upload_request("/repo/a.txt", UploadBody::Text("a".to_string()), 1);
    let err = client.upload_file(STORE, request).await.unwrap_err();
    assert!(err.is_quota(), "{err:?}");
}

#[tokio::test]
async fn test_upload_quota_message_is_classified() {
    let (server, client) = common::setup_store_mock().await;

    Mock::given(method("PUT"))
        .and(path(FILES_PATH))
        .respond_with(
            ResponseTemplate::new(403)
                .set_body_json(serde_json::json!({"error": "Monthly usage limit reached"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let request = common::upload_request("/repo/a.txt", UploadBody::Text("a".to_string()), 1);
    let err = client.upload_file(STORE, request).await.unwrap_err();
    match err {
        RemoteStoreError::QuotaExceeded(message) => {
            assert!(message.contains("Monthly usage limit reached"))
        }
        other => panic!("expected quota, got {other:?}"),
    }
}

#[tokio::test]
async fn test_upload_rejected_is_other() {
    let (server, client) = common::setup_store_mock().await;

    Mock::given(method("PUT"))
        .and(path(FILES_PATH))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(serde_json::json!({"message": "bad encoding"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let request = common::upload_request("/repo/a.txt", UploadBody::Text("a".to_string()), 1);
    let err = client.upload_file(STORE, request).await.unwrap_err();
    assert!(matches!(err, RemoteStoreError::Other(ref m) if m.contains("bad encoding")));
}

#[tokio::test]
async fn test_streamed_upload_is_retried_after_throttling() {
    let (server, client) = common::setup_store_mock().await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.txt");
    std::fs::write(&file, b"hello").unwrap();

    Mock::given(method("PUT"))
        .and(path(FILES_PATH))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("PUT"))
        .and(path(FILES_PATH))
        .and(body_string("hello"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let request = common::upload_request("/repo/a.txt", common::stream_body(&file), 5);
    client.upload_file(STORE, request).await.unwrap();
}

#[tokio::test]
async fn test_upload_of_missing_file_sends_nothing() {
    let (server, client) = common::setup_store_mock().await;

    let request = common::upload_request(
        "/repo/gone.txt",
        common::stream_body("/definitely/not/here.txt"),
        1,
    );
    let err = client.upload_file(STORE, request).await.unwrap_err();

    assert!(matches!(err, RemoteStoreError::Other(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
}

// ============================================================================
// Delete tests
// ============================================================================

#[tokio::test]
async fn test_delete_file() {
    let (server, client) = common::setup_store_mock().await;

    Mock::given(method("DELETE"))
        .and(path(FILES_PATH))
        .and(query_param("external_id", "/repo/old.txt"))
        .and(header("authorization", "Bearer test-api-key"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    client
        .delete_file(STORE, &ExternalId::new("/repo/old.txt").unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete_missing_is_not_found() {
    let (server, client) = common::setup_store_mock().await;

    Mock::given(method("DELETE"))
        .and(path(FILES_PATH))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let err = client
        .delete_file(STORE, &ExternalId::new("/repo/old.txt").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteStoreError::NotFound(_)));
}
