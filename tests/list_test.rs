mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{multipart_body, seed_user, send, spawn_app};
use stashbin::config::Config;
use stashbin::entities::users::permissions;
use stashbin::services::scanner::NoOpScanner;
use std::sync::Arc;

async fn upload_named(test: &common::TestApp, token: &str, filename: &str, data: &[u8]) -> String {
    let (content_type, body) =
        multipart_body(&[], &[("files[]", filename, "application/octet-stream", data)]);
    let request = Request::builder()
        .method("POST")
        .uri("/api/upload")
        .header("content-type", content_type)
        .header("token", token)
        .body(Body::from(body))
        .unwrap();
    let (status, json) = send(&test.app, request).await;
    assert_eq!(status, StatusCode::OK);
    json["files"][0]["name"].as_str().unwrap().to_string()
}

fn list_request(uri: &str, token: &str, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri).header("token", token);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn lists_own_uploads() {
    let test = spawn_app(Config::default(), Arc::new(NoOpScanner)).await;
    let alice = seed_user(&test.state, "alice", 0).await;
    let bob = seed_user(&test.state, "bob", 0).await;

    upload_named(&test, &alice.token, "mine.txt", b"alice data").await;
    upload_named(&test, &bob.token, "theirs.txt", b"bob data").await;

    let (status, json) = send(&test.app, list_request("/api/uploads", &alice.token, &[])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 1);
    assert_eq!(json["files"][0]["original"], "mine.txt");
    // Uploader IPs are moderator-only.
    assert!(json["files"][0]["ip"].is_null());
}

#[tokio::test]
async fn text_query_quota_applies() {
    let test = spawn_app(Config::default(), Arc::new(NoOpScanner)).await;
    let user = seed_user(&test.state, "quota", 0).await;

    let (status, json) = send(
        &test.app,
        list_request("/api/uploads", &user.token, &[("filters", "a b c d")]),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        json["description"]
            .as_str()
            .unwrap()
            .contains("text queries")
    );
}

#[tokio::test]
async fn moderator_bypasses_quota_and_sees_all() {
    let test = spawn_app(Config::default(), Arc::new(NoOpScanner)).await;
    let user = seed_user(&test.state, "plain", 0).await;
    let moderator = seed_user(&test.state, "mod", permissions::MODERATOR).await;

    upload_named(&test, &user.token, "one.txt", b"one").await;

    let (status, json) = send(
        &test.app,
        list_request(
            "/api/uploads",
            &moderator.token,
            &[("all", "1"), ("filters", "a b c d e")],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 0);

    let (_, json) = send(
        &test.app,
        list_request("/api/uploads", &moderator.token, &[("all", "1")]),
    )
    .await;
    assert_eq!(json["count"], 1);
}

#[tokio::test]
async fn all_header_is_moderator_only() {
    let test = spawn_app(Config::default(), Arc::new(NoOpScanner)).await;
    let user = seed_user(&test.state, "normie", 0).await;

    let (status, _) = send(
        &test.app,
        list_request("/api/uploads", &user.token, &[("all", "1")]),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn filter_matches_original_name() {
    let test = spawn_app(Config::default(), Arc::new(NoOpScanner)).await;
    let user = seed_user(&test.state, "searcher", 0).await;

    upload_named(&test, &user.token, "report-final.txt", b"alpha").await;
    upload_named(&test, &user.token, "holiday.jpg", b"beta").await;

    let (status, json) = send(
        &test.app,
        list_request("/api/uploads", &user.token, &[("filters", "report*")]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 1);
    assert_eq!(json["files"][0]["original"], "report-final.txt");
}

#[tokio::test]
async fn get_single_upload_scoped_to_owner() {
    let test = spawn_app(Config::default(), Arc::new(NoOpScanner)).await;
    let owner = seed_user(&test.state, "owner", 0).await;
    let other = seed_user(&test.state, "other", 0).await;

    let name = upload_named(&test, &owner.token, "private.txt", b"secret").await;

    let uri = format!("/api/upload/get/{name}");
    let (status, json) = send(&test.app, list_request(&uri, &owner.token, &[])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["file"]["name"], name.as_str());

    let (status, _) = send(&test.app, list_request(&uri, &other.token, &[])).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_and_bulkdelete_report_failures() {
    let test = spawn_app(Config::default(), Arc::new(NoOpScanner)).await;
    let user = seed_user(&test.state, "wiper", 0).await;

    let name = upload_named(&test, &user.token, "doomed.txt", b"doomed").await;

    let body = serde_json::json!({ "field": "name", "values": [name, "missing.bin"] });
    let request = Request::builder()
        .method("POST")
        .uri("/api/upload/bulkdelete")
        .header("content-type", "application/json")
        .header("token", user.token.as_str())
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, json) = send(&test.app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["failed"].as_array().unwrap().len(), 1);
    assert_eq!(json["failed"][0], "missing.bin");
    assert!(!test.state.paths.file(&name).exists());
}
