mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{multipart_body, seed_user, send, spawn_app};
use stashbin::config::Config;
use stashbin::services::scanner::{NoOpScanner, testing::AlwaysInfectedScanner};
use std::sync::Arc;

fn upload_request(
    content_type: &str,
    body: Vec<u8>,
    token: Option<&str>,
    extra_headers: &[(&str, &str)],
) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/upload")
        .header("content-type", content_type);
    if let Some(token) = token {
        builder = builder.header("token", token);
    }
    for (name, value) in extra_headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::from(body)).unwrap()
}

#[tokio::test]
async fn multipart_happy_path() {
    let test = spawn_app(Config::default(), Arc::new(NoOpScanner)).await;
    let user = seed_user(&test.state, "uploader", 0).await;

    let (content_type, body) =
        multipart_body(&[], &[("files[]", "hello.bin", "application/octet-stream", b"hello")]);
    let (status, json) = send(
        &test.app,
        upload_request(&content_type, body, Some(&user.token), &[]),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    let file = &json["files"][0];
    assert_eq!(file["size"], 5);
    assert_eq!(
        file["hash"].as_str().unwrap(),
        blake3::hash(b"hello").to_hex().to_string()
    );

    let name = file["name"].as_str().unwrap();
    let (identifier, ext) = name.split_once('.').unwrap();
    assert_eq!(identifier.len(), 8);
    assert!(identifier.chars().all(|c| c.is_ascii_alphanumeric()));
    assert_eq!(ext, "bin");

    assert!(test.state.paths.file(name).exists());
    // No reservation survives the request.
    assert_eq!(test.state.ids.held_count(), 0);
}

#[tokio::test]
async fn duplicate_upload_is_marked_repeated() {
    let test = spawn_app(Config::default(), Arc::new(NoOpScanner)).await;
    let user = seed_user(&test.state, "dedup", 0).await;

    let (content_type, body) =
        multipart_body(&[], &[("files[]", "a.bin", "application/octet-stream", b"same-bytes")]);
    let (_, first) = send(
        &test.app,
        upload_request(&content_type, body.clone(), Some(&user.token), &[]),
    )
    .await;

    let (status, second) = send(
        &test.app,
        upload_request(&content_type, body, Some(&user.token), &[]),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["files"][0]["repeated"], true);
    assert_eq!(second["files"][0]["name"], first["files"][0]["name"]);
}

#[tokio::test]
async fn empty_file_is_rejected() {
    let test = spawn_app(Config::default(), Arc::new(NoOpScanner)).await;

    let (content_type, body) =
        multipart_body(&[], &[("files[]", "empty.bin", "application/octet-stream", b"")]);
    let (status, json) = send(&test.app, upload_request(&content_type, body, None, &[])).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);
    assert!(
        json["description"]
            .as_str()
            .unwrap()
            .contains("Empty files")
    );
}

#[tokio::test]
async fn blacklisted_extension_is_rejected() {
    let test = spawn_app(Config::default(), Arc::new(NoOpScanner)).await;

    let (content_type, body) =
        multipart_body(&[], &[("files[]", "evil.exe", "application/x-dosexec", b"MZ")]);
    let (status, json) = send(&test.app, upload_request(&content_type, body, None, &[])).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["description"].as_str().unwrap().contains(".exe"));
}

#[tokio::test]
async fn infected_upload_is_rejected_and_removed() {
    let config = Config {
        scan_enabled: true,
        ..Config::default()
    };
    let test = spawn_app(config, Arc::new(AlwaysInfectedScanner)).await;

    let (content_type, body) =
        multipart_body(&[], &[("files[]", "cat.png", "image/png", b"fake image bytes")]);
    let (status, json) = send(&test.app, upload_request(&content_type, body, None, &[])).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        json["description"]
            .as_str()
            .unwrap()
            .contains("Eicar-Test-Signature")
    );

    // The staged file must not survive the rejection.
    let mut entries = tokio::fs::read_dir(test.state.paths.uploads()).await.unwrap();
    let mut stray_files = Vec::new();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        if entry.file_type().await.unwrap().is_file() {
            stray_files.push(entry.file_name());
        }
    }
    assert!(stray_files.is_empty(), "staged upload leaked: {stray_files:?}");
}

#[tokio::test]
async fn private_mode_requires_token() {
    let config = Config {
        private: true,
        ..Config::default()
    };
    let test = spawn_app(config, Arc::new(NoOpScanner)).await;

    let (content_type, body) =
        multipart_body(&[], &[("files[]", "x.bin", "application/octet-stream", b"data")]);
    let (status, _) = send(&test.app, upload_request(&content_type, body, None, &[])).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn retention_age_sets_expiry() {
    let test = spawn_app(Config::default(), Arc::new(NoOpScanner)).await;
    let user = seed_user(&test.state, "ages", 0).await;

    let (content_type, body) =
        multipart_body(&[], &[("files[]", "t.bin", "application/octet-stream", b"temp")]);
    let (status, json) = send(
        &test.app,
        upload_request(&content_type, body, Some(&user.token), &[("age", "24")]),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(json["files"][0]["expirydate"].is_i64());
}

#[tokio::test]
async fn disallowed_retention_age_is_rejected() {
    let test = spawn_app(Config::default(), Arc::new(NoOpScanner)).await;
    let user = seed_user(&test.state, "badage", 0).await;

    let (content_type, body) =
        multipart_body(&[], &[("files[]", "t.bin", "application/octet-stream", b"temp")]);
    let (status, json) = send(
        &test.app,
        upload_request(&content_type, body, Some(&user.token), &[("age", "99999")]),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        json["description"]
            .as_str()
            .unwrap()
            .contains("retention period")
    );
}

#[tokio::test]
async fn upload_with_invalid_token_is_rejected() {
    let test = spawn_app(Config::default(), Arc::new(NoOpScanner)).await;

    let (content_type, body) =
        multipart_body(&[], &[("files[]", "x.bin", "application/octet-stream", b"data")]);
    let (status, json) = send(
        &test.app,
        upload_request(&content_type, body, Some("bogus-token"), &[]),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["code"], 10001);
}
