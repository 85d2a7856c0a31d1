//! Router tests driven through `tower::ServiceExt::oneshot`.

mod common;

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use bindrop_server::{api::create_router, service::ContentService, state::AppState};

use common::{add_minio_image, content_service, FakeRegistry, RELEASE};

fn router(dir: &TempDir) -> (Router, ContentService) {
    let registry = Arc::new(FakeRegistry::new());
    add_minio_image(&registry, "minio/minio:latest", RELEASE);
    let service = content_service(dir, registry);
    (create_router(AppState::new(service.clone())), service)
}

fn create_request(body: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/create")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn test_create_returns_descriptor() {
    let dir = TempDir::new().unwrap();
    let (app, _service) = router(&dir);

    let response = app
        .oneshot(create_request(r#"{"imagename":"minio/minio:latest"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["minio"], format!("minio.{RELEASE}"));
    assert_eq!(body["MinioSha256"], format!("minio.{RELEASE}.sha256sum"));
    assert_eq!(body["minisig"], format!("minio.{RELEASE}.minisig"));
}

#[tokio::test]
async fn test_create_rejects_bad_body() {
    let dir = TempDir::new().unwrap();
    let (app, _service) = router(&dir);

    let response = app.oneshot(create_request("{not json")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/problem+json"
    );
    let body = body_json(response).await;
    assert_eq!(body["code"], "invalid_request");
}

#[tokio::test]
async fn test_create_reports_failures_as_bad_request() {
    let dir = TempDir::new().unwrap();
    let (app, _service) = router(&dir);

    let response = app
        .oneshot(create_request(r#"{"imagename":"minio/unknown:1"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "image_fetch_failed");
    assert_eq!(body["status"], 400);
}

#[tokio::test]
async fn test_download_streams_artifact() {
    let dir = TempDir::new().unwrap();
    let (app, _service) = router(&dir);

    let response = app
        .clone()
        .oneshot(create_request(r#"{"imagename":"minio/minio:latest"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let name = format!("minio.{RELEASE}");
    let response = app
        .oneshot(get(&format!("/{RELEASE}/{name}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/octet-stream"
    );
    assert_eq!(
        response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
        format!("attachment; filename=\"{name}\"").as_str()
    );
    assert_eq!(body_bytes(response).await, b"#!/bin/sh\necho minio\n");
}

#[tokio::test]
async fn test_download_unknown_release_is_not_found() {
    let dir = TempDir::new().unwrap();
    let (app, _service) = router(&dir);

    let response = app
        .oneshot(get("/RELEASE.2000-01-01T00-00-00Z/minio"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["detail"], "File not found");
}

#[tokio::test]
async fn test_download_missing_file_is_not_found() {
    let dir = TempDir::new().unwrap();
    let (app, _service) = router(&dir);

    app.clone()
        .oneshot(create_request(r#"{"imagename":"minio/minio:latest"}"#))
        .await
        .unwrap();

    let response = app
        .oneshot(get(&format!("/{RELEASE}/no-such-file")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["code"], "file_missing");
}

#[tokio::test]
async fn test_update_serves_content_directories() {
    let dir = TempDir::new().unwrap();
    let (app, service) = router(&dir);

    let response = app
        .clone()
        .oneshot(create_request(r#"{"imagename":"minio/minio:latest"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let hash = std::fs::read_dir(service.base_path())
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .file_name()
        .to_string_lossy()
        .into_owned();

    let response = app
        .oneshot(get(&format!("/update/{hash}/minio.{RELEASE}.sha256sum")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"0123abcd  minio\n");
}

#[tokio::test]
async fn test_healthz_reports_cache() {
    let dir = TempDir::new().unwrap();
    let (app, _service) = router(&dir);

    let response = app
        .clone()
        .oneshot(create_request(r#"{"imagename":"minio/minio:latest"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "bindrop");
    assert_eq!(body["cache"]["entries"], 1);
    assert_eq!(body["cache"]["capacity"], 20);
}

#[tokio::test]
async fn test_download_rejects_quoted_name() {
    let dir = TempDir::new().unwrap();
    let (app, _service) = router(&dir);

    app.clone()
        .oneshot(create_request(r#"{"imagename":"minio/minio:latest"}"#))
        .await
        .unwrap();

    let response = app
        .oneshot(get(&format!("/{RELEASE}/minio%22.bin")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers().get(header::CONTENT_DISPOSITION).is_none());
    let body = body_json(response).await;
    assert_eq!(body["code"], "file_not_found");
}
