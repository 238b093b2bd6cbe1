//! Defines the gateway's HTTP routes.
//!
//! ## Structure
//! - **Health**
//!   - `GET  /healthz`, `GET /readyz`
//!
//! - **Multipart uploads**
//!   - `POST /{account}/uploads`: create an upload
//!   - `GET  /{account}/uploads/{prefix}/{id}`: upload state
//!   - `PUT  /{account}/uploads/{prefix}/{id}/{part}`: store a part
//!   - `POST /{account}/uploads/{prefix}/{id}/commit`: commit
//!   - `POST /{account}/uploads/{prefix}/{id}/abort`: abort
//!
//! - **Namespace**
//!   - `PUT  /{account}/{top}/{*path}`: create a directory
//!   - `GET  /{account}/{top}/{*path}`: download a committed object
//!   - `HEAD /{account}/{top}/{*path}`: object metadata only
//!
//! The `uploads` routes are static at the second segment, so they take
//! priority over `{top}`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        namespace_handlers::{get_object, head_object, put_directory},
        upload_handlers::{abort_upload, commit_upload, create_upload, get_upload, upload_part},
    },
    services::upload_service::UploadService,
};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Build the router; handlers share the `UploadService` state.
pub fn routes() -> Router<UploadService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Upload routes
        .route("/{account}/uploads", post(create_upload))
        .route("/{account}/uploads/{prefix}/{id}", get(get_upload))
        .route("/{account}/uploads/{prefix}/{id}/commit", post(commit_upload))
        .route("/{account}/uploads/{prefix}/{id}/abort", post(abort_upload))
        .route("/{account}/uploads/{prefix}/{id}/{part}", put(upload_part))
        // Namespace routes
        .route(
            "/{account}/{top}/{*path}",
            put(put_directory).get(get_object).head(head_object),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handlers::CALLER_HEADER,
        services::{namespace::SqliteNamespace, upload_service::provision_accounts},
        test_support::{ZERO_BYTE_MD5, content_md5_of, memory_pool, test_limits},
    };
    use axum::{
        body::{Body, Bytes, to_bytes},
        http::{HeaderMap, Request, StatusCode, header},
    };
    use base64::{Engine as _, engine::general_purpose};
    use serde_json::{Value, json};
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn app() -> (Router, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = memory_pool().await;
        let ns = SqliteNamespace::new(db.clone(), 100);
        provision_accounts(&ns, &["alice".into(), "bob".into()])
            .await
            .unwrap();
        let service = UploadService::new(db, dir.path(), test_limits());
        (routes().with_state(service), dir)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(CALLER_HEADER, "alice")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(CALLER_HEADER, "alice")
            .body(Body::empty())
            .unwrap()
    }

    fn put_part(uri: &str, bytes: &'static [u8]) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .header(CALLER_HEADER, "alice")
            .header(header::CONTENT_LENGTH, bytes.len())
            .body(Body::from(bytes))
            .unwrap()
    }

    fn error_code(body: &Bytes) -> String {
        let value: Value = serde_json::from_slice(body).unwrap();
        value["code"].as_str().unwrap().to_string()
    }

    /// Create an upload and return its parts directory.
    async fn create(app: &Router, object_path: &str, headers: Value) -> String {
        let (status, resp_headers, body) = send(
            app,
            json_request(
                "POST",
                "/alice/uploads",
                json!({"objectPath": object_path, "headers": headers}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let value: Value = serde_json::from_slice(&body).unwrap();
        let parts_directory = value["partsDirectory"].as_str().unwrap().to_string();
        assert!(parts_directory.ends_with(value["id"].as_str().unwrap()));
        assert_eq!(resp_headers[header::LOCATION], parts_directory.as_str());
        parts_directory
    }

    #[tokio::test]
    async fn health_endpoints_report_ok() {
        let (app, _dir) = app().await;
        let (status, _, _) = send(&app, request("GET", "/healthz")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, body) = send(&app, request("GET", "/readyz")).await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["checks"]["sqlite"]["ok"], true);
        assert_eq!(value["checks"]["disk"]["ok"], true);
    }

    #[tokio::test]
    async fn upload_lifecycle_over_http() {
        let (app, _dir) = app().await;
        let upload = create(
            &app,
            "/alice/stor/big.bin",
            json!({"content-type": "text/plain", "content-length": 6}),
        )
        .await;

        let (status, headers, _) = send(&app, put_part(&format!("{}/0", upload), b"abcd")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let first = headers[header::ETAG].to_str().unwrap().to_string();
        assert_eq!(first, format!("{:x}", md5::compute(b"abcd")));
        let (_, headers, _) = send(&app, put_part(&format!("{}/1", upload), b"ef")).await;
        let second = headers[header::ETAG].to_str().unwrap().to_string();

        let (status, _, body) = send(&app, request("GET", &upload)).await;
        assert_eq!(status, StatusCode::OK);
        let view: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(view["state"], "created");
        assert_eq!(view["partsDirectory"], upload.as_str());
        assert_eq!(view["headers"]["content-length"], "6");

        let (status, headers, _) = send(
            &app,
            json_request(
                "POST",
                &format!("{}/commit", upload),
                json!({"parts": [first, second]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(headers[header::LOCATION], "/alice/stor/big.bin");

        let (_, _, body) = send(&app, request("GET", &upload)).await;
        let view: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(view["state"], "done");
        assert_eq!(view["result"], "committed");
        assert!(view.get("partsDirectory").is_none());
        // the summary is the digest of the ETag values exactly as returned
        let mut digest = md5::Context::new();
        digest.consume(first.as_bytes());
        digest.consume(second.as_bytes());
        let expected = general_purpose::STANDARD.encode(digest.compute().0);
        assert_eq!(view["partsMD5Summary"], expected.as_str());

        let (status, headers, body) = send(&app, request("GET", "/alice/stor/big.bin")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_ref(), b"abcdef");
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
        assert_eq!(headers["content-md5"], content_md5_of(b"abcdef").as_str());
        assert_eq!(headers["durability-level"], "2");

        let (status, headers, body) = send(&app, request("HEAD", "/alice/stor/big.bin")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_LENGTH], "6");
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn empty_commit_then_retry_over_http() {
        let (app, _dir) = app().await;
        let upload = create(&app, "/alice/stor/empty", json!({})).await;
        let commit = format!("{}/commit", upload);

        for _ in 0..2 {
            let (status, _, _) = send(&app, json_request("POST", &commit, json!({"parts": []}))).await;
            assert_eq!(status, StatusCode::NO_CONTENT);
        }
        let (_, _, body) = send(&app, request("GET", &upload)).await;
        let view: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(view["partsMD5Summary"], ZERO_BYTE_MD5);

        let (status, _, body) = send(
            &app,
            json_request("POST", &commit, json!({"parts": ["\"abc\""]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&body), "MultipartUploadInvalidArgument");
    }

    #[tokio::test]
    async fn commits_without_a_part_list_are_invalid() {
        let (app, _dir) = app().await;
        let upload = create(&app, "/alice/stor/kept", json!({})).await;
        let commit = format!("{}/commit", upload);

        for body in [json!({}), json!({"parts": null}), json!({"parts": "abc"}), json!({"parts": [1]})] {
            let (status, _, response) = send(&app, json_request("POST", &commit, body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(error_code(&response), "MultipartUploadInvalidArgument");
        }

        // nothing was committed
        let (_, _, body) = send(&app, request("GET", &upload)).await;
        let view: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(view["state"], "created");
        let (status, _, _) = send(&app, request("GET", "/alice/stor/kept")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn abort_is_idempotent_and_blocks_commit() {
        let (app, _dir) = app().await;
        let upload = create(&app, "/alice/stor/gone", json!({})).await;
        let abort = format!("{}/abort", upload);

        for _ in 0..2 {
            let (status, _, _) = send(&app, request("POST", &abort)).await;
            assert_eq!(status, StatusCode::NO_CONTENT);
        }
        let (status, _, body) = send(
            &app,
            json_request("POST", &format!("{}/commit", upload), json!({"parts": []})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error_code(&body), "InvalidMultipartUploadState");

        let (status, _, body) = send(&app, put_part(&format!("{}/0", upload), b"abcd")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error_code(&body), "InvalidMultipartUploadState");
    }

    #[tokio::test]
    async fn malformed_and_unknown_ids_are_not_found() {
        let (app, _dir) = app().await;
        let upload = create(&app, "/alice/stor/x", json!({})).await;
        let id = upload.rsplit('/').next().unwrap().to_string();
        let prefix = &id[..1];
        let wrong_prefix = if prefix == "0" { "1" } else { "0" };

        for uri in [
            "/alice/uploads/f/foobar/commit".to_string(),
            format!("/alice/uploads/{}/{}/commit", wrong_prefix, id),
            format!("/alice/uploads/0/{}/commit", uuid::Uuid::nil()),
        ] {
            let (status, _, body) =
                send(&app, json_request("POST", &uri, json!({"parts": []}))).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            assert_eq!(error_code(&body), "ResourceNotFound");
        }

        let (status, _, _) = send(&app, request("POST", "/alice/uploads/f/foobar/abort")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_errors_map_to_statuses() {
        let (app, _dir) = app().await;
        let cases = [
            ("/bob/stor/x", StatusCode::FORBIDDEN, "AuthorizationFailed"),
            ("/alice/stor/a/b", StatusCode::NOT_FOUND, "DirectoryDoesNotExist"),
            (
                "/alice/stor",
                StatusCode::BAD_REQUEST,
                "OperationNotAllowedOnDirectory",
            ),
            (
                "/alice",
                StatusCode::BAD_REQUEST,
                "OperationNotAllowedOnRootDirectory",
            ),
        ];
        for (path, status, code) in cases {
            let (got, _, body) = send(
                &app,
                json_request("POST", "/alice/uploads", json!({"objectPath": path})),
            )
            .await;
            assert_eq!(got, status, "{path}");
            assert_eq!(error_code(&body), code, "{path}");
        }

        let (status, _, body) = send(
            &app,
            json_request(
                "POST",
                "/alice/uploads",
                json!({"objectPath": "/alice/stor/x", "headers": {"durability-level": 42}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&body), "InvalidDurabilityLevel");
    }

    #[tokio::test]
    async fn malformed_bodies_are_invalid_parameters() {
        let (app, _dir) = app().await;
        let garbled = Request::builder()
            .method("POST")
            .uri("/alice/uploads")
            .header(CALLER_HEADER, "alice")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, _, body) = send(&app, garbled).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&body), "InvalidParameter");
    }

    #[tokio::test]
    async fn requests_without_a_caller_are_rejected() {
        let (app, _dir) = app().await;
        let anonymous = Request::builder()
            .method("POST")
            .uri("/alice/uploads")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"objectPath": "/alice/stor/x"}).to_string()))
            .unwrap();
        let (status, _, body) = send(&app, anonymous).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(error_code(&body), "AuthorizationFailed");
    }

    #[tokio::test]
    async fn parts_require_a_content_length() {
        let (app, _dir) = app().await;
        let upload = create(&app, "/alice/stor/x", json!({})).await;
        let (status, _, body) = send(&app, request("PUT", &format!("{}/0", upload))).await;
        assert_eq!(status, StatusCode::LENGTH_REQUIRED);
        assert_eq!(error_code(&body), "ContentLengthRequired");
    }

    #[tokio::test]
    async fn directories_are_created_with_put() {
        let (app, _dir) = app().await;
        let mkdir = Request::builder()
            .method("PUT")
            .uri("/alice/stor/photos")
            .header(CALLER_HEADER, "alice")
            .header(header::CONTENT_TYPE, "application/json; type=directory")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&app, mkdir).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        create(&app, "/alice/stor/photos/cat.jpg", json!({})).await;

        let (status, _, body) = send(&app, request("PUT", "/alice/stor/plain")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&body), "InvalidParameter");
    }
}
