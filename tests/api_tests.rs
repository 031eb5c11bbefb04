//! Router-level API tests driven through `tower::ServiceExt::oneshot`.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use backup_controller::models::{Job, JobStatus};

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let ctx = common::TestContext::new().await;
    let response = ctx.router().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["database"]["status"], "healthy");
}

#[tokio::test]
async fn server_crud_round_trip() {
    let ctx = common::TestContext::new().await;

    // Create without a password: no deploy, row persisted.
    let response = ctx
        .router()
        .oneshot(json_request(
            "POST",
            "/api/servers",
            json!({ "name": "web-01", "hostname": "10.0.0.5" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["name"], "web-01");
    assert_eq!(created["port"], 22);
    assert_eq!(created["agent_status"], "disconnected");
    let id = created["id"].as_str().unwrap().to_string();

    let response = ctx
        .router()
        .oneshot(get(&format!("/api/servers/{}", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = ctx
        .router()
        .oneshot(json_request(
            "PUT",
            &format!("/api/servers/{}", id),
            json!({ "hostname": "10.0.0.6" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["hostname"], "10.0.0.6");

    let response = ctx
        .router()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/servers/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = ctx
        .router()
        .oneshot(get(&format!("/api/servers/{}", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_server_fields_rejected() {
    let ctx = common::TestContext::new().await;
    let response = ctx
        .router()
        .oneshot(json_request(
            "POST",
            "/api/servers",
            json!({ "name": "", "hostname": "" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn job_creation_requires_remote_paths() {
    let ctx = common::TestContext::new().await;
    let server = ctx.insert_server("web-01", "10.0.0.5").await;

    let response = ctx
        .router()
        .oneshot(json_request(
            "POST",
            "/api/jobs",
            json!({ "server_id": server.id, "name": "Daily", "remote_paths": [] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn job_creation_requires_backup_root() {
    let ctx = common::TestContext::without_backup_root().await;
    let server = ctx.insert_server("web-01", "10.0.0.5").await;

    let response = ctx
        .router()
        .oneshot(json_request(
            "POST",
            "/api/jobs",
            json!({ "server_id": server.id, "name": "Daily", "remote_paths": ["/etc"] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn job_creation_requires_connected_agent() {
    let ctx = common::TestContext::new().await;
    let server = ctx.insert_server("web-01", "10.0.0.5").await;

    let response = ctx
        .router()
        .oneshot(json_request(
            "POST",
            "/api/jobs",
            json!({ "server_id": server.id, "name": "Daily", "remote_paths": ["/etc"] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn run_rejected_when_agent_disconnected() {
    let ctx = common::TestContext::new().await;
    let server = ctx.insert_server("web-01", "10.0.0.5").await;
    let job = ctx.insert_job(&server, "Daily", &["/etc"]).await;

    let response = ctx
        .router()
        .oneshot(json_request(
            "POST",
            &format!("/api/jobs/{}/run", job.id),
            json!({ "full": false }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn cancel_of_idle_job_is_404() {
    let ctx = common::TestContext::new().await;
    let server = ctx.insert_server("web-01", "10.0.0.5").await;
    let job = ctx.insert_job(&server, "Daily", &["/etc"]).await;

    let response = ctx
        .router()
        .oneshot(json_request(
            "POST",
            &format!("/api/jobs/{}/cancel", job.id),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deleting_server_cascades_to_jobs_and_versions() {
    let ctx = common::TestContext::new().await;
    let server = ctx.insert_server("web-01", "10.0.0.5").await;
    let job = ctx.insert_job(&server, "Daily", &["/etc"]).await;
    ctx.insert_version(&job, "2026-01-01_00-00-00", true).await;

    let response = ctx
        .router()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/servers/{}", server.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    assert!(Job::find_by_id(&ctx.pool, &job.id).await.unwrap().is_none());
    let response = ctx
        .router()
        .oneshot(get(&format!("/api/versions?job_id={}", job.id)))
        .await
        .unwrap();
    let versions = body_json(response).await;
    assert_eq!(versions.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn version_listing_and_delete() {
    let ctx = common::TestContext::new().await;
    let server = ctx.insert_server("web-01", "10.0.0.5").await;
    let job = ctx.insert_job(&server, "Daily", &["/etc"]).await;
    let v1 = ctx.insert_version(&job, "2026-01-01_00-00-00", true).await;
    ctx.insert_version(&job, "2026-01-02_00-00-00", true).await;

    let response = ctx
        .router()
        .oneshot(get(&format!("/api/versions?job_id={}", job.id)))
        .await
        .unwrap();
    let versions = body_json(response).await;
    let list = versions.as_array().unwrap();
    assert_eq!(list.len(), 2);
    // Newest first.
    assert_eq!(list[0]["version_timestamp"], "2026-01-02_00-00-00");

    let response = ctx
        .router()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/versions/{}", v1.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn browse_version_rejects_path_escape() {
    let ctx = common::TestContext::new().await;
    let server = ctx.insert_server("web-01", "10.0.0.5").await;
    let job = ctx.insert_job(&server, "Daily", &["/etc"]).await;
    let version = ctx.insert_version(&job, "2026-01-01_00-00-00", true).await;

    let response = ctx
        .router()
        .oneshot(get(&format!(
            "/api/storage/browse-version?version_id={}&path=/../../../../../../etc",
            version.id
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn upload_requires_running_version() {
    let ctx = common::TestContext::new().await;
    let server = ctx.insert_server("web-01", "10.0.0.5").await;
    let job = ctx.insert_job(&server, "Daily", &["/etc"]).await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/files/upload")
        .header("x-job-id", &job.id)
        .header("x-relative-path", "etc/hosts")
        .header("x-total-size", "5")
        .body(Body::from("hello"))
        .unwrap();
    let response = ctx.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn upload_streams_into_running_version() {
    let ctx = common::TestContext::new().await;
    let server = ctx.insert_server("web-01", "10.0.0.5").await;
    let job = ctx.insert_job(&server, "Daily", &["/etc"]).await;
    let version = ctx.insert_version(&job, "2026-01-01_00-00-00", false).await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/files/upload")
        .header("x-job-id", &job.id)
        .header("x-relative-path", "etc/hosts")
        .header("x-total-size", "5")
        .body(Body::from("hello"))
        .unwrap();
    let response = ctx.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let on_disk =
        std::fs::read(std::path::Path::new(&version.local_path).join("etc/hosts")).unwrap();
    assert_eq!(on_disk, b"hello");
}

#[tokio::test]
async fn upload_size_mismatch_discards_partial_file() {
    let ctx = common::TestContext::new().await;
    let server = ctx.insert_server("web-01", "10.0.0.5").await;
    let job = ctx.insert_job(&server, "Daily", &["/etc"]).await;
    let version = ctx.insert_version(&job, "2026-01-01_00-00-00", false).await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/files/upload")
        .header("x-job-id", &job.id)
        .header("x-relative-path", "etc/hosts")
        .header("x-total-size", "999")
        .body(Body::from("hello"))
        .unwrap();
    let response = ctx.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert!(!std::path::Path::new(&version.local_path)
        .join("etc/hosts")
        .exists());
}

#[tokio::test]
async fn zstd_upload_is_decompressed() {
    let ctx = common::TestContext::new().await;
    let server = ctx.insert_server("web-01", "10.0.0.5").await;
    let job = ctx.insert_job(&server, "Daily", &["/etc"]).await;
    let version = ctx.insert_version(&job, "2026-01-01_00-00-00", false).await;

    let plain = b"compressible compressible compressible".to_vec();
    let compressed = zstd::encode_all(plain.as_slice(), 3).unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/api/files/upload")
        .header("x-job-id", &job.id)
        .header("x-relative-path", "blob.txt")
        .header("x-total-size", plain.len().to_string())
        .header("content-encoding", "zstd")
        .body(Body::from(compressed))
        .unwrap();
    let response = ctx.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let on_disk =
        std::fs::read(std::path::Path::new(&version.local_path).join("blob.txt")).unwrap();
    assert_eq!(on_disk, plain);
}

#[tokio::test]
async fn upload_rejects_escaping_relative_path() {
    let ctx = common::TestContext::new().await;
    let server = ctx.insert_server("web-01", "10.0.0.5").await;
    let job = ctx.insert_job(&server, "Daily", &["/etc"]).await;
    ctx.insert_version(&job, "2026-01-01_00-00-00", false).await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/files/upload")
        .header("x-job-id", &job.id)
        .header("x-relative-path", "../../outside.txt")
        .header("x-total-size", "5")
        .body(Body::from("hello"))
        .unwrap();
    let response = ctx.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn storage_settings_move_rewrites_job_paths() {
    let ctx = common::TestContext::new().await;
    let server = ctx.insert_server("web-01", "10.0.0.5").await;
    let job = ctx.insert_job(&server, "Daily", &["/etc"]).await;
    std::fs::write(
        std::path::Path::new(&job.local_path).join("marker.txt"),
        b"x",
    )
    .unwrap();

    let new_root = tempfile::tempdir().unwrap();
    let response = ctx
        .router()
        .oneshot(json_request(
            "PUT",
            "/api/storage/settings",
            json!({ "backup_root": new_root.path().to_string_lossy() }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let moved = Job::find_by_id(&ctx.pool, &job.id).await.unwrap().unwrap();
    assert!(moved.local_path.starts_with(&*new_root.path().to_string_lossy()));
    assert!(std::path::Path::new(&moved.local_path)
        .join("marker.txt")
        .exists());
}

#[tokio::test]
async fn job_status_starts_idle() {
    let ctx = common::TestContext::new().await;
    let server = ctx.insert_server("web-01", "10.0.0.5").await;
    let job = ctx.insert_job(&server, "Daily", &["/etc"]).await;
    assert_eq!(job.status, JobStatus::Idle);

    let response = ctx
        .router()
        .oneshot(get(&format!("/api/jobs/{}/logs", job.id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 0);
}
