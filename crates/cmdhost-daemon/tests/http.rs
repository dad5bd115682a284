//! End-to-end tests of the HTTP surface, driven in-process

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use cmdhost_core::{ExecutionConfig, PoolConfig, WorkerPool};
use cmdhost_daemon::router;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

struct TestServer {
    app: Router,
    pool: Arc<WorkerPool>,
    root: TempDir,
}

impl TestServer {
    fn new(workers: usize) -> Self {
        let root = tempfile::tempdir().unwrap();
        let pool = Arc::new(WorkerPool::new(
            PoolConfig {
                num_workers: workers,
                max_queue_depth: None,
            },
            ExecutionConfig::builder().workspace_root(root.path()).build(),
        ));
        let app = router(Arc::clone(&pool), 16 * 1024 * 1024);
        Self { app, pool, root }
    }

    async fn post(&self, body: Value, accept: Option<&str>) -> (StatusCode, String, Vec<u8>) {
        let mut request = Request::builder()
            .method("POST")
            .uri("/run-command")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(accept) = accept {
            request = request.header(header::ACCEPT, accept);
        }
        let request = request.body(Body::from(body.to_string())).unwrap();

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string())
            .unwrap_or_default();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec();
        (status, content_type, body)
    }

    async fn post_json(&self, body: Value) -> (StatusCode, Value) {
        let (status, _, body) = self.post(body, Some("application/json")).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn assert_no_workspaces_left(&self) {
        for _ in 0..200 {
            if workspace_count(self.root.path()) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("workspaces left behind in {}", self.root.path().display());
    }
}

fn workspace_count(root: &Path) -> usize {
    std::fs::read_dir(root).map_or(0, Iterator::count)
}

/// Split a multipart/mixed body into (headers, content) pairs
fn parts(content_type: &str, body: &[u8]) -> Vec<(String, Vec<u8>)> {
    let boundary = content_type
        .split("boundary=")
        .nth(1)
        .expect("boundary parameter");
    let body = String::from_utf8_lossy(body).into_owned();
    let closing = format!("--{boundary}--\r\n");
    assert!(body.ends_with(&closing), "missing terminal boundary");

    body[..body.len() - closing.len()]
        .split(&format!("--{boundary}\r\n"))
        .skip(1)
        .map(|part| {
            let (headers, content) = part.split_once("\r\n\r\n").unwrap();
            let content = content.strip_suffix("\r\n").unwrap();
            (headers.to_string(), content.as_bytes().to_vec())
        })
        .collect()
}

#[tokio::test]
async fn health_reports_pool() {
    let server = TestServer::new(3);
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();

    let response = server.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["workers"], 3);
    assert_eq!(health["active_workers"], 0);
    assert_eq!(server.pool.status().busy, 0);
}

#[tokio::test]
async fn echo_streams_multipart_metadata() {
    let server = TestServer::new(2);
    let (status, content_type, body) = server
        .post(json!({"command": ["echo", "hello"]}), None)
        .await;

    assert_eq!(status, StatusCode::OK);
    assert!(content_type.starts_with("multipart/mixed; boundary="));

    let parts = parts(&content_type, &body);
    assert_eq!(parts.len(), 1);
    assert!(parts[0].0.contains("Content-Type: application/json"));

    let metadata: Value = serde_json::from_slice(&parts[0].1).unwrap();
    assert_eq!(metadata["status"], "COMPLETED");
    assert_eq!(metadata["exit_code"], 0);
    assert_eq!(metadata["stdout"], "hello\n");
    assert_eq!(metadata["command"], "echo hello");
    assert!(metadata["execution_stats"]["started_at"].is_string());

    server.assert_no_workspaces_left().await;
}

#[tokio::test]
async fn output_files_follow_metadata_in_request_order() {
    let server = TestServer::new(1);
    let (status, content_type, body) = server
        .post(
            json!({
                "command": ["sh", "-c", "printf generated > out.txt"],
                "input_files": [{"relative_path": "a/b.txt", "content_base64": BASE64.encode("C")}],
                "output_files": ["out.txt", "a/b.txt", "absent.txt"],
            }),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let parts = parts(&content_type, &body);
    assert_eq!(parts.len(), 3);

    let metadata: Value = serde_json::from_slice(&parts[0].1).unwrap();
    assert_eq!(metadata["status"], "MISSING_OUTPUT_FILES");
    assert_eq!(metadata["missing_files"], json!(["absent.txt"]));
    assert_eq!(metadata["output_files"], json!(["out.txt", "a/b.txt"]));

    assert!(parts[1].0.contains("Content-Type: application/octet-stream"));
    assert!(parts[1].0.contains("filename=\"out.txt\""));
    assert_eq!(parts[1].1, b"generated");
    assert!(parts[2].0.contains("filename=\"a/b.txt\""));
    assert_eq!(parts[2].1, b"C");

    server.assert_no_workspaces_left().await;
}

#[tokio::test]
async fn json_mode_round_trips_files() {
    let server = TestServer::new(1);
    let (status, body) = server
        .post_json(json!({
            "arguments": ["cat", "nested/a.txt"],
            "input_files": [{"relative_path": "nested/a.txt", "content_base64": BASE64.encode("x")}],
            "output_files": ["nested/a.txt"],
        }))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "COMPLETED");
    assert_eq!(body["stdout"], "x");
    assert_eq!(body["output_files"][0]["relative_path"], "nested/a.txt");
    let content = BASE64
        .decode(body["output_files"][0]["content_base64"].as_str().unwrap())
        .unwrap();
    assert_eq!(content, b"x");

    server.assert_no_workspaces_left().await;
}

#[tokio::test]
async fn command_failures_are_results_not_http_errors() {
    let server = TestServer::new(2);

    let (status, body) = server.post_json(json!({"command": ["false"]})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "FAILED");
    assert_eq!(body["exit_code"], 1);

    let (status, body) = server
        .post_json(json!({"command": ["sleep", "5"], "timeout_secs": 0.1}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "TIMEOUT");
    assert!(body["exit_code"].is_null());

    let (status, body) = server
        .post_json(json!({"command": ["sh", "-c", "kill -9 $$"], "output_files": ["never"]}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "OOM");
    assert_eq!(body["signal_num"], 9);
    assert_eq!(body["missing_files"], json!(["never"]));

    server.assert_no_workspaces_left().await;
}

#[tokio::test]
async fn client_errors_are_rejected_before_spawning() {
    let server = TestServer::new(1);

    let (status, body) = server
        .post_json(json!({
            "command": ["true"],
            "input_files": [{"relative_path": "../escape.txt", "content_base64": ""}],
        }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "InvalidRequest");
    assert!(!server.root.path().parent().unwrap().join("escape.txt").exists());

    let (status, body) = server
        .post_json(json!({"command": ["no-such-binary-for-cmdhost"]}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "CommandNotFound");

    let (status, body) = server.post_json(json!({"command": []})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "InvalidRequest");

    let (status, _) = server.post_json(json!({"not_a_command": true})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    server.assert_no_workspaces_left().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_the_pool() {
    let server = Arc::new(TestServer::new(2));

    let requests: Vec<_> = (0..4)
        .map(|i| {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                server
                    .post_json(json!({
                        "command": ["sh", "-c", "sleep 0.2; cat id"],
                        "input_files": [{"relative_path": "id", "content_base64": BASE64.encode(i.to_string())}],
                    }))
                    .await
            })
        })
        .collect();

    for (i, request) in requests.into_iter().enumerate() {
        let (status, body) = request.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stdout"], i.to_string());
    }

    assert_eq!(server.pool.status().busy, 0);
    server.assert_no_workspaces_left().await;
}
