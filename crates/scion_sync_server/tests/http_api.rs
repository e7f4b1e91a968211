//! Router-level contract tests, driven in-process.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use http_body_util::BodyExt;
use scion_core::VaultPaths;
use scion_sync_server::{app, AppState};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

fn test_app() -> (TempDir, Router) {
    let dir = TempDir::new().unwrap();
    let state = AppState::new(VaultPaths::new(dir.path()));
    (dir, app(state))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

async fn sync_file(app: &Router, vault: &str, path: &str, content: &str, base: Option<&str>) -> Value {
    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/vault/{vault}/sync"),
            json!({
                "path": path,
                "content": BASE64.encode(content),
                "base_commit": base,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

#[tokio::test]
async fn health_reports_ok() {
    let (_dir, app) = test_app();
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "status": "ok" }));
}

#[tokio::test]
async fn new_file_round_trips_with_hash_headers() {
    let (_dir, app) = test_app();

    let sync = sync_file(&app, "notes", "n.md", "hello", None).await;
    assert_eq!(sync["success"], json!(true));
    assert_eq!(sync["merged"], json!(false));
    assert_eq!(sync["has_conflicts"], json!(false));
    assert_eq!(
        sync["hash"],
        json!("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
    );

    let response = app.clone().oneshot(get("/vault/notes/file/n.md")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let commit_header = response
        .headers()
        .get("x-file-commit")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let hash_header = response
        .headers()
        .get("x-file-hash")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(commit_header, sync["commit"].as_str().unwrap());
    assert_eq!(hash_header, sync["hash"].as_str().unwrap());
    assert_eq!(body_bytes(response).await, b"hello");
}

#[tokio::test]
async fn fast_forward_update_creates_new_commit() {
    let (_dir, app) = test_app();
    let first = sync_file(&app, "notes", "n.md", "hello", None).await;
    let c1 = first["commit"].as_str().unwrap().to_string();

    let second = sync_file(&app, "notes", "n.md", "hello world", Some(&c1)).await;
    assert_ne!(second["commit"], first["commit"]);
    assert_eq!(second["merged"], json!(false));

    let response = app.oneshot(get("/vault/notes/file/n.md")).await.unwrap();
    assert_eq!(body_bytes(response).await, b"hello world");
}

#[tokio::test]
async fn conflicting_uploads_return_markers_without_committing() {
    let (_dir, app) = test_app();
    let base = sync_file(&app, "notes", "n.md", "Original line", None).await;
    let base_commit = base["commit"].as_str().unwrap().to_string();

    let a = sync_file(&app, "notes", "n.md", "A edited this line", Some(&base_commit)).await;
    let b = sync_file(&app, "notes", "n.md", "B edited this line", Some(&base_commit)).await;

    assert_eq!(b["merged"], json!(true));
    assert_eq!(b["has_conflicts"], json!(true));
    assert_eq!(b["commit"], a["commit"]);

    let merged = BASE64
        .decode(b["merged_content"].as_str().unwrap())
        .unwrap();
    let merged = String::from_utf8(merged).unwrap();
    assert!(merged.contains("<<<<<<<"));
    assert!(merged.contains("======="));
    assert!(merged.contains(">>>>>>>"));

    // The server still serves A's content.
    let response = app.oneshot(get("/vault/notes/file/n.md")).await.unwrap();
    assert_eq!(body_bytes(response).await, b"A edited this line");
}

#[tokio::test]
async fn manifest_and_status_track_changes() {
    let (_dir, app) = test_app();
    let first = sync_file(&app, "notes", "a.md", "alpha", None).await;
    sync_file(&app, "notes", "dir/b.md", "beta", None).await;

    let response = app.clone().oneshot(get("/vault/notes/manifest")).await.unwrap();
    let manifest = body_json(response).await;
    let files = manifest["files"].as_array().unwrap();
    assert_eq!(files.len(), 2);
    let paths: Vec<&str> = files.iter().map(|f| f["path"].as_str().unwrap()).collect();
    assert!(paths.contains(&"a.md"));
    assert!(paths.contains(&"dir/b.md"));
    assert!(files.iter().all(|f| f["file_id"].as_str().is_some()));

    let since = first["commit"].as_str().unwrap();
    let response = app
        .clone()
        .oneshot(get(&format!("/vault/notes/status?since={since}")))
        .await
        .unwrap();
    let status = body_json(response).await;
    assert_eq!(status["has_changes"], json!(true));
    assert_eq!(status["changed_files"], json!(["dir/b.md"]));

    let head = manifest["head_commit"].as_str().unwrap();
    let response = app
        .oneshot(get(&format!("/vault/notes/status?since={head}")))
        .await
        .unwrap();
    let status = body_json(response).await;
    assert_eq!(status["has_changes"], json!(false));
}

#[tokio::test]
async fn invalid_vault_names_are_rejected_everywhere() {
    let (_dir, app) = test_app();
    let bad = "bad..name";

    for request in [
        get(&format!("/vault/{bad}/manifest")),
        get(&format!("/vault/{bad}/status")),
        get(&format!("/vault/{bad}/file/a.md")),
        post_json(
            &format!("/vault/{bad}/sync"),
            json!({ "path": "a.md", "content": BASE64.encode("x"), "base_commit": null }),
        ),
        post_json(
            &format!("/vault/{bad}/detect-rename"),
            json!({ "missing_path": "a.md", "missing_hash": "0" }),
        ),
    ] {
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["success"], json!(false));
        assert!(body["error"].as_str().unwrap().contains("bad..name"));
    }
}

#[tokio::test]
async fn reserved_paths_are_invisible() {
    let (_dir, app) = test_app();
    sync_file(&app, "notes", "a.md", "alpha", None).await;

    // Committed into history, but not servable.
    let response = app
        .clone()
        .oneshot(get("/vault/notes/file/.scion/manifest.json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(delete("/vault/notes/file/.gitignore"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.oneshot(get("/vault/notes/manifest")).await.unwrap();
    let manifest = body_json(response).await;
    let paths: Vec<&str> = manifest["files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["path"].as_str().unwrap())
        .collect();
    assert_eq!(paths, vec!["a.md"]);
}

#[tokio::test]
async fn batch_with_empty_operations_is_rejected() {
    let (_dir, app) = test_app();
    let response = app
        .oneshot(post_json(
            "/vault/notes/sync/v2",
            json!({ "operations": [], "atomic": true }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn atomic_batch_failure_reports_partial_results_and_start_commit() {
    let (_dir, app) = test_app();
    let seed = sync_file(&app, "notes", "seed.md", "seed", None).await;
    let start_commit = seed["commit"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(post_json(
            "/vault/notes/sync/v2",
            json!({
                "operations": [
                    { "type": "create", "path": "a.md", "content": BASE64.encode("a") },
                    { "type": "modify", "file_id": "00000000-0000-0000-0000-000000000000",
                      "content": BASE64.encode("x") },
                    { "type": "create", "path": "b.md", "content": BASE64.encode("b") },
                ],
                "atomic": true,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let report = body_json(response).await;
    assert_eq!(report["success"], json!(false));
    let results = report["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["index"], json!(0));
    assert_eq!(results[0]["success"], json!(true));
    assert_eq!(results[1]["index"], json!(1));
    assert_eq!(results[1]["success"], json!(false));
    assert_eq!(report["head_commit"], json!(start_commit));

    // b.md was never attempted.
    let response = app.oneshot(get("/vault/notes/manifest")).await.unwrap();
    let manifest = body_json(response).await;
    let paths: Vec<&str> = manifest["files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["path"].as_str().unwrap())
        .collect();
    assert!(!paths.contains(&"b.md"));
}

#[tokio::test]
async fn non_atomic_batch_reports_every_result() {
    let (_dir, app) = test_app();
    let response = app
        .clone()
        .oneshot(post_json(
            "/vault/notes/sync/v2",
            json!({
                "operations": [
                    { "type": "create", "path": "a.md", "content": BASE64.encode("a") },
                    { "type": "delete", "file_id": "missing" },
                    { "type": "create", "path": "b.md", "content": BASE64.encode("b") },
                ],
                "atomic": false,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let report = body_json(response).await;
    assert_eq!(report["success"], json!(false));
    assert_eq!(report["results"].as_array().unwrap().len(), 3);
    assert_eq!(report["results"][2]["success"], json!(true));
}

#[tokio::test]
async fn rename_moves_manifest_row_and_is_detectable() {
    let (_dir, app) = test_app();
    let created = sync_file(&app, "notes", "old.md", "body", None).await;
    let file_id = created["file_id"].as_str().unwrap().to_string();
    let hash = created["hash"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(post_json(
            "/vault/notes/rename",
            json!({ "file_id": file_id, "old_path": "old.md", "new_path": "new.md" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let renamed = body_json(response).await;
    assert_eq!(renamed["success"], json!(true));
    assert_eq!(renamed["file_id"], json!(file_id));

    let response = app.clone().oneshot(get("/vault/notes/manifest")).await.unwrap();
    let manifest = body_json(response).await;
    let files = manifest["files"].as_array().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["path"], json!("new.md"));
    assert_eq!(files[0]["file_id"], json!(file_id));

    let response = app
        .oneshot(post_json(
            "/vault/notes/detect-rename",
            json!({ "missing_path": "old.md", "missing_hash": hash }),
        ))
        .await
        .unwrap();
    let detection = body_json(response).await;
    assert_eq!(detection["found"], json!(true));
    assert_eq!(detection["new_path"], json!("new.md"));
    assert_eq!(detection["file_id"], json!(file_id));
}

#[tokio::test]
async fn file_by_id_serves_bytes_with_identity_headers() {
    let (_dir, app) = test_app();
    let created = sync_file(&app, "notes", "dir/x.md", "by id", None).await;
    let file_id = created["file_id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(get(&format!("/vault/notes/file-by-id/{file_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-file-id").unwrap().to_str().unwrap(),
        file_id
    );
    assert_eq!(
        response.headers().get("x-file-path").unwrap().to_str().unwrap(),
        "dir/x.md"
    );
    assert_eq!(body_bytes(response).await, b"by id");

    let response = app
        .oneshot(get("/vault/notes/file-by-id/unknown-id"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_removes_file_and_returns_commit() {
    let (_dir, app) = test_app();
    sync_file(&app, "notes", "gone.md", "bye", None).await;

    let response = app
        .clone()
        .oneshot(delete("/vault/notes/file/gone.md"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(true));
    assert!(body["commit"].as_str().is_some());

    let response = app
        .clone()
        .oneshot(get("/vault/notes/file/gone.md"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.oneshot(delete("/vault/notes/file/gone.md")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn history_lists_commits_and_serves_old_versions() {
    let (_dir, app) = test_app();
    let v1 = sync_file(&app, "notes", "n.md", "v1", None).await;
    let c1 = v1["commit"].as_str().unwrap().to_string();
    let v2 = sync_file(&app, "notes", "n.md", "v2", Some(&c1)).await;
    let c2 = v2["commit"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(get("/vault/notes/history/n.md"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let history = body_json(response).await;
    assert_eq!(history["path"], json!("n.md"));
    let commits: Vec<&str> = history["commits"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["commit"].as_str().unwrap())
        .collect();
    assert_eq!(commits, vec![c2.as_str(), c1.as_str()]);

    // Point-in-time read of the first version.
    let response = app
        .clone()
        .oneshot(get(&format!("/vault/notes/file/n.md?commit={c1}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"v1");

    let response = app
        .oneshot(get("/vault/notes/history/ghost.md"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sync_rejects_undecodable_content() {
    let (_dir, app) = test_app();
    let response = app
        .oneshot(post_json(
            "/vault/notes/sync",
            json!({ "path": "a.md", "content": "%%%", "base_commit": null }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("base64"));
}

#[tokio::test]
async fn ws_status_starts_empty() {
    let (_dir, app) = test_app();
    let response = app.oneshot(get("/ws/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status = body_json(response).await;
    assert_eq!(status["connected_vaults"], json!(0));
    assert_eq!(status["clients_by_vault"], json!({}));
}

#[tokio::test]
async fn ws_route_rejects_plain_http_requests() {
    // Without upgrade headers the handshake cannot proceed; the exact
    // status comes from the upgrade extractor, but it is a client error.
    let (_dir, app) = test_app();
    let response = app.oneshot(get("/vault/notes/ws?deviceId=d1")).await.unwrap();
    assert!(response.status().is_client_error());
}
