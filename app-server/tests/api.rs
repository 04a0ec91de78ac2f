//! REST surface tests driven through the router without a network socket.

use axum::Router;
use axum::body::Body;
use axum::http::Request;
use axum::http::StatusCode;
use http_body_util::BodyExt;
use serde_json::Value;
use serde_json::json;
use tower::ServiceExt;

use fws_app_server::AppState;
use fws_app_server::ServerConfig;

async fn app() -> (tempfile::TempDir, Router) {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::new(ServerConfig {
        cache_root: dir.path().to_path_buf(),
        install_root: dir.path().to_path_buf(),
        codex_argv: vec!["true".to_string()],
        acp_argv: None,
        acp_eager_session_init: false,
    })
    .unwrap();
    (dir, fws_app_server::build_router(state))
}

async fn send(router: &Router, method: &str, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conversation_crud_select_and_meta() {
    let (_dir, router) = app().await;

    let (status, created) = send(&router, "POST", "/api/appserver/conversations", None).await;
    assert_eq!(status, StatusCode::OK);
    let id = created["conversation_id"].as_str().unwrap().to_string();
    assert_eq!(created["status"], "draft");

    let (status, listed) = send(&router, "GET", "/api/appserver/conversations", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["conversations"].as_array().unwrap().len(), 1);

    let (status, _) = send(
        &router,
        "POST",
        "/api/appserver/conversations/select",
        Some(json!({"conversation_id": id, "view": "chat"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Active meta reads back through the persisted pointer.
    let (status, meta) = send(&router, "GET", "/api/appserver/conversation", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(meta["conversation_id"].as_str().unwrap(), id);

    // Settings update flows into the SSOT.
    let (status, meta) = send(
        &router,
        "POST",
        "/api/appserver/conversation",
        Some(json!({"settings": {"model": "gpt-5-codex", "approvalPolicy": "on-failure"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(meta["settings"]["model"], "gpt-5-codex");
    assert_eq!(meta["settings"]["approvalPolicy"], "on-failure");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn thread_id_is_immutable_over_rest() {
    let (_dir, router) = app().await;

    let (_, created) = send(&router, "POST", "/api/appserver/conversations", None).await;
    let id = created["conversation_id"].as_str().unwrap().to_string();
    send(
        &router,
        "POST",
        "/api/appserver/conversations/select",
        Some(json!({"conversation_id": id})),
    )
    .await;

    let (status, _) = send(
        &router,
        "POST",
        "/api/appserver/conversation",
        Some(json!({"thread_id": "T1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, error) = send(
        &router,
        "POST",
        "/api/appserver/conversation",
        Some(json!({"thread_id": "T2"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error["error"]["kind"], "immutable_thread_id");

    // Disk still holds the original binding.
    let (_, meta) = send(&router, "GET", "/api/appserver/conversation", None).await;
    assert_eq!(meta["thread_id"], "T1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transcript_append_and_range() {
    let (_dir, router) = app().await;

    let (_, created) = send(&router, "POST", "/api/appserver/conversations", None).await;
    let id = created["conversation_id"].as_str().unwrap().to_string();
    send(
        &router,
        "POST",
        "/api/appserver/conversations/select",
        Some(json!({"conversation_id": id})),
    )
    .await;

    for i in 0..3 {
        let (status, appended) = send(
            &router,
            "POST",
            "/api/appserver/transcript/append",
            Some(json!({"role": "user", "text": format!("m{i}")})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(appended["msg_num"], i);
    }

    let (status, range) = send(
        &router,
        "GET",
        "/api/appserver/transcript/range?from=1&to=3",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let entries = range["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["msg_num"], 1);
    assert_eq!(entries[0]["role"], "user");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_log_board_round_trips() {
    let (_dir, router) = app().await;

    let (status, entry) = send(
        &router,
        "POST",
        "/api/messages",
        Some(json!({"who": "agent-alpha", "message": "starting task 3"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entry["who"], "agent-alpha");
    assert!(entry["ts"].is_string());

    let (status, all) = send(&router, "GET", "/api/messages", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all["messages"].as_array().unwrap().len(), 1);

    // Bad payloads are rejected without state mutation.
    let (status, error) = send(
        &router,
        "POST",
        "/api/messages",
        Some(json!({"who": "", "message": ""})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"]["kind"], "validation_error");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleting_a_missing_conversation_is_a_404() {
    let (_dir, router) = app().await;
    let (status, error) = send(
        &router,
        "DELETE",
        "/api/appserver/conversations/nope",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["error"]["kind"], "not_found");
}
