//! Tests for the JSON-RPC method dispatch, run against a local app.

use std::time::Duration;

use serde_json::{json, Value};
use smartmarks::app::{LocalApp, LocalPlatform};
use smartmarks::rpc_handler::handle_method;
use smartmarks::types::settings::AppConfig;
use smartmarks::types::view::ViewPhase;
use tokio::time::timeout;

fn start() -> (LocalPlatform, LocalApp) {
    let config = AppConfig::default();
    let platform = LocalPlatform::open(&config).unwrap();
    let app = LocalApp::start_local(config, &platform);
    (platform, app)
}

async fn call(app: &LocalApp, method: &str, params: Value) -> Result<Value, String> {
    handle_method(app, method, &params).await
}

async fn signed_in() -> (LocalPlatform, LocalApp) {
    let (platform, app) = start();
    call(&app, "auth.sign_in", json!({})).await.unwrap();
    timeout(
        Duration::from_secs(2),
        app.wait_for_state(|s| s.phase == ViewPhase::Ready),
    )
    .await
    .unwrap()
    .unwrap();
    (platform, app)
}

#[tokio::test]
async fn test_ping() {
    let (_, app) = start();
    assert_eq!(call(&app, "ping", json!({})).await, Ok(json!({"pong": true})));
}

#[tokio::test]
async fn test_unknown_method_is_an_error() {
    let (_, app) = start();
    assert_eq!(
        call(&app, "bookmark.frobnicate", json!({})).await,
        Err("unknown method: bookmark.frobnicate".to_string())
    );
}

#[tokio::test]
async fn test_local_sign_in_completes_immediately() {
    let (_, app) = start();
    let result = call(&app, "auth.sign_in", json!({})).await.unwrap();
    assert_eq!(result["status"], "completed");
    assert_eq!(result["identity"], "local-user");

    let user = call(&app, "auth.user", json!({})).await.unwrap();
    assert_eq!(user, json!({"identity": "local-user"}));
}

#[tokio::test]
async fn test_complete_requires_code() {
    let (_, app) = start();
    assert_eq!(
        call(&app, "auth.complete", json!({})).await,
        Err("missing code".to_string())
    );
    let result = call(&app, "auth.complete", json!({"code": "u2"})).await.unwrap();
    assert_eq!(result, json!({"identity": "u2"}));
}

#[tokio::test]
async fn test_add_then_list() {
    let (_, app) = signed_in().await;
    let created = call(&app, "bookmark.add", json!({"title": "Doc", "url": "docs.example.com"}))
        .await
        .unwrap();
    assert_eq!(created["url"], "https://docs.example.com");
    assert_eq!(created["owner"], "local-user");

    let listed = call(&app, "bookmark.list", json!({})).await.unwrap();
    assert_eq!(listed["phase"], "ready");
    assert_eq!(listed["items"].as_array().unwrap().len(), 1);
    assert_eq!(listed["items"][0]["title"], "Doc");
}

#[tokio::test]
async fn test_add_errors_use_user_facing_messages() {
    let (_, app) = start();
    assert_eq!(
        call(&app, "bookmark.add", json!({"title": "X", "url": "x.com"})).await,
        Err("User not logged in".to_string())
    );

    let (_, app) = signed_in().await;
    assert_eq!(
        call(&app, "bookmark.add", json!({"title": "X"})).await,
        Err("Please enter both title and URL".to_string())
    );
}

#[tokio::test]
async fn test_delete_honours_confirmation() {
    let (_, app) = signed_in().await;
    let created = call(&app, "bookmark.add", json!({"title": "A", "url": "a.io"}))
        .await
        .unwrap();
    let id = created["id"].clone();

    let declined = call(&app, "bookmark.delete", json!({"id": id, "confirm": false}))
        .await
        .unwrap();
    assert_eq!(declined, json!({"outcome": "declined"}));
    assert_eq!(app.state().bookmarks.len(), 1);

    let deleted = call(&app, "bookmark.delete", json!({"id": id, "confirm": true}))
        .await
        .unwrap();
    assert_eq!(deleted, json!({"outcome": "deleted"}));
    assert!(app.state().bookmarks.is_empty());
}

#[tokio::test]
async fn test_delete_rejects_bad_ids() {
    let (_, app) = signed_in().await;
    assert_eq!(
        call(&app, "bookmark.delete", json!({})).await,
        Err("missing id".to_string())
    );
    assert_eq!(
        call(&app, "bookmark.delete", json!({"id": true})).await,
        Err("invalid id".to_string())
    );
}

#[tokio::test]
async fn test_add_without_fields_submits_form() {
    let (_, app) = signed_in().await;
    call(&app, "form.set", json!({"title": "Form", "url": "form.io"}))
        .await
        .unwrap();

    let created = call(&app, "bookmark.add", json!({})).await.unwrap();
    assert_eq!(created["title"], "Form");

    let state = call(&app, "state", json!({})).await.unwrap();
    assert_eq!(state["form"], json!({"title": "", "url": ""}));
    assert_eq!(state["pending"], false);
}

#[tokio::test]
async fn test_sign_out_resets_state() {
    let (_, app) = signed_in().await;
    call(&app, "bookmark.add", json!({"title": "A", "url": "a.io"}))
        .await
        .unwrap();

    assert_eq!(
        call(&app, "auth.sign_out", json!({})).await,
        Ok(json!({"ok": true}))
    );
    timeout(
        Duration::from_secs(2),
        app.wait_for_state(|s| s.phase == ViewPhase::SignedOut),
    )
    .await
    .unwrap()
    .unwrap();
    let state = call(&app, "state", json!({})).await.unwrap();
    assert_eq!(state["identity"], Value::Null);
    assert_eq!(state["bookmarks"], json!([]));
}
