//! RPC method handler for the smartmarks JSON-RPC protocol.
//!
//! Kept apart from `rpc_server.rs` so it can be tested without stdin/stdout.
//! `handle_method` dispatches one call to the [`App`].

use serde_json::{json, Value};

use crate::app::App;
use crate::services::auth_client::IdentityProvider;
use crate::types::bookmark::BookmarkId;

fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| format!("serialization error: {}", e))
}

/// Dispatch a JSON-RPC method call.
///
/// Returns `Ok(Value)` on success or `Err(String)` with the message the user should see.
pub async fn handle_method<P: IdentityProvider>(
    app: &App<P>,
    method: &str,
    params: &Value,
) -> Result<Value, String> {
    match method {
        // ─── Session ───
        "auth.sign_in" => {
            let start = app.sign_in().await.map_err(|e| e.to_string())?;
            to_json(&start)
        }
        "auth.complete" => {
            let code = str_param(params, "code").ok_or("missing code")?;
            let identity = app.complete_sign_in(code).await.map_err(|e| e.to_string())?;
            Ok(json!({"identity": identity}))
        }
        "auth.sign_out" => {
            app.sign_out().await;
            Ok(json!({"ok": true}))
        }
        "auth.user" => {
            let identity = app.current_user().await.map_err(|e| e.to_string())?;
            Ok(json!({"identity": identity}))
        }

        // ─── Form ───
        "form.set" => {
            let title = str_param(params, "title").map(str::to_string);
            let url = str_param(params, "url").map(str::to_string);
            app.set_form(title, url).await;
            Ok(json!({"ok": true}))
        }

        // ─── Bookmarks ───
        "bookmark.add" => {
            let title = str_param(params, "title");
            let url = str_param(params, "url");
            let created = match (title, url) {
                (None, None) => app.submit_form().await,
                (title, url) => {
                    app.add_bookmark(title.unwrap_or_default(), url.unwrap_or_default())
                        .await
                }
            };
            let bookmark = created.map_err(|e| e.create_message())?;
            to_json(&bookmark)
        }
        "bookmark.delete" => {
            let id = params.get("id").ok_or("missing id")?;
            let id = match id {
                Value::String(s) => BookmarkId::new(s.clone()),
                Value::Number(n) => BookmarkId::new(n.to_string()),
                _ => return Err("invalid id".to_string()),
            };
            let confirmed = params
                .get("confirm")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let outcome = app
                .delete_bookmark(&id, confirmed)
                .await
                .map_err(|e| e.delete_message())?;
            Ok(json!({"outcome": outcome}))
        }
        "bookmark.list" => {
            let state = app.state();
            Ok(json!({"items": state.bookmarks, "phase": state.phase}))
        }
        "bookmark.refresh" => {
            app.refresh().await.map_err(|e| e.to_string())?;
            Ok(json!({"ok": true}))
        }

        // ─── View ───
        "state" => to_json(&app.state()),

        "ping" => Ok(json!({"pong": true})),

        _ => Err(format!("unknown method: {}", method)),
    }
}
