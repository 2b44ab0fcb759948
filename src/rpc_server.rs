//! smartmarks RPC Server: JSON-RPC over stdin/stdout.
//!
//! Protocol: one JSON object per line (newline-delimited JSON).
//! Request:  {"id":1, "method":"bookmark.add", "params":{"url":"...","title":"..."}}
//! Response: {"id":1, "result":{...}} or {"id":1, "error":"..."}
//! Events:   {"event":"ready"|"state"|"notice", ...}
//!
//! Logs go to stderr so stdout carries only protocol lines.

use std::error::Error;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use smartmarks::app::{App, LocalApp, LocalPlatform, SupabaseApp};
use smartmarks::rpc_handler::handle_method;
use smartmarks::services::auth_client::IdentityProvider;
use smartmarks::services::settings_engine::SettingsEngine;
use smartmarks::types::settings::BackendKind;

/// Simple rate limiter: max requests per second.
struct RateLimiter {
    window_start: Instant,
    request_count: u32,
    max_per_second: u32,
}

impl RateLimiter {
    fn new(max_per_second: u32) -> Self {
        Self {
            window_start: Instant::now(),
            request_count: 0,
            max_per_second,
        }
    }

    /// Returns true if the request is allowed, false if rate-limited.
    fn check(&mut self) -> bool {
        if self.window_start.elapsed().as_secs() >= 1 {
            self.window_start = Instant::now();
            self.request_count = 0;
        }
        self.request_count += 1;
        self.request_count <= self.max_per_second
    }
}

fn config_path_from_args() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let mut settings = SettingsEngine::new(config_path_from_args());
    let config = settings.load_from_environment()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match config.backend {
        BackendKind::Local => {
            let platform = LocalPlatform::open(&config)?;
            serve(LocalApp::start_local(config, &platform)).await
        }
        BackendKind::Supabase => serve(SupabaseApp::start_supabase(config)?).await,
    }
}

async fn serve<P: IdentityProvider>(mut app: App<P>) -> Result<(), Box<dyn Error>> {
    let (out, mut out_rx) = mpsc::unbounded_channel::<Value>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = out_rx.recv().await {
            let line = format!("{}\n", message);
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let _ = out.send(json!({"event": "ready", "version": env!("CARGO_PKG_VERSION")}));

    if let Some(mut notices) = app.take_notices() {
        let out = out.clone();
        tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                let _ = out.send(json!({"event": "notice", "level": notice.level, "message": notice.message}));
            }
        });
    }

    let mut state = app.watch_state();
    let state_out = out.clone();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let snapshot = serde_json::to_value(&*state.borrow_and_update());
            if let Ok(snapshot) = snapshot {
                let _ = state_out.send(json!({"event": "state", "state": snapshot}));
            }
        }
    });

    // Max 200 RPC requests per second
    let mut rate_limiter = RateLimiter::new(200);
    let app = Arc::new(app);
    let mut in_flight = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                let _ = out.send(json!({"id": null, "error": format!("parse error: {}", e)}));
                continue;
            }
        };
        let id = req.get("id").cloned().unwrap_or(Value::Null);

        if !rate_limiter.check() {
            let _ = out.send(json!({"id": id, "error": "rate limit exceeded"}));
            continue;
        }

        let method = req
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let params = req.get("params").cloned().unwrap_or(json!({}));

        // Each call runs on its own so a slow create does not block a delete.
        let app = Arc::clone(&app);
        let out = out.clone();
        in_flight.spawn(async move {
            let response = match handle_method(&*app, &method, &params).await {
                Ok(val) => json!({"id": id, "result": val}),
                Err(err) => json!({"id": id, "error": err}),
            };
            let _ = out.send(response);
        });
        while let Some(Some(_)) = in_flight.join_next().now_or_never() {}
    }

    while in_flight.join_next().await.is_some() {}
    match Arc::try_unwrap(app) {
        Ok(app) => app.shutdown().await,
        Err(_) => error!("app still referenced at exit"),
    }
    info!("stdin closed, exiting");

    drop(out);
    let _ = writer.await;
    Ok(())
}
