use serde::{Deserialize, Serialize};

use super::session::OAuthProvider;

/// Which platform implementation backs auth, storage and the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Hosted Supabase project (GoTrue + PostgREST + Realtime).
    Supabase,
    /// In-process SQLite store with a local change hub.
    #[default]
    Local,
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendKind,
    pub supabase_url: String,
    pub anon_key: String,
    pub oauth_provider: OAuthProvider,
    pub redirect_to: Option<String>,
    pub schema: String,
    pub table: String,
    pub channel: String,
    pub request_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// How often the session is checked for an access token close to expiry.
    pub session_check_secs: u64,
    /// First delay before re-subscribing to a lost change feed; doubles per attempt.
    pub feed_retry_initial_ms: u64,
    pub feed_retry_max_secs: u64,
    pub command_buffer: usize,
    pub log_filter: String,
    pub local_db_path: Option<String>,
    pub local_identity: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            supabase_url: String::new(),
            anon_key: String::new(),
            oauth_provider: OAuthProvider::Google,
            redirect_to: None,
            schema: "public".to_string(),
            table: "bookmarks".to_string(),
            channel: "bookmarks-changes".to_string(),
            request_timeout_secs: 30,
            heartbeat_interval_secs: 25,
            session_check_secs: 30,
            feed_retry_initial_ms: 1000,
            feed_retry_max_secs: 30,
            command_buffer: 64,
            log_filter: "info".to_string(),
            local_db_path: None,
            local_identity: "local-user".to_string(),
        }
    }
}

impl AppConfig {
    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.supabase_url.trim_end_matches('/')
    }
}
