//! Durable store clients.
//!
//! [`PostgrestStore`] talks to the hosted REST endpoint; [`SqliteBookmarkStore`]
//! keeps rows in the local database, enforcing the same per-owner access rules
//! and publishing every mutation to a [`LocalChangeHub`].

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{ffi, params, OptionalExtension};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::database::Database;
use crate::services::realtime::LocalChangeHub;
use crate::types::bookmark::{BookmarkId, NewBookmark};
use crate::types::errors::StoreError;
use crate::types::feed::{ChangeKind, RawChange};
use crate::types::session::{Identity, SessionCell};
use crate::types::settings::AppConfig;

/// Contract of the durable store. Rows come back untyped and are parsed by the caller.
pub trait BookmarkStore: Send + Sync + 'static {
    /// Rows owned by `owner` that the caller may see.
    fn select_by_owner(
        &self,
        owner: &Identity,
    ) -> impl Future<Output = Result<Vec<Value>, StoreError>> + Send;

    /// Inserts a row and returns it as stored, including the assigned id.
    fn insert(&self, draft: &NewBookmark) -> impl Future<Output = Result<Value, StoreError>> + Send;

    /// Deletes by id. Deleting a row that is absent or invisible is not an error.
    fn delete_by_id(&self, id: &BookmarkId) -> impl Future<Output = Result<(), StoreError>> + Send;
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// === PostgREST ===

#[derive(Deserialize, Default)]
struct PostgrestErrorBody {
    code: Option<String>,
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
}

/// REST client for the hosted bookmarks table.
pub struct PostgrestStore {
    http: reqwest::Client,
    endpoint: String,
    anon_key: String,
    session: SessionCell,
}

impl PostgrestStore {
    pub fn new(config: &AppConfig, session: SessionCell) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| StoreError::transport(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: format!("{}/rest/v1/{}", config.base_url(), config.table),
            anon_key: config.anon_key.clone(),
            session,
        })
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        // Without a session the anon key doubles as the bearer; RLS then hides every row.
        let token = self
            .session
            .access_token()
            .unwrap_or_else(|| self.anon_key.clone());
        self.http
            .request(method, &self.endpoint)
            .header("apikey", &self.anon_key)
            .bearer_auth(zeroize::Zeroizing::new(token).as_str())
    }

    async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, StoreError> {
        let response = request
            .send()
            .await
            .map_err(|e| StoreError::transport(e.to_string()))?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body: PostgrestErrorBody = response.json().await.unwrap_or_default();
        if let Some(details) = body.details.as_deref().or(body.hint.as_deref()) {
            debug!(status = status.as_u16(), details, "store rejection details");
        }
        Err(StoreError {
            status: Some(status.as_u16()),
            code: body.code,
            message: body.message.unwrap_or_else(|| status.to_string()),
        })
    }
}

impl BookmarkStore for PostgrestStore {
    async fn select_by_owner(&self, owner: &Identity) -> Result<Vec<Value>, StoreError> {
        let owner_filter = format!("eq.{}", owner);
        let request = self
            .request(reqwest::Method::GET)
            .query(&[("select", "*"), ("user_id", owner_filter.as_str())]);
        Self::send(request)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::transport(e.to_string()))
    }

    async fn insert(&self, draft: &NewBookmark) -> Result<Value, StoreError> {
        let request = self
            .request(reqwest::Method::POST)
            .header("Prefer", "return=representation")
            .json(&[draft]);
        let mut rows: Vec<Value> = Self::send(request)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::transport(e.to_string()))?;
        if rows.is_empty() {
            return Err(StoreError::transport("insert returned no row"));
        }
        Ok(rows.swap_remove(0))
    }

    async fn delete_by_id(&self, id: &BookmarkId) -> Result<(), StoreError> {
        let id_filter = format!("eq.{}", id);
        let request = self
            .request(reqwest::Method::DELETE)
            .query(&[("id", id_filter.as_str())]);
        Self::send(request).await?;
        Ok(())
    }
}

// === Local SQLite ===

/// Bookmark table in the local database.
///
/// Every statement runs as the identity in the shared [`SessionCell`]: inserts
/// for another owner are refused with `42501`, and other owners' rows are
/// invisible to select and delete.
#[derive(Clone)]
pub struct SqliteBookmarkStore {
    db: Arc<Database>,
    hub: LocalChangeHub,
    session: SessionCell,
    table: String,
}

impl SqliteBookmarkStore {
    pub fn new(db: Arc<Database>, hub: LocalChangeHub, session: SessionCell, table: &str) -> Self {
        Self {
            db,
            hub,
            session,
            table: table.to_string(),
        }
    }

    fn map_error(err: rusqlite::Error) -> StoreError {
        if let rusqlite::Error::SqliteFailure(failure, _) = &err {
            match failure.extended_code {
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    return StoreError::with_code(
                        StoreError::UNIQUE_VIOLATION,
                        "duplicate key value violates unique constraint \"bookmarks_user_id_url_key\"",
                    );
                }
                ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                    return StoreError::with_code(
                        StoreError::FOREIGN_KEY_VIOLATION,
                        "insert or update on table \"bookmarks\" violates foreign key constraint \"bookmarks_user_id_fkey\"",
                    );
                }
                _ => {}
            }
        }
        StoreError::transport(err.to_string())
    }

    fn row_to_value(row: &rusqlite::Row) -> rusqlite::Result<Value> {
        let id: String = row.get(0)?;
        let title: String = row.get(1)?;
        let url: String = row.get(2)?;
        let user_id: String = row.get(3)?;
        let created_at: i64 = row.get(4)?;
        Ok(json!({
            "id": id,
            "title": title,
            "url": url,
            "user_id": user_id,
            "created_at": created_at,
        }))
    }

    fn fetch(&self, id: &str) -> Result<Option<Value>, StoreError> {
        self.db
            .connection()
            .query_row(
                "SELECT id, title, url, user_id, created_at FROM bookmarks WHERE id = ?1",
                params![id],
                Self::row_to_value,
            )
            .optional()
            .map_err(Self::map_error)
    }

    fn publish(&self, kind: ChangeKind, new: Option<Value>, old: Option<Value>) {
        self.hub.publish(RawChange {
            kind,
            table: self.table.clone(),
            new,
            old,
        });
    }

    /// Retitles a row regardless of the session, the way an edit made on
    /// another device reaches this one. Returns whether the row existed.
    pub fn update_title(&self, id: &BookmarkId, title: &str) -> Result<bool, StoreError> {
        let Some(old) = self.fetch(id.as_str())? else {
            return Ok(false);
        };
        self.db
            .connection()
            .execute(
                "UPDATE bookmarks SET title = ?1 WHERE id = ?2",
                params![title, id.as_str()],
            )
            .map_err(Self::map_error)?;
        let new = self.fetch(id.as_str())?;
        self.publish(ChangeKind::Update, new, Some(old));
        Ok(true)
    }

    /// Number of rows stored for `owner`, ignoring access rules.
    pub fn count_for(&self, owner: &Identity) -> Result<i64, StoreError> {
        self.db
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM bookmarks WHERE user_id = ?1",
                params![owner.as_str()],
                |row| row.get(0),
            )
            .map_err(Self::map_error)
    }
}

impl BookmarkStore for SqliteBookmarkStore {
    async fn select_by_owner(&self, owner: &Identity) -> Result<Vec<Value>, StoreError> {
        if self.session.identity().as_ref() != Some(owner) {
            return Ok(Vec::new());
        }
        let conn = self.db.connection();
        let mut stmt = conn
            .prepare(
                "SELECT id, title, url, user_id, created_at FROM bookmarks
                 WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC",
            )
            .map_err(Self::map_error)?;
        let rows = stmt
            .query_map(params![owner.as_str()], Self::row_to_value)
            .map_err(Self::map_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(Self::map_error)?;
        Ok(rows)
    }

    async fn insert(&self, draft: &NewBookmark) -> Result<Value, StoreError> {
        if self.session.identity().as_ref() != Some(&draft.owner) {
            warn!(owner = %draft.owner, "insert refused by row-level policy");
            return Err(StoreError::with_code(
                StoreError::INSUFFICIENT_PRIVILEGE,
                "new row violates row-level security policy for table \"bookmarks\"",
            ));
        }

        let id = Uuid::new_v4().to_string();
        self.db
            .connection()
            .execute(
                "INSERT INTO bookmarks (id, title, url, user_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, draft.title, draft.url, draft.owner.as_str(), now_secs()],
            )
            .map_err(Self::map_error)?;

        let row = self
            .fetch(&id)?
            .ok_or_else(|| StoreError::transport("inserted row vanished"))?;
        self.publish(ChangeKind::Insert, Some(row.clone()), None);
        Ok(row)
    }

    async fn delete_by_id(&self, id: &BookmarkId) -> Result<(), StoreError> {
        let Some(caller) = self.session.identity() else {
            return Ok(());
        };
        let Some(old) = self.fetch(id.as_str())? else {
            return Ok(());
        };
        if old.get("user_id").and_then(Value::as_str) != Some(caller.as_str()) {
            return Ok(());
        }

        self.db
            .connection()
            .execute(
                "DELETE FROM bookmarks WHERE id = ?1 AND user_id = ?2",
                params![id.as_str(), caller.as_str()],
            )
            .map_err(Self::map_error)?;
        self.publish(ChangeKind::Delete, None, Some(old));
        Ok(())
    }
}
