//! Bookmark Store Client for smartmarks.
//!
//! Validates and normalizes input, applies the local duplicate guard, and
//! turns store rows and rejections into typed bookmarks and [`BookmarkError`]s.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::services::store_client::BookmarkStore;
use crate::types::bookmark::{Bookmark, BookmarkId, NewBookmark};
use crate::types::errors::{BookmarkError, ValidationError};
use crate::types::session::Identity;

/// Schemes accepted as-is; anything else gets `https://` prepended.
const SCHEME_PREFIXES: [&str; 2] = ["http://", "https://"];

/// Question asked before a delete is sent.
pub const DELETE_PROMPT: &str = "Are you sure you want to delete this bookmark?";

/// Normalizes a user-typed URL. Idempotent.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if SCHEME_PREFIXES.iter().any(|scheme| url.starts_with(scheme)) {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

/// Yes/no gate in front of destructive operations.
pub trait ConfirmPrompt {
    fn confirm(&self, question: &str) -> bool;
}

/// A pre-answered prompt, for callers that collected the answer up front.
impl ConfirmPrompt for bool {
    fn confirm(&self, _question: &str) -> bool {
        *self
    }
}

/// Result of a delete that got past validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    /// The user declined the confirmation; nothing was sent.
    Declined,
}

/// Client for the remote bookmark collection.
pub struct BookmarkClient<S: BookmarkStore> {
    store: Arc<S>,
}

impl<S: BookmarkStore> Clone for BookmarkClient<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: BookmarkStore> BookmarkClient<S> {
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    /// All bookmarks owned by `identity`. No identity means no bookmarks, and
    /// the store is not called.
    ///
    /// Rows that fail to parse or belong to someone else are logged and dropped.
    pub async fn list(&self, identity: Option<&Identity>) -> Result<Vec<Bookmark>, BookmarkError> {
        let Some(identity) = identity else {
            return Ok(Vec::new());
        };

        let rows = self
            .store
            .select_by_owner(identity)
            .await
            .map_err(BookmarkError::from_store)?;

        let mut bookmarks = Vec::with_capacity(rows.len());
        for row in &rows {
            match Bookmark::from_record(row) {
                Ok(bookmark) if &bookmark.owner == identity => bookmarks.push(bookmark),
                Ok(bookmark) => {
                    warn!(bookmark_id = %bookmark.id, owner = %bookmark.owner, "dropping foreign row")
                }
                Err(e) => warn!(error = %e, "dropping malformed row"),
            }
        }
        debug!(identity = %identity, count = bookmarks.len(), "bookmarks listed");
        Ok(bookmarks)
    }

    /// Everything `create` checks before the remote call: input present,
    /// signed in, URL normalized, URL not already in `existing`.
    pub fn prepare_create(
        &self,
        identity: Option<&Identity>,
        title: &str,
        url: &str,
        existing: &[Bookmark],
    ) -> Result<NewBookmark, BookmarkError> {
        let title = title.trim();
        let url = url.trim();
        if title.is_empty() {
            return Err(ValidationError::MissingTitle.into());
        }
        if url.is_empty() {
            return Err(ValidationError::MissingUrl.into());
        }
        let owner = identity.ok_or(BookmarkError::NotSignedIn)?;

        let url = normalize_url(url);
        // Best effort: the store's unique constraint is authoritative.
        if existing.iter().any(|b| b.url == url) {
            return Err(BookmarkError::Duplicate { url, remote: false });
        }

        Ok(NewBookmark {
            title: title.to_string(),
            url,
            owner: owner.clone(),
        })
    }

    /// Sends a prepared bookmark to the store.
    pub async fn insert(&self, draft: &NewBookmark) -> Result<Bookmark, BookmarkError> {
        let row = self.store.insert(draft).await.map_err(|e| {
            warn!(code = e.code.as_deref().unwrap_or("-"), error = %e, "insert rejected");
            match BookmarkError::from_store(e) {
                BookmarkError::Duplicate { remote, .. } => BookmarkError::Duplicate {
                    url: draft.url.clone(),
                    remote,
                },
                other => other,
            }
        })?;

        let bookmark = Bookmark::from_record(&row)
            .map_err(|e| BookmarkError::Transport(format!("malformed created row: {}", e)))?;
        info!(bookmark_id = %bookmark.id, owner = %bookmark.owner, "bookmark created");
        Ok(bookmark)
    }

    /// Validates and creates a bookmark in one step.
    pub async fn create(
        &self,
        identity: Option<&Identity>,
        title: &str,
        url: &str,
        existing: &[Bookmark],
    ) -> Result<Bookmark, BookmarkError> {
        let draft = self.prepare_create(identity, title, url, existing)?;
        self.insert(&draft).await
    }

    /// Deletes by id on the store, without asking.
    pub async fn remove(&self, identity: &Identity, id: &BookmarkId) -> Result<(), BookmarkError> {
        self.store.delete_by_id(id).await.map_err(|e| {
            warn!(bookmark_id = %id, identity = %identity, error = %e, "delete rejected");
            BookmarkError::from_store(e)
        })?;
        info!(bookmark_id = %id, "bookmark deleted");
        Ok(())
    }

    /// Asks `prompt` first; a declined prompt sends nothing.
    pub async fn delete<C: ConfirmPrompt>(
        &self,
        identity: Option<&Identity>,
        id: &BookmarkId,
        prompt: &C,
    ) -> Result<DeleteOutcome, BookmarkError> {
        let identity = identity.ok_or(BookmarkError::NotSignedIn)?;
        if !prompt.confirm(DELETE_PROMPT) {
            debug!(bookmark_id = %id, "delete declined");
            return Ok(DeleteOutcome::Declined);
        }
        self.remove(identity, id).await?;
        Ok(DeleteOutcome::Deleted)
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}
