use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::bookmark::{Bookmark, BookmarkId};
use super::errors::PayloadError;
use super::session::Identity;

/// Type of change carried by a feed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A change notification exactly as the transport delivered it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChange {
    pub kind: ChangeKind,
    pub table: String,
    /// Row after the change (insert, update).
    pub new: Option<Value>,
    /// Row before the change (update, delete). May only carry the primary key.
    pub old: Option<Value>,
}

impl RawChange {
    /// Owner column of whichever row image is present.
    pub fn owner(&self) -> Option<&str> {
        self.new
            .as_ref()
            .and_then(|row| row.get("user_id"))
            .or_else(|| self.old.as_ref().and_then(|row| row.get("user_id")))
            .and_then(Value::as_str)
    }
}

/// A feed notification parsed into the strict bookmark shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Insert(Bookmark),
    Update(Bookmark),
    Delete(BookmarkId),
}

impl ChangeEvent {
    pub fn parse(raw: &RawChange) -> Result<Self, PayloadError> {
        match raw.kind {
            ChangeKind::Insert => {
                let row = raw.new.as_ref().ok_or(PayloadError::MissingField("new"))?;
                Ok(ChangeEvent::Insert(Bookmark::from_record(row)?))
            }
            ChangeKind::Update => {
                let row = raw.new.as_ref().ok_or(PayloadError::MissingField("new"))?;
                Ok(ChangeEvent::Update(Bookmark::from_record(row)?))
            }
            ChangeKind::Delete => {
                let row = raw.old.as_ref().ok_or(PayloadError::MissingField("old"))?;
                Ok(ChangeEvent::Delete(BookmarkId::from_record(row)?))
            }
        }
    }

    pub fn id(&self) -> &BookmarkId {
        match self {
            ChangeEvent::Insert(b) | ChangeEvent::Update(b) => &b.id,
            ChangeEvent::Delete(id) => id,
        }
    }
}

/// Server-side filter for a change-feed subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedFilter {
    pub schema: String,
    pub table: String,
    pub owner: Identity,
}

impl FeedFilter {
    /// Filter expression in the platform's `column=eq.value` syntax.
    pub fn expression(&self) -> String {
        format!("user_id=eq.{}", self.owner)
    }
}
