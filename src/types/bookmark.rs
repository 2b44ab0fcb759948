use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::PayloadError;
use super::session::Identity;

/// Store-assigned bookmark identifier. Opaque to the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookmarkId(pub String);

impl BookmarkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reads an id from a JSON value. The hosted store may use integer keys,
    /// so numbers are accepted and kept in their decimal form.
    fn from_value(value: &Value) -> Result<Self, PayloadError> {
        match value {
            Value::String(s) if !s.trim().is_empty() => Ok(Self(s.clone())),
            Value::Number(n) => Ok(Self(n.to_string())),
            Value::Null => Err(PayloadError::MissingField("id")),
            other => Err(PayloadError::InvalidField {
                field: "id",
                reason: format!("unexpected value {}", other),
            }),
        }
    }

    /// Extracts just the `id` of a record, for payloads that carry nothing else
    /// (delete events only guarantee the primary key).
    pub fn from_record(record: &Value) -> Result<Self, PayloadError> {
        let map = record.as_object().ok_or(PayloadError::NotAnObject)?;
        Self::from_value(map.get("id").unwrap_or(&Value::Null))
    }
}

impl fmt::Display for BookmarkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A saved bookmark owned by one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: BookmarkId,
    pub title: String,
    pub url: String,
    pub owner: Identity,
}

impl Bookmark {
    /// Parses a loosely typed store/feed row (`id`, `title`, `url`, `user_id`)
    /// into the strict bookmark shape.
    pub fn from_record(record: &Value) -> Result<Self, PayloadError> {
        let map = record.as_object().ok_or(PayloadError::NotAnObject)?;
        let id = BookmarkId::from_value(map.get("id").unwrap_or(&Value::Null))?;
        let title = required_text(map, "title")?;
        let url = required_text(map, "url")?;
        let owner = Identity::new(required_text(map, "user_id")?);
        Ok(Self {
            id,
            title,
            url,
            owner,
        })
    }
}

fn required_text(map: &Map<String, Value>, field: &'static str) -> Result<String, PayloadError> {
    match map.get(field) {
        None | Some(Value::Null) => Err(PayloadError::MissingField(field)),
        Some(Value::String(s)) if s.trim().is_empty() => Err(PayloadError::InvalidField {
            field,
            reason: "empty".to_string(),
        }),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(PayloadError::InvalidField {
            field,
            reason: format!("expected string, got {}", other),
        }),
    }
}

/// A validated, normalized bookmark ready to be inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewBookmark {
    pub title: String,
    pub url: String,
    #[serde(rename = "user_id")]
    pub owner: Identity,
}
