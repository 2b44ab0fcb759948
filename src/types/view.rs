use serde::{Deserialize, Serialize};

use super::bookmark::Bookmark;
use super::session::Identity;

/// Lifecycle phase of the bookmark view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewPhase {
    #[default]
    SignedOut,
    LoadingInitial,
    Ready,
    Mutating,
}

/// Contents of the add-bookmark form.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FormFields {
    pub title: String,
    pub url: String,
}

/// Read-only projection handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ViewState {
    pub phase: ViewPhase,
    pub identity: Option<Identity>,
    /// Most recently added first.
    pub bookmarks: Vec<Bookmark>,
    /// True while at least one create/delete is in flight; gates the form.
    pub pending: bool,
    pub form: FormFields,
}

impl ViewState {
    pub fn is_signed_in(&self) -> bool {
        self.identity.is_some()
    }

    pub fn contains_url(&self, url: &str) -> bool {
        self.bookmarks.iter().any(|b| b.url == url)
    }
}

/// Severity of a user notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Error,
}

/// A blocking notification for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }
}
