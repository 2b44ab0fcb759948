use thiserror::Error;

// === ValidationError ===

/// Input rejected before any remote call is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The bookmark title is empty after trimming.
    #[error("Missing title")]
    MissingTitle,
    /// The bookmark URL is empty after trimming.
    #[error("Missing URL")]
    MissingUrl,
}

// === StoreError ===

/// A rejection or failure reported by the durable store.
///
/// `code` carries the platform's error code (Postgres SQLSTATE for the hosted
/// store, or the emulated equivalent for the local store).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Store error: {message}")]
pub struct StoreError {
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
}

impl StoreError {
    pub const UNIQUE_VIOLATION: &'static str = "23505";
    pub const FOREIGN_KEY_VIOLATION: &'static str = "23503";
    pub const INSUFFICIENT_PRIVILEGE: &'static str = "42501";

    /// A store error carrying a platform code.
    pub fn with_code(code: &str, message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: Some(code.to_string()),
            message: message.into(),
        }
    }

    /// A transport-level failure with no platform code.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
        }
    }
}

// === BookmarkError ===

/// User-facing bookmark operation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BookmarkError {
    /// Required input missing.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),
    /// A bookmark with the same normalized URL already exists for this owner.
    /// `remote` is true when the store rejected the insert rather than the local guard.
    #[error("Duplicate bookmark URL: {url}")]
    Duplicate { url: String, remote: bool },
    /// Access-control rejection from the store.
    #[error("Permission denied: {0}")]
    Permission(String),
    /// Referential violation such as an owner that does not exist.
    #[error("Integrity violation: {0}")]
    Integrity(String),
    /// Any other store or network failure, with the raw message.
    #[error("Transport error: {0}")]
    Transport(String),
    /// No identity is signed in.
    #[error("Not signed in")]
    NotSignedIn,
    /// The initial list is still loading.
    #[error("Bookmarks are still loading")]
    NotReady,
    /// The remote call ended without producing a result.
    #[error("Unexpected failure: {0}")]
    Unexpected(String),
}

impl BookmarkError {
    /// Classifies a store rejection by its platform code.
    pub fn from_store(err: StoreError) -> Self {
        match err.code.as_deref() {
            Some(StoreError::UNIQUE_VIOLATION) => BookmarkError::Duplicate {
                url: err.message,
                remote: true,
            },
            Some(StoreError::INSUFFICIENT_PRIVILEGE) => BookmarkError::Permission(err.message),
            Some(StoreError::FOREIGN_KEY_VIOLATION) => BookmarkError::Integrity(err.message),
            _ if matches!(err.status, Some(401) | Some(403)) => {
                BookmarkError::Permission(err.message)
            }
            _ => BookmarkError::Transport(err.message),
        }
    }

    /// Message shown to the user when a create fails with this error.
    pub fn create_message(&self) -> String {
        match self {
            BookmarkError::Validation(_) => "Please enter both title and URL".to_string(),
            BookmarkError::Duplicate { remote: false, .. } => {
                "This bookmark already exists".to_string()
            }
            BookmarkError::Duplicate { remote: true, .. } => {
                "This bookmark already exists (duplicate entry)".to_string()
            }
            BookmarkError::Permission(_) => {
                "Permission denied. Please check RLS policies.".to_string()
            }
            BookmarkError::Integrity(_) => {
                "Foreign key violation. User ID might be invalid.".to_string()
            }
            BookmarkError::Transport(msg) => format!("Error: {}", msg),
            BookmarkError::NotSignedIn => "User not logged in".to_string(),
            BookmarkError::NotReady => "Bookmarks are still loading".to_string(),
            BookmarkError::Unexpected(_) => "An unexpected error occurred".to_string(),
        }
    }

    /// Message shown to the user when a delete fails with this error.
    pub fn delete_message(&self) -> String {
        match self {
            BookmarkError::NotSignedIn => "User not logged in".to_string(),
            BookmarkError::NotReady => "Bookmarks are still loading".to_string(),
            BookmarkError::Unexpected(_) => "An unexpected error occurred".to_string(),
            _ => "Failed to delete bookmark".to_string(),
        }
    }
}

// === PayloadError ===

/// A loosely typed record from the store or feed that does not fit the bookmark shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    /// The record is not a JSON object.
    #[error("Record is not an object")]
    NotAnObject,
    /// A required field is absent or null.
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    /// A field has the wrong type or an empty value.
    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

// === AuthError ===

/// Errors from the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No sign-in exchange is waiting for an authorization code.
    #[error("No sign-in in progress")]
    NoPendingSignIn,
    /// The provider rejected the exchange or the credential.
    #[error("Authentication rejected: {0}")]
    Rejected(String),
    /// Network failure talking to the provider.
    #[error("Auth network error: {0}")]
    Network(String),
    /// Provider response could not be understood.
    #[error("Auth protocol error: {0}")]
    Protocol(String),
    /// Random generation for the PKCE verifier failed.
    #[error("Random generation failed: {0}")]
    RandomGeneration(String),
}

// === FeedError ===

/// Errors from the change-feed transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    /// Could not open the underlying connection.
    #[error("Feed connection failed: {0}")]
    Connect(String),
    /// The server refused the channel join.
    #[error("Feed join rejected: {0}")]
    JoinRejected(String),
    /// No credential available for the subscription.
    #[error("Feed requires a signed-in session")]
    NotAuthenticated,
    /// The subscription ended unexpectedly.
    #[error("Feed closed: {0}")]
    Closed(String),
}

// === SettingsError ===

/// Errors related to configuration loading.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// An I/O error occurred while reading the config file.
    #[error("Settings I/O error: {0}")]
    IoError(String),
    /// Failed to parse the config file.
    #[error("Settings serialization error: {0}")]
    SerializationError(String),
    /// A configured value is invalid.
    #[error("Invalid settings value: {0}")]
    InvalidValue(String),
}
