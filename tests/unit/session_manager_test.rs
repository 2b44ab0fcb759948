//! Unit tests for the Session Holder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use smartmarks::database::Database;
use smartmarks::managers::session_manager::SessionManager;
use smartmarks::services::auth_client::{IdentityProvider, LocalIdentityProvider};
use smartmarks::types::errors::AuthError;
use smartmarks::types::session::{Identity, OAuthProvider, SessionCell, SignInStart};

fn local_session() -> (Arc<LocalIdentityProvider>, SessionCell, SessionManager<LocalIdentityProvider>) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let cell = SessionCell::new();
    let provider = Arc::new(LocalIdentityProvider::new(
        db,
        cell.clone(),
        Identity::new("local-user"),
    ));
    let manager = SessionManager::new(provider.clone(), OAuthProvider::Google);
    (provider, cell, manager)
}

#[tokio::test]
async fn test_starts_signed_out() {
    let (_, _, manager) = local_session();
    assert_eq!(manager.current_identity(), None);
    assert_eq!(*manager.identity_changes().borrow(), None);
}

#[tokio::test]
async fn test_sign_in_publishes_identity() {
    let (_, cell, manager) = local_session();
    let mut changes = manager.identity_changes();

    let start = manager.sign_in().await.unwrap();
    assert_eq!(
        start,
        SignInStart::Completed {
            identity: Identity::new("local-user")
        }
    );

    changes.changed().await.unwrap();
    assert_eq!(*changes.borrow(), Some(Identity::new("local-user")));
    assert_eq!(cell.identity(), Some(Identity::new("local-user")));
}

#[tokio::test]
async fn test_complete_sign_in_switches_identity() {
    let (_, _, manager) = local_session();
    manager.sign_in().await.unwrap();

    let identity = manager.complete_sign_in("u2").await.unwrap();
    assert_eq!(identity, Identity::new("u2"));
    assert_eq!(manager.current_identity(), Some(Identity::new("u2")));
}

#[tokio::test]
async fn test_empty_code_is_rejected() {
    let (_, _, manager) = local_session();
    let err = manager.complete_sign_in("  ").await.unwrap_err();
    assert!(matches!(err, AuthError::Rejected(_)));
    assert_eq!(manager.current_identity(), None);
}

#[tokio::test]
async fn test_sign_out_clears_identity_and_credential() {
    let (_, cell, manager) = local_session();
    manager.sign_in().await.unwrap();

    manager.sign_out().await;
    assert_eq!(manager.current_identity(), None);
    assert!(cell.snapshot().is_none());
}

#[tokio::test]
async fn test_refresh_notices_revoked_credential() {
    let (provider, _, manager) = local_session();
    manager.sign_in().await.unwrap();

    provider.revoke();
    assert_eq!(manager.refresh().await.unwrap(), None);
    assert_eq!(manager.current_identity(), None);
}

#[tokio::test]
async fn test_same_identity_is_not_republished() {
    let (_, _, manager) = local_session();
    manager.sign_in().await.unwrap();
    let mut changes = manager.identity_changes();
    let _ = changes.borrow_and_update();

    manager.refresh().await.unwrap();
    assert!(!changes.has_changed().unwrap());
}

/// Provider whose sign-out call always fails.
struct FlakyProvider {
    signed_in: AtomicBool,
    expired: AtomicBool,
}

impl FlakyProvider {
    fn new() -> Self {
        Self {
            signed_in: AtomicBool::new(false),
            expired: AtomicBool::new(false),
        }
    }
}

impl IdentityProvider for FlakyProvider {
    async fn sign_in_with_oauth(&self, _provider: OAuthProvider) -> Result<SignInStart, AuthError> {
        self.signed_in.store(true, Ordering::SeqCst);
        Ok(SignInStart::Completed {
            identity: Identity::new("u1"),
        })
    }

    async fn exchange_code(&self, _code: &str) -> Result<Identity, AuthError> {
        Err(AuthError::NoPendingSignIn)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        Err(AuthError::Network("connection refused".to_string()))
    }

    async fn get_current_user(&self) -> Result<Option<Identity>, AuthError> {
        Ok(self
            .signed_in
            .load(Ordering::SeqCst)
            .then(|| Identity::new("u1")))
    }

    async fn refresh_session(&self) -> Result<Option<Identity>, AuthError> {
        if self.expired.load(Ordering::SeqCst) {
            self.signed_in.store(false, Ordering::SeqCst);
        }
        self.get_current_user().await
    }
}

#[tokio::test]
async fn test_failed_remote_sign_out_still_signs_out_locally() {
    let provider = Arc::new(FlakyProvider::new());
    let manager = SessionManager::new(provider, OAuthProvider::Github);
    manager.sign_in().await.unwrap();
    assert!(manager.current_identity().is_some());

    manager.sign_out().await;
    assert_eq!(manager.current_identity(), None);
}

#[tokio::test]
async fn test_redirect_flow_waits_for_code() {
    let provider = Arc::new(FlakyProvider::new());
    let manager = SessionManager::new(provider, OAuthProvider::Github);
    assert_eq!(
        manager.complete_sign_in("code").await,
        Err(AuthError::NoPendingSignIn)
    );
    assert_eq!(manager.current_identity(), None);
}

#[tokio::test]
async fn test_keep_alive_keeps_a_live_session() {
    let provider = Arc::new(FlakyProvider::new());
    let manager = SessionManager::new(provider, OAuthProvider::Github);
    manager.sign_in().await.unwrap();

    assert_eq!(manager.keep_alive().await, Ok(Some(Identity::new("u1"))));
    assert_eq!(manager.current_identity(), Some(Identity::new("u1")));
}

#[tokio::test]
async fn test_keep_alive_clears_an_ended_session() {
    let provider = Arc::new(FlakyProvider::new());
    let manager = SessionManager::new(provider.clone(), OAuthProvider::Github);
    manager.sign_in().await.unwrap();
    let mut changes = manager.identity_changes();
    let _ = changes.borrow_and_update();

    provider.expired.store(true, Ordering::SeqCst);
    let watcher = manager.clone();
    assert_eq!(watcher.keep_alive().await, Ok(None));

    assert!(changes.has_changed().unwrap());
    assert_eq!(manager.current_identity(), None);
}

#[tokio::test]
async fn test_refresh_skips_lookup_for_an_ended_session() {
    let provider = Arc::new(FlakyProvider::new());
    let manager = SessionManager::new(provider.clone(), OAuthProvider::Github);
    manager.sign_in().await.unwrap();

    provider.expired.store(true, Ordering::SeqCst);
    assert_eq!(manager.refresh().await, Ok(None));
    assert_eq!(manager.current_identity(), None);
}
