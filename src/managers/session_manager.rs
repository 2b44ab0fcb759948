//! Session Holder for smartmarks.
//!
//! Tracks who is signed in and broadcasts every identity change on a watch
//! channel. Downstream components (initial fetch, feed filter) re-evaluate
//! whenever the published identity changes.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::services::auth_client::IdentityProvider;
use crate::types::errors::AuthError;
use crate::types::session::{Identity, OAuthProvider, SignInStart};

/// Session holder over an identity provider.
///
/// Clones share the provider and the identity channel.
pub struct SessionManager<P: IdentityProvider> {
    provider: Arc<P>,
    oauth_provider: OAuthProvider,
    identity: Arc<watch::Sender<Option<Identity>>>,
}

impl<P: IdentityProvider> Clone for SessionManager<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            oauth_provider: self.oauth_provider,
            identity: Arc::clone(&self.identity),
        }
    }
}

impl<P: IdentityProvider> SessionManager<P> {
    pub fn new(provider: Arc<P>, oauth_provider: OAuthProvider) -> Self {
        let (identity, _) = watch::channel(None);
        Self {
            provider,
            oauth_provider,
            identity: Arc::new(identity),
        }
    }

    /// Subscribes to identity changes. The receiver starts at the current value.
    pub fn identity_changes(&self) -> watch::Receiver<Option<Identity>> {
        self.identity.subscribe()
    }

    /// Latest known identity.
    pub fn current_identity(&self) -> Option<Identity> {
        self.identity.borrow().clone()
    }

    /// Publishes `next`, notifying subscribers only on an actual change.
    fn publish(&self, next: Option<Identity>) -> bool {
        self.identity.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            match &next {
                Some(identity) => info!(identity = %identity, "identity acquired"),
                None => info!("identity cleared"),
            }
            *current = next;
            true
        })
    }

    /// Starts the OAuth exchange with the configured provider.
    ///
    /// Providers that finish immediately publish the identity right away;
    /// redirect flows publish it from [`complete_sign_in`](Self::complete_sign_in).
    pub async fn sign_in(&self) -> Result<SignInStart, AuthError> {
        let start = self.provider.sign_in_with_oauth(self.oauth_provider).await?;
        if let SignInStart::Completed { identity } = &start {
            self.publish(Some(identity.clone()));
        }
        Ok(start)
    }

    /// Finishes a redirect-based sign-in.
    pub async fn complete_sign_in(&self, code: &str) -> Result<Identity, AuthError> {
        let identity = self.provider.exchange_code(code).await?;
        self.publish(Some(identity.clone()));
        Ok(identity)
    }

    /// Signs out. The identity becomes absent even if the provider call fails.
    pub async fn sign_out(&self) {
        if let Err(e) = self.provider.sign_out().await {
            warn!(error = %e, "provider sign-out failed; clearing local session anyway");
        }
        self.publish(None);
    }

    /// Asks the provider who is signed in and publishes the answer.
    ///
    /// This is how an invalidated credential is noticed: the provider reports
    /// nobody and the identity becomes absent.
    pub async fn refresh(&self) -> Result<Option<Identity>, AuthError> {
        let identity = match self.provider.refresh_session().await? {
            Some(_) => self.provider.get_current_user().await?,
            None => None,
        };
        self.publish(identity.clone());
        Ok(identity)
    }

    /// Renews the credential when it is close to expiry.
    ///
    /// A session the provider can no longer renew is published as absent.
    /// A renewal never publishes an identity, so it cannot undo a concurrent
    /// sign-out. Network errors leave the identity untouched.
    pub async fn keep_alive(&self) -> Result<Option<Identity>, AuthError> {
        let identity = self.provider.refresh_session().await?;
        if identity.is_none() && self.publish(None) {
            warn!("session ended; signed out");
        }
        Ok(identity)
    }
}
