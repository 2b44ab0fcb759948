//! Identity provider clients.
//!
//! [`SupabaseAuth`] drives the hosted OAuth PKCE flow against GoTrue;
//! [`LocalIdentityProvider`] signs in immediately against the local database.
//! Both publish the active credential into a shared [`SessionCell`].

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::{StatusCode, Url};
use rusqlite::params;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::database::Database;
use crate::services::pkce::{PkceGenerator, CHALLENGE_METHOD};
use crate::types::errors::AuthError;
use crate::types::session::{AuthSession, Identity, OAuthProvider, SessionCell, SignInStart};
use crate::types::settings::AppConfig;

/// Contract of the external identity provider.
pub trait IdentityProvider: Send + Sync + 'static {
    /// Starts an OAuth sign-in with the given provider.
    fn sign_in_with_oauth(
        &self,
        provider: OAuthProvider,
    ) -> impl Future<Output = Result<SignInStart, AuthError>> + Send;

    /// Finishes a redirect-based sign-in with the authorization code.
    fn exchange_code(&self, code: &str) -> impl Future<Output = Result<Identity, AuthError>> + Send;

    /// Invalidates the current session.
    fn sign_out(&self) -> impl Future<Output = Result<(), AuthError>> + Send;

    /// Asks the provider who is signed in right now.
    fn get_current_user(&self) -> impl Future<Output = Result<Option<Identity>, AuthError>> + Send;

    /// Renews the credential if it is about to expire. `Ok(None)` means the
    /// session has ended and cannot be renewed.
    fn refresh_session(&self) -> impl Future<Output = Result<Option<Identity>, AuthError>> + Send;
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// === Supabase GoTrue ===

/// Access tokens are renewed this many seconds before they expire.
const RENEW_MARGIN_SECS: i64 = 60;

enum Renewal {
    NotNeeded,
    Refresh(Zeroizing<String>),
    Ended,
}

fn renewal(session: &AuthSession, now: i64) -> Renewal {
    match session.expires_at {
        Some(at) if at - now <= RENEW_MARGIN_SECS => match &session.refresh_token {
            Some(token) => Renewal::Refresh(Zeroizing::new(token.clone())),
            None if at <= now => Renewal::Ended,
            None => Renewal::NotNeeded,
        },
        _ => Renewal::NotNeeded,
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    user: UserResponse,
}

#[derive(Deserialize)]
struct UserResponse {
    id: String,
}

#[derive(Deserialize, Default)]
struct GoTrueError {
    error: Option<String>,
    error_description: Option<String>,
    msg: Option<String>,
    message: Option<String>,
}

impl GoTrueError {
    fn describe(self, status: StatusCode) -> String {
        self.error_description
            .or(self.msg)
            .or(self.message)
            .or(self.error)
            .unwrap_or_else(|| status.to_string())
    }
}

/// GoTrue client using the PKCE authorization-code flow.
pub struct SupabaseAuth {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    redirect_to: Option<String>,
    session: SessionCell,
    pkce: PkceGenerator,
    pending_verifier: Mutex<Option<Zeroizing<String>>>,
}

impl SupabaseAuth {
    pub fn new(config: &AppConfig, session: SessionCell) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| AuthError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url().to_string(),
            anon_key: config.anon_key.clone(),
            redirect_to: config.redirect_to.clone(),
            session,
            pkce: PkceGenerator::new(),
            pending_verifier: Mutex::new(None),
        })
    }

    /// Builds the authorize URL the user has to open.
    fn authorize_url(&self, provider: OAuthProvider, challenge: &str) -> Result<String, AuthError> {
        let mut query = vec![
            ("provider", provider.as_str()),
            ("code_challenge", challenge),
            ("code_challenge_method", CHALLENGE_METHOD),
        ];
        if let Some(redirect) = self.redirect_to.as_deref() {
            query.push(("redirect_to", redirect));
        }
        let url = Url::parse_with_params(&format!("{}/auth/v1/authorize", self.base_url), &query)
            .map_err(|e| AuthError::Protocol(format!("invalid authorize URL: {}", e)))?;
        Ok(url.to_string())
    }

    fn take_verifier(&self) -> Option<Zeroizing<String>> {
        self.pending_verifier
            .lock()
            .map(|mut slot| slot.take())
            .unwrap_or(None)
    }

    /// Stores a token grant as the active session.
    fn store_tokens(&self, token: TokenResponse) -> Identity {
        let identity = Identity::new(token.user.id.clone());
        self.session.set(AuthSession {
            identity: identity.clone(),
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            expires_at: token.expires_in.map(|secs| now_secs() + secs),
        });
        identity
    }

    async fn rejection(response: reqwest::Response) -> AuthError {
        let status = response.status();
        let body: GoTrueError = response.json().await.unwrap_or_default();
        AuthError::Rejected(body.describe(status))
    }
}

impl IdentityProvider for SupabaseAuth {
    async fn sign_in_with_oauth(&self, provider: OAuthProvider) -> Result<SignInStart, AuthError> {
        let pair = self.pkce.generate()?;
        let url = self.authorize_url(provider, &pair.challenge)?;
        if let Ok(mut slot) = self.pending_verifier.lock() {
            *slot = Some(pair.verifier);
        }
        info!(provider = provider.as_str(), "oauth sign-in started");
        Ok(SignInStart::Redirect { url })
    }

    async fn exchange_code(&self, code: &str) -> Result<Identity, AuthError> {
        let verifier = self.take_verifier().ok_or(AuthError::NoPendingSignIn)?;

        let response = self
            .http
            .post(format!("{}/auth/v1/token", self.base_url))
            .query(&[("grant_type", "pkce")])
            .header("apikey", &self.anon_key)
            .json(&json!({ "auth_code": code, "code_verifier": verifier.as_str() }))
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Protocol(e.to_string()))?;

        let identity = self.store_tokens(token);
        info!(identity = %identity, "oauth code exchanged");
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        let token = self.session.access_token();
        self.session.clear();

        let Some(token) = token.map(Zeroizing::new) else {
            return Ok(());
        };
        let response = self
            .http
            .post(format!("{}/auth/v1/logout", self.base_url))
            .header("apikey", &self.anon_key)
            .bearer_auth(token.as_str())
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        // An already-expired token cannot be revoked again; that is still a sign-out.
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Ok(()),
            _ => Err(Self::rejection(response).await),
        }
    }

    async fn get_current_user(&self) -> Result<Option<Identity>, AuthError> {
        let Some(token) = self.session.access_token().map(Zeroizing::new) else {
            return Ok(None);
        };

        let response = self
            .http
            .get(format!("{}/auth/v1/user", self.base_url))
            .header("apikey", &self.anon_key)
            .bearer_auth(token.as_str())
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!("provider no longer accepts the session credential");
                self.session.clear();
                Ok(None)
            }
            s if s.is_success() => {
                let user: UserResponse = response
                    .json()
                    .await
                    .map_err(|e| AuthError::Protocol(e.to_string()))?;
                Ok(Some(Identity::new(user.id)))
            }
            _ => Err(Self::rejection(response).await),
        }
    }

    async fn refresh_session(&self) -> Result<Option<Identity>, AuthError> {
        let Some(session) = self.session.snapshot() else {
            return Ok(None);
        };
        let refresh_token = match renewal(&session, now_secs()) {
            Renewal::NotNeeded => return Ok(Some(session.identity.clone())),
            Renewal::Ended => {
                warn!(identity = %session.identity, "access token expired and cannot be renewed");
                self.session.clear();
                return Ok(None);
            }
            Renewal::Refresh(token) => token,
        };

        let response = self
            .http
            .post(format!("{}/auth/v1/token", self.base_url))
            .query(&[("grant_type", "refresh_token")])
            .header("apikey", &self.anon_key)
            .json(&json!({ "refresh_token": refresh_token.as_str() }))
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        match response.status() {
            s if s.is_success() => {
                let token: TokenResponse = response
                    .json()
                    .await
                    .map_err(|e| AuthError::Protocol(e.to_string()))?;
                let identity = self.store_tokens(token);
                debug!(identity = %identity, "access token renewed");
                Ok(Some(identity))
            }
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let reason = Self::rejection(response).await;
                warn!(identity = %session.identity, error = %reason, "session refresh rejected");
                self.session.clear();
                Ok(None)
            }
            _ => Err(Self::rejection(response).await),
        }
    }
}

// === Local provider ===

/// Signs in without a browser hop, registering the identity in the local database.
///
/// `exchange_code` treats the code as the identity to sign in as, which lets
/// a single process switch between several local users.
pub struct LocalIdentityProvider {
    db: Arc<Database>,
    session: SessionCell,
    default_identity: Identity,
}

impl LocalIdentityProvider {
    pub fn new(db: Arc<Database>, session: SessionCell, default_identity: Identity) -> Self {
        Self {
            db,
            session,
            default_identity,
        }
    }

    fn establish(&self, identity: &Identity) -> Result<(), AuthError> {
        self.db
            .connection()
            .execute(
                "INSERT OR IGNORE INTO users (id, created_at) VALUES (?1, ?2)",
                params![identity.as_str(), now_secs()],
            )
            .map_err(|e| AuthError::Rejected(e.to_string()))?;
        self.session.set(AuthSession::new(
            identity.clone(),
            format!("local-{}", Uuid::new_v4()),
        ));
        debug!(identity = %identity, "local session established");
        Ok(())
    }

    /// Drops the credential as if the provider had invalidated it.
    pub fn revoke(&self) {
        self.session.clear();
    }
}

impl IdentityProvider for LocalIdentityProvider {
    async fn sign_in_with_oauth(&self, provider: OAuthProvider) -> Result<SignInStart, AuthError> {
        self.establish(&self.default_identity)?;
        info!(provider = provider.as_str(), identity = %self.default_identity, "local sign-in");
        Ok(SignInStart::Completed {
            identity: self.default_identity.clone(),
        })
    }

    async fn exchange_code(&self, code: &str) -> Result<Identity, AuthError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(AuthError::Rejected("empty authorization code".to_string()));
        }
        let identity = Identity::new(code);
        self.establish(&identity)?;
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.session.clear();
        Ok(())
    }

    async fn get_current_user(&self) -> Result<Option<Identity>, AuthError> {
        Ok(self.session.identity())
    }

    async fn refresh_session(&self) -> Result<Option<Identity>, AuthError> {
        Ok(self.session.identity())
    }
}
