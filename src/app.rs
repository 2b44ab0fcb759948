//! App Core for smartmarks.
//!
//! [`App`] is the explicitly constructed application state: it owns the
//! session holder, the reconciler task and a keep-alive task that renews the
//! access token before it expires. It is torn down with [`App::shutdown`]. Platform clients are injected, so the same App runs
//! against the hosted platform or the local SQLite one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::managers::bookmark_manager::{BookmarkClient, DeleteOutcome};
use crate::managers::feed_subscriber::RetryPolicy;
use crate::managers::reconciler::{Command, Reconciler};
use crate::managers::session_manager::SessionManager;
use crate::services::auth_client::{IdentityProvider, LocalIdentityProvider, SupabaseAuth};
use crate::services::realtime::{FeedTransport, LocalChangeHub, RealtimeTransport};
use crate::services::store_client::{BookmarkStore, PostgrestStore, SqliteBookmarkStore};
use crate::types::bookmark::{Bookmark, BookmarkId};
use crate::types::errors::{AuthError, BookmarkError};
use crate::types::session::{Identity, SessionCell, SignInStart};
use crate::types::settings::AppConfig;
use crate::types::view::{Notice, ViewState};

/// App wired to the hosted platform.
pub type SupabaseApp = App<SupabaseAuth>;

/// App wired to the local platform.
pub type LocalApp = App<LocalIdentityProvider>;

/// Central application struct.
pub struct App<P: IdentityProvider> {
    config: AppConfig,
    session: SessionManager<P>,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ViewState>,
    notices: Option<mpsc::UnboundedReceiver<Notice>>,
    reconciler: Option<JoinHandle<()>>,
    keep_alive: JoinHandle<()>,
}

impl<P: IdentityProvider> App<P> {
    /// Wires the components and spawns the reconciler. Must run inside a tokio runtime.
    pub fn start<S, F>(config: AppConfig, provider: Arc<P>, store: S, transport: F) -> Self
    where
        S: BookmarkStore,
        F: FeedTransport,
    {
        let session = SessionManager::new(provider, config.oauth_provider);
        let (reconciler, channels) = Reconciler::new(
            BookmarkClient::new(store),
            transport,
            &config.schema,
            &config.table,
            session.identity_changes(),
            config.command_buffer,
            RetryPolicy {
                initial: Duration::from_millis(config.feed_retry_initial_ms),
                max: Duration::from_secs(config.feed_retry_max_secs),
            },
        );
        let handle = tokio::spawn(reconciler.run());
        let keep_alive = tokio::spawn(keep_session_alive(
            session.clone(),
            Duration::from_secs(config.session_check_secs),
        ));
        info!(backend = ?config.backend, table = %config.table, "app started");

        Self {
            config,
            session,
            commands: channels.commands,
            state: channels.state,
            notices: Some(channels.notices),
            reconciler: Some(handle),
            keep_alive,
        }
    }

    /// Stops the reconciler and releases the feed.
    pub async fn shutdown(mut self) {
        self.keep_alive.abort();
        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(handle) = self.reconciler.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "reconciler ended abnormally");
            }
        }
        info!("app stopped");
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionManager<P> {
        &self.session
    }

    // ─── Session ───

    pub async fn sign_in(&self) -> Result<SignInStart, AuthError> {
        self.session.sign_in().await
    }

    pub async fn complete_sign_in(&self, code: &str) -> Result<Identity, AuthError> {
        self.session.complete_sign_in(code).await
    }

    pub async fn sign_out(&self) {
        self.session.sign_out().await
    }

    pub fn current_identity(&self) -> Option<Identity> {
        self.session.current_identity()
    }

    /// Re-checks the credential with the provider.
    pub async fn current_user(&self) -> Result<Option<Identity>, AuthError> {
        self.session.refresh().await
    }

    // ─── Bookmarks ───

    async fn request<T>(
        &self,
        build: impl FnOnce(Option<oneshot::Sender<Result<T, BookmarkError>>>) -> Command,
    ) -> Result<T, BookmarkError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(Some(tx)))
            .await
            .map_err(|_| BookmarkError::Unexpected("app is shut down".to_string()))?;
        rx.await
            .map_err(|_| BookmarkError::Unexpected("request dropped".to_string()))?
    }

    pub async fn add_bookmark(&self, title: &str, url: &str) -> Result<Bookmark, BookmarkError> {
        let (title, url) = (title.to_string(), url.to_string());
        self.request(|reply| Command::Create { title, url, reply }).await
    }

    /// Creates a bookmark from the form fields held in the view state.
    pub async fn submit_form(&self) -> Result<Bookmark, BookmarkError> {
        self.request(|reply| Command::SubmitForm { reply }).await
    }

    pub async fn delete_bookmark(
        &self,
        id: &BookmarkId,
        confirmed: bool,
    ) -> Result<DeleteOutcome, BookmarkError> {
        let id = id.clone();
        self.request(|reply| Command::Delete {
            id,
            confirmed,
            reply,
        })
        .await
    }

    pub async fn refresh(&self) -> Result<(), BookmarkError> {
        self.request(|reply| Command::Refresh { reply }).await
    }

    pub async fn set_form(&self, title: Option<String>, url: Option<String>) {
        let _ = self.commands.send(Command::SetForm { title, url }).await;
    }

    // ─── View ───

    pub fn state(&self) -> ViewState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ViewState> {
        self.state.clone()
    }

    /// Waits until the view state satisfies `predicate` and returns it.
    pub async fn wait_for_state(
        &self,
        predicate: impl FnMut(&ViewState) -> bool,
    ) -> Result<ViewState, BookmarkError> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(predicate)
            .await
            .map_err(|_| BookmarkError::Unexpected("app is shut down".to_string()))?
            .clone();
        Ok(state)
    }

    /// Hands the notice stream to a presentation layer. Only the first call gets it.
    pub fn take_notices(&mut self) -> Option<mpsc::UnboundedReceiver<Notice>> {
        self.notices.take()
    }

    /// Notices queued so far, without waiting.
    pub fn drain_notices(&mut self) -> Vec<Notice> {
        let mut drained = Vec::new();
        if let Some(rx) = self.notices.as_mut() {
            while let Ok(notice) = rx.try_recv() {
                drained.push(notice);
            }
        }
        drained
    }
}

impl<P: IdentityProvider> Drop for App<P> {
    fn drop(&mut self) {
        self.keep_alive.abort();
    }
}

/// Periodically renews the access token; an unrenewable session signs out.
async fn keep_session_alive<P: IdentityProvider>(session: SessionManager<P>, period: Duration) {
    let mut ticks = interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        if session.current_identity().is_none() {
            continue;
        }
        match session.keep_alive().await {
            Ok(Some(_)) => {}
            Ok(None) => debug!("keep-alive found no session"),
            Err(e) => warn!(error = %e, "session renewal failed; will retry"),
        }
    }
}

/// Local platform pieces sharing one database and one session cell.
#[derive(Clone)]
pub struct LocalPlatform {
    pub db: Arc<Database>,
    pub session: SessionCell,
    pub hub: LocalChangeHub,
    pub provider: Arc<LocalIdentityProvider>,
    pub store: SqliteBookmarkStore,
}

impl LocalPlatform {
    /// Opens the configured database file, or an in-memory one.
    pub fn open(config: &AppConfig) -> Result<Self, rusqlite::Error> {
        let db = Arc::new(match config.local_db_path.as_deref() {
            Some(path) => Database::open(path)?,
            None => Database::open_in_memory()?,
        });
        let session = SessionCell::new();
        let hub = LocalChangeHub::default();
        let provider = Arc::new(LocalIdentityProvider::new(
            Arc::clone(&db),
            session.clone(),
            Identity::new(config.local_identity.clone()),
        ));
        let store = SqliteBookmarkStore::new(Arc::clone(&db), hub.clone(), session.clone(), &config.table);
        Ok(Self {
            db,
            session,
            hub,
            provider,
            store,
        })
    }
}

impl LocalApp {
    pub fn start_local(config: AppConfig, platform: &LocalPlatform) -> Self {
        Self::start(
            config,
            Arc::clone(&platform.provider),
            platform.store.clone(),
            platform.hub.clone(),
        )
    }
}

impl SupabaseApp {
    pub fn start_supabase(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let session = SessionCell::new();
        let provider = Arc::new(SupabaseAuth::new(&config, session.clone())?);
        let store = PostgrestStore::new(&config, session.clone())?;
        let transport = RealtimeTransport::new(&config, session);
        Ok(Self::start(config, provider, store, transport))
    }
}
