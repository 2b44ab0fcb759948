//! View State Reconciler for smartmarks.
//!
//! A single task owns the [`ViewProjection`]. It reacts to identity changes,
//! user commands, finished remote calls and feed events, one message at a
//! time, and publishes the resulting [`ViewState`] on a watch channel.
//!
//! Remote calls run in their own tasks and report back as [`Outcome`]
//! messages, so the projection is never modified across an await point.
//! A caller's reply is sent only after the state it produced is published.
//!
//! A lost change feed is reported to the user; once the feed is back, the
//! list is re-read to pick up whatever was missed.

use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::managers::bookmark_manager::{BookmarkClient, ConfirmPrompt, DeleteOutcome, DELETE_PROMPT};
use crate::managers::feed_subscriber::{FeedEvent, FeedSignal, FeedSubscriber, RetryPolicy};
use crate::managers::view_state::ViewProjection;
use crate::services::realtime::FeedTransport;
use crate::services::store_client::BookmarkStore;
use crate::types::bookmark::{Bookmark, BookmarkId, NewBookmark};
use crate::types::errors::BookmarkError;
use crate::types::session::Identity;
use crate::types::view::{Notice, ViewPhase, ViewState};

type Reply<T> = Option<oneshot::Sender<Result<T, BookmarkError>>>;

/// Requests from the presentation layer.
#[derive(Debug)]
pub enum Command {
    Create {
        title: String,
        url: String,
        reply: Reply<Bookmark>,
    },
    /// Creates from the current form fields.
    SubmitForm { reply: Reply<Bookmark> },
    Delete {
        id: BookmarkId,
        confirmed: bool,
        reply: Reply<DeleteOutcome>,
    },
    SetForm {
        title: Option<String>,
        url: Option<String>,
    },
    Refresh { reply: Reply<()> },
    Shutdown,
}

/// A finished remote call.
#[derive(Debug)]
enum Outcome {
    Listed {
        generation: u64,
        identity: Identity,
        initial: bool,
        /// List epoch when the read was issued.
        issued_at: u64,
        result: Result<Vec<Bookmark>, BookmarkError>,
        reply: Reply<()>,
    },
    Created {
        generation: u64,
        result: Result<Bookmark, BookmarkError>,
        reply: Reply<Bookmark>,
    },
    Deleted {
        generation: u64,
        id: BookmarkId,
        result: Result<(), BookmarkError>,
        reply: Reply<DeleteOutcome>,
    },
}

fn respond<T>(reply: Reply<T>, result: Result<T, BookmarkError>) {
    if let Some(tx) = reply {
        // The caller may have stopped waiting.
        let _ = tx.send(result);
    }
}

/// Runs `call` to completion, turning a panic into [`BookmarkError::Unexpected`]
/// so the outcome is always reported.
async fn guarded<T, Fut>(what: &'static str, call: Fut) -> Result<T, BookmarkError>
where
    Fut: std::future::Future<Output = Result<T, BookmarkError>>,
{
    AssertUnwindSafe(call).catch_unwind().await.unwrap_or_else(|_| {
        error!(operation = what, "remote call panicked");
        Err(BookmarkError::Unexpected(format!("{} did not complete", what)))
    })
}

/// The single update loop owning the view state.
pub struct Reconciler<S: BookmarkStore, F: FeedTransport> {
    client: BookmarkClient<S>,
    feed: FeedSubscriber<F>,
    view: ViewProjection,
    identity: watch::Receiver<Option<Identity>>,
    commands: mpsc::Receiver<Command>,
    outcomes_tx: mpsc::UnboundedSender<Outcome>,
    outcomes: mpsc::UnboundedReceiver<Outcome>,
    feed_events: mpsc::Receiver<FeedEvent>,
    state: watch::Sender<ViewState>,
    notices: mpsc::UnboundedSender<Notice>,
}

/// Channels the presentation layer keeps after the loop is spawned.
pub struct ReconcilerChannels {
    pub commands: mpsc::Sender<Command>,
    pub state: watch::Receiver<ViewState>,
    pub notices: mpsc::UnboundedReceiver<Notice>,
}

impl<S: BookmarkStore, F: FeedTransport> Reconciler<S, F> {
    pub fn new(
        client: BookmarkClient<S>,
        transport: F,
        schema: &str,
        table: &str,
        identity: watch::Receiver<Option<Identity>>,
        command_buffer: usize,
        retry: RetryPolicy,
    ) -> (Self, ReconcilerChannels) {
        let (commands_tx, commands) = mpsc::channel(command_buffer.max(1));
        let (outcomes_tx, outcomes) = mpsc::unbounded_channel();
        let (feed_tx, feed_events) = mpsc::channel(command_buffer.max(1));
        let (state, state_rx) = watch::channel(ViewState::default());
        let (notices, notices_rx) = mpsc::unbounded_channel();

        let reconciler = Self {
            client,
            feed: FeedSubscriber::new(transport, schema, table, feed_tx).with_retry(retry),
            view: ViewProjection::new(),
            identity,
            commands,
            outcomes_tx,
            outcomes,
            feed_events,
            state,
            notices,
        };
        let channels = ReconcilerChannels {
            commands: commands_tx,
            state: state_rx,
            notices: notices_rx,
        };
        (reconciler, channels)
    }

    /// Runs until [`Command::Shutdown`], or until every command sender or the
    /// session holder is gone. The feed is released on exit.
    pub async fn run(mut self) {
        let initial = self.identity.borrow_and_update().clone();
        self.on_identity(initial);
        self.publish();

        loop {
            tokio::select! {
                // Identity first: a command sent right after sign-in must see the new session.
                biased;

                changed = self.identity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let identity = self.identity.borrow_and_update().clone();
                    self.on_identity(identity);
                }
                Some(outcome) = self.outcomes.recv() => self.on_outcome(outcome),
                Some(event) = self.feed_events.recv() => self.on_feed(event),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
            }
            self.publish();
        }

        self.feed.release();
        info!("reconciler stopped");
    }

    fn publish(&self) {
        let current = self.view.state();
        self.state.send_if_modified(|published| {
            if *published == *current {
                return false;
            }
            *published = current.clone();
            true
        });
    }

    fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }

    fn on_identity(&mut self, identity: Option<Identity>) {
        if !self.view.set_identity(identity.clone()) {
            return;
        }
        let generation = self.view.generation();
        info!(identity = ?identity.as_ref().map(Identity::as_str), generation, "session changed");

        self.feed.follow(identity.as_ref(), generation);
        if let Some(identity) = identity {
            self.spawn_list(generation, identity, true, None);
        }
    }

    fn on_feed(&mut self, event: FeedEvent) {
        let generation = event.generation;
        match event.signal {
            FeedSignal::Change(change) => {
                let id = change.id().clone();
                if !self.view.apply_event(generation, change) {
                    debug!(generation, bookmark_id = %id, "feed event ignored");
                }
            }
            _ if self.view.generation() != generation => {
                debug!(generation, "feed status from an earlier session ignored");
            }
            FeedSignal::Interrupted(e) => {
                self.notify(Notice::error(format!("Live updates interrupted: {}", e)));
            }
            FeedSignal::Resumed => {
                self.notify(Notice::info("Live updates restored"));
                if let (ViewPhase::Ready | ViewPhase::Mutating, Some(identity)) =
                    (self.view.phase(), self.view.identity().cloned())
                {
                    self.spawn_list(generation, identity, false, None);
                }
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Create { title, url, reply } => self.start_create(&title, &url, reply),
            Command::SubmitForm { reply } => {
                let form = self.view.state().form.clone();
                self.start_create(&form.title, &form.url, reply);
            }
            Command::Delete {
                id,
                confirmed,
                reply,
            } => self.start_delete(id, confirmed, reply),
            Command::SetForm { title, url } => self.view.set_form(title, url),
            Command::Refresh { reply } => match (self.view.phase(), self.view.identity().cloned()) {
                (ViewPhase::Ready | ViewPhase::Mutating, Some(identity)) => {
                    self.spawn_list(self.view.generation(), identity, false, reply);
                }
                (ViewPhase::LoadingInitial, _) => respond(reply, Err(BookmarkError::NotReady)),
                _ => respond(reply, Err(BookmarkError::NotSignedIn)),
            },
            Command::Shutdown => {}
        }
    }

    fn start_create(&mut self, title: &str, url: &str, reply: Reply<Bookmark>) {
        let draft = self
            .client
            .prepare_create(self.view.identity(), title, url, &self.view.state().bookmarks)
            .and_then(|draft| self.view.begin_mutation().map(|generation| (generation, draft)));

        match draft {
            Ok((generation, draft)) => self.spawn_create(generation, draft, reply),
            Err(e) => {
                warn!(error = %e, "create refused");
                self.notify(Notice::error(e.create_message()));
                respond(reply, Err(e));
            }
        }
    }

    fn start_delete(&mut self, id: BookmarkId, confirmed: bool, reply: Reply<DeleteOutcome>) {
        let Some(identity) = self.view.identity().cloned() else {
            let e = BookmarkError::NotSignedIn;
            self.notify(Notice::error(e.delete_message()));
            respond(reply, Err(e));
            return;
        };
        if !confirmed.confirm(DELETE_PROMPT) {
            debug!(bookmark_id = %id, "delete declined");
            respond(reply, Ok(DeleteOutcome::Declined));
            return;
        }
        match self.view.begin_mutation() {
            Ok(generation) => self.spawn_delete(generation, identity, id, reply),
            Err(e) => {
                warn!(bookmark_id = %id, error = %e, "delete refused");
                self.notify(Notice::error(e.delete_message()));
                respond(reply, Err(e));
            }
        }
    }

    fn spawn_list(&self, generation: u64, identity: Identity, initial: bool, reply: Reply<()>) {
        let issued_at = self.view.epoch();
        let client = self.client.clone();
        let outcomes = self.outcomes_tx.clone();
        tokio::spawn(async move {
            let result = guarded("list", client.list(Some(&identity))).await;
            let _ = outcomes.send(Outcome::Listed {
                generation,
                identity,
                initial,
                issued_at,
                result,
                reply,
            });
        });
    }

    fn spawn_create(&self, generation: u64, draft: NewBookmark, reply: Reply<Bookmark>) {
        let client = self.client.clone();
        let outcomes = self.outcomes_tx.clone();
        tokio::spawn(async move {
            let result = guarded("create", client.insert(&draft)).await;
            let _ = outcomes.send(Outcome::Created {
                generation,
                result,
                reply,
            });
        });
    }

    fn spawn_delete(&self, generation: u64, identity: Identity, id: BookmarkId, reply: Reply<DeleteOutcome>) {
        let client = self.client.clone();
        let outcomes = self.outcomes_tx.clone();
        tokio::spawn(async move {
            let result = guarded("delete", client.remove(&identity, &id)).await;
            let _ = outcomes.send(Outcome::Deleted {
                generation,
                id,
                result,
                reply,
            });
        });
    }

    fn on_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Listed {
                generation,
                identity,
                initial,
                issued_at,
                result,
                reply,
            } => {
                let current = self.view.generation() == generation;
                let rows = match result {
                    Ok(rows) => rows,
                    Err(e) => {
                        error!(identity = %identity, error = %e, "listing bookmarks failed");
                        if current {
                            self.notify(Notice::error(format!("Failed to load bookmarks: {}", e)));
                        }
                        if !initial {
                            respond(reply, Err(e));
                            return;
                        }
                        Vec::new()
                    }
                };
                let applied = if initial {
                    self.view.apply_initial_list(generation, &identity, rows)
                } else {
                    self.view.apply_refresh(generation, &identity, issued_at, rows)
                };
                if !applied {
                    debug!(identity = %identity, generation, "discarding stale list");
                }
                self.publish();
                respond(reply, Ok(()));
            }
            Outcome::Created {
                generation,
                result,
                reply,
            } => {
                self.view.finish_mutation(generation);
                match &result {
                    Ok(bookmark) => {
                        self.view.apply_created(generation, bookmark.clone());
                    }
                    Err(e) => {
                        warn!(error = %e, "create failed");
                        if self.view.generation() == generation {
                            self.notify(Notice::error(e.create_message()));
                        }
                    }
                }
                self.publish();
                respond(reply, result);
            }
            Outcome::Deleted {
                generation,
                id,
                result,
                reply,
            } => {
                self.view.finish_mutation(generation);
                let result = match result {
                    Ok(()) => {
                        self.view.apply_deleted(generation, &id);
                        Ok(DeleteOutcome::Deleted)
                    }
                    Err(e) => {
                        warn!(bookmark_id = %id, error = %e, "delete failed");
                        if self.view.generation() == generation {
                            self.notify(Notice::error(e.delete_message()));
                        }
                        Err(e)
                    }
                };
                self.publish();
                respond(reply, result);
            }
        }
    }
}
