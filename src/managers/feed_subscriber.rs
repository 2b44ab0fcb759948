//! Change Feed Subscriber for smartmarks.
//!
//! Keeps at most one live subscription, bound to the current identity. Each
//! subscription runs in its own task that parses raw changes into typed
//! [`ChangeEvent`]s and pushes them onto a channel read by the reconciler.
//!
//! When the transport refuses or drops the feed, the task reports it once,
//! then keeps re-subscribing with exponential backoff until it succeeds or
//! is released. A successful re-subscription is reported as well, since
//! changes made while the feed was down were never delivered.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::services::realtime::{FeedTransport, Subscription};
use crate::types::errors::FeedError;
use crate::types::feed::{ChangeEvent, FeedFilter};
use crate::types::session::Identity;

/// What the feed task has to tell the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSignal {
    Change(ChangeEvent),
    /// The feed is down; retries continue in the background.
    Interrupted(FeedError),
    /// The feed is back after an interruption.
    Resumed,
}

/// A feed signal, tagged with the identity generation it was received under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEvent {
    pub generation: u64,
    pub signal: FeedSignal,
}

/// Delays between re-subscription attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    fn next(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).min(self.max)
    }
}

struct ActiveFeed {
    identity: Identity,
    generation: u64,
    shutdown: oneshot::Sender<()>,
}

/// How a live subscription ended.
enum Ended {
    Released,
    Lost(FeedError),
}

/// Owns the subscription for the current identity.
pub struct FeedSubscriber<F: FeedTransport> {
    transport: Arc<F>,
    schema: String,
    table: String,
    retry: RetryPolicy,
    events: mpsc::Sender<FeedEvent>,
    active: Option<ActiveFeed>,
}

impl<F: FeedTransport> FeedSubscriber<F> {
    pub fn new(transport: F, schema: &str, table: &str, events: mpsc::Sender<FeedEvent>) -> Self {
        Self {
            transport: Arc::new(transport),
            schema: schema.to_string(),
            table: table.to_string(),
            retry: RetryPolicy::default(),
            events,
            active: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Re-binds the subscription to `identity`. The previous subscription is
    /// released first; an absent identity leaves nothing open.
    pub fn follow(&mut self, identity: Option<&Identity>, generation: u64) {
        if let Some(active) = &self.active {
            if Some(&active.identity) == identity && active.generation == generation {
                return;
            }
        }
        self.release();

        let Some(identity) = identity else {
            return;
        };
        let filter = FeedFilter {
            schema: self.schema.clone(),
            table: self.table.clone(),
            owner: identity.clone(),
        };
        let (shutdown, shutdown_rx) = oneshot::channel();
        tokio::spawn(Self::pump(
            Arc::clone(&self.transport),
            filter,
            generation,
            self.retry,
            self.events.clone(),
            shutdown_rx,
        ));
        self.active = Some(ActiveFeed {
            identity: identity.clone(),
            generation,
            shutdown,
        });
    }

    /// Releases the current subscription, if any.
    pub fn release(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(identity = %active.identity, generation = active.generation, "releasing feed");
            // The task may already have ended on its own.
            let _ = active.shutdown.send(());
        }
    }

    async fn pump(
        transport: Arc<F>,
        filter: FeedFilter,
        generation: u64,
        retry: RetryPolicy,
        events: mpsc::Sender<FeedEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut delay = retry.initial;
        let mut interrupted = false;

        loop {
            let subscribed = tokio::select! {
                _ = &mut shutdown => return,
                result = transport.subscribe(&filter) => result,
            };
            let error = match subscribed {
                Ok(mut subscription) => {
                    info!(identity = %filter.owner, generation, "feed subscribed");
                    if interrupted {
                        interrupted = false;
                        let signal = FeedSignal::Resumed;
                        if events.send(FeedEvent { generation, signal }).await.is_err() {
                            return;
                        }
                    }
                    delay = retry.initial;
                    let ended =
                        Self::forward(&mut subscription, &filter, generation, &events, &mut shutdown).await;
                    subscription.unsubscribe();
                    debug!(identity = %filter.owner, generation, "feed unsubscribed");
                    match ended {
                        Ended::Released => return,
                        Ended::Lost(error) => error,
                    }
                }
                Err(error) => error,
            };

            warn!(identity = %filter.owner, error = %error, retry_in = ?delay, "feed unavailable");
            if !interrupted {
                interrupted = true;
                let signal = FeedSignal::Interrupted(error);
                if events.send(FeedEvent { generation, signal }).await.is_err() {
                    return;
                }
            }
            tokio::select! {
                _ = &mut shutdown => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = retry.next(delay);
        }
    }

    /// Forwards changes from one live subscription until it ends.
    async fn forward(
        subscription: &mut Subscription,
        filter: &FeedFilter,
        generation: u64,
        events: &mpsc::Sender<FeedEvent>,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Ended {
        loop {
            let raw = tokio::select! {
                _ = &mut *shutdown => return Ended::Released,
                raw = subscription.next() => raw,
            };
            let Some(raw) = raw else {
                return Ended::Lost(FeedError::Closed("closed by transport".to_string()));
            };
            if raw.table != filter.table {
                continue;
            }
            if let Some(owner) = raw.owner() {
                if owner != filter.owner.as_str() {
                    warn!(identity = %filter.owner, owner, "dropping change for another owner");
                    continue;
                }
            }
            let event = match ChangeEvent::parse(&raw) {
                Ok(event) => event,
                Err(e) => {
                    warn!(identity = %filter.owner, error = %e, kind = ?raw.kind, "dropping malformed change");
                    continue;
                }
            };
            let signal = FeedSignal::Change(event);
            if events.send(FeedEvent { generation, signal }).await.is_err() {
                return Ended::Released;
            }
        }
    }
}

impl<F: FeedTransport> Drop for FeedSubscriber<F> {
    fn drop(&mut self) {
        self.release();
    }
}
