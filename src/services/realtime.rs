//! Change-feed transports.
//!
//! A [`Subscription`] is the client end of one live feed. Its transport runs a
//! background task that forwards matching changes until the subscription is
//! released, either explicitly with [`Subscription::unsubscribe`] or by drop.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::types::errors::FeedError;
use crate::types::feed::{ChangeKind, FeedFilter, RawChange};
use crate::types::session::SessionCell;
use crate::types::settings::AppConfig;

/// Buffered changes per subscription before the transport applies backpressure.
const SUBSCRIPTION_BUFFER: usize = 256;

/// Contract of the change-feed transport.
pub trait FeedTransport: Send + Sync + 'static {
    /// Opens a live subscription for changes matching `filter`.
    fn subscribe(
        &self,
        filter: &FeedFilter,
    ) -> impl Future<Output = Result<Subscription, FeedError>> + Send;
}

/// Client end of a live feed.
pub struct Subscription {
    events: mpsc::Receiver<RawChange>,
    release: Option<oneshot::Sender<()>>,
}

/// Transport end of a live feed.
pub struct SubscriptionSink {
    pub events: mpsc::Sender<RawChange>,
    pub released: oneshot::Receiver<()>,
}

impl Subscription {
    /// Creates a connected subscription/sink pair.
    pub fn channel() -> (SubscriptionSink, Subscription) {
        let (events_tx, events_rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (release_tx, release_rx) = oneshot::channel();
        (
            SubscriptionSink {
                events: events_tx,
                released: release_rx,
            },
            Subscription {
                events: events_rx,
                release: Some(release_tx),
            },
        )
    }

    /// Next change, or `None` once the transport has closed the feed.
    pub async fn next(&mut self) -> Option<RawChange> {
        self.events.recv().await
    }

    /// Releases the feed and every resource the transport holds for it.
    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(tx) = self.release.take() {
            let _ = tx.send(());
        }
        self.events.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

// === Local hub ===

/// In-process change feed fed by the local store.
#[derive(Clone)]
pub struct LocalChangeHub {
    tx: broadcast::Sender<RawChange>,
    active: Arc<AtomicUsize>,
}

/// Counts a live subscription for as long as it is held.
struct ActiveSubscription(Arc<AtomicUsize>);

impl ActiveSubscription {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveSubscription {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl LocalChangeHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Broadcasts a change to every live subscription.
    pub fn publish(&self, change: RawChange) {
        // No receivers is fine: nobody is listening.
        let _ = self.tx.send(change);
    }

    /// Number of subscriptions not yet released.
    pub fn active_subscriptions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn matches(filter: &FeedFilter, change: &RawChange) -> bool {
        change.table == filter.table && change.owner() == Some(filter.owner.as_str())
    }
}

impl Default for LocalChangeHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl FeedTransport for LocalChangeHub {
    async fn subscribe(&self, filter: &FeedFilter) -> Result<Subscription, FeedError> {
        let mut rx = self.tx.subscribe();
        let active = ActiveSubscription::new(self.active.clone());
        let (sink, subscription) = Subscription::channel();
        let filter = filter.clone();

        tokio::spawn(async move {
            let _active = active;
            let SubscriptionSink {
                events,
                mut released,
            } = sink;
            loop {
                tokio::select! {
                    _ = &mut released => break,
                    received = rx.recv() => match received {
                        Ok(change) => {
                            if Self::matches(&filter, &change) && events.send(change).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, owner = %filter.owner, "local feed lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!(owner = %filter.owner, "local subscription released");
        });

        Ok(subscription)
    }
}

// === Supabase Realtime ===

/// One Phoenix channel message (protocol version 1.0.0, JSON).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    pub payload: Value,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

/// Incoming frame, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Reply {
        reference: Option<String>,
        ok: bool,
        response: Value,
    },
    Change(RawChange),
    Closed,
    Error(String),
    Ignored,
}

#[derive(Deserialize)]
struct PostgresChange {
    #[serde(rename = "type")]
    kind: ChangeKind,
    table: String,
    record: Option<Value>,
    old_record: Option<Value>,
}

/// Decodes one text frame from the realtime socket.
pub fn decode_frame(text: &str) -> Result<Frame, FeedError> {
    let message: PhoenixMessage = serde_json::from_str(text)
        .map_err(|e| FeedError::Closed(format!("undecodable frame: {}", e)))?;

    match message.event.as_str() {
        "phx_reply" => {
            let ok = message.payload.get("status").and_then(Value::as_str) == Some("ok");
            Ok(Frame::Reply {
                reference: message.reference,
                ok,
                response: message.payload.get("response").cloned().unwrap_or(Value::Null),
            })
        }
        "postgres_changes" => {
            let data = message
                .payload
                .get("data")
                .cloned()
                .ok_or_else(|| FeedError::Closed("postgres_changes without data".to_string()))?;
            let change: PostgresChange = serde_json::from_value(data)
                .map_err(|e| FeedError::Closed(format!("bad change payload: {}", e)))?;
            Ok(Frame::Change(RawChange {
                kind: change.kind,
                table: change.table,
                new: change.record.filter(|r| !r.is_null()),
                old: change.old_record.filter(|r| !r.is_null()),
            }))
        }
        "phx_close" => Ok(Frame::Closed),
        "phx_error" => Ok(Frame::Error(message.payload.to_string())),
        _ => Ok(Frame::Ignored),
    }
}

/// Supabase Realtime client speaking Phoenix channels over a websocket.
pub struct RealtimeTransport {
    socket_url: String,
    channel: String,
    session: SessionCell,
    heartbeat: Duration,
    join_timeout: Duration,
}

impl RealtimeTransport {
    pub fn new(config: &AppConfig, session: SessionCell) -> Self {
        let ws_base = config
            .base_url()
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        Self {
            socket_url: format!(
                "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
                ws_base, config.anon_key
            ),
            channel: config.channel.clone(),
            session,
            heartbeat: Duration::from_secs(config.heartbeat_interval_secs),
            join_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    /// `phx_join` for a postgres_changes subscription.
    pub fn join_message(topic: &str, filter: &FeedFilter, access_token: &str) -> PhoenixMessage {
        PhoenixMessage {
            topic: topic.to_string(),
            event: "phx_join".to_string(),
            payload: json!({
                "config": {
                    "broadcast": { "ack": false, "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [{
                        "event": "*",
                        "schema": filter.schema,
                        "table": filter.table,
                        "filter": filter.expression(),
                    }],
                },
                "access_token": access_token,
            }),
            reference: Some("1".to_string()),
            join_ref: Some("1".to_string()),
        }
    }

    fn control(topic: &str, event: &str, reference: u64) -> PhoenixMessage {
        PhoenixMessage {
            topic: topic.to_string(),
            event: event.to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
            join_ref: None,
        }
    }

    fn encode(message: &PhoenixMessage) -> Result<Message, FeedError> {
        serde_json::to_string(message)
            .map(|text| Message::Text(text.into()))
            .map_err(|e| FeedError::Closed(e.to_string()))
    }
}

impl FeedTransport for RealtimeTransport {
    async fn subscribe(&self, filter: &FeedFilter) -> Result<Subscription, FeedError> {
        let token = self
            .session
            .access_token()
            .map(zeroize::Zeroizing::new)
            .ok_or(FeedError::NotAuthenticated)?;
        let topic = format!("realtime:{}", self.channel);

        let (socket, _) = tokio_tungstenite::connect_async(self.socket_url.as_str())
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;
        let (mut write, mut read) = socket.split();

        let join = Self::join_message(&topic, filter, token.as_str());
        write
            .send(Self::encode(&join)?)
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;

        // Wait for the join reply before handing out the subscription.
        let joined = tokio::time::timeout(self.join_timeout, async {
            while let Some(message) = read.next().await {
                let message = message.map_err(|e| FeedError::Connect(e.to_string()))?;
                let Message::Text(text) = message else { continue };
                match decode_frame(text.as_str())? {
                    Frame::Reply { reference, ok, response } if reference == join.reference => {
                        return if ok {
                            Ok(())
                        } else {
                            Err(FeedError::JoinRejected(response.to_string()))
                        };
                    }
                    Frame::Error(reason) => return Err(FeedError::JoinRejected(reason)),
                    _ => {}
                }
            }
            Err(FeedError::Closed("socket closed during join".to_string()))
        })
        .await
        .map_err(|_| FeedError::Connect("timed out waiting for join reply".to_string()))?;
        joined?;
        info!(topic = %topic, filter = %filter.expression(), "realtime channel joined");

        let (sink, subscription) = Subscription::channel();
        let heartbeat_every = self.heartbeat;
        tokio::spawn(async move {
            let SubscriptionSink {
                events,
                mut released,
            } = sink;
            let mut heartbeat = tokio::time::interval(heartbeat_every);
            heartbeat.tick().await;
            let mut next_ref: u64 = 2;

            loop {
                tokio::select! {
                    _ = &mut released => {
                        if let Ok(leave) = Self::encode(&Self::control(&topic, "phx_leave", next_ref)) {
                            let _ = write.send(leave).await;
                        }
                        let _ = write.close().await;
                        break;
                    }
                    _ = heartbeat.tick() => {
                        let beat = Self::control("phoenix", "heartbeat", next_ref);
                        next_ref += 1;
                        let sent = match Self::encode(&beat) {
                            Ok(frame) => write.send(frame).await.is_ok(),
                            Err(_) => false,
                        };
                        if !sent {
                            warn!(topic = %topic, "heartbeat failed, closing feed");
                            break;
                        }
                    }
                    incoming = read.next() => match incoming {
                        Some(Ok(Message::Text(text))) => match decode_frame(text.as_str()) {
                            Ok(Frame::Change(change)) => {
                                if events.send(change).await.is_err() {
                                    break;
                                }
                            }
                            Ok(Frame::Closed) => break,
                            Ok(Frame::Error(reason)) => {
                                warn!(topic = %topic, %reason, "realtime channel error");
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => warn!(topic = %topic, error = %e, "dropping realtime frame"),
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(topic = %topic, error = %e, "realtime socket error");
                            break;
                        }
                    }
                }
            }
            debug!(topic = %topic, "realtime subscription released");
        });

        Ok(subscription)
    }
}
