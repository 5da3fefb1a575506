//! Correlated request/response over a [`MessageChannel`].
//!
//! ## Protocol
//!
//! 1. Register a pending entry keyed by a fresh `messageId`, with its own timeout task
//! 2. Broadcast the query to every peer passing the filter
//! 3. The first reply carrying that `messageId` settles the entry
//!
//! Late, duplicate and unknown replies find no entry and are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use modbridge_core::{Clock, MessageId};
use modbridge_events::{
    ChannelError, ChannelMessage, MessageChannel, PeerInfo, QueryEnvelope, QueryKind, ReplyEnvelope,
};
use modbridge_observability::Metrics;

/// Predicate selecting which peers receive a query.
pub type PeerFilter = Arc<dyn Fn(&PeerInfo) -> bool + Send + Sync>;

/// Capability a peer must advertise to answer queries by default.
pub const BOT_CAPABILITY: &str = "bot";

#[derive(Clone)]
pub struct QueryConfig {
    /// How long to wait for a reply (default 30s).
    pub timeout: Duration,
    pub peer_filter: PeerFilter,
}

impl core::fmt::Debug for QueryConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueryConfig")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            peer_filter: Arc::new(|peer: &PeerInfo| {
                peer.is_authenticated() && peer.has_capability(BOT_CAPABILITY)
            }),
        }
    }
}

impl QueryConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_peer_filter(
        mut self,
        filter: impl Fn(&PeerInfo) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.peer_filter = Arc::new(filter);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("no peer available to answer {event}")]
    NoPeerAvailable { event: String },

    #[error("query {event} timed out after {after:?}")]
    Timeout { event: String, after: Duration },

    #[error("query {event} rejected: {error}")]
    Rejected { event: String, error: String },

    #[error("reply to {event} could not be decoded: {reason}")]
    Decode { event: String, reason: String },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("query client shut down")]
    Shutdown,
}

impl QueryError {
    fn outcome(&self) -> &'static str {
        match self {
            QueryError::NoPeerAvailable { .. } => "no_peer",
            QueryError::Timeout { .. } => "timeout",
            QueryError::Rejected { .. } => "rejected",
            QueryError::Decode { .. } => "decode_error",
            QueryError::Channel(_) => "channel_error",
            QueryError::Shutdown => "shutdown",
        }
    }
}

type ReplySender = oneshot::Sender<Result<JsonValue, QueryError>>;

struct Pending {
    event: String,
    reply: ReplySender,
    timer: JoinHandle<()>,
}

struct ClientInner {
    channel: Arc<dyn MessageChannel>,
    config: QueryConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    pending: Mutex<HashMap<MessageId, Pending>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    fn take(&self, id: &MessageId) -> Option<Pending> {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id)
    }

    fn expire(&self, id: &MessageId) {
        if let Some(pending) = self.take(id) {
            warn!(message_id = %id, event = %pending.event, "query timed out");
            let _ = pending.reply.send(Err(QueryError::Timeout {
                event: pending.event,
                after: self.config.timeout,
            }));
        }
    }

    fn settle(&self, reply: ReplyEnvelope) -> bool {
        let Some(pending) = self.take(reply.message_id()) else {
            debug!(message_id = %reply.message_id(), "discarding reply for unknown query");
            return false;
        };
        pending.timer.abort();

        let result = if reply.is_success() {
            Ok(reply.into_data())
        } else {
            Err(QueryError::Rejected {
                event: pending.event,
                error: reply.error().unwrap_or("query failed").to_string(),
            })
        };
        let _ = pending.reply.send(result);
        true
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().unwrap_or_else(|p| p.into_inner()).take() {
            listener.abort();
        }
        let pending = self.pending.get_mut().unwrap_or_else(|p| p.into_inner());
        for (_, entry) in pending.drain() {
            entry.timer.abort();
        }
    }
}

/// Sends queries to peer processes and awaits their correlated replies.
///
/// Cheap to clone; all clones share the pending map and the reply listener.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl core::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueryClient")
            .field("config", &self.inner.config)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl QueryClient {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        config: QueryConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                channel,
                config,
                clock,
                metrics,
                pending: Mutex::new(HashMap::new()),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to the channel and start routing replies. Idempotent.
    pub fn attach(&self) {
        let mut listener = self.inner.listener.lock().unwrap_or_else(|p| p.into_inner());
        if listener.is_some() {
            return;
        }

        let mut subscription = self.inner.channel.subscribe();
        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        *listener = Some(tokio::spawn(async move {
            while let Some(inbound) = subscription.recv().await {
                let ChannelMessage::Reply(reply) = inbound.message else {
                    continue;
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.settle(reply);
            }
        }));
        info!("query client attached");
    }

    /// Stop the listener and fail every outstanding query with `Shutdown`.
    pub fn detach(&self) {
        if let Some(listener) = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            listener.abort();
        }

        let drained: Vec<Pending> = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
            .map(|(_, pending)| pending)
            .collect();
        let rejected = drained.len();
        for pending in drained {
            pending.timer.abort();
            let _ = pending.reply.send(Err(QueryError::Shutdown));
        }
        info!(rejected, "query client detached");
    }

    pub fn is_attached(&self) -> bool {
        self.inner
            .listener
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Feed a reply received elsewhere. Returns whether it settled a pending query.
    pub fn handle_reply(&self, reply: ReplyEnvelope) -> bool {
        self.inner.settle(reply)
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// Ask eligible peers and wait for the first reply's `data`.
    ///
    /// # Errors
    /// - `NoPeerAvailable` immediately when no peer passes the filter
    /// - `Rejected` when the peer answered with `success: false`
    /// - `Timeout` when nothing answered in time
    pub async fn query(
        &self,
        kind: QueryKind,
        event: &str,
        data: Option<JsonValue>,
    ) -> Result<JsonValue, QueryError> {
        let result = self.send_and_wait(kind, event, data).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.outcome(),
        };
        self.inner.metrics.record_query(event, outcome);
        result
    }

    /// [`query`](Self::query), then deserialise the reply `data` into `T`.
    pub async fn query_as<T: DeserializeOwned>(
        &self,
        kind: QueryKind,
        event: &str,
        data: Option<JsonValue>,
    ) -> Result<T, QueryError> {
        let value = self.query(kind, event, data).await?;
        serde_json::from_value(value).map_err(|e| QueryError::Decode {
            event: event.to_string(),
            reason: e.to_string(),
        })
    }

    async fn send_and_wait(
        &self,
        kind: QueryKind,
        event: &str,
        data: Option<JsonValue>,
    ) -> Result<JsonValue, QueryError> {
        let message_id = MessageId::generate();
        let envelope = QueryEnvelope::new(
            kind,
            event,
            data,
            message_id.clone(),
            self.inner.clock.now_ms(),
        );

        // Register before sending so a fast reply always finds its entry.
        let (tx, rx) = oneshot::channel();
        let timer = {
            let weak = Arc::downgrade(&self.inner);
            let id = message_id.clone();
            let timeout = self.inner.config.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    inner.expire(&id);
                }
            })
        };
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                message_id.clone(),
                Pending {
                    event: event.to_string(),
                    reply: tx,
                    timer,
                },
            );

        let filter = self.inner.config.peer_filter.clone();
        let sent = self
            .inner
            .channel
            .broadcast(&*filter, envelope.into())
            .await;

        match sent {
            Ok(0) => {
                self.abandon(&message_id);
                return Err(QueryError::NoPeerAvailable {
                    event: event.to_string(),
                });
            }
            Ok(delivered) => {
                debug!(message_id = %message_id, event = %event, %kind, delivered, "query sent");
            }
            Err(e) => {
                self.abandon(&message_id);
                return Err(e.into());
            }
        }

        rx.await.unwrap_or(Err(QueryError::Shutdown))
    }

    fn abandon(&self, id: &MessageId) {
        if let Some(pending) = self.inner.take(id) {
            pending.timer.abort();
        }
    }
}
