//! Peer side of the query protocol: answer queries this process knows about.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use modbridge_core::PeerId;
use modbridge_events::{ChannelError, ChannelMessage, MessageChannel, QueryEnvelope, QueryKind, ReplyEnvelope};

/// Handles one `(kind, event)` pair.
#[async_trait::async_trait]
pub trait QueryHandler: Send + Sync {
    /// Produce the reply payload. Errors become `{ success: false, error }`.
    async fn handle(&self, data: Option<JsonValue>) -> anyhow::Result<JsonValue>;
}

/// Routes inbound queries to registered handlers and replies on the
/// originating connection.
///
/// Queries with no handler get no reply at all, leaving them to other peers.
pub struct QueryResponder {
    channel: Arc<dyn MessageChannel>,
    handlers: HashMap<(QueryKind, String), Arc<dyn QueryHandler>>,
}

impl core::fmt::Debug for QueryResponder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut routes: Vec<String> = self
            .handlers
            .keys()
            .map(|(kind, event)| format!("{kind}:{event}"))
            .collect();
        routes.sort();
        f.debug_struct("QueryResponder")
            .field("routes", &routes)
            .finish_non_exhaustive()
    }
}

impl QueryResponder {
    pub fn new(channel: Arc<dyn MessageChannel>) -> Self {
        Self {
            channel,
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for `(kind, event)`. A later registration for the
    /// same pair replaces the earlier one and logs a warning.
    pub fn register(
        mut self,
        kind: QueryKind,
        event: impl Into<String>,
        handler: Arc<dyn QueryHandler>,
    ) -> Self {
        let event = event.into();
        if self.handlers.insert((kind, event.clone()), handler).is_some() {
            warn!(kind = %kind, event = %event, "query handler replaced by a later registration");
        }
        self
    }

    pub fn handles(&self, kind: QueryKind, event: &str) -> bool {
        self.handlers.contains_key(&(kind, event.to_string()))
    }

    /// Answer one query. Returns `Ok(false)` when no handler is registered.
    pub async fn respond(&self, from: &PeerId, query: QueryEnvelope) -> Result<bool, ChannelError> {
        let Some(handler) = self
            .handlers
            .get(&(query.kind(), query.event().to_string()))
            .cloned()
        else {
            debug!(event = %query.event(), kind = %query.kind(), "no handler for query");
            return Ok(false);
        };

        let message_id = query.message_id().clone();
        let event = query.event().to_string();
        let reply = match handler.handle(query.into_data()).await {
            Ok(payload) => ReplyEnvelope::success(message_id, payload),
            Err(err) => {
                warn!(event = %event, from = %from, error = %format!("{err:#}"), "query handler failed");
                ReplyEnvelope::failure(message_id, format!("{err:#}"))
            }
        };

        self.channel.send(from, reply.into()).await?;
        Ok(true)
    }

    /// Subscribe and answer queries on a background task, one task per query.
    pub fn spawn(self) -> ResponderHandle {
        let responder = Arc::new(self);
        let mut subscription = responder.channel.subscribe();
        info!(routes = responder.handlers.len(), "query responder started");

        let task = tokio::spawn(async move {
            while let Some(inbound) = subscription.recv().await {
                let ChannelMessage::Query(query) = inbound.message else {
                    continue;
                };
                if !responder.handles(query.kind(), query.event()) {
                    continue;
                }
                let responder = responder.clone();
                tokio::spawn(async move {
                    if let Err(e) = responder.respond(&inbound.from, query).await {
                        warn!(to = %inbound.from, error = %e, "failed to send query reply");
                    }
                });
            }
        });

        ResponderHandle { task: Some(task) }
    }
}

/// Owns the responder's listener task; dropping it stops answering.
#[derive(Debug)]
pub struct ResponderHandle {
    task: Option<JoinHandle<()>>,
}

impl ResponderHandle {
    pub fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ResponderHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
