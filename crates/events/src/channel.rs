//! Bidirectional message channel abstraction (mechanics only).
//!
//! A channel connects one local process to any number of peer connections. The
//! contract is deliberately small:
//!
//! - **Broadcast with a predicate**: send to every peer whose [`PeerInfo`] matches
//! - **Per-connection send**: reply to the connection a message came from
//! - **Inbound stream**: every subscriber sees every inbound message
//!
//! Delivery is best-effort. Messages can be lost (a peer disconnects mid-flight)
//! and peers can answer more than once, so consumers must tolerate both.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;

use modbridge_core::PeerId;

use crate::envelope::{ChannelMessage, InboundMessage};

/// Channel-level failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("peer not connected: {0}")]
    PeerNotFound(PeerId),
    #[error("channel disconnected: {0}")]
    Disconnected(String),
    #[error("failed to serialize message: {0}")]
    Serialization(String),
}

/// What the local process knows about a connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    id: PeerId,
    authenticated: bool,
    capabilities: BTreeSet<String>,
}

impl PeerInfo {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            authenticated: false,
            capabilities: BTreeSet::new(),
        }
    }

    /// Mark the connection as having completed authentication.
    pub fn authenticated(mut self) -> Self {
        self.authenticated = true;
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &str> {
        self.capabilities.iter().map(String::as_str)
    }
}

/// A subscription to the inbound message stream.
///
/// Each subscription gets a copy of every inbound message (broadcast semantics).
/// It ends (`recv` returns `None`) once the channel side is dropped.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: mpsc::UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: mpsc::UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Take a message if one is already buffered.
    pub fn try_recv(&mut self) -> Result<M, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }
}

/// Transport-agnostic bidirectional channel.
///
/// Implementations must be safe to share across tasks; sends may happen
/// concurrently with an active subscription.
#[async_trait::async_trait]
pub trait MessageChannel: Send + Sync {
    /// Snapshot of the currently connected peers (excluding ourselves).
    fn peers(&self) -> Vec<PeerInfo>;

    /// Send to one specific connection.
    async fn send(&self, peer: &PeerId, message: ChannelMessage) -> Result<(), ChannelError>;

    /// Send to every peer matching `filter`; returns how many received it.
    async fn broadcast(
        &self,
        filter: &(dyn for<'p> Fn(&'p PeerInfo) -> bool + Send + Sync),
        message: ChannelMessage,
    ) -> Result<usize, ChannelError>;

    /// Subscribe to inbound messages from all peers.
    fn subscribe(&self) -> Subscription<InboundMessage>;
}

#[async_trait::async_trait]
impl<C> MessageChannel for Arc<C>
where
    C: MessageChannel + ?Sized,
{
    fn peers(&self) -> Vec<PeerInfo> {
        (**self).peers()
    }

    async fn send(&self, peer: &PeerId, message: ChannelMessage) -> Result<(), ChannelError> {
        (**self).send(peer, message).await
    }

    async fn broadcast(
        &self,
        filter: &(dyn for<'p> Fn(&'p PeerInfo) -> bool + Send + Sync),
        message: ChannelMessage,
    ) -> Result<usize, ChannelError> {
        (**self).broadcast(filter, message).await
    }

    fn subscribe(&self) -> Subscription<InboundMessage> {
        (**self).subscribe()
    }
}
