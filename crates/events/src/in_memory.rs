//! In-memory channel hub for tests/dev.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use modbridge_core::PeerId;

use crate::channel::{ChannelError, MessageChannel, PeerInfo, Subscription};
use crate::envelope::{ChannelMessage, InboundMessage};

#[derive(Debug)]
struct Slot {
    token: u64,
    info: PeerInfo,
    subscribers: Vec<mpsc::UnboundedSender<InboundMessage>>,
}

/// Shared switchboard connecting in-process endpoints.
///
/// - No IO
/// - Each endpoint stands in for one process attached to the channel
/// - Best-effort fan-out; dead subscribers are dropped while delivering
#[derive(Debug, Clone, Default)]
pub struct InMemoryHub {
    slots: Arc<Mutex<BTreeMap<PeerId, Slot>>>,
    tokens: Arc<AtomicU64>,
}

impl InMemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint described by `info`.
    ///
    /// Reconnecting with an id that is already attached replaces the old slot;
    /// the stale endpoint then neither receives nor disconnects anything.
    pub fn connect(&self, info: PeerInfo) -> InMemoryEndpoint {
        let token = self.tokens.fetch_add(1, Ordering::Relaxed);
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.insert(
            info.id().clone(),
            Slot {
                token,
                info: info.clone(),
                subscribers: Vec::new(),
            },
        );
        InMemoryEndpoint {
            hub: self.clone(),
            info,
            token,
        }
    }

    /// Number of attached endpoints.
    pub fn connected(&self) -> usize {
        self.slots.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn deliver(&self, from: &PeerId, to: &PeerId, message: &ChannelMessage) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        let Some(slot) = slots.get_mut(to) else {
            return false;
        };
        slot.subscribers.retain(|tx| {
            tx.send(InboundMessage {
                from: from.clone(),
                message: message.clone(),
            })
            .is_ok()
        });
        true
    }

    fn disconnect(&self, id: &PeerId, token: u64) {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        if slots.get(id).is_some_and(|slot| slot.token == token) {
            slots.remove(id);
        }
    }
}

/// One process's view of the hub. Dropping it disconnects.
#[derive(Debug)]
pub struct InMemoryEndpoint {
    hub: InMemoryHub,
    info: PeerInfo,
    token: u64,
}

impl InMemoryEndpoint {
    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    pub fn id(&self) -> &PeerId {
        self.info.id()
    }
}

impl Drop for InMemoryEndpoint {
    fn drop(&mut self) {
        self.hub.disconnect(self.info.id(), self.token);
    }
}

#[async_trait::async_trait]
impl MessageChannel for InMemoryEndpoint {
    fn peers(&self) -> Vec<PeerInfo> {
        let slots = self.hub.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots
            .values()
            .filter(|slot| slot.info.id() != self.info.id())
            .map(|slot| slot.info.clone())
            .collect()
    }

    async fn send(&self, peer: &PeerId, message: ChannelMessage) -> Result<(), ChannelError> {
        if self.hub.deliver(self.info.id(), peer, &message) {
            Ok(())
        } else {
            Err(ChannelError::PeerNotFound(peer.clone()))
        }
    }

    async fn broadcast(
        &self,
        filter: &(dyn for<'p> Fn(&'p PeerInfo) -> bool + Send + Sync),
        message: ChannelMessage,
    ) -> Result<usize, ChannelError> {
        let targets: Vec<PeerId> = self
            .peers()
            .into_iter()
            .filter(|peer| filter(peer))
            .map(|peer| peer.id().clone())
            .collect();

        let delivered = targets
            .iter()
            .filter(|target| self.hub.deliver(self.info.id(), target, &message))
            .count();
        debug!(from = %self.info.id(), delivered, "broadcast delivered");
        Ok(delivered)
    }

    fn subscribe(&self) -> Subscription<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();

        // A detached endpoint still returns a subscription; it just stays silent.
        let mut slots = self.hub.slots.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(slot) = slots
            .get_mut(self.info.id())
            .filter(|slot| slot.token == self.token)
        {
            slot.subscribers.push(tx);
        }

        Subscription::new(rx)
    }
}
