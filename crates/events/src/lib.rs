//! Cross-process message channel: transport abstraction and wire envelopes.
//!
//! The query protocol in `modbridge-infra` is written against [`MessageChannel`];
//! a websocket server, a Redis relay or the [`InMemoryHub`] can sit underneath.

pub mod channel;
pub mod envelope;
pub mod in_memory;

pub use channel::{ChannelError, MessageChannel, PeerInfo, Subscription};
pub use envelope::{ChannelMessage, InboundMessage, QueryEnvelope, QueryKind, ReplyEnvelope};
pub use in_memory::{InMemoryEndpoint, InMemoryHub};
