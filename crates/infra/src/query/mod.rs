//! Cross-process queries: correlated request/response over the message channel.
//!
//! Job queues carry one-way work; when a process needs an answer from another
//! long-lived process (the API asking the bot), it uses a [`QueryClient`] on its
//! side and a [`QueryResponder`] on the other.

pub mod client;
pub mod responder;

pub use client::{BOT_CAPABILITY, PeerFilter, QueryClient, QueryConfig, QueryError};
pub use responder::{QueryHandler, QueryResponder, ResponderHandle};
