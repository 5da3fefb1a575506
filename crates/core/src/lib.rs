//! `modbridge-core`: shared primitives for the coordination layer.
//!
//! This crate contains **pure** building blocks (no IO, no async): identifiers,
//! the error model, and the clock port every time-dependent component reads from.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::CoreError;
pub use id::{ActorId, JobId, MessageId, PeerId};
