//! Infrastructure layer: job queues, circuit breakers, throttling, cross-process queries.

pub mod config;
pub mod jobs;
pub mod query;
pub mod resilience;
pub mod throttle;


pub use config::{ConfigError, InfraConfig};
