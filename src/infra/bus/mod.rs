//! Message bus adapters.

pub mod nats;

pub use nats::{NatsConfig, NatsEventPublisher};
