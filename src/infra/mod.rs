//! Infrastructure layer implementations.

pub mod blob;
pub mod bus;
pub mod database;
pub mod observability;
pub mod users;

pub use blob::FsBlobStore;
pub use bus::{NatsConfig, NatsEventPublisher};
pub use database::{PostgresClient, PostgresConfig};
pub use observability::{PrometheusHandle, init_metrics, init_tracing};
pub use users::{HttpUserDirectory, UserServiceConfig};
