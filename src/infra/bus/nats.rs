//! NATS JetStream event publisher.
//!
//! The topic exchange is a JetStream stream. Its subject bindings decide
//! which routing keys land in it; the routing key of an envelope is used as
//! the subject. Every message carries `Nats-Msg-Id` so the server drops
//! redeliveries of the same event inside the stream's duplicate window.

use std::time::Duration;

use async_nats::jetstream::{self, stream};
use async_nats::{Client, HeaderMap, header};
use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::config::EventConfig;
use crate::domain::{AppError, Envelope, EventPublisher, MessageBusError, PublishAck};

#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub url: String,
    /// Name of the stream acting as the exchange.
    pub exchange: String,
    pub bindings: Vec<String>,
    pub duplicate_window: Duration,
    pub connection_timeout: Duration,
}

impl From<&EventConfig> for NatsConfig {
    fn from(config: &EventConfig) -> Self {
        Self {
            url: config.nats_url.clone(),
            exchange: config.exchange.clone(),
            bindings: config.bindings.clone(),
            duplicate_window: Duration::from_secs(120),
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl NatsConfig {
    fn stream_config(&self) -> stream::Config {
        stream::Config {
            name: self.exchange.clone(),
            subjects: self.bindings.clone(),
            duplicate_window: self.duplicate_window,
            ..Default::default()
        }
    }
}

pub struct NatsEventPublisher {
    client: Client,
    jetstream: jetstream::Context,
    config: NatsConfig,
    stream_ready: OnceCell<()>,
}

impl NatsEventPublisher {
    /// Connects to the server.
    ///
    /// The connection is retried in the background when the server is not
    /// reachable yet, so startup does not depend on the bus. Publishes fail
    /// with `PublishFailed` until it is.
    pub async fn connect(config: NatsConfig) -> Result<Self, AppError> {
        info!(url = %config.url, exchange = %config.exchange, "Connecting to NATS...");
        let client = async_nats::ConnectOptions::new()
            .name("item-service")
            .connection_timeout(config.connection_timeout)
            .retry_on_initial_connect()
            .connect(config.url.as_str())
            .await
            .map_err(|e| MessageBusError::Connection(e.to_string()))?;

        let jetstream = jetstream::new(client.clone());
        let publisher = Self {
            client,
            jetstream,
            config,
            stream_ready: OnceCell::new(),
        };

        if let Err(e) = publisher.ensure_exchange().await {
            warn!(error = %e, "Exchange not declared yet; will retry on first publish");
        }
        Ok(publisher)
    }

    /// Declares the exchange stream once per process.
    async fn ensure_exchange(&self) -> Result<(), MessageBusError> {
        self.stream_ready
            .get_or_try_init(|| async {
                let stream_config = self.config.stream_config();
                self.jetstream
                    .get_or_create_stream(stream_config)
                    .await
                    .map_err(|e| MessageBusError::Connection(e.to_string()))?;
                info!(
                    exchange = %self.config.exchange,
                    bindings = ?self.config.bindings,
                    "Exchange declared"
                );
                Ok::<(), MessageBusError>(())
            })
            .await
            .map(|_| ())
    }
}

/// Converts a JetStream acknowledgement, checking it landed in `expected`.
fn accept_ack(
    expected: &str,
    stream: String,
    sequence: u64,
    duplicate: bool,
) -> Result<PublishAck, MessageBusError> {
    if stream != expected {
        return Err(MessageBusError::Misrouted {
            expected: expected.to_string(),
            actual: stream,
        });
    }
    Ok(PublishAck {
        topic: stream,
        sequence,
        duplicate,
    })
}

fn message_headers(message_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::NATS_MESSAGE_ID, message_id);
    headers
}

#[async_trait]
impl EventPublisher for NatsEventPublisher {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        match self.client.connection_state() {
            async_nats::connection::State::Connected => Ok(()),
            state => Err(MessageBusError::Connection(format!("client is {state:?}")).into()),
        }
    }

    #[instrument(
        skip(self, envelope),
        fields(topic = %envelope.topic, routing_key = %envelope.routing_key, message_id = %envelope.message_id)
    )]
    async fn publish(&self, envelope: Envelope) -> Result<PublishAck, AppError> {
        if envelope.topic != self.config.exchange {
            return Err(MessageBusError::PublishFailed(format!(
                "exchange '{}' is not declared",
                envelope.topic
            ))
            .into());
        }
        self.ensure_exchange().await?;

        let ack = self
            .jetstream
            .publish_with_headers(
                envelope.routing_key.clone(),
                message_headers(&envelope.message_id),
                envelope.payload,
            )
            .await
            .map_err(|e| MessageBusError::PublishFailed(e.to_string()))?
            .await
            .map_err(|e| MessageBusError::PublishFailed(e.to_string()))?;

        let ack = accept_ack(&envelope.topic, ack.stream, ack.sequence, ack.duplicate)?;
        debug!(sequence = ack.sequence, duplicate = ack.duplicate, "Published event");
        Ok(ack)
    }
}
