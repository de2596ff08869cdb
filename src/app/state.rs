//! Application state management.
//!
//! This module provides the shared application state that is
//! accessible to all request handlers via Axum's State extractor.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use secrecy::SecretString;

use crate::config::AppConfig;
use crate::domain::{AnnouncementLedger, BlobStore, EventPublisher, ItemRepository, UserDirectory};

use super::attachment::{AttachmentConfig, AttachmentCoordinator};
use super::ingestion::{IngestionConfig, IngestionCoordinator};
use super::service::AppService;

/// The collaborators every component is wired from.
#[derive(Clone)]
pub struct Collaborators {
    pub users: Arc<dyn UserDirectory>,
    pub items: Arc<dyn ItemRepository>,
    pub ledger: Arc<dyn AnnouncementLedger>,
    pub blobs: Arc<dyn BlobStore>,
    pub publisher: Arc<dyn EventPublisher>,
}

/// Shared application state for the Axum web server.
///
/// All contained types are wrapped in `Arc` and implement `Send + Sync`,
/// making `AppState` safe to share across async tasks.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<AppService>,
    pub ingestion: Arc<IngestionCoordinator>,
    pub attachments: Arc<AttachmentCoordinator>,
    /// Key expected in `x-api-key` on mutating routes.
    pub api_auth_key: SecretString,
    /// Prometheus scrape handle; `/metrics` answers 404 without one.
    pub metrics: Option<Arc<PrometheusHandle>>,
}

impl AppState {
    /// Wires the services and coordinators from `collaborators`.
    #[must_use]
    pub fn new(collaborators: Collaborators, config: &AppConfig) -> Self {
        let Collaborators {
            users,
            items,
            ledger,
            blobs,
            publisher,
        } = collaborators;

        let service = Arc::new(AppService::new(
            Arc::clone(&items),
            Arc::clone(&blobs),
            Arc::clone(&publisher),
            config.call_timeout,
        ));
        let ingestion = Arc::new(IngestionCoordinator::new(
            users,
            Arc::clone(&items),
            ledger,
            publisher,
            IngestionConfig::from(config),
        ));
        let attachments = Arc::new(AttachmentCoordinator::new(
            items,
            blobs,
            AttachmentConfig::from(config),
        ));

        Self {
            service,
            ingestion,
            attachments,
            api_auth_key: config.api_auth_key.clone(),
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, handle: Arc<PrometheusHandle>) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Largest request body the upload route must accept to judge an image.
    pub fn upload_body_limit(&self) -> usize {
        self.attachments
            .policy()
            .max_bytes
            .saturating_mul(2)
            .max(8 * 1024 * 1024)
    }
}
