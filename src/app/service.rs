//! Read-side application service.
//!
//! Lookups, listings and health reporting over the same collaborators the
//! coordinators write through.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use tracing::{info, instrument, warn};

use crate::domain::{
    AppError, BlobStore, EventPublisher, HealthResponse, HealthStatus, Item, ItemFilter, ItemId,
    ItemRepository,
};

use super::deadline::{Collaborator, bounded};

/// Page size used when a listing does not ask for one.
pub const DEFAULT_LIST_LIMIT: usize = 100;
/// Largest page a single listing returns.
pub const MAX_LIST_LIMIT: usize = 500;

/// Application service for queries and health.
///
/// # Example
///
/// ```ignore
/// let service = AppService::new(items, blobs, publisher, Duration::from_secs(5));
/// let item = service.get_item(id).await?;
/// let health = service.health_check().await;
/// ```
pub struct AppService {
    items: Arc<dyn ItemRepository>,
    blobs: Arc<dyn BlobStore>,
    publisher: Arc<dyn EventPublisher>,
    call_timeout: Duration,
}

impl AppService {
    #[must_use]
    pub fn new(
        items: Arc<dyn ItemRepository>,
        blobs: Arc<dyn BlobStore>,
        publisher: Arc<dyn EventPublisher>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            items,
            blobs,
            publisher,
            call_timeout,
        }
    }

    /// Gets an item by ID.
    #[instrument(skip(self))]
    pub async fn get_item(&self, id: ItemId) -> Result<Option<Item>, AppError> {
        info!(item_id = %id, "Fetching item");
        bounded(
            self.call_timeout,
            Collaborator::ItemStore,
            self.items.get_item(id),
        )
        .await
    }

    /// Collects at most `limit` items matching `filter`.
    ///
    /// The repository stream is dropped as soon as the page is full, so a
    /// large table is never read past the requested page.
    #[instrument(skip(self))]
    pub async fn list_items(
        &self,
        filter: ItemFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Item>, AppError> {
        let limit = limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);

        bounded(
            self.call_timeout,
            Collaborator::ItemStore,
            self.items.list_items(filter).take(limit).try_collect(),
        )
        .await
    }

    /// Performs a health check on all dependencies.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> HealthResponse {
        let (database, blob_store, message_bus) = tokio::join!(
            self.probe("database", Collaborator::ItemStore, self.items.health_check()),
            self.probe("blob_store", Collaborator::BlobStore, self.blobs.health_check()),
            self.probe(
                "message_bus",
                Collaborator::MessageBus,
                self.publisher.health_check()
            ),
        );

        HealthResponse::new(database, blob_store, message_bus)
    }

    async fn probe<F>(&self, name: &str, target: Collaborator, check: F) -> HealthStatus
    where
        F: Future<Output = Result<(), AppError>>,
    {
        match bounded(self.call_timeout, target, check).await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => {
                warn!(component = name, error = %e, "Health check failed");
                HealthStatus::Unhealthy
            }
        }
    }
}
