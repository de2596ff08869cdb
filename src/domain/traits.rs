//! Domain traits defining contracts for external systems.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use super::error::AppError;
use super::types::{
    BlobKey, BlobMetadata, BlobRef, Envelope, Item, ItemFilter, ItemId, PendingAnnouncement,
    PublishAck, SellerId, User,
};

/// Lazily produced sequence of items.
pub type ItemStream = BoxStream<'static, Result<Item, AppError>>;

/// Persistence of item metadata records.
#[async_trait]
pub trait ItemRepository: Send + Sync {
    /// Check storage connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Insert a new record. Fails with `DatabaseError::Duplicate` on an id clash.
    async fn create_item(&self, item: &Item) -> Result<ItemId, AppError>;

    async fn get_item(&self, id: ItemId) -> Result<Option<Item>, AppError>;

    /// Stream every item matching `filter`, in creation order.
    fn list_items(&self, filter: ItemFilter) -> ItemStream;

    /// Replace the image reference of an item in a single atomic update.
    ///
    /// Returns `AppError::ItemNotFound` when no record has this id.
    async fn set_image_reference(&self, id: ItemId, image: &BlobRef) -> Result<(), AppError>;
}

/// Durable record of items whose creation event has not been acknowledged.
#[async_trait]
pub trait AnnouncementLedger: Send + Sync {
    /// Record (or refresh) a pending announcement for `item_id`.
    async fn record_unannounced(&self, item_id: ItemId, error: &str) -> Result<(), AppError>;

    /// Entries due for another attempt, oldest first.
    async fn pending_announcements(
        &self,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Vec<PendingAnnouncement>, AppError>;

    async fn get_pending(&self, item_id: ItemId) -> Result<Option<PendingAnnouncement>, AppError>;

    /// Remove the entry once the bus acknowledged the event.
    async fn mark_announced(&self, item_id: ItemId) -> Result<(), AppError>;

    /// Bump the attempt counter and return the new count.
    async fn record_attempt_failure(
        &self,
        item_id: ItemId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<i32, AppError>;
}

/// Content-addressed binary storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    /// Store `content` under `key`. A blob is visible only once data and
    /// metadata are both complete.
    async fn put(
        &self,
        key: &BlobKey,
        content: Bytes,
        metadata: &BlobMetadata,
    ) -> Result<BlobRef, AppError>;

    async fn get(&self, key: &BlobKey) -> Result<Option<Bytes>, AppError>;
}

/// At-least-once delivery of domain events to a topic exchange.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    /// Publish and wait for the bus acknowledgement.
    async fn publish(&self, envelope: Envelope) -> Result<PublishAck, AppError>;
}

/// Read-only lookup into the external user service.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, id: SellerId) -> Result<Option<User>, AppError>;
}
