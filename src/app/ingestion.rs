//! Item creation: validate, persist, then announce.
//!
//! The item record is the source of truth. A failed announcement never rolls
//! the record back; the item is written to the [`AnnouncementLedger`] and
//! re-announced later, either on demand or by the background worker.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{SubsecRound, Utc};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::config::AppConfig;
use crate::domain::{
    AnnouncementLedger, AppError, CategorySet, CreateItemRequest, DatabaseError, Envelope,
    EventPublisher, Item,
    ItemCreatedEvent, ItemDraft, ItemId, ItemRepository, MessageBusError, PublishAck,
    UserDirectory, ValidationError,
};

use super::deadline::{Collaborator, bounded};

/// Settings for the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub exchange: String,
    pub routing_key: String,
    pub categories: CategorySet,
    pub call_timeout: Duration,
    /// Delay before the first re-announcement; doubles per failed attempt.
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub max_attempts: i32,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            exchange: "topic_fleet".to_string(),
            routing_key: "items.create".to_string(),
            categories: CategorySet::default(),
            call_timeout: Duration::from_secs(5),
            retry_base_delay: Duration::from_secs(30),
            retry_max_delay: Duration::from_secs(3600),
            max_attempts: 10,
        }
    }
}

impl From<&AppConfig> for IngestionConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            exchange: config.events.exchange.clone(),
            routing_key: config.events.routing_key.clone(),
            categories: config.categories.clone(),
            call_timeout: config.call_timeout,
            retry_base_delay: config.reconcile.interval,
            max_attempts: config.reconcile.max_attempts,
            ..Self::default()
        }
    }
}

/// Successful result of a creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestionOutcome {
    /// Persisted and announced.
    Created(Item),
    /// Persisted, but the creation event was not acknowledged.
    CreatedUnannounced { item: Item, reason: String },
}

impl IngestionOutcome {
    pub fn item(&self) -> &Item {
        match self {
            Self::Created(item) | Self::CreatedUnannounced { item, .. } => item,
        }
    }

    pub fn is_announced(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IngestionState {
    Received,
    Validated,
    Persisted,
    Announced,
    Rejected,
    Failed,
}

impl fmt::Display for IngestionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::Persisted => "persisted",
            Self::Announced => "announced",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        })
    }
}

pub struct IngestionCoordinator {
    users: Arc<dyn UserDirectory>,
    items: Arc<dyn ItemRepository>,
    ledger: Arc<dyn AnnouncementLedger>,
    publisher: Arc<dyn EventPublisher>,
    config: IngestionConfig,
}

impl IngestionCoordinator {
    #[must_use]
    pub fn new(
        users: Arc<dyn UserDirectory>,
        items: Arc<dyn ItemRepository>,
        ledger: Arc<dyn AnnouncementLedger>,
        publisher: Arc<dyn EventPublisher>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            users,
            items,
            ledger,
            publisher,
            config,
        }
    }

    pub fn config(&self) -> &IngestionConfig {
        &self.config
    }

    /// Validates, persists and announces a new item.
    ///
    /// # Errors
    ///
    /// Rejections (`Validation`, `SellerNotFound`, `UnsupportedCategory`)
    /// happen before anything is written. Any storage failure, an id clash
    /// included, is reported as `StorageUnavailable` and nothing is published. A publish failure is not an error: it
    /// yields [`IngestionOutcome::CreatedUnannounced`].
    #[instrument(
        skip(self, request),
        fields(item_id = tracing::field::Empty, seller = tracing::field::Empty)
    )]
    pub async fn create_item(
        &self,
        request: CreateItemRequest,
    ) -> Result<IngestionOutcome, AppError> {
        let span = tracing::Span::current();
        debug!(state = %IngestionState::Received, "Creation request received");

        let draft = match self.validate(request).await {
            Ok(draft) => draft,
            Err(e) => {
                let state = if e.kind().is_rejection() {
                    IngestionState::Rejected
                } else {
                    IngestionState::Failed
                };
                warn!(state = %state, error = %e, "Creation request not accepted");
                return Err(e);
            }
        };
        span.record("seller", tracing::field::display(draft.seller));
        debug!(state = %IngestionState::Validated, "Creation request validated");

        // Storage keeps microseconds.
        let item = Item::from_draft(Uuid::new_v4(), Utc::now().trunc_subsecs(6), draft);
        span.record("item_id", tracing::field::display(item.id));

        if let Err(e) = bounded(
            self.config.call_timeout,
            Collaborator::ItemStore,
            self.items.create_item(&item),
        )
        .await
        .map_err(storage_failure)
        {
            error!(state = %IngestionState::Failed, error = %e, "Failed to persist item");
            return Err(e);
        }
        info!(state = %IngestionState::Persisted, "Item persisted");

        match self.announce(&item).await {
            Ok(ack) => {
                info!(
                    state = %IngestionState::Announced,
                    sequence = ack.sequence,
                    duplicate = ack.duplicate,
                    "Item announced"
                );
                metrics::counter!("items_created_total").increment(1);
                Ok(IngestionOutcome::Created(item))
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(
                    state = %IngestionState::Persisted,
                    error = %reason,
                    "Item persisted but not announced"
                );
                self.remember_unannounced(item.id, &reason).await;
                metrics::counter!("items_created_total").increment(1);
                metrics::counter!("items_unannounced_total").increment(1);
                Ok(IngestionOutcome::CreatedUnannounced { item, reason })
            }
        }
    }

    /// Re-publishes the creation event of an item awaiting announcement.
    ///
    /// # Errors
    ///
    /// `ItemNotFound` for an unknown id, `AlreadyAnnounced` when the item has
    /// no ledger entry, and the publish error when the bus fails again.
    #[instrument(skip(self))]
    pub async fn retry_announcement(&self, id: ItemId) -> Result<Item, AppError> {
        let item = bounded(
            self.config.call_timeout,
            Collaborator::ItemStore,
            self.items.get_item(id),
        )
        .await?
        .ok_or_else(|| AppError::ItemNotFound(id.to_string()))?;

        let pending = bounded(
            self.config.call_timeout,
            Collaborator::ItemStore,
            self.ledger.get_pending(id),
        )
        .await?
        .ok_or_else(|| AppError::AlreadyAnnounced(id.to_string()))?;

        self.reannounce(&item, pending.attempts).await?;
        Ok(item)
    }

    /// Re-publishes up to `batch` due ledger entries. Returns how many were announced.
    #[instrument(skip(self))]
    pub async fn announce_pending(&self, batch: i64) -> Result<usize, AppError> {
        let pending = bounded(
            self.config.call_timeout,
            Collaborator::ItemStore,
            self.ledger
                .pending_announcements(batch, self.config.max_attempts),
        )
        .await?;
        if pending.is_empty() {
            return Ok(0);
        }
        debug!(count = pending.len(), "Re-announcing pending items");

        let mut announced = 0;
        for entry in pending {
            let loaded = bounded(
                self.config.call_timeout,
                Collaborator::ItemStore,
                self.items.get_item(entry.item_id),
            )
            .await;
            let item = match loaded {
                Ok(Some(item)) => item,
                Ok(None) => {
                    warn!(item_id = %entry.item_id, "Ledger entry without item, dropping");
                    self.settle(entry.item_id).await;
                    continue;
                }
                Err(e) => {
                    warn!(item_id = %entry.item_id, error = %e, "Could not load pending item");
                    continue;
                }
            };

            match self.reannounce(&item, entry.attempts).await {
                Ok(()) => announced += 1,
                Err(e) => debug!(item_id = %item.id, error = %e, "Re-announcement failed"),
            }
        }
        Ok(announced)
    }

    async fn validate(&self, request: CreateItemRequest) -> Result<ItemDraft, AppError> {
        let draft = validate_payload(request)?;

        let seller = bounded(
            self.config.call_timeout,
            Collaborator::UserDirectory,
            self.users.find_user(draft.seller),
        )
        .await?;
        if seller.is_none() {
            return Err(AppError::SellerNotFound(draft.seller.to_string()));
        }

        if !self.config.categories.contains(&draft.category_code) {
            return Err(AppError::UnsupportedCategory(draft.category_code));
        }

        Ok(draft)
    }

    async fn announce(&self, item: &Item) -> Result<PublishAck, AppError> {
        let payload = serde_json::to_vec(&ItemCreatedEvent::from(item))?;
        let envelope = Envelope {
            topic: self.config.exchange.clone(),
            routing_key: self.config.routing_key.clone(),
            message_id: item.id.to_string(),
            payload: Bytes::from(payload),
        };

        let ack = bounded(
            self.config.call_timeout,
            Collaborator::MessageBus,
            self.publisher.publish(envelope),
        )
        .await?;

        if ack.topic != self.config.exchange {
            return Err(MessageBusError::Misrouted {
                expected: self.config.exchange.clone(),
                actual: ack.topic,
            }
            .into());
        }
        Ok(ack)
    }

    /// Announces a ledgered item and updates its ledger entry either way.
    ///
    /// Only the publish result is returned. Ledger failures are logged and
    /// counted; an entry left behind is re-published under the same message id.
    async fn reannounce(&self, item: &Item, attempts: i32) -> Result<(), AppError> {
        match self.announce(item).await {
            Ok(ack) => {
                metrics::counter!("announcements_retried_total", "result" => "announced")
                    .increment(1);
                info!(
                    item_id = %item.id,
                    state = %IngestionState::Announced,
                    sequence = ack.sequence,
                    duplicate = ack.duplicate,
                    "Pending item announced"
                );
                self.settle(item.id).await;
                Ok(())
            }
            Err(e) => {
                metrics::counter!("announcements_retried_total", "result" => "failed")
                    .increment(1);
                let next_attempt_at = Utc::now() + self.backoff(attempts + 1);
                let recorded = bounded(
                    self.config.call_timeout,
                    Collaborator::ItemStore,
                    self.ledger
                        .record_attempt_failure(item.id, &e.to_string(), next_attempt_at),
                )
                .await;
                match recorded {
                    Ok(attempts) if attempts >= self.config.max_attempts => {
                        error!(item_id = %item.id, attempts, "Giving up on announcing item");
                    }
                    Ok(_) => {}
                    Err(ledger_err) => {
                        metrics::counter!("announcement_ledger_errors_total").increment(1);
                        error!(
                            item_id = %item.id,
                            error = %ledger_err,
                            "Failed to record announcement attempt"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// Removes the ledger entry of an item that needs no further announcement.
    async fn settle(&self, item_id: ItemId) {
        let settled = bounded(
            self.config.call_timeout,
            Collaborator::ItemStore,
            self.ledger.mark_announced(item_id),
        )
        .await;
        if let Err(e) = settled {
            metrics::counter!("announcement_ledger_errors_total").increment(1);
            warn!(item_id = %item_id, error = %e, "Failed to clear ledger entry");
        }
    }

    async fn remember_unannounced(&self, item_id: ItemId, reason: &str) {
        let recorded = bounded(
            self.config.call_timeout,
            Collaborator::ItemStore,
            self.ledger.record_unannounced(item_id, reason),
        )
        .await;
        if let Err(e) = recorded {
            metrics::counter!("announcement_ledger_errors_total").increment(1);
            error!(
                item_id = %item_id,
                error = %e,
                "Failed to record unannounced item; it will not be retried automatically"
            );
        }
    }

    /// Delay before attempt number `attempt` (1-based) is tried again.
    fn backoff(&self, attempt: i32) -> chrono::Duration {
        let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(0).min(16);
        let delay = self
            .config
            .retry_base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.config.retry_max_delay);
        chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1))
    }
}

/// Item ids are generated here, so a clash on insert is a storage fault.
fn storage_failure(err: AppError) -> AppError {
    match err {
        AppError::Database(DatabaseError::Duplicate(msg)) => {
            AppError::Database(DatabaseError::Query(format!("item id clash: {msg}")))
        }
        other => other,
    }
}

/// Checks presence and shape of the request fields.
pub fn validate_payload(request: CreateItemRequest) -> Result<ItemDraft, AppError> {
    request.validate()?;

    let seller = request
        .seller
        .ok_or_else(|| ValidationError::MissingField("seller".to_string()))?;
    let title = required_text(request.title, "title")?;
    let category_code = required_text(request.category_code, "category_code")?;

    Ok(ItemDraft {
        seller,
        title,
        brand: request.brand,
        description: request.description,
        category_code,
        location: request.location,
        price: request.price,
    })
}

fn required_text(value: Option<String>, field: &str) -> Result<String, ValidationError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ValidationError::MissingField(field.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorKind, ItemFilter};
    use crate::test_utils::{
        MockAnnouncementLedger, MockConfig, MockEventPublisher, MockItemRepository,
        MockUserDirectory,
    };
    use futures::TryStreamExt;
    use rust_decimal::Decimal;

    struct Harness {
        users: Arc<MockUserDirectory>,
        items: Arc<MockItemRepository>,
        ledger: Arc<MockAnnouncementLedger>,
        publisher: Arc<MockEventPublisher>,
        coordinator: IngestionCoordinator,
    }

    fn harness_with(
        items: MockItemRepository,
        ledger: MockAnnouncementLedger,
        publisher: MockEventPublisher,
    ) -> Harness {
        let users = Arc::new(MockUserDirectory::new());
        let items = Arc::new(items);
        let ledger = Arc::new(ledger);
        let publisher = Arc::new(publisher);
        let coordinator = IngestionCoordinator::new(
            users.clone(),
            items.clone(),
            ledger.clone(),
            publisher.clone(),
            IngestionConfig::default(),
        );
        Harness {
            users,
            items,
            ledger,
            publisher,
            coordinator,
        }
    }

    fn harness() -> Harness {
        harness_with(
            MockItemRepository::new(),
            MockAnnouncementLedger::new(),
            MockEventPublisher::new(),
        )
    }

    #[tokio::test]
    async fn test_create_item_persists_and_announces_once() {
        let h = harness();
        let seller = h.users.add_user();

        let request = CreateItemRequest::new(seller, "Chair", "CH")
            .with_brand("Armani")
            .with_price(Decimal::new(4999, 2));
        let outcome = h.coordinator.create_item(request).await.unwrap();

        assert!(outcome.is_announced());
        let item = outcome.item();
        assert_eq!(item.title, "Chair");
        assert_eq!(h.items.get_all_items(), vec![item.clone()]);

        let published = h.publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "topic_fleet");
        assert_eq!(published[0].routing_key, "items.create");
        assert_eq!(published[0].message_id, item.id.to_string());

        let event: ItemCreatedEvent = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(event, ItemCreatedEvent::from(item));
        assert!(h.ledger.entries().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_seller_writes_nothing() {
        let h = harness();

        let request = CreateItemRequest::new(Uuid::new_v4(), "Chair", "CH");
        let err = h.coordinator.create_item(request).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SellerNotFound);
        assert!(h.items.get_all_items().is_empty());
        assert!(h.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_category_writes_nothing() {
        let h = harness();
        let seller = h.users.add_user();

        let request = CreateItemRequest::new(seller, "Chair", "ZZ");
        let err = h.coordinator.create_item(request).await.unwrap_err();

        assert!(matches!(err, AppError::UnsupportedCategory(ref code) if code == "ZZ"));
        assert!(h.items.get_all_items().is_empty());
        assert!(h.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_missing_fields_are_invalid_payload() {
        let h = harness();
        let seller = h.users.add_user();

        let no_title = CreateItemRequest {
            seller: Some(seller),
            category_code: Some("CH".to_string()),
            ..Default::default()
        };
        let err = h.coordinator.create_item(no_title).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Validation(ValidationError::MissingField(ref f)) if f == "title"
        ));

        let no_seller = CreateItemRequest {
            title: Some("Chair".to_string()),
            category_code: Some("CH".to_string()),
            ..Default::default()
        };
        let err = h.coordinator.create_item(no_seller).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPayload);

        let blank_category = CreateItemRequest::new(seller, "Chair", "   ");
        let err = h.coordinator.create_item(blank_category).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPayload);

        assert_eq!(h.users.call_count(), 0);
        assert!(h.items.get_all_items().is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_does_not_publish() {
        let h = harness_with(
            MockItemRepository::failing("connection refused"),
            MockAnnouncementLedger::new(),
            MockEventPublisher::new(),
        );
        let seller = h.users.add_user();

        let err = h
            .coordinator
            .create_item(CreateItemRequest::new(seller, "Lamp", "LA"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::StorageUnavailable);
        assert!(h.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_item_and_ledgers_it() {
        let h = harness_with(
            MockItemRepository::new(),
            MockAnnouncementLedger::new(),
            MockEventPublisher::failing("no responders"),
        );
        let seller = h.users.add_user();

        let outcome = h
            .coordinator
            .create_item(CreateItemRequest::new(seller, "Coat", "CO"))
            .await
            .unwrap();

        let IngestionOutcome::CreatedUnannounced { item, reason } = outcome else {
            panic!("expected CreatedUnannounced");
        };
        assert!(reason.contains("no responders"));
        assert_eq!(h.items.get_item(item.id).await.unwrap(), Some(item.clone()));

        let entries = h.ledger.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].item_id, item.id);
    }

    #[tokio::test]
    async fn test_ledger_failure_still_reports_unannounced() {
        let h = harness_with(
            MockItemRepository::new(),
            MockAnnouncementLedger::failing("ledger down"),
            MockEventPublisher::failing("no responders"),
        );
        let seller = h.users.add_user();

        let outcome = h
            .coordinator
            .create_item(CreateItemRequest::new(seller, "Ring", "RI"))
            .await
            .unwrap();

        assert!(!outcome.is_announced());
        assert_eq!(h.items.get_all_items().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_timeout_becomes_unannounced() {
        let h = harness_with(
            MockItemRepository::new(),
            MockAnnouncementLedger::new(),
            MockEventPublisher::with_config(MockConfig::success().with_latency(200)),
        );
        let coordinator = IngestionCoordinator::new(
            h.users.clone(),
            h.items.clone(),
            h.ledger.clone(),
            h.publisher.clone(),
            IngestionConfig {
                call_timeout: Duration::from_millis(20),
                ..IngestionConfig::default()
            },
        );
        let seller = h.users.add_user();

        let outcome = coordinator
            .create_item(CreateItemRequest::new(seller, "Chair", "CH"))
            .await
            .unwrap();

        assert!(!outcome.is_announced());
        assert_eq!(h.ledger.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_announcement_clears_ledger() {
        let h = harness();
        let seller = h.users.add_user();

        h.publisher.set_failing(true);
        let outcome = h
            .coordinator
            .create_item(CreateItemRequest::new(seller, "Chair", "CH"))
            .await
            .unwrap();
        let id = outcome.item().id;

        h.publisher.set_failing(false);
        let item = h.coordinator.retry_announcement(id).await.unwrap();

        assert_eq!(item.id, id);
        assert!(h.ledger.entries().is_empty());
        assert_eq!(h.publisher.published().len(), 1);

        let err = h.coordinator.retry_announcement(id).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyAnnounced(_)));
    }

    #[tokio::test]
    async fn test_retry_announcement_unknown_item() {
        let h = harness();
        let err = h
            .coordinator
            .retry_announcement(Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ItemNotFound);
    }

    #[tokio::test]
    async fn test_retry_failure_counts_attempt() {
        let h = harness();
        let seller = h.users.add_user();

        h.publisher.set_failing(true);
        let id = h
            .coordinator
            .create_item(CreateItemRequest::new(seller, "Chair", "CH"))
            .await
            .unwrap()
            .item()
            .id;

        let err = h.coordinator.retry_announcement(id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PublishFailed);

        let entry = h.ledger.get_pending(id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, 1);
        assert!(entry.next_attempt_at.is_some_and(|at| at > Utc::now()));
    }

    #[tokio::test]
    async fn test_announce_pending_batch() {
        let h = harness();
        let seller = h.users.add_user();

        h.publisher.set_failing(true);
        for title in ["Chair", "Lamp", "Ring"] {
            h.coordinator
                .create_item(CreateItemRequest::new(seller, title, "CH"))
                .await
                .unwrap();
        }
        assert_eq!(h.ledger.entries().len(), 3);

        h.publisher.set_failing(false);
        let announced = h.coordinator.announce_pending(2).await.unwrap();
        assert_eq!(announced, 2);
        assert_eq!(h.ledger.entries().len(), 1);

        let announced = h.coordinator.announce_pending(10).await.unwrap();
        assert_eq!(announced, 1);
        assert!(h.ledger.entries().is_empty());
        assert_eq!(h.publisher.published().len(), 3);

        let stored: Vec<Item> = h
            .items
            .list_items(ItemFilter::default())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn test_id_clash_reports_storage_unavailable() {
        let h = harness();
        let seller = h.users.add_user();
        h.items.set_reject_creates_as_duplicate(true);

        let err = h
            .coordinator
            .create_item(CreateItemRequest::new(seller, "Chair", "CH"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::StorageUnavailable);
        assert!(h.publisher.published().is_empty());
    }

    async fn ledgered_item(h: &Harness) -> ItemId {
        let seller = h.users.add_user();
        h.publisher.set_failing(true);
        let id = h
            .coordinator
            .create_item(CreateItemRequest::new(seller, "Chair", "CH"))
            .await
            .unwrap()
            .item()
            .id;
        h.publisher.set_failing(false);
        id
    }

    #[tokio::test]
    async fn test_retry_succeeds_when_ledger_cannot_be_cleared() {
        let h = harness();
        let id = ledgered_item(&h).await;
        h.ledger.set_fail_updates(true);

        let item = h.coordinator.retry_announcement(id).await.unwrap();

        assert_eq!(item.id, id);
        assert_eq!(h.publisher.published().len(), 1);
        assert_eq!(h.ledger.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_is_bounded_by_call_timeout() {
        let h = harness();
        let id = ledgered_item(&h).await;
        let coordinator = IngestionCoordinator::new(
            h.users.clone(),
            h.items.clone(),
            h.ledger.clone(),
            h.publisher.clone(),
            IngestionConfig {
                call_timeout: Duration::from_millis(20),
                ..IngestionConfig::default()
            },
        );
        h.ledger.set_update_latency(2_000);

        let started = tokio::time::Instant::now();
        coordinator.retry_announcement(id).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(1_000));

        h.publisher.set_failing(true);
        let started = tokio::time::Instant::now();
        let err = coordinator.retry_announcement(id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PublishFailed);
        assert!(started.elapsed() < Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_announce_pending_continues_past_ledger_failures() {
        let h = harness();
        h.ledger
            .record_unannounced(Uuid::new_v4(), "no responders")
            .await
            .unwrap();
        ledgered_item(&h).await;
        h.ledger.set_fail_updates(true);

        let announced = h.coordinator.announce_pending(10).await.unwrap();

        assert_eq!(announced, 1);
        assert_eq!(h.publisher.published().len(), 1);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let h = harness();
        let base = chrono::Duration::seconds(30);
        assert_eq!(h.coordinator.backoff(1), base);
        assert_eq!(h.coordinator.backoff(2), base * 2);
        assert_eq!(h.coordinator.backoff(3), base * 4);
        assert_eq!(h.coordinator.backoff(30), chrono::Duration::hours(1));
    }
}
