//! Mock implementations for testing.
//!
//! These mocks provide in-memory implementations of domain traits
//! that can be configured to simulate various scenarios including
//! success, failure, and edge cases.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{
    AnnouncementLedger, AppError, BlobKey, BlobMetadata, BlobRef, BlobStore, BlobStoreError,
    DatabaseError, Envelope, EventPublisher, ExternalServiceError, Item, ItemFilter, ItemId,
    ItemRepository, ItemStream, MessageBusError, PendingAnnouncement, PublishAck, SellerId, User,
    UserDirectory,
};

/// Configuration for mock behavior.
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    /// If true, operations will fail.
    pub should_fail: bool,
    /// Custom error message for failures.
    pub error_message: Option<String>,
    /// Simulated latency in milliseconds.
    pub latency_ms: Option<u64>,
}

impl MockConfig {
    /// Creates a config that always succeeds.
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    /// Creates a config that always fails.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            should_fail: true,
            error_message: Some(message.into()),
            latency_ms: None,
        }
    }

    /// Adds simulated latency.
    #[must_use]
    pub fn with_latency(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }

    fn message(&self, fallback: &str) -> String {
        self.error_message
            .clone()
            .unwrap_or_else(|| fallback.to_string())
    }

    async fn simulate_latency(&self) {
        if let Some(ms) = self.latency_ms {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

/// In-memory item repository.
///
/// Items are kept in insertion order, which is also the order listings
/// return them in.
///
/// # Example
///
/// ```
/// use item_service::test_utils::{MockItemRepository, MockConfig};
///
/// let mock = MockItemRepository::new();
/// let failing_mock = MockItemRepository::with_config(MockConfig::failure("DB error"));
/// ```
pub struct MockItemRepository {
    storage: Arc<Mutex<Vec<Item>>>,
    config: MockConfig,
    call_count: AtomicU64,
    is_healthy: AtomicBool,
    fail_image_updates: AtomicBool,
    reject_creates_as_duplicate: AtomicBool,
}

impl MockItemRepository {
    /// Creates a new mock with default (success) configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    /// Creates a new mock with the given configuration.
    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            storage: Arc::new(Mutex::new(Vec::new())),
            config,
            call_count: AtomicU64::new(0),
            is_healthy: AtomicBool::new(true),
            fail_image_updates: AtomicBool::new(false),
            reject_creates_as_duplicate: AtomicBool::new(false),
        }
    }

    /// Creates a mock that always fails.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    /// Gets the number of times any method was called.
    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Sets the health status.
    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Makes `set_image_reference` fail while everything else keeps working.
    pub fn set_fail_image_updates(&self, fail: bool) {
        self.fail_image_updates.store(fail, Ordering::Relaxed);
    }

    /// Makes `create_item` report an id clash for every new item.
    pub fn set_reject_creates_as_duplicate(&self, reject: bool) {
        self.reject_creates_as_duplicate.store(reject, Ordering::Relaxed);
    }

    /// Gets all stored items in insertion order.
    pub fn get_all_items(&self) -> Vec<Item> {
        self.storage.lock().unwrap().clone()
    }

    /// Clears all stored items.
    pub fn clear(&self) {
        self.storage.lock().unwrap().clear();
    }

    fn increment_call_count(&self) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            let msg = self.config.message("Mock database error");
            return Err(AppError::Database(DatabaseError::Query(msg)));
        }
        Ok(())
    }
}

impl Default for MockItemRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ItemRepository for MockItemRepository {
    async fn health_check(&self) -> Result<(), AppError> {
        self.increment_call_count();

        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Database(DatabaseError::Connection(
                "Mock database unhealthy".to_string(),
            )));
        }

        self.check_should_fail()
    }

    async fn create_item(&self, item: &Item) -> Result<ItemId, AppError> {
        self.increment_call_count();
        self.config.simulate_latency().await;
        self.check_should_fail()?;

        let mut storage = self.storage.lock().unwrap();
        if self.reject_creates_as_duplicate.load(Ordering::Relaxed)
            || storage.iter().any(|existing| existing.id == item.id)
        {
            return Err(AppError::Database(DatabaseError::Duplicate(
                item.id.to_string(),
            )));
        }
        storage.push(item.clone());
        Ok(item.id)
    }

    async fn get_item(&self, id: ItemId) -> Result<Option<Item>, AppError> {
        self.increment_call_count();
        self.config.simulate_latency().await;
        self.check_should_fail()?;

        let storage = self.storage.lock().unwrap();
        Ok(storage.iter().find(|item| item.id == id).cloned())
    }

    fn list_items(&self, filter: ItemFilter) -> ItemStream {
        self.increment_call_count();
        if let Err(e) = self.check_should_fail() {
            return Box::pin(stream::iter(vec![Err(e)]));
        }

        let matching: Vec<Result<Item, AppError>> = self
            .storage
            .lock()
            .unwrap()
            .iter()
            .filter(|item| filter.matches(item))
            .cloned()
            .map(Ok)
            .collect();
        Box::pin(stream::iter(matching))
    }

    async fn set_image_reference(&self, id: ItemId, image: &BlobRef) -> Result<(), AppError> {
        self.increment_call_count();
        self.config.simulate_latency().await;
        self.check_should_fail()?;

        if self.fail_image_updates.load(Ordering::Relaxed) {
            return Err(AppError::Database(DatabaseError::Connection(
                "Mock image update failure".to_string(),
            )));
        }

        let mut storage = self.storage.lock().unwrap();
        match storage.iter_mut().find(|item| item.id == id) {
            Some(item) => {
                item.image = Some(image.clone());
                Ok(())
            }
            None => Err(AppError::ItemNotFound(id.to_string())),
        }
    }
}

/// In-memory announcement ledger.
pub struct MockAnnouncementLedger {
    entries: Mutex<Vec<PendingAnnouncement>>,
    config: MockConfig,
    fail_updates: AtomicBool,
    update_latency_ms: AtomicU64,
}

impl MockAnnouncementLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            config,
            fail_updates: AtomicBool::new(false),
            update_latency_ms: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    /// Makes `mark_announced` and `record_attempt_failure` fail.
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::Relaxed);
    }

    /// Delays `mark_announced` and `record_attempt_failure` by `ms`.
    pub fn set_update_latency(&self, ms: u64) {
        self.update_latency_ms.store(ms, Ordering::Relaxed);
    }

    /// Current entries in recording order.
    pub fn entries(&self) -> Vec<PendingAnnouncement> {
        self.entries.lock().unwrap().clone()
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            let msg = self.config.message("Mock ledger error");
            return Err(AppError::Database(DatabaseError::Query(msg)));
        }
        Ok(())
    }

    async fn check_update(&self) -> Result<(), AppError> {
        let ms = self.update_latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if self.fail_updates.load(Ordering::Relaxed) {
            return Err(AppError::Database(DatabaseError::Connection(
                "Mock ledger update failure".to_string(),
            )));
        }
        self.check_should_fail()
    }
}

impl Default for MockAnnouncementLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AnnouncementLedger for MockAnnouncementLedger {
    async fn record_unannounced(&self, item_id: ItemId, error: &str) -> Result<(), AppError> {
        self.check_should_fail()?;

        let mut entries = self.entries.lock().unwrap();
        match entries.iter_mut().find(|e| e.item_id == item_id) {
            Some(entry) => entry.last_error = Some(error.to_string()),
            None => entries.push(PendingAnnouncement {
                item_id,
                attempts: 0,
                last_error: Some(error.to_string()),
                recorded_at: Utc::now(),
                next_attempt_at: None,
            }),
        }
        Ok(())
    }

    async fn pending_announcements(
        &self,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Vec<PendingAnnouncement>, AppError> {
        self.check_should_fail()?;

        let now = Utc::now();
        let mut due: Vec<PendingAnnouncement> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.attempts < max_attempts)
            .filter(|e| e.next_attempt_at.is_none_or(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|e| (e.next_attempt_at, e.recorded_at));
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due)
    }

    async fn get_pending(&self, item_id: ItemId) -> Result<Option<PendingAnnouncement>, AppError> {
        self.check_should_fail()?;
        let entries = self.entries.lock().unwrap();
        Ok(entries.iter().find(|e| e.item_id == item_id).cloned())
    }

    async fn mark_announced(&self, item_id: ItemId) -> Result<(), AppError> {
        self.check_update().await?;
        self.entries.lock().unwrap().retain(|e| e.item_id != item_id);
        Ok(())
    }

    async fn record_attempt_failure(
        &self,
        item_id: ItemId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<i32, AppError> {
        self.check_update().await?;

        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .iter_mut()
            .find(|e| e.item_id == item_id)
            .ok_or_else(|| AppError::AlreadyAnnounced(item_id.to_string()))?;
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        entry.next_attempt_at = Some(next_attempt_at);
        Ok(entry.attempts)
    }
}

/// In-memory blob store keyed by `BlobKey`.
pub struct MockBlobStore {
    blobs: Mutex<HashMap<BlobKey, (BlobRef, Bytes)>>,
    config: MockConfig,
    is_healthy: AtomicBool,
    quota_bytes: Option<u64>,
}

impl MockBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            config,
            is_healthy: AtomicBool::new(true),
            quota_bytes: None,
        }
    }

    /// Caps the total stored content at `bytes`.
    #[must_use]
    pub fn with_quota(mut self, bytes: u64) -> Self {
        self.quota_bytes = Some(bytes);
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            let msg = self.config.message("Mock blob store error");
            return Err(AppError::BlobStore(BlobStoreError::Unavailable(msg)));
        }
        Ok(())
    }
}

impl Default for MockBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MockBlobStore {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::BlobStore(BlobStoreError::Unavailable(
                "Mock blob store unhealthy".to_string(),
            )));
        }
        self.check_should_fail()
    }

    async fn put(
        &self,
        key: &BlobKey,
        content: Bytes,
        metadata: &BlobMetadata,
    ) -> Result<BlobRef, AppError> {
        self.config.simulate_latency().await;
        self.check_should_fail()?;
        if content.is_empty() {
            return Err(BlobStoreError::EmptyInput.into());
        }

        let mut blobs = self.blobs.lock().unwrap();
        if let Some((existing, _)) = blobs.get(key) {
            return Ok(existing.clone());
        }
        if let Some(quota) = self.quota_bytes {
            let used: u64 = blobs.values().map(|(blob, _)| blob.size_bytes).sum();
            if used + content.len() as u64 > quota {
                let message = format!("{used} of {quota} bytes used");
                return Err(BlobStoreError::QuotaExceeded(message).into());
            }
        }

        let blob = BlobRef {
            key: key.clone(),
            item_id: metadata.item_id,
            filename: metadata.filename.clone(),
            size_bytes: content.len() as u64,
            media_type: metadata.media_type.clone(),
            content_sha256: hex::encode(Sha256::digest(&content)),
            stored_at: Utc::now(),
        };
        blobs.insert(key.clone(), (blob.clone(), content));
        Ok(blob)
    }

    async fn get(&self, key: &BlobKey) -> Result<Option<Bytes>, AppError> {
        self.config.simulate_latency().await;
        self.check_should_fail()?;
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs.get(key).map(|(_, content)| content.clone()))
    }
}

/// Records published envelopes; acknowledges each message id once.
pub struct MockEventPublisher {
    published: Mutex<Vec<Envelope>>,
    config: MockConfig,
    failing: AtomicBool,
    is_healthy: AtomicBool,
}

impl MockEventPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            failing: AtomicBool::new(config.should_fail),
            config,
            is_healthy: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    /// Toggles publish failures at runtime.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Every envelope the bus acknowledged as new, in publish order.
    pub fn published(&self) -> Vec<Envelope> {
        self.published.lock().unwrap().clone()
    }
}

impl Default for MockEventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for MockEventPublisher {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::MessageBus(MessageBusError::Connection(
                "Mock bus unhealthy".to_string(),
            )));
        }
        Ok(())
    }

    async fn publish(&self, envelope: Envelope) -> Result<PublishAck, AppError> {
        self.config.simulate_latency().await;
        if self.failing.load(Ordering::Relaxed) {
            let msg = self.config.message("Mock publish failure");
            return Err(AppError::MessageBus(MessageBusError::PublishFailed(msg)));
        }

        let mut published = self.published.lock().unwrap();
        let duplicate = published
            .iter()
            .any(|earlier| earlier.message_id == envelope.message_id);
        let topic = envelope.topic.clone();
        if !duplicate {
            published.push(envelope);
        }

        Ok(PublishAck {
            topic,
            sequence: published.len() as u64,
            duplicate,
        })
    }
}

/// In-memory user directory.
pub struct MockUserDirectory {
    users: Mutex<HashMap<SellerId, User>>,
    config: MockConfig,
    call_count: AtomicU64,
}

impl MockUserDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            config,
            call_count: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    /// Registers a fresh user and returns its id.
    pub fn add_user(&self) -> SellerId {
        let id = Uuid::new_v4();
        self.users.lock().unwrap().insert(
            id,
            User {
                id,
                name: Some(format!("seller-{}", &id.simple().to_string()[..8])),
            },
        );
        id
    }

    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }
}

impl Default for MockUserDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserDirectory for MockUserDirectory {
    async fn find_user(&self, id: SellerId) -> Result<Option<User>, AppError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.config.simulate_latency().await;
        if self.config.should_fail {
            let msg = self.config.message("Mock user service error");
            return Err(AppError::ExternalService(ExternalServiceError::Unavailable(
                msg,
            )));
        }
        Ok(self.users.lock().unwrap().get(&id).cloned())
    }
}
