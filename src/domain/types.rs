use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Identifier of an item record.
pub type ItemId = Uuid;

/// Identifier of a user owned by the external user service.
pub type SellerId = Uuid;

/// Core domain entity: an item offered by a seller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Item {
    #[schema(value_type = Uuid)]
    pub id: ItemId,
    #[schema(value_type = Uuid)]
    pub seller: SellerId,
    pub title: String,
    pub brand: Option<String>,
    pub description: Option<String>,
    pub category_code: String,
    pub location: Option<String>,
    pub price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    /// Current image. Only ever set after the blob was written.
    pub image: Option<BlobRef>,
}

impl Item {
    /// Builds a fresh record from a validated draft.
    pub fn from_draft(id: ItemId, created_at: DateTime<Utc>, draft: ItemDraft) -> Self {
        Self {
            id,
            seller: draft.seller,
            title: draft.title,
            brand: draft.brand,
            description: draft.description,
            category_code: draft.category_code,
            location: draft.location,
            price: draft.price,
            created_at,
            image: None,
        }
    }
}

/// Request payload for creating a new item.
///
/// Required fields are `Option` so that a missing field is reported as an
/// invalid payload by the coordinator instead of a JSON rejection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateItemRequest {
    #[schema(value_type = Option<Uuid>)]
    pub seller: Option<SellerId>,
    #[validate(length(min = 1, max = 200, message = "Title must be 1-200 characters"))]
    pub title: Option<String>,
    #[validate(length(max = 100, message = "Brand must be at most 100 characters"))]
    pub brand: Option<String>,
    #[validate(length(max = 5000, message = "Description must be at most 5000 characters"))]
    pub description: Option<String>,
    #[validate(length(min = 1, max = 16, message = "Category code must be 1-16 characters"))]
    pub category_code: Option<String>,
    #[validate(length(max = 200, message = "Location must be at most 200 characters"))]
    pub location: Option<String>,
    pub price: Option<Decimal>,
}

impl CreateItemRequest {
    pub fn new(seller: SellerId, title: impl Into<String>, category_code: impl Into<String>) -> Self {
        Self {
            seller: Some(seller),
            title: Some(title.into()),
            category_code: Some(category_code.into()),
            ..Default::default()
        }
    }

    pub fn with_brand(mut self, brand: impl Into<String>) -> Self {
        self.brand = Some(brand.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_price(mut self, price: Decimal) -> Self {
        self.price = Some(price);
        self
    }
}

/// Item fields after validation, before an identifier is assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDraft {
    pub seller: SellerId,
    pub title: String,
    pub brand: Option<String>,
    pub description: Option<String>,
    pub category_code: String,
    pub location: Option<String>,
    pub price: Option<Decimal>,
}

/// The closed set of category codes accepted at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategorySet(BTreeSet<String>);

impl CategorySet {
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(codes.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, code: &str) -> bool {
        self.0.contains(code)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

}

impl Default for CategorySet {
    /// Chair, lamp, coat and ring.
    fn default() -> Self {
        Self::new(["CH", "LA", "CO", "RI"])
    }
}

/// Optional, AND-combined narrowing of an item listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFilter {
    pub category: Option<String>,
    pub location: Option<String>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

impl ItemFilter {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Reference semantics of the filter; storage backends must agree with this.
    ///
    /// Location compares case-insensitively. A price bound excludes items
    /// without a price. Date bounds are inclusive.
    pub fn matches(&self, item: &Item) -> bool {
        if let Some(ref category) = self.category {
            if item.category_code != *category {
                return false;
            }
        }
        if let Some(ref location) = self.location {
            match item.location {
                Some(ref l) if l.to_lowercase() == location.to_lowercase() => {}
                _ => return false,
            }
        }
        if self.min_price.is_some() || self.max_price.is_some() {
            let Some(price) = item.price else {
                return false;
            };
            if self.min_price.is_some_and(|min| price < min) {
                return false;
            }
            if self.max_price.is_some_and(|max| price > max) {
                return false;
            }
        }
        if self.date_from.is_some_and(|from| item.created_at < from) {
            return false;
        }
        if self.date_to.is_some_and(|to| item.created_at > to) {
            return false;
        }
        true
    }
}

/// Storage key of a blob: lowercase hex SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct BlobKey(String);

impl BlobKey {
    /// Derives the key for `content` owned by `item_id`.
    ///
    /// The owner is part of the digest, so identical bytes uploaded for two
    /// items never share a blob.
    pub fn derive(item_id: ItemId, content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(item_id.as_bytes());
        hasher.update(content);
        Self(hex::encode(hasher.finalize()))
    }

    /// Parses a key, accepting only 64 lowercase hex characters.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = raw.len() == 64
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata tags stored alongside a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobMetadata {
    pub item_id: ItemId,
    pub filename: String,
    pub media_type: String,
}

/// Reference to a fully written blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BlobRef {
    pub key: BlobKey,
    /// Owning item, stored as the blob's `itemId` tag.
    #[schema(value_type = Uuid)]
    pub item_id: ItemId,
    pub filename: String,
    pub size_bytes: u64,
    pub media_type: String,
    /// SHA-256 of the content alone.
    pub content_sha256: String,
    pub stored_at: DateTime<Utc>,
}

/// Image formats the attachment path understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageMediaType {
    Jpeg,
    Png,
}

impl ImageMediaType {
    const PNG_SIGNATURE: &'static [u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    const JPEG_SIGNATURE: &'static [u8] = &[0xff, 0xd8, 0xff];

    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        match essence.to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            _ => None,
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }

    /// True when `content` starts with this format's magic bytes.
    pub fn matches_signature(&self, content: &[u8]) -> bool {
        match self {
            Self::Jpeg => content.starts_with(Self::JPEG_SIGNATURE),
            Self::Png => content.starts_with(Self::PNG_SIGNATURE),
        }
    }
}

impl fmt::Display for ImageMediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}

/// An uploaded file as received from the client.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub content_type: String,
    pub body: Bytes,
}

impl ImageUpload {
    pub fn new(content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            body: body.into(),
        }
    }
}

/// A user as returned by the external user service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: SellerId,
    #[serde(default)]
    pub name: Option<String>,
}

/// Creation-time snapshot of an item, published on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCreatedEvent {
    pub id: ItemId,
    pub seller: SellerId,
    pub title: String,
    pub brand: Option<String>,
    pub description: Option<String>,
    pub category_code: String,
    pub location: Option<String>,
    pub price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

impl From<&Item> for ItemCreatedEvent {
    fn from(item: &Item) -> Self {
        Self {
            id: item.id,
            seller: item.seller,
            title: item.title.clone(),
            brand: item.brand.clone(),
            description: item.description.clone(),
            category_code: item.category_code.clone(),
            location: item.location.clone(),
            price: item.price,
            created_at: item.created_at,
        }
    }
}

/// A message handed to the event publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Exchange (stream) the message must land in.
    pub topic: String,
    pub routing_key: String,
    /// De-duplication id for the bus.
    pub message_id: String,
    pub payload: Bytes,
}

/// Bus acknowledgement of a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub topic: String,
    pub sequence: u64,
    /// The bus had already seen this message id.
    pub duplicate: bool,
}

/// Ledger entry for an item that is persisted but not yet announced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAnnouncement {
    pub item_id: ItemId,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Response body of `POST /items`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateItemResponse {
    pub status: CreationStatus,
    pub item: Item,
    /// Present when the item was stored but its creation event was not published.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CreationStatus {
    Created,
    CreatedUnannounced,
}

/// Response body of a successful image upload.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ImageLinkedResponse {
    #[schema(value_type = Uuid)]
    pub item_id: ItemId,
    pub image: BlobRef,
}

/// Health check status for services.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health check response for the application.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub database: HealthStatus,
    pub blob_store: HealthStatus,
    pub message_bus: HealthStatus,
    pub timestamp: DateTime<Utc>,
}

impl HealthResponse {
    /// The database and blob store are required for every request; the bus
    /// only degrades the service since creations are still accepted.
    pub fn new(database: HealthStatus, blob_store: HealthStatus, message_bus: HealthStatus) -> Self {
        let status = match (database, blob_store, message_bus) {
            (HealthStatus::Healthy, HealthStatus::Healthy, HealthStatus::Healthy) => {
                HealthStatus::Healthy
            }
            (HealthStatus::Unhealthy, _, _) | (_, HealthStatus::Unhealthy, _) => {
                HealthStatus::Unhealthy
            }
            _ => HealthStatus::Degraded,
        };

        Self {
            status,
            database,
            blob_store,
            message_bus,
            timestamp: Utc::now(),
        }
    }
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    pub r#type: String,
    pub message: String,
}

/// Rate limit error body with retry hint.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RateLimitResponse {
    pub error: ErrorDetail,
    pub retry_after: u64,
}

/// Build information served by `GET /version`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct VersionResponse {
    pub name: String,
    pub version: String,
}
