//! Domain layer containing core business types, traits, and error definitions.

pub mod error;
pub mod traits;
pub mod types;

pub use error::{
    AppError, BlobStoreError, ConfigError, DatabaseError, ErrorKind, ExternalServiceError,
    MessageBusError, ValidationError,
};
pub use traits::{
    AnnouncementLedger, BlobStore, EventPublisher, ItemRepository, ItemStream, UserDirectory,
};
pub use types::{
    BlobKey, BlobMetadata, BlobRef, CategorySet, CreateItemRequest, CreateItemResponse,
    CreationStatus, Envelope, ErrorDetail, ErrorResponse, HealthResponse, HealthStatus,
    ImageLinkedResponse, ImageMediaType, ImageUpload, Item, ItemCreatedEvent, ItemDraft,
    ItemFilter, ItemId, PendingAnnouncement, PublishAck, RateLimitResponse, SellerId, User,
    VersionResponse,
};
