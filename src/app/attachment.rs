//! Image attachment: write the blob first, link it second.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{AppConfig, ImagePolicy};
use crate::domain::{
    AppError, BlobKey, BlobMetadata, BlobRef, BlobStore, BlobStoreError, ImageMediaType,
    ImageUpload, Item, ItemId, ItemRepository,
};

use super::deadline::{Collaborator, bounded};

#[derive(Debug, Clone)]
pub struct AttachmentConfig {
    pub policy: ImagePolicy,
    pub call_timeout: Duration,
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            policy: ImagePolicy::default(),
            call_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&AppConfig> for AttachmentConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            policy: config.images.clone(),
            call_timeout: config.call_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttachmentState {
    Received,
    ItemLocated,
    BlobWritten,
    Linked,
    Rejected,
    Failed,
}

impl fmt::Display for AttachmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Received => "received",
            Self::ItemLocated => "item_located",
            Self::BlobWritten => "blob_written",
            Self::Linked => "linked",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        })
    }
}

pub struct AttachmentCoordinator {
    items: Arc<dyn ItemRepository>,
    blobs: Arc<dyn BlobStore>,
    config: AttachmentConfig,
}

impl AttachmentCoordinator {
    #[must_use]
    pub fn new(
        items: Arc<dyn ItemRepository>,
        blobs: Arc<dyn BlobStore>,
        config: AttachmentConfig,
    ) -> Self {
        Self {
            items,
            blobs,
            config,
        }
    }

    pub fn policy(&self) -> &ImagePolicy {
        &self.config.policy
    }

    /// Stores `upload` and makes it the item's current image.
    ///
    /// The item record is only touched after the blob is fully written, so a
    /// failure at any step leaves the previous image reference in place.
    #[instrument(skip(self, upload), fields(size = upload.body.len(), content_type = %upload.content_type))]
    pub async fn attach_image(&self, id: ItemId, upload: ImageUpload) -> Result<BlobRef, AppError> {
        debug!(state = %AttachmentState::Received, "Upload received");

        let result = self.store_and_link(id, upload).await;
        if let Err(ref e) = result {
            let state = if e.kind().is_rejection() {
                metrics::counter!("item_images_rejected_total").increment(1);
                AttachmentState::Rejected
            } else {
                AttachmentState::Failed
            };
            warn!(state = %state, error = %e, "Image not attached");
        }
        result
    }

    /// Resolves the item's current image to its bytes.
    #[instrument(skip(self))]
    pub async fn fetch_image(&self, id: ItemId) -> Result<(BlobRef, Bytes), AppError> {
        let item = self.locate(id).await?;
        let image = item
            .image
            .ok_or_else(|| AppError::ItemNotFound(format!("{id} has no image")))?;

        let content = bounded(
            self.config.call_timeout,
            Collaborator::BlobStore,
            self.blobs.get(&image.key),
        )
        .await?
        .ok_or_else(|| {
            error!(blob_key = %image.key, "Image reference points at a missing blob");
            AppError::BlobStore(BlobStoreError::Unavailable(format!(
                "blob {} is missing",
                image.key
            )))
        })?;

        Ok((image, content))
    }

    async fn store_and_link(&self, id: ItemId, upload: ImageUpload) -> Result<BlobRef, AppError> {
        self.locate(id).await?;
        debug!(state = %AttachmentState::ItemLocated, "Target item located");

        let media_type = self.check_media(&upload)?;
        let key = BlobKey::derive(id, &upload.body);
        let metadata = BlobMetadata {
            item_id: id,
            filename: format!("{id}.{}", media_type.extension()),
            media_type: media_type.mime().to_string(),
        };

        let blob = bounded(
            self.config.call_timeout,
            Collaborator::BlobStore,
            self.blobs.put(&key, upload.body, &metadata),
        )
        .await?;
        debug!(state = %AttachmentState::BlobWritten, blob_key = %key, "Blob written");

        let linked = bounded(
            self.config.call_timeout,
            Collaborator::ItemStore,
            self.items.set_image_reference(id, &blob),
        )
        .await;
        if let Err(e) = linked {
            warn!(
                state = %AttachmentState::Failed,
                blob_key = %key,
                error = %e,
                "Blob written but not linked; it is orphaned"
            );
            return Err(e);
        }

        metrics::counter!("item_images_linked_total").increment(1);
        info!(
            state = %AttachmentState::Linked,
            blob_key = %key,
            size_bytes = blob.size_bytes,
            "Image linked to item"
        );
        Ok(blob)
    }

    async fn locate(&self, id: ItemId) -> Result<Item, AppError> {
        bounded(
            self.config.call_timeout,
            Collaborator::ItemStore,
            self.items.get_item(id),
        )
        .await?
        .ok_or_else(|| AppError::ItemNotFound(id.to_string()))
    }

    fn check_media(&self, upload: &ImageUpload) -> Result<ImageMediaType, AppError> {
        let policy = &self.config.policy;

        let media_type = ImageMediaType::from_mime(&upload.content_type)
            .filter(|t| policy.allows(*t))
            .ok_or_else(|| {
                AppError::InvalidMedia(format!(
                    "content type '{}' is not accepted",
                    upload.content_type
                ))
            })?;

        if upload.body.len() > policy.max_bytes {
            return Err(AppError::InvalidMedia(format!(
                "{} bytes exceeds the {} byte limit",
                upload.body.len(),
                policy.max_bytes
            )));
        }

        if upload.body.is_empty() {
            return Err(BlobStoreError::EmptyInput.into());
        }

        if !media_type.matches_signature(&upload.body) {
            return Err(AppError::InvalidMedia(format!(
                "content is not a valid {media_type} file"
            )));
        }

        Ok(media_type)
    }
}
