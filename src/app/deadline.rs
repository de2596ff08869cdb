//! Request-scoped time limits for collaborator calls.

use std::future::Future;
use std::time::Duration;

use crate::domain::{
    AppError, BlobStoreError, DatabaseError, ExternalServiceError, MessageBusError,
};

/// The collaborator a bounded call goes to; picks the error an expired
/// deadline is reported as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collaborator {
    ItemStore,
    BlobStore,
    MessageBus,
    UserDirectory,
}

impl Collaborator {
    fn elapsed(self, limit: Duration) -> AppError {
        let message = format!("no response within {}ms", limit.as_millis());
        match self {
            Self::ItemStore => DatabaseError::Timeout(message).into(),
            Self::BlobStore => BlobStoreError::Timeout(message).into(),
            Self::MessageBus => MessageBusError::Timeout(message).into(),
            Self::UserDirectory => ExternalServiceError::Timeout(message).into(),
        }
    }
}

/// Runs `call` with an upper bound of `limit`.
pub async fn bounded<T, F>(limit: Duration, target: Collaborator, call: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(target.elapsed(limit)),
    }
}
