//! Application error types with proper error chaining.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Query execution failed: {0}")]
    Query(String),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Duplicate record: {0}")]
    Duplicate(String),
    #[error("Pool exhausted: {0}")]
    PoolExhausted(String),
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("Timed out: {0}")]
    Timeout(String),
}

#[derive(Error, Debug, Clone)]
pub enum BlobStoreError {
    #[error("Blob store unavailable: {0}")]
    Unavailable(String),
    #[error("Blob quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("Blob input is empty")]
    EmptyInput,
    #[error("Invalid blob key: {0}")]
    InvalidKey(String),
    #[error("Corrupt blob metadata: {0}")]
    CorruptMetadata(String),
    #[error("Timed out: {0}")]
    Timeout(String),
}

#[derive(Error, Debug, Clone)]
pub enum MessageBusError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Publish failed: {0}")]
    PublishFailed(String),
    #[error("Message routed to stream '{actual}', expected '{expected}'")]
    Misrouted { expected: String, actual: String },
    #[error("Timed out waiting for acknowledgement: {0}")]
    Timeout(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    #[error("Validation failed: {0}")]
    Multiple(String),
}

#[derive(Error, Debug)]
pub enum ExternalServiceError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Rate limited: {0}")]
    RateLimited(String),
}

/// Stable names of the failure categories reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidPayload,
    SellerNotFound,
    UnsupportedCategory,
    StorageUnavailable,
    DuplicateId,
    PublishFailed,
    ItemNotFound,
    InvalidMedia,
    EmptyInput,
    QuotaExceeded,
    AlreadyAnnounced,
    UserDirectoryUnavailable,
    Unauthorized,
    RateLimited,
    Configuration,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidPayload => "invalid_payload",
            Self::SellerNotFound => "seller_not_found",
            Self::UnsupportedCategory => "unsupported_category",
            Self::StorageUnavailable => "storage_unavailable",
            Self::DuplicateId => "duplicate_id",
            Self::PublishFailed => "publish_failed",
            Self::ItemNotFound => "item_not_found",
            Self::InvalidMedia => "invalid_media",
            Self::EmptyInput => "empty_input",
            Self::QuotaExceeded => "quota_exceeded",
            Self::AlreadyAnnounced => "already_announced",
            Self::UserDirectoryUnavailable => "user_directory_unavailable",
            Self::Unauthorized => "unauthorized",
            Self::RateLimited => "rate_limited",
            Self::Configuration => "configuration_error",
            Self::Internal => "internal_error",
        }
    }

    /// Rejections caused by the request itself, as opposed to a failing dependency.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidPayload
                | Self::SellerNotFound
                | Self::UnsupportedCategory
                | Self::ItemNotFound
                | Self::InvalidMedia
                | Self::EmptyInput
                | Self::AlreadyAnnounced
                | Self::Unauthorized
                | Self::RateLimited
        )
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    BlobStore(#[from] BlobStoreError),
    #[error(transparent)]
    MessageBus(#[from] MessageBusError),
    #[error(transparent)]
    ExternalService(#[from] ExternalServiceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Seller not found: {0}")]
    SellerNotFound(String),
    #[error("Unsupported category code: {0}")]
    UnsupportedCategory(String),
    #[error("Item not found: {0}")]
    ItemNotFound(String),
    #[error("Invalid media: {0}")]
    InvalidMedia(String),
    #[error("Item {0} has no pending announcement")]
    AlreadyAnnounced(String),
    #[error("Authentication failed: {0}")]
    Authentication(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Rate limit exceeded")]
    RateLimited,
}

impl AppError {
    /// Category of this error in the caller-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Database(DatabaseError::Duplicate(_)) => ErrorKind::DuplicateId,
            AppError::Database(DatabaseError::NotFound(_)) => ErrorKind::ItemNotFound,
            AppError::Database(DatabaseError::Migration(_)) => ErrorKind::Internal,
            AppError::Database(_) => ErrorKind::StorageUnavailable,
            AppError::BlobStore(BlobStoreError::EmptyInput) => ErrorKind::EmptyInput,
            AppError::BlobStore(BlobStoreError::QuotaExceeded(_)) => ErrorKind::QuotaExceeded,
            AppError::BlobStore(BlobStoreError::InvalidKey(_)) => ErrorKind::Internal,
            AppError::BlobStore(_) => ErrorKind::StorageUnavailable,
            AppError::MessageBus(_) => ErrorKind::PublishFailed,
            AppError::ExternalService(_) => ErrorKind::UserDirectoryUnavailable,
            AppError::Config(_) => ErrorKind::Configuration,
            AppError::Validation(_) => ErrorKind::InvalidPayload,
            AppError::SellerNotFound(_) => ErrorKind::SellerNotFound,
            AppError::UnsupportedCategory(_) => ErrorKind::UnsupportedCategory,
            AppError::ItemNotFound(_) => ErrorKind::ItemNotFound,
            AppError::InvalidMedia(_) => ErrorKind::InvalidMedia,
            AppError::AlreadyAnnounced(_) => ErrorKind::AlreadyAnnounced,
            AppError::Authentication(_) => ErrorKind::Unauthorized,
            AppError::Serialization(_) => ErrorKind::Internal,
            AppError::RateLimited => ErrorKind::RateLimited,
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(ValidationError::Multiple(err.to_string()))
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("Row not found".to_string()),
            sqlx::Error::PoolTimedOut => DatabaseError::PoolExhausted("Pool timed out".to_string()),
            sqlx::Error::Io(io) => DatabaseError::Connection(io.to_string()),
            sqlx::Error::Database(db_err) => {
                if db_err.code().is_some_and(|code| code == "23505") {
                    return DatabaseError::Duplicate(db_err.message().to_string());
                }
                DatabaseError::Query(db_err.message().to_string())
            }
            _ => DatabaseError::Query(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        AppError::Database(DatabaseError::Migration(err.to_string()))
    }
}

impl From<std::io::Error> for BlobStoreError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::StorageFull => {
                BlobStoreError::QuotaExceeded(err.to_string())
            }
            _ => BlobStoreError::Unavailable(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_error_conversions() {
        let not_found = DatabaseError::from(sqlx::Error::RowNotFound);
        assert!(matches!(not_found, DatabaseError::NotFound(_)));

        let pool_timeout = DatabaseError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(pool_timeout, DatabaseError::PoolExhausted(_)));

        let generic = DatabaseError::from(sqlx::Error::WorkerCrashed);
        assert!(matches!(generic, DatabaseError::Query(_)));
    }

    #[test]
    fn test_blob_store_error_from_io() {
        let full = std::io::Error::from(std::io::ErrorKind::StorageFull);
        assert!(matches!(
            BlobStoreError::from(full),
            BlobStoreError::QuotaExceeded(_)
        ));

        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(matches!(
            BlobStoreError::from(denied),
            BlobStoreError::Unavailable(_)
        ));
    }

    #[test]
    fn test_validation_conversion() {
        use validator::Validate;

        #[derive(Validate)]
        struct TestStruct {
            #[validate(length(min = 1))]
            val: String,
        }

        let s = TestStruct {
            val: "".to_string(),
        };
        let err = s.validate().unwrap_err();
        let app_err = AppError::from(err);

        assert!(matches!(
            app_err,
            AppError::Validation(ValidationError::Multiple(_))
        ));
        assert_eq!(app_err.kind(), ErrorKind::InvalidPayload);
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let json_err = serde_json::from_str::<String>("invalid json").unwrap_err();
        let app_err = AppError::from(json_err);
        assert!(matches!(app_err, AppError::Serialization(_)));
    }

    #[test]
    fn test_storage_failures_share_a_kind() {
        let db: AppError = DatabaseError::Connection("refused".to_string()).into();
        let db_timeout: AppError = DatabaseError::Timeout("5s".to_string()).into();
        let blob: AppError = BlobStoreError::Unavailable("disk gone".to_string()).into();

        assert_eq!(db.kind(), ErrorKind::StorageUnavailable);
        assert_eq!(db_timeout.kind(), ErrorKind::StorageUnavailable);
        assert_eq!(blob.kind(), ErrorKind::StorageUnavailable);
    }

    #[test]
    fn test_kind_distinguishes_rejections_from_failures() {
        let rejected = [
            AppError::Validation(ValidationError::MissingField("title".to_string())),
            AppError::SellerNotFound("u1".to_string()),
            AppError::UnsupportedCategory("ZZ".to_string()),
            AppError::ItemNotFound("i1".to_string()),
            AppError::InvalidMedia("image/gif".to_string()),
            AppError::BlobStore(BlobStoreError::EmptyInput),
        ];
        for err in rejected {
            assert!(err.kind().is_rejection(), "{err} should be a rejection");
        }

        let failed = [
            AppError::Database(DatabaseError::Connection("down".to_string())),
            AppError::MessageBus(MessageBusError::PublishFailed("nack".to_string())),
            AppError::BlobStore(BlobStoreError::QuotaExceeded("full".to_string())),
            AppError::ExternalService(ExternalServiceError::Timeout("3s".to_string())),
        ];
        for err in failed {
            assert!(!err.kind().is_rejection(), "{err} should be a failure");
        }
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ErrorKind::InvalidPayload.as_str(), "invalid_payload");
        assert_eq!(ErrorKind::PublishFailed.as_str(), "publish_failed");
        assert_eq!(ErrorKind::DuplicateId.as_str(), "duplicate_id");
    }

    #[test]
    fn test_database_error_display() {
        let err = DatabaseError::Connection("timeout".to_string());
        assert_eq!(err.to_string(), "Connection failed: timeout");

        let err = DatabaseError::Duplicate("unique violation".to_string());
        assert_eq!(err.to_string(), "Duplicate record: unique violation");

        let err = DatabaseError::Timeout("5s".to_string());
        assert_eq!(err.to_string(), "Timed out: 5s");
    }

    #[test]
    fn test_message_bus_error_display() {
        let err = MessageBusError::Misrouted {
            expected: "topic_fleet".to_string(),
            actual: "other".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Message routed to stream 'other', expected 'topic_fleet'"
        );

        let err = MessageBusError::PublishFailed("no responders".to_string());
        assert_eq!(err.to_string(), "Publish failed: no responders");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingEnvVar("DATABASE_URL".to_string());
        assert_eq!(
            err.to_string(),
            "Missing environment variable: DATABASE_URL"
        );

        let err = ConfigError::InvalidValue {
            key: "MAX_IMAGE_BYTES".to_string(),
            message: "not a number".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid value for 'MAX_IMAGE_BYTES': not a number"
        );
    }

    #[test]
    fn test_app_error_display() {
        let err = AppError::SellerNotFound("42".to_string());
        assert_eq!(err.to_string(), "Seller not found: 42");

        let err = AppError::UnsupportedCategory("ZZ".to_string());
        assert_eq!(err.to_string(), "Unsupported category code: ZZ");

        let err = AppError::BlobStore(BlobStoreError::EmptyInput);
        assert_eq!(err.to_string(), "Blob input is empty");

        let err = AppError::RateLimited;
        assert_eq!(err.to_string(), "Rate limit exceeded");
    }

    #[test]
    fn test_app_error_from_migrate_error() {
        let mig_err = sqlx::migrate::MigrateError::VersionMissing(1);
        let app_err: AppError = mig_err.into();

        match app_err {
            AppError::Database(DatabaseError::Migration(msg)) => {
                assert!(msg.contains("migration 1 was previously applied"));
            }
            _ => panic!("Expected DatabaseError::Migration, got {:?}", app_err),
        }
    }
}
