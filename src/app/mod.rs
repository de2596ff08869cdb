//! Application layer containing business logic and shared state.

pub mod attachment;
pub mod deadline;
pub mod ingestion;
pub mod service;
pub mod state;
pub mod worker;

pub use attachment::{AttachmentConfig, AttachmentCoordinator};
pub use ingestion::{IngestionConfig, IngestionCoordinator, IngestionOutcome};
pub use service::AppService;
pub use state::{AppState, Collaborators};
pub use worker::{AnnouncementRetryWorker, WorkerConfig, spawn_worker};
