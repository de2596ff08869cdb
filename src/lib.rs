//! Item ingestion service.
//!
//! Accepts marketplace items over HTTP, persists them, announces each new
//! item on a topic exchange and stores image attachments in a blob store.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                   API Layer                  │
//! │   HTTP handlers, routing, auth, rate limits  │
//! ├─────────────────────────────────────────────┤
//! │               Application Layer              │
//! │  Ingestion, attachment, retry worker, state  │
//! ├─────────────────────────────────────────────┤
//! │                 Domain Layer                 │
//! │            Traits, types, errors             │
//! ├─────────────────────────────────────────────┤
//! │             Infrastructure Layer             │
//! │  PostgreSQL, filesystem blobs, NATS, users   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Every collaborator (user directory, item repository, announcement
//! ledger, blob store, event publisher) sits behind a trait in
//! [`domain`], so the application layer runs unchanged against the
//! in-memory mocks in `test_utils`.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use item_service::api::create_router;
//! use item_service::app::{AppState, Collaborators};
//! use item_service::config::AppConfig;
//!
//! let config = AppConfig::from_env()?;
//! let state = Arc::new(AppState::new(collaborators, &config));
//! axum::serve(listener, create_router(state)).await?;
//! ```

pub mod api;
pub mod app;
pub mod config;
pub mod domain;
pub mod infra;

// Test utilities are available in tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
