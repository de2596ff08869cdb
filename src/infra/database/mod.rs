//! Concrete database client implementations.
//!
//! This module contains the PostgreSQL adapter implementing the
//! `ItemRepository` and `AnnouncementLedger` traits.

pub mod postgres;

pub use postgres::{PostgresClient, PostgresConfig};
