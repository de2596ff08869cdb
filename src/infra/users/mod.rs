//! User service adapters.

pub mod http;

pub use http::{HttpUserDirectory, UserServiceConfig};
