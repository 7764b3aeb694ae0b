//! Cloudstore Core - Shared foundation for the cloudstore crates
//!
//! Provides the error taxonomy, store configuration, object metadata types
//! and the cancellation context passed to every remote operation.

pub mod config;
pub mod context;
pub mod error;
pub mod types;

pub use config::{BackendConfig, CacheConfig, StoreConfig};
pub use context::OpContext;
pub use error::{Error, Result};
pub use types::*;
