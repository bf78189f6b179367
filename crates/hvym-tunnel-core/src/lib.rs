//! HVYM Tunnel Core Library
//!
//! Shared functionality for tunnel components:
//! - Persisted tunnel configuration record and `ConfigStore`
//! - Common error types
//! - Tracing initialisation

pub mod error;
pub mod store;
pub mod tracing_init;

pub use error::{Error, Result};
pub use store::{ConfigRecord, ConfigStore, JsonConfigStore, MemoryConfigStore};
