//! Incremental, resumable migration of blob payloads between object stores,
//! with conversion of the records that reference them and a read-only
//! verification pass.

pub mod config;
pub mod errors;
pub mod keys;
pub mod models;
pub mod services;
pub mod stores;

pub use errors::{MigrateError, MigrateResult};
