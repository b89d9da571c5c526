//! Data models shared by the record sources, the stores and the engines.
//!
//! Typed records map onto the persisted document shapes via `serde`; the
//! object row maps onto the metadata table via `sqlx::FromRow`.

pub mod document;
pub mod node;
pub mod object;
pub mod record;
pub mod window;
pub mod workspace;
