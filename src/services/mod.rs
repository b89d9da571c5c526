pub mod checkpoint;
pub mod ledger;
pub mod record_migration;
pub mod record_source;
pub mod sync;
pub mod transfer;
pub mod transform;
pub mod transporter;
pub mod verify;
