pub mod fixtures;
pub mod memory;

#[allow(unused_imports)]
pub use fixtures::{TestEnv, at, blob_node_doc, legacy_node_doc, legacy_user_doc, node_id};
#[allow(unused_imports)]
pub use memory::MemoryObjectStore;
