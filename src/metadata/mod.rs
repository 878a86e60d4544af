pub mod memory;
pub mod store;
pub mod types;

pub use memory::MemoryMetadataStore;
pub use store::{MetadataError, MetadataStore, MongoMetadataStore, METADATA_COLLECTION};
pub use types::{priority, ConnectionMetadata, MetadataPatch};
