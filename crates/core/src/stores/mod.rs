pub mod images;
pub mod memory;
pub mod qdrant;

pub use images::{content_key, LocalDirImageStore};
pub use memory::{EntryStatus, InMemoryKnowledgeBase, StoredEntry};
pub use qdrant::QdrantKnowledgeBase;
