pub mod index;
pub mod search;

pub use index::{IndexedChunk, KnowledgeIndex, QueryVector, SearchHit};
