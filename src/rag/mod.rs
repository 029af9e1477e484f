//! Retrieval plumbing shared by memory and knowledge: the embedding
//! capability, the vector index capability, and an in-memory index used as
//! the default backend.

pub mod embedder;
pub mod index;

pub use embedder::{EmbedError, Embedder, HttpEmbedder};
pub use index::{cosine_similarity, IndexEntry, InMemoryVectorIndex, MetadataFilter, ScoredHit, VectorIndex};
