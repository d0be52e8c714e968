pub mod embeddings;
pub mod index;
pub mod kv;
pub mod lookup;
pub mod mock;
pub mod store;

pub use embeddings::{cosine_similarity, EmbeddingProvider, HttpEmbeddingProvider};
pub use index::DocumentIndex;
pub use kv::KvMemory;
pub use lookup::{ChainedLookup, GraphDirectory, MemoryRunStore, StaticGraphs};
pub use mock::MockSearch;
pub use store::{GraphSummary, SqliteStore};
