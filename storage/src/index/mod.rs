pub mod fts;
pub mod graph;
pub mod hnsw;

pub use fts::{FtsError, FtsIndex};
pub use graph::AdjacencyGraph;
pub use hnsw::HnswIndex;
