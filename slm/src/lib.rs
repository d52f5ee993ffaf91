pub mod decompose;
pub mod lightweight;
pub mod ner;
pub mod registry;
pub mod reranker;
