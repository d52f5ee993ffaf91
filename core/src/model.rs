use rkyv::{Archive, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)] // Enables bytecheck validation for zero-copy safety
pub struct Node {
    pub id: u64,
    pub embedding: Vec<f32>,
    pub data: String, // Raw text or JSON content
    pub metadata: HashMap<String, String>,
}

#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct Edge {
    pub source: u64,
    pub target: u64,
    pub relation: String,
    pub weight: f32,
    pub metadata: HashMap<String, String>,
}

impl Node {
    pub fn new(id: u64, embedding: Vec<f32>, data: String) -> Self {
        Self {
            id,
            embedding,
            data,
            metadata: HashMap::new(),
        }
    }
}

impl Edge {
    pub fn new(source: u64, target: u64, relation: impl Into<String>, weight: f32) -> Self {
        Self {
            source,
            target,
            relation: relation.into(),
            weight,
            metadata: HashMap::new(),
        }
    }
}

/// Resolves a provenance string out of a metadata map, preferring an
/// explicit `source` key but falling back to whatever the ingestion path
/// actually wrote: the file-watcher pipeline stores the document path
/// under `file_path`, the request-based pipeline under `filename`.
pub fn resolve_source(metadata: &HashMap<String, String>) -> Option<String> {
    metadata
        .get("source")
        .or_else(|| metadata.get("file_path"))
        .or_else(|| metadata.get("filename"))
        .cloned()
}

/// Derives a stable `u64` node/edge id from a symbolic key (a path, tag
/// name, or other string that needs to round-trip to the same id on
/// every reindex). Same SHA256-digest-truncation scheme used for chunk
/// and entity ids elsewhere in the pipeline.
pub fn stable_id(key: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_id_is_reproducible_and_key_sensitive() {
        assert_eq!(stable_id("note:a.md"), stable_id("note:a.md"));
        assert_ne!(stable_id("note:a.md"), stable_id("note:b.md"));
    }

    #[test]
    fn resolve_source_prefers_source_then_falls_back() {
        let mut metadata = HashMap::new();
        metadata.insert("file_path".to_string(), "docs/a.md".to_string());
        assert_eq!(resolve_source(&metadata).as_deref(), Some("docs/a.md"));

        metadata.insert("source".to_string(), "explicit.md".to_string());
        assert_eq!(resolve_source(&metadata).as_deref(), Some("explicit.md"));

        let filename_only: HashMap<String, String> =
            [("filename".to_string(), "upload.txt".to_string())].into();
        assert_eq!(resolve_source(&filename_only).as_deref(), Some("upload.txt"));

        assert_eq!(resolve_source(&HashMap::new()), None);
    }
}
