//! Contentless-style inverted index for BM25 keyword search.
//!
//! Backed by `tantivy`. "Contentless" here means the index stores and
//! tokenises `content` for scoring but is never used to retrieve it — the
//! caller always re-joins the returned `chunk_id` against the `Repository`'s
//! node map, the same shape as a `fts_chunks(chunk_id UNINDEXED, content)`
//! table: tantivy's own stored-field store plays the role of that table,
//! but call sites only ever read `chunk_id`.

use std::path::Path;
use std::sync::RwLock;

use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::QueryParser;
use tantivy::schema::{Schema, FAST, STORED, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument};
use thiserror::Error;

const WRITER_HEAP_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FtsError {
    #[error("fts io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("fts backend error: {0}")]
    Backend(String),
}

pub type FtsResult<T> = Result<T, FtsError>;

pub struct FtsIndex {
    index: Index,
    writer: RwLock<IndexWriter>,
    reader: IndexReader,
    chunk_id_field: tantivy::schema::Field,
    content_field: tantivy::schema::Field,
}

impl FtsIndex {
    /// Opens (or creates) a persistent index at `dir`.
    pub fn open(dir: &Path) -> FtsResult<Self> {
        std::fs::create_dir_all(dir).map_err(FtsError::Io)?;
        let schema = Self::schema();
        let directory = MmapDirectory::open(dir).map_err(|e| FtsError::Backend(e.to_string()))?;
        let index = Index::open_or_create(directory, schema.clone())
            .map_err(|e| FtsError::Backend(e.to_string()))?;
        Self::from_index(index, &schema)
    }

    /// In-memory index, primarily for tests and `FtsRebuilder` scratch
    /// passes that build a fresh index before swapping it in.
    pub fn create_in_ram() -> FtsResult<Self> {
        let schema = Self::schema();
        let index = Index::create_in_ram(schema.clone());
        Self::from_index(index, &schema)
    }

    fn schema() -> Schema {
        let mut builder = Schema::builder();
        builder.add_u64_field("chunk_id", STORED | FAST);
        builder.add_text_field("content", TEXT);
        builder.build()
    }

    fn from_index(index: Index, schema: &Schema) -> FtsResult<Self> {
        let writer = index
            .writer(WRITER_HEAP_BYTES)
            .map_err(|e| FtsError::Backend(e.to_string()))?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .map_err(|e: tantivy::TantivyError| FtsError::Backend(e.to_string()))?;
        let chunk_id_field = schema.get_field("chunk_id").expect("schema has chunk_id");
        let content_field = schema.get_field("content").expect("schema has content");
        Ok(Self {
            index,
            writer: RwLock::new(writer),
            reader,
            chunk_id_field,
            content_field,
        })
    }

    /// Inserts or replaces the posting for `chunk_id` (upsert via
    /// delete-then-add, matching the `contentless_delete` contract).
    pub fn upsert(&self, chunk_id: u64, content: &str) -> FtsResult<()> {
        let mut writer = self.writer.write().expect("fts writer lock poisoned");
        writer.delete_term(tantivy::Term::from_field_u64(self.chunk_id_field, chunk_id));
        writer
            .add_document(doc!(
                self.chunk_id_field => chunk_id,
                self.content_field => content,
            ))
            .map_err(|e| FtsError::Backend(e.to_string()))?;
        writer.commit().map_err(|e| FtsError::Backend(e.to_string()))?;
        Ok(())
    }

    pub fn delete(&self, chunk_id: u64) -> FtsResult<()> {
        let mut writer = self.writer.write().expect("fts writer lock poisoned");
        writer.delete_term(tantivy::Term::from_field_u64(self.chunk_id_field, chunk_id));
        writer.commit().map_err(|e| FtsError::Backend(e.to_string()))?;
        Ok(())
    }

    /// BM25 keyword search, returning `(chunk_id, score)` ranked descending.
    pub fn search(&self, query_text: &str, top_k: usize) -> FtsResult<Vec<(u64, f32)>> {
        if query_text.trim().is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let searcher = self.reader.searcher();
        let parser = QueryParser::for_index(&self.index, vec![self.content_field]);
        let query = parser
            .parse_query(&sanitize_query(query_text))
            .map_err(|e| FtsError::Backend(e.to_string()))?;
        let hits = searcher
            .search(&query, &TopDocs::with_limit(top_k))
            .map_err(|e| FtsError::Backend(e.to_string()))?;

        let mut out = Vec::with_capacity(hits.len());
        for (score, address) in hits {
            let retrieved: TantivyDocument = searcher
                .doc(address)
                .map_err(|e| FtsError::Backend(e.to_string()))?;
            if let Some(chunk_id) = retrieved
                .get_first(self.chunk_id_field)
                .and_then(|v| v.as_u64())
            {
                out.push((chunk_id, score));
            }
        }
        Ok(out)
    }

    /// Drops every posting. Used by `FtsRebuilder` before repopulating.
    pub fn clear(&self) -> FtsResult<()> {
        let mut writer = self.writer.write().expect("fts writer lock poisoned");
        writer
            .delete_all_documents()
            .map_err(|e| FtsError::Backend(e.to_string()))?;
        writer.commit().map_err(|e| FtsError::Backend(e.to_string()))?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.reader.searcher().num_docs() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enumerates every indexed chunk id, used by `IntegrityChecker` and
    /// `FtsRebuilder` to diff the FTS index's membership against the
    /// repository's node set.
    pub fn all_chunk_ids(&self) -> FtsResult<Vec<u64>> {
        let searcher = self.reader.searcher();
        let limit = self.len().max(1);
        let hits = searcher
            .search(&tantivy::query::AllQuery, &TopDocs::with_limit(limit))
            .map_err(|e| FtsError::Backend(e.to_string()))?;

        let mut out = Vec::with_capacity(hits.len());
        for (_score, address) in hits {
            let retrieved: TantivyDocument = searcher
                .doc(address)
                .map_err(|e| FtsError::Backend(e.to_string()))?;
            if let Some(chunk_id) = retrieved
                .get_first(self.chunk_id_field)
                .and_then(|v| v.as_u64())
            {
                out.push(chunk_id);
            }
        }
        Ok(out)
    }
}

/// tantivy's query parser treats bare `and`/`or` as lowercase text, not
/// boolean operators, unless escaped — this keeps compound-query
/// connective words searchable as plain terms rather than parser syntax.
fn sanitize_query(text: &str) -> String {
    text.chars()
        .map(|c| if "+-&|!(){}[]^\"~*?:\\/".contains(c) { ' ' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_finds_upserted_content() {
        let index = FtsIndex::create_in_ram().unwrap();
        index.upsert(1, "position sizing for risk management").unwrap();
        index.upsert(2, "unrelated content about gardening").unwrap();

        let results = index.search("risk management", 10).unwrap();
        assert_eq!(results[0].0, 1);
    }

    #[test]
    fn delete_removes_from_results() {
        let index = FtsIndex::create_in_ram().unwrap();
        index.upsert(1, "alpha beta gamma").unwrap();
        index.delete(1).unwrap();

        let results = index.search("alpha", 10).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn all_chunk_ids_enumerates_every_posting() {
        let index = FtsIndex::create_in_ram().unwrap();
        index.upsert(1, "alpha").unwrap();
        index.upsert(2, "beta").unwrap();

        let mut ids = index.all_chunk_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn upsert_replaces_prior_posting() {
        let index = FtsIndex::create_in_ram().unwrap();
        index.upsert(1, "alpha").unwrap();
        index.upsert(1, "beta").unwrap();

        assert!(index.search("alpha", 10).unwrap().is_empty());
        assert_eq!(index.search("beta", 10).unwrap()[0].0, 1);
    }
}
