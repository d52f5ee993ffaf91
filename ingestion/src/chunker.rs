use ragkb_core::ingest::{Chunk, ChunkingConfig, ChunkStrategy};
use async_trait::async_trait;
use std::collections::HashMap;
use text_splitter::TextSplitter;
use tree_sitter::{Language, Node as TsNode, Parser};

#[async_trait]
pub trait Chunker: Send + Sync {
    async fn chunk(&self, content: &str, base_metadata: HashMap<String, String>) -> Vec<Chunk>;
}

/// Size-bounded chunking with configurable overlap between consecutive
/// windows, the simplest of the three strategies.
pub struct FixedChunker {
    max_chars: usize,
    overlap_chars: usize,
}

impl FixedChunker {
    pub fn new(max_chars: usize, overlap_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
            overlap_chars: overlap_chars.min(max_chars.saturating_sub(1)),
        }
    }
}

impl Default for FixedChunker {
    fn default() -> Self {
        Self::new(1000, 0)
    }
}

#[async_trait]
impl Chunker for FixedChunker {
    async fn chunk(&self, content: &str, base_metadata: HashMap<String, String>) -> Vec<Chunk> {
        let chars: Vec<char> = content.chars().collect();
        if chars.is_empty() {
            return Vec::new();
        }

        let stride = self.max_chars.saturating_sub(self.overlap_chars).max(1);
        let mut chunks = Vec::new();
        let mut start = 0usize;
        let mut index = 0u64;

        while start < chars.len() {
            let end = (start + self.max_chars).min(chars.len());
            let text: String = chars[start..end].iter().collect();

            let mut metadata = base_metadata.clone();
            metadata.insert("chunk_index".to_string(), index.to_string());
            metadata.insert("chunk_chars".to_string(), text.len().to_string());
            metadata.insert("chunk_strategy".to_string(), "fixed".to_string());

            chunks.push(Chunk {
                content: text,
                metadata,
                embedding: None,
            });

            index += 1;
            if end == chars.len() {
                break;
            }
            start += stride;
        }

        chunks
    }
}

/// Sentence-boundary-aware, paragraph-preserving chunking, the default
/// fallback for prose content that isn't structured markup or source code.
pub struct SemanticChunker {
    max_chars: usize,
    splitter: TextSplitter<text_splitter::Characters>,
}

impl SemanticChunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self {
            max_chars: config.max_chars.max(1),
            splitter: TextSplitter::default().with_trim_chunks(true),
        }
    }
}

impl Default for SemanticChunker {
    fn default() -> Self {
        Self::new(ChunkingConfig::default())
    }
}

#[async_trait]
impl Chunker for SemanticChunker {
    async fn chunk(&self, content: &str, base_metadata: HashMap<String, String>) -> Vec<Chunk> {
        let chunks: Vec<_> = self.splitter.chunks(content, self.max_chars).collect();

        chunks
            .into_iter()
            .enumerate()
            .map(|(i, text)| {
                let mut metadata = base_metadata.clone();
                metadata.insert("chunk_index".to_string(), i.to_string());
                metadata.insert("chunk_chars".to_string(), text.len().to_string());
                metadata.insert("chunk_strategy".to_string(), "semantic".to_string());

                Chunk {
                    content: text.to_string(),
                    metadata,
                    embedding: None,
                }
            })
            .collect()
    }
}

fn grammar_for_extension(extension: &str) -> Option<Language> {
    match extension {
        "rs" => Some(tree_sitter_rust::language()),
        "py" => Some(tree_sitter_python::language()),
        "js" | "jsx" | "mjs" => Some(tree_sitter_javascript::language()),
        "ts" | "tsx" => Some(tree_sitter_typescript::language_typescript()),
        "go" => Some(tree_sitter_go::language()),
        _ => None,
    }
}

/// Node kinds worth treating as independently chunkable top-level units,
/// per supported grammar. Everything else at the top level (imports,
/// comments, stray punctuation) gets merged into whichever neighboring
/// chunk it fits into.
fn is_chunkable_kind(language_extension: &str, kind: &str) -> bool {
    match language_extension {
        "rs" => matches!(
            kind,
            "function_item" | "impl_item" | "struct_item" | "enum_item" | "trait_item" | "mod_item"
        ),
        "py" => matches!(kind, "function_definition" | "class_definition"),
        "js" | "jsx" | "mjs" | "ts" | "tsx" => matches!(
            kind,
            "function_declaration"
                | "class_declaration"
                | "lexical_declaration"
                | "export_statement"
        ),
        "go" => matches!(
            kind,
            "function_declaration" | "method_declaration" | "type_declaration"
        ),
        _ => false,
    }
}

/// AST-aware chunker implementing a split-then-merge pass over a
/// `tree-sitter` parse tree: any node whose source exceeds `max_chars` is
/// split at its own children; adjacent small nodes (including the
/// whitespace/comments between them) are greedily merged up to the cap.
pub struct TreeSitterChunker {
    max_chars: usize,
    fallback: SemanticChunker,
}

impl TreeSitterChunker {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
            fallback: SemanticChunker::new(ChunkingConfig::new(
                ChunkStrategy::Semantic,
                max_chars,
                0,
            )),
        }
    }

    /// Parses `content` as `extension`'s language and returns split-then-merge
    /// chunks, or `None` if the extension has no registered grammar or the
    /// parse fails outright.
    fn ast_chunk(&self, content: &str, extension: &str) -> Option<Vec<(String, String, usize, usize)>> {
        let language = grammar_for_extension(extension)?;
        let mut parser = Parser::new();
        parser.set_language(&language).ok()?;
        let tree = parser.parse(content, None)?;
        let root = tree.root_node();

        let mut units: Vec<(String, String, usize, usize)> = Vec::new();
        collect_units(root, content, extension, self.max_chars, &mut units);
        Some(merge_units(units, self.max_chars))
    }
}

fn collect_units(
    node: TsNode,
    source: &str,
    extension: &str,
    max_chars: usize,
    out: &mut Vec<(String, String, usize, usize)>,
) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        let kind = child.kind();
        if is_chunkable_kind(extension, kind) {
            let text = child
                .utf8_text(source.as_bytes())
                .unwrap_or_default()
                .to_string();
            if text.len() > max_chars && child.child_count() > 0 {
                collect_units(child, source, extension, max_chars, out);
            } else {
                out.push((kind.to_string(), text, child.start_byte(), child.end_byte()));
            }
        } else if child.child_count() > 0 {
            collect_units(child, source, extension, max_chars, out);
        }
    }
}

/// Greedily merges adjacent units (in source order) up to `max_chars`,
/// joining their node kinds with `+` as spec'd.
fn merge_units(
    units: Vec<(String, String, usize, usize)>,
    max_chars: usize,
) -> Vec<(String, String, usize, usize)> {
    let mut sorted = units;
    sorted.sort_by_key(|(_, _, start, _)| *start);

    let mut merged: Vec<(String, String, usize, usize)> = Vec::new();
    for (kind, text, start, end) in sorted {
        if let Some(last) = merged.last_mut() {
            let combined_len = last.1.len() + text.len();
            if combined_len <= max_chars {
                last.0 = format!("{}+{}", last.0, kind);
                last.1.push_str(&text);
                last.3 = end;
                continue;
            }
        }
        merged.push((kind, text, start, end));
    }
    merged
}

#[async_trait]
impl Chunker for TreeSitterChunker {
    async fn chunk(&self, content: &str, base_metadata: HashMap<String, String>) -> Vec<Chunk> {
        let extension = base_metadata
            .get("language")
            .or_else(|| base_metadata.get("extension"))
            .cloned()
            .unwrap_or_default();

        match self.ast_chunk(content, &extension) {
            Some(units) if !units.is_empty() => units
                .into_iter()
                .enumerate()
                .map(|(i, (node_type, text, start_byte, end_byte))| {
                    let mut metadata = base_metadata.clone();
                    metadata.insert("chunk_index".to_string(), i.to_string());
                    metadata.insert("chunk_chars".to_string(), text.len().to_string());
                    metadata.insert("chunk_strategy".to_string(), "ast".to_string());
                    metadata.insert("node_type".to_string(), node_type);
                    metadata.insert("start_byte".to_string(), start_byte.to_string());
                    metadata.insert("end_byte".to_string(), end_byte.to_string());

                    Chunk {
                        content: text,
                        metadata,
                        embedding: None,
                    }
                })
                .collect(),
            _ => self.fallback.chunk(content, base_metadata).await,
        }
    }
}

/// Structure-aware chunking: routes to the AST chunker when the content's
/// `language`/`extension` metadata names a supported grammar, otherwise to
/// the semantic splitter. This is the default strategy (`ChunkStrategy::Hybrid`).
pub struct HybridChunker {
    tree_sitter: TreeSitterChunker,
    semantic: SemanticChunker,
}

impl HybridChunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self {
            tree_sitter: TreeSitterChunker::new(config.max_chars),
            semantic: SemanticChunker::new(config),
        }
    }
}

impl Default for HybridChunker {
    fn default() -> Self {
        Self::new(ChunkingConfig::default())
    }
}

#[async_trait]
impl Chunker for HybridChunker {
    async fn chunk(&self, content: &str, base_metadata: HashMap<String, String>) -> Vec<Chunk> {
        let has_grammar = base_metadata
            .get("language")
            .or_else(|| base_metadata.get("extension"))
            .map(|ext| grammar_for_extension(ext).is_some())
            .unwrap_or(false);

        if has_grammar {
            self.tree_sitter.chunk(content, base_metadata).await
        } else {
            self.semantic.chunk(content, base_metadata).await
        }
    }
}

/// Builds the chunker named by `config.strategy`, the factory `default_chunker`
/// and the pipeline's configuration surface dispatch through.
pub fn chunker_for_strategy(config: ChunkingConfig) -> Box<dyn Chunker> {
    match config.strategy {
        ChunkStrategy::Hybrid => Box::new(HybridChunker::new(config)),
        ChunkStrategy::Semantic => Box::new(SemanticChunker::new(config)),
        ChunkStrategy::Fixed => Box::new(FixedChunker::new(config.max_chars, config.overlap_chars)),
    }
}
