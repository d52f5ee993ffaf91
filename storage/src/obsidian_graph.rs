//! Note/tag/header graph layered over a markdown vault: wikilinks,
//! `#tags`, and headers become graph nodes and edges alongside the
//! chunk nodes the ingestion pipeline already stores, so search can
//! walk from a chunk to its note, its note's tags, and its note's
//! backlinks without re-parsing markdown at query time.
//!
//! Node ids are derived deterministically from a symbolic key (`note:
//! <path>`, `tag:<name>`, ...) with `ragkb_core::model::stable_id`, the
//! same scheme `derive_chunk_id` and the entity-extraction worker use
//! for their own ids, so re-indexing the same note produces the same
//! node ids rather than duplicating them.
//!
//! `Repository::put_edge` requires both endpoints to already exist
//! (`validate_index_transaction` rejects edges to nodes it hasn't seen
//! a `PutNode` for), so a wikilink to a note that hasn't been indexed
//! yet resolves to a placeholder `note_ref:<target>` node rather than a
//! dangling edge. Indexing the real note later does not retroactively
//! rewrite that edge; the placeholder stays until the linking note is
//! reindexed.

use ragkb_core::model::{stable_id, Edge, Node};
use std::collections::HashMap;
use std::sync::Arc;

use crate::repo::{RepoError, Repository};

pub const REL_HEADER_CHILD: &str = "header_child";
pub const REL_TAGGED: &str = "tagged";
pub const REL_LINKS_TO: &str = "links_to";
pub const REL_CHUNK_OF: &str = "chunk_of";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphNodeType {
    Note,
    Header,
    Tag,
    /// Wikilink target that hasn't been indexed as a real note yet.
    NoteRef,
}

impl GraphNodeType {
    fn as_str(self) -> &'static str {
        match self {
            GraphNodeType::Note => "note",
            GraphNodeType::Header => "header",
            GraphNodeType::Tag => "tag",
            GraphNodeType::NoteRef => "note_ref",
        }
    }
}

/// Result of indexing one note: the ids a caller might want to link
/// further chunks to or display as a confirmation.
#[derive(Debug, Clone)]
pub struct IndexedNote {
    pub note_id: u64,
    pub header_ids: Vec<u64>,
    pub tag_ids: Vec<u64>,
    pub link_target_ids: Vec<u64>,
}

/// Derives the node id for a note path. Exposed so callers can look a
/// note up (e.g. for backlinks) without re-parsing its content.
pub fn note_id(path: &str) -> u64 {
    stable_id(&format!("note:{path}"))
}

pub fn tag_id(tag: &str) -> u64 {
    stable_id(&format!("tag:{tag}"))
}

fn note_ref_id(target: &str) -> u64 {
    stable_id(&format!("note_ref:{target}"))
}

fn header_id(note_path: &str, index: usize) -> u64 {
    stable_id(&format!("header:{note_path}:{index}"))
}

/// Builds and maintains the note/tag/header graph for a markdown vault
/// on top of a `Repository`. One builder per repository; cheap to
/// clone-share via the `Arc<Repository>` it wraps.
pub struct ObsidianGraphBuilder {
    repo: Arc<Repository>,
}

impl ObsidianGraphBuilder {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }

    /// Parses `content` for headers, wikilinks and tags, materializes
    /// the corresponding nodes/edges, and links `chunk_ids` (already
    /// stored chunk nodes for this note) to the note node. Reindexing
    /// the same path first tears down its previous header/note nodes
    /// via `delete_note_nodes`, so stale headers from a shrunk file
    /// don't linger.
    pub async fn index_note(
        &self,
        path: &str,
        content: &str,
        chunk_ids: &[u64],
    ) -> Result<IndexedNote, RepoError> {
        self.delete_note_nodes(path).await?;

        let note_id = note_id(path);
        let title = title_from_path(path);
        let preview: String = content.chars().take(200).collect();

        let mut note_node = Node::new(note_id, Vec::new(), preview);
        note_node.metadata.insert("kind".to_string(), GraphNodeType::Note.as_str().to_string());
        note_node.metadata.insert("title".to_string(), title);
        note_node.metadata.insert("path".to_string(), path.to_string());
        self.repo.put_node(note_node).await?;

        let mut header_ids = Vec::new();
        let mut parent_stack: Vec<(u8, u64)> = Vec::new();
        for (index, header) in extract_headers(content).into_iter().enumerate() {
            let id = header_id(path, index);
            let mut node = Node::new(id, Vec::new(), header.title.clone());
            node.metadata.insert("kind".to_string(), GraphNodeType::Header.as_str().to_string());
            node.metadata.insert("level".to_string(), header.level.to_string());
            node.metadata.insert("path".to_string(), path.to_string());
            self.repo.put_node(node).await?;

            while parent_stack.last().is_some_and(|(level, _)| *level >= header.level) {
                parent_stack.pop();
            }
            let parent_id = parent_stack.last().map(|(_, id)| *id).unwrap_or(note_id);
            self.repo
                .put_edge(Edge::new(parent_id, id, REL_HEADER_CHILD, 1.0))
                .await?;
            parent_stack.push((header.level, id));
            header_ids.push(id);
        }

        let mut tag_ids = Vec::new();
        for tag in extract_tags(content) {
            let id = tag_id(&tag);
            if self.repo.get_node(id).await.is_err() {
                let mut node = Node::new(id, Vec::new(), tag.clone());
                node.metadata.insert("kind".to_string(), GraphNodeType::Tag.as_str().to_string());
                self.repo.put_node(node).await?;
            }
            self.repo
                .put_edge(Edge::new(note_id, id, REL_TAGGED, 1.0))
                .await?;
            tag_ids.push(id);
        }

        let mut link_target_ids = Vec::new();
        for link in extract_wikilinks(content) {
            let target_path = resolve_link_path(path, &link.target);
            let target_note = note_id(&target_path);
            let target = if self.repo.get_node(target_note).await.is_ok() {
                target_note
            } else {
                let placeholder_id = note_ref_id(&link.target);
                if self.repo.get_node(placeholder_id).await.is_err() {
                    let mut node = Node::new(placeholder_id, Vec::new(), link.target.clone());
                    node.metadata
                        .insert("kind".to_string(), GraphNodeType::NoteRef.as_str().to_string());
                    self.repo.put_node(node).await?;
                }
                placeholder_id
            };
            self.repo
                .put_edge(Edge::new(note_id, target, REL_LINKS_TO, 1.0))
                .await?;
            link_target_ids.push(target);
        }

        for chunk_id in chunk_ids {
            self.repo
                .put_edge(Edge::new(*chunk_id, note_id, REL_CHUNK_OF, 1.0))
                .await?;
        }

        Ok(IndexedNote {
            note_id,
            header_ids,
            tag_ids,
            link_target_ids,
        })
    }

    /// Removes a note's own node plus every header node it owns, then
    /// drops any tag or note_ref placeholder that no longer has an
    /// incoming edge from anywhere else in the graph. Chunk nodes are
    /// left alone; callers re-create `chunk_of` edges on the next
    /// `index_note` call for that path.
    pub async fn delete_note_nodes(&self, path: &str) -> Result<(), RepoError> {
        let note_id = note_id(path);
        if self.repo.get_node(note_id).await.is_err() {
            return Ok(());
        }

        let graph = self.repo.graph_index().await;

        // Headers owned by this note: walk header_child edges only,
        // since that relation forms a tree rooted at the note.
        let header_ids = header_subtree(&graph, note_id);

        let mut referenced_candidates: Vec<u64> = graph_outgoing(&graph, note_id)
            .into_iter()
            .filter(|(_, relation)| relation == REL_TAGGED || relation == REL_LINKS_TO)
            .map(|(target, _)| target)
            .collect();
        for id in &header_ids {
            referenced_candidates.extend(
                graph_outgoing(&graph, *id)
                    .into_iter()
                    .filter(|(_, relation)| relation == REL_TAGGED || relation == REL_LINKS_TO)
                    .map(|(target, _)| target),
            );
        }

        self.repo.delete_node(note_id).await?;
        for id in &header_ids {
            if self.repo.get_node(*id).await.is_ok() {
                self.repo.delete_node(*id).await?;
            }
        }

        let graph_after = self.repo.graph_index().await;
        for candidate in referenced_candidates {
            if candidate == note_id || header_ids.contains(&candidate) {
                continue;
            }
            if graph_after.incoming_count(candidate) == 0 {
                if self.repo.get_node(candidate).await.is_ok() {
                    self.repo.delete_node(candidate).await?;
                }
            }
        }

        Ok(())
    }
}

fn graph_outgoing(graph: &crate::index::AdjacencyGraph, id: u64) -> Vec<(u64, String)> {
    graph
        .neighbors(id)
        .into_iter()
        .map(|(target, relation, _)| (*target, relation.clone()))
        .collect()
}

/// Every node reachable from `note_id` purely through `header_child`
/// edges: the full nested header tree this note owns.
fn header_subtree(graph: &crate::index::AdjacencyGraph, note_id: u64) -> Vec<u64> {
    let mut out = Vec::new();
    let mut frontier = vec![note_id];
    let mut seen = std::collections::HashSet::new();
    seen.insert(note_id);
    while let Some(curr) = frontier.pop() {
        for (target, relation) in graph_outgoing(graph, curr) {
            if relation != REL_HEADER_CHILD || !seen.insert(target) {
                continue;
            }
            out.push(target);
            frontier.push(target);
        }
    }
    out
}

/// Node ids with an edge pointing at `node_id` (1-hop backlinks).
pub async fn backlinks(repo: &Repository, node_id: u64) -> Vec<u64> {
    let index = repo.hyper_index.read().await;
    index
        .graph_index
        .incoming_edges(node_id)
        .into_iter()
        .map(|(source, _)| source)
        .collect()
}

/// Notes tagged with `tag` (1-hop backlinks of the tag node).
pub async fn notes_with_tag(repo: &Repository, tag: &str) -> Vec<u64> {
    backlinks(repo, tag_id(tag)).await
}

/// BFS up to `max_hops`, optionally filtered to a single edge relation.
/// `AdjacencyGraph::expand` has no relation filter, so a filtered walk
/// is reimplemented here directly against `neighbors`.
pub async fn traverse(
    repo: &Repository,
    start: u64,
    max_hops: u8,
    relation: Option<&str>,
) -> Vec<(u64, u8)> {
    let index = repo.hyper_index.read().await;
    match relation {
        None => index.graph_index.expand(start, max_hops),
        Some(relation) => bfs_filtered(&index.graph_index, start, max_hops, relation),
    }
}

fn bfs_filtered(
    graph: &crate::index::AdjacencyGraph,
    start: u64,
    max_hops: u8,
    relation: &str,
) -> Vec<(u64, u8)> {
    if max_hops == 0 {
        return Vec::new();
    }
    let mut visited = std::collections::HashSet::new();
    visited.insert(start);
    let mut queue = std::collections::VecDeque::new();
    queue.push_back((start, 0u8));
    let mut result = Vec::new();
    while let Some((curr, dist)) = queue.pop_front() {
        if dist >= max_hops {
            continue;
        }
        for (target, rel, _) in graph.neighbors(curr) {
            if rel == relation && visited.insert(*target) {
                result.push((*target, dist + 1));
                queue.push_back((*target, dist + 1));
            }
        }
    }
    result
}

/// Note/tag/header graph ranked by `storage::community::pagerank`, the
/// same power-iteration PageRank `CommunityEngine` uses over the entity
/// graph.
pub async fn pagerank(repo: &Repository, iterations: usize, damping: f64) -> HashMap<u64, f64> {
    let graph = repo.graph_index().await;
    crate::community::pagerank(&graph, iterations, damping)
}

struct HeaderMatch {
    level: u8,
    title: String,
}

struct WikiLinkMatch {
    target: String,
}

fn header_level(line: &str) -> Option<(u8, &str)> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|&c| c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &trimmed[hashes..];
    if !rest.starts_with(' ') {
        return None;
    }
    Some((hashes as u8, rest.trim()))
}

fn extract_headers(content: &str) -> Vec<HeaderMatch> {
    content
        .lines()
        .filter_map(|line| {
            let (level, title) = header_level(line)?;
            if title.is_empty() {
                return None;
            }
            Some(HeaderMatch {
                level,
                title: title.to_string(),
            })
        })
        .collect()
}

/// `[[Target]]` and `[[Target|Display]]`; the anchor after a `#` (a
/// link into a specific header) is stripped since notes are linked at
/// note granularity, not header granularity.
fn extract_wikilinks(content: &str) -> Vec<WikiLinkMatch> {
    let mut out = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find("[[") {
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("]]") else {
            break;
        };
        let inner = &after_open[..end];
        if !inner.is_empty() && !inner.contains("[[") {
            let target_part = inner.split('|').next().unwrap_or(inner).trim();
            let target = target_part.split('#').next().unwrap_or(target_part).trim();
            if !target.is_empty() {
                out.push(WikiLinkMatch {
                    target: target.to_string(),
                });
            }
        }
        rest = &after_open[end + 2..];
    }
    out
}

fn is_tag_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_tag_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-' || c == '/'
}

/// `#tag` anywhere in the body, skipping header lines so `## Overview`
/// doesn't register `Overview` as a tag.
fn extract_tags(content: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut tags = Vec::new();
    for line in content.lines() {
        if header_level(line).is_some() {
            continue;
        }
        let chars: Vec<char> = line.chars().collect();
        let mut idx = 0;
        while idx < chars.len() {
            if chars[idx] == '#' {
                let prev_is_word =
                    idx > 0 && (chars[idx - 1].is_alphanumeric() || chars[idx - 1] == '_');
                if !prev_is_word && idx + 1 < chars.len() && is_tag_start(chars[idx + 1]) {
                    let mut end = idx + 1;
                    while end < chars.len() && is_tag_char(chars[end]) {
                        end += 1;
                    }
                    let tag: String = chars[idx + 1..end].iter().collect();
                    if seen.insert(tag.clone()) {
                        tags.push(tag);
                    }
                    idx = end;
                    continue;
                }
            }
            idx += 1;
        }
    }
    tags
}

fn title_from_path(path: &str) -> String {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    file_name.strip_suffix(".md").unwrap_or(file_name).to_string()
}

/// A bare wikilink target (no `/`) resolves to a note alongside the
/// linking note rather than the vault root; a target already written
/// as a relative path is used as-is.
fn resolve_link_path(from_path: &str, target: &str) -> String {
    let with_ext = if target.ends_with(".md") {
        target.to_string()
    } else {
        format!("{target}.md")
    };
    if with_ext.contains('/') {
        return with_ext;
    }
    match from_path.rsplit_once('/') {
        Some((dir, _)) => format!("{dir}/{with_ext}"),
        None => with_ext,
    }
}
