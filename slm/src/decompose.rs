/// Connective words/phrases that mark a query as compound. Checked against
/// whitespace-delimited, punctuation-trimmed, lowercased tokens so "EVs vs.
/// hybrids" and "Toyota and Honda" both split cleanly.
const CONNECTIVES: [&str; 5] = ["and", "or", "vs", "versus", "compare"];

/// Minimum length (in chars, after trimming) for a split fragment to count
/// as its own sub-query; shorter fragments are folded back into the whole.
const MIN_SUB_QUERY_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct DecompositionResult {
    pub applied: bool,
    pub sub_queries: Vec<String>,
}

/// Splits a compound query ("Toyota vs Honda EV strategy", "What is RAG? How
/// does it differ from fine-tuning?") into independently searchable
/// sub-queries. Returns `applied: false` with an empty `sub_queries` list
/// when the query doesn't look compound, so callers can always report
/// `decomposition: {applied, sub_queries}` without a separate branch.
pub fn decompose_query(query: &str) -> DecompositionResult {
    let mut parts = split_on_connectives(query);

    if parts.len() < 2 && query.matches('?').count() >= 2 {
        parts = split_on_questions(query);
    }

    let sub_queries: Vec<String> = parts
        .into_iter()
        .map(|part| part.trim().to_string())
        .filter(|part| part.chars().count() > MIN_SUB_QUERY_LEN)
        .collect();

    if sub_queries.len() >= 2 {
        DecompositionResult {
            applied: true,
            sub_queries,
        }
    } else {
        DecompositionResult {
            applied: false,
            sub_queries: Vec::new(),
        }
    }
}

fn split_on_connectives(query: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for word in query.split_whitespace() {
        let normalized: String = word
            .trim_matches(|ch: char| !ch.is_alphanumeric())
            .to_lowercase();

        if CONNECTIVES.contains(&normalized.as_str()) {
            if !current.is_empty() {
                parts.push(current.join(" "));
                current.clear();
            }
        } else {
            current.push(word);
        }
    }

    if !current.is_empty() {
        parts.push(current.join(" "));
    }

    parts
}

fn split_on_questions(query: &str) -> Vec<String> {
    query
        .split('?')
        .map(|fragment| fragment.trim())
        .filter(|fragment| !fragment.is_empty())
        .map(|fragment| format!("{fragment}?"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decomposes_and_conjunction() {
        let result = decompose_query("Toyota EV strategy and Honda EV strategy");
        assert!(result.applied);
        assert_eq!(result.sub_queries.len(), 2);
    }

    #[test]
    fn decomposes_versus_comparison() {
        let result = decompose_query("Toyota vs Honda battery partnerships");
        assert!(result.applied);
        assert_eq!(result.sub_queries, vec!["Toyota", "Honda battery partnerships"]);
    }

    #[test]
    fn decomposes_multi_question_query() {
        let result = decompose_query("What is RAG? How does it differ from fine-tuning?");
        assert!(result.applied);
        assert_eq!(result.sub_queries.len(), 2);
    }

    #[test]
    fn leaves_simple_queries_untouched() {
        let result = decompose_query("Toyota battery strategy");
        assert!(!result.applied);
        assert!(result.sub_queries.is_empty());
    }

    #[test]
    fn ignores_short_fragments_after_split() {
        // "a" and "or" around a one-letter token shouldn't register as a
        // second sub-query once trimmed.
        let result = decompose_query("battery and a");
        assert!(!result.applied);
        assert!(result.sub_queries.is_empty());
    }
}
