//! Caches validation outcomes by content hash so an unchanged file isn't
//! re-scanned (archive inspection and PDF parsing are the expensive
//! checks) on every watcher debounce or startup re-index pass.
//!
//! Grounded in the same `DashMap`-backed concurrent-table idiom as
//! `IngestionPipeline::locks` and `ProgressTracker::entries`.

use crate::validation::ValidationOutcome;
use dashmap::DashMap;

#[derive(Debug, Clone)]
struct ScanCacheEntry {
    outcome: ValidationOutcome,
    scanner_version: String,
}

/// A cache entry is only considered valid if it was recorded under the
/// currently-running `scanner_version` — bumping the version (after
/// adding or changing a validation strategy) invalidates every prior
/// entry without having to touch the map.
pub struct SecurityScanCache {
    entries: DashMap<String, ScanCacheEntry>,
    scanner_version: String,
}

impl SecurityScanCache {
    pub fn new(scanner_version: impl Into<String>) -> Self {
        Self {
            entries: DashMap::new(),
            scanner_version: scanner_version.into(),
        }
    }

    pub fn get(&self, file_hash: &str) -> Option<ValidationOutcome> {
        let entry = self.entries.get(file_hash)?;
        if entry.scanner_version != self.scanner_version {
            return None;
        }
        Some(entry.outcome.clone())
    }

    pub fn record(&self, file_hash: impl Into<String>, outcome: ValidationOutcome) {
        self.entries.insert(
            file_hash.into(),
            ScanCacheEntry {
                outcome,
                scanner_version: self.scanner_version.clone(),
            },
        );
    }

    pub fn invalidate(&self, file_hash: &str) {
        self.entries.remove(file_hash);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::{Severity, ValidationResult};

    fn sample_outcome() -> ValidationOutcome {
        ValidationOutcome {
            results: vec![ValidationResult {
                is_valid: true,
                file_type: Some("text".to_string()),
                reason: None,
                validation_check: "file_existence".to_string(),
                severity: Severity::None,
                matches: Vec::new(),
            }],
        }
    }

    #[test]
    fn caches_and_returns_outcome() {
        let cache = SecurityScanCache::new("v1");
        cache.record("hash1", sample_outcome());
        assert!(cache.get("hash1").is_some());
    }

    #[test]
    fn version_bump_invalidates_existing_entries() {
        let cache = SecurityScanCache::new("v1");
        cache.record("hash1", sample_outcome());

        let newer = SecurityScanCache::new("v2");
        newer.entries.insert(
            "hash1".to_string(),
            ScanCacheEntry {
                outcome: sample_outcome(),
                scanner_version: "v1".to_string(),
            },
        );
        assert!(newer.get("hash1").is_none());
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = SecurityScanCache::new("v1");
        cache.record("hash1", sample_outcome());
        cache.invalidate("hash1");
        assert!(cache.get("hash1").is_none());
    }
}
