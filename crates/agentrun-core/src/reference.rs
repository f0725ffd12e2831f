// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bounded registry of references recovered from compressed tool results
//! (file paths, URLs, symbols), so a later tool call can resolve a pointer
//! that was truncated out of the model's view.
use std::sync::Mutex;

use lru::LruCache;
use tracing::warn;

/// A structured pointer recovered from a compressed tool result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub kind: ReferenceKind,
    pub value: String,
    /// Surrounding text that helps disambiguate the reference (e.g. the line
    /// the path appeared on).
    pub context: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    FilePath,
    Url,
    Symbol,
}

/// Process-wide, capacity-bounded LRU map of reference key → Reference.
/// Registration is best-effort: failures are logged and ignored, never
/// propagated, per the optimizer's degrade-silently contract.
pub struct ReferenceRegistry {
    inner: Mutex<LruCache<String, Reference>>,
}

impl ReferenceRegistry {
    pub fn new(capacity: usize) -> Self {
        let cap = std::num::NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Register a reference, keyed by its value (paths/URLs are unique enough
    /// to collide usefully — re-registering the same value refreshes recency).
    pub fn register(&self, reference: Reference) {
        match self.inner.lock() {
            Ok(mut cache) => {
                cache.put(reference.value.clone(), reference);
            }
            Err(_) => warn!("reference registry mutex poisoned; dropping registration"),
        }
    }

    pub fn resolve(&self, value: &str) -> Option<Reference> {
        match self.inner.lock() {
            Ok(mut cache) => cache.get(value).cloned(),
            Err(_) => {
                warn!("reference registry mutex poisoned; resolve failed");
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Extract `Reference`s from free text via regex: absolute/relative file
/// paths with a known extension, and http(s) URLs.
pub fn extract_references(text: &str) -> Vec<Reference> {
    use regex::Regex;
    use std::sync::OnceLock;

    static PATH_RE: OnceLock<Regex> = OnceLock::new();
    static URL_RE: OnceLock<Regex> = OnceLock::new();

    let path_re = PATH_RE.get_or_init(|| {
        Regex::new(r"(?:[./][\w./-]*|[\w-]+/[\w./-]*)\.(?:rs|py|js|ts|tsx|jsx|go|java|c|h|cpp|hpp|md|toml|yaml|yml|json)\b").unwrap()
    });
    let url_re = URL_RE.get_or_init(|| Regex::new(r"https?://[^\s)]+").unwrap());

    let mut refs = Vec::new();
    for m in path_re.find_iter(text) {
        refs.push(Reference {
            kind: ReferenceKind::FilePath,
            value: m.as_str().to_string(),
            context: line_containing(text, m.start()),
        });
    }
    for m in url_re.find_iter(text) {
        refs.push(Reference {
            kind: ReferenceKind::Url,
            value: m.as_str().trim_end_matches(['.', ',', ')']).to_string(),
            context: line_containing(text, m.start()),
        });
    }
    refs
}

fn line_containing(text: &str, byte_offset: usize) -> String {
    let start = text[..byte_offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let end = text[byte_offset..]
        .find('\n')
        .map(|i| byte_offset + i)
        .unwrap_or(text.len());
    text[start..end].trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ref(value: &str) -> Reference {
        Reference {
            kind: ReferenceKind::FilePath,
            value: value.to_string(),
            context: String::new(),
        }
    }

    #[test]
    fn register_and_resolve_roundtrip() {
        let reg = ReferenceRegistry::new(4);
        reg.register(sample_ref("src/main.rs"));
        assert_eq!(reg.resolve("src/main.rs").unwrap().value, "src/main.rs");
    }

    #[test]
    fn resolve_missing_returns_none() {
        let reg = ReferenceRegistry::new(4);
        assert!(reg.resolve("nope").is_none());
    }

    #[test]
    fn evicts_lru_when_over_capacity() {
        let reg = ReferenceRegistry::new(2);
        reg.register(sample_ref("a.rs"));
        reg.register(sample_ref("b.rs"));
        reg.register(sample_ref("c.rs")); // evicts a.rs (least recently used)
        assert!(reg.resolve("a.rs").is_none());
        assert!(reg.resolve("b.rs").is_some());
        assert!(reg.resolve("c.rs").is_some());
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn accessing_an_entry_refreshes_its_recency() {
        let reg = ReferenceRegistry::new(2);
        reg.register(sample_ref("a.rs"));
        reg.register(sample_ref("b.rs"));
        reg.resolve("a.rs"); // a.rs is now most-recently-used
        reg.register(sample_ref("c.rs")); // evicts b.rs, not a.rs
        assert!(reg.resolve("a.rs").is_some());
        assert!(reg.resolve("b.rs").is_none());
    }

    #[test]
    fn extracts_file_paths_from_text() {
        let refs = extract_references("see src/lib.rs for details");
        assert!(refs.iter().any(|r| r.value == "src/lib.rs" && r.kind == ReferenceKind::FilePath));
    }

    #[test]
    fn extracts_urls_from_text() {
        let refs = extract_references("docs at https://example.com/docs, see above");
        assert!(refs.iter().any(|r| r.value == "https://example.com/docs" && r.kind == ReferenceKind::Url));
    }

    #[test]
    fn empty_text_yields_no_references() {
        assert!(extract_references("nothing interesting here").is_empty());
    }
}
