use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::document::JsonDocument;
use crate::error::Result;

pub const DEFAULT_SUGGESTIONS: usize = 10;

/// Labels typed so far with how often each was used, for autocompletion.
pub struct LabelDictionary {
    doc: JsonDocument<BTreeMap<String, u64>>,
    max_suggestions: usize,
}

impl LabelDictionary {
    /// A corrupt dictionary file is not fatal; counting starts over.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            doc: JsonDocument::open_lenient(path)?,
            max_suggestions: DEFAULT_SUGGESTIONS,
        })
    }

    pub fn with_max_suggestions(mut self, max: usize) -> Self {
        self.max_suggestions = max;
        self
    }

    pub fn add(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        self.doc.update(|counts| {
            *counts.entry(text.to_string()).or_default() += 1;
        })
    }

    pub fn count(&self, text: &str) -> u64 {
        self.doc.read(|counts| counts.get(text).copied().unwrap_or(0))
    }

    /// Every label, most used first, ties alphabetical.
    pub fn all(&self) -> Vec<(String, u64)> {
        let mut entries: Vec<_> = self.doc.read(|counts| {
            counts.iter().map(|(label, count)| (label.clone(), *count)).collect()
        });
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }

    /// Labels starting with `prefix` (case-insensitive) in the order of
    /// [`LabelDictionary::all`]. `limit` defaults to the configured maximum.
    pub fn suggestions(&self, prefix: &str, limit: Option<usize>) -> Vec<String> {
        let limit = limit.unwrap_or(self.max_suggestions);
        let prefix = prefix.to_lowercase();
        self.all()
            .into_iter()
            .map(|(label, _)| label)
            .filter(|label| label.to_lowercase().starts_with(&prefix))
            .take(limit)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn suggestions_are_ranked_by_use() {
        let dir = tempfile::tempdir().unwrap();
        let dictionary = LabelDictionary::open(dir.path().join("dict.json")).unwrap();
        for label in ["cat", "car", " car ", "dog", "Cart", "car", ""] {
            dictionary.add(label).unwrap();
        }

        assert_eq!(dictionary.count("car"), 3);
        assert_eq!(dictionary.suggestions("", None), ["car", "Cart", "cat", "dog"]);
        assert_eq!(dictionary.suggestions("CA", Some(2)), ["car", "Cart"]);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dict.json");
        fs::write(&path, "{broken").unwrap();

        let dictionary = LabelDictionary::open(&path).unwrap().with_max_suggestions(1);
        assert!(dictionary.all().is_empty());
        dictionary.add("owl").unwrap();
        dictionary.add("bat").unwrap();
        assert_eq!(dictionary.suggestions("", None), ["bat"]);
    }
}
