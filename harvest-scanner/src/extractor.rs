//! Visible-text extraction.

use scraper::{ElementRef, Html, Node};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_SEPARATOR: &str = "#+#";

/// Elements whose text never reaches the reader.
const HIDDEN_ELEMENTS: &[&str] = &[
    "script", "style", "head", "title", "meta", "noscript", "template", "svg",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSummary {
    pub text: String,
    pub n_chars: usize,
    pub n_words: usize,
}

/// Reduces a document to its visible text chunks. Pure: no I/O.
#[derive(Debug, Clone)]
pub struct TextExtractor {
    separator: String,
    /// Chunks this short or shorter are dropped.
    min_chunk_chars: usize,
    /// Chunks of at least `boilerplate_min_chars` seen more often than this
    /// on one page are treated as navigation/footer boilerplate.
    max_repeats: usize,
    boilerplate_min_chars: usize,
}

impl Default for TextExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_SEPARATOR)
    }
}

impl TextExtractor {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
            min_chunk_chars: 2,
            max_repeats: 2,
            boilerplate_min_chars: 5,
        }
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    pub fn chunks(&self, document: &Html) -> Vec<String> {
        let mut raw = Vec::new();
        for node in document.tree.root().descendants() {
            let Node::Text(text) = node.value() else {
                continue;
            };
            if node.ancestors().any(|a| {
                ElementRef::wrap(a).is_some_and(|e| HIDDEN_ELEMENTS.contains(&e.value().name()))
            }) {
                continue;
            }
            let trimmed = text.trim();
            if trimmed.chars().count() > self.min_chunk_chars {
                raw.push(trimmed.to_string());
            }
        }
        self.drop_boilerplate(raw)
    }

    fn drop_boilerplate(&self, segments: Vec<String>) -> Vec<String> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for seg in &segments {
            *counts.entry(seg.as_str()).or_insert(0) += 1;
        }

        let keep: Vec<bool> = segments
            .iter()
            .map(|seg| {
                seg.chars().count() < self.boilerplate_min_chars
                    || counts[seg.as_str()] <= self.max_repeats
            })
            .collect();

        let mut out: Vec<String> = Vec::with_capacity(segments.len());
        for (seg, keep) in segments.into_iter().zip(keep) {
            if keep && out.last() != Some(&seg) {
                out.push(seg);
            }
        }
        out
    }

    /// Join chunks and count characters and words over the joined text.
    pub fn summarize<'a, I>(&self, chunks: I) -> TextSummary
    where
        I: IntoIterator<Item = &'a str>,
    {
        let text = chunks
            .into_iter()
            .collect::<Vec<_>>()
            .join(self.separator.as_str());
        let n_chars = text.chars().count();
        let n_words = text.split_whitespace().count();
        TextSummary {
            text,
            n_chars,
            n_words,
        }
    }

    pub fn extract(&self, document: &Html) -> TextSummary {
        let chunks = self.chunks(document);
        self.summarize(chunks.iter().map(String::as_str))
    }
}
