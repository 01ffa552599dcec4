//! Prompt categorisation with bounded label cardinality
//!
//! Prompts are mapped to a `prompt_category` metrics label. The label space is
//! the fixed pattern categories, `empty`, at most [`MAX_DYNAMIC_CATEGORIES`]
//! first-word categories, and 256 hash-derived `other_xx` overflow buckets.

use parking_lot::RwLock;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Cap on first-word categories created at runtime
pub const MAX_DYNAMIC_CATEGORIES: usize = 50;

/// Label used for requests without a prompt
pub const EMPTY_CATEGORY: &str = "empty";

const PATTERNS: [(&str, &str); 10] = [
    ("summar", "summarize"),
    ("translat", "translate"),
    ("explain", "explain"),
    ("write.*code", "code_write"),
    ("debug|fix", "code_debug"),
    ("question|what|how|why|when", "question"),
    ("creat|generat", "creative"),
    ("analy", "analyze"),
    ("help", "help"),
    ("list|enumerate", "list"),
];

/// Maps free-text prompts to a bounded set of labels
///
/// Shared across all requests. The dynamic set only grows, and never past
/// [`MAX_DYNAMIC_CATEGORIES`].
pub struct PromptCategorizer {
    patterns: Vec<(Regex, &'static str)>,
    dynamic: RwLock<HashSet<String>>,
}

impl PromptCategorizer {
    pub fn new() -> Self {
        let patterns = PATTERNS
            .iter()
            .filter_map(|(pattern, label)| match Regex::new(pattern) {
                Ok(re) => Some((re, *label)),
                Err(e) => {
                    tracing::error!(pattern = %pattern, error = %e, "Invalid category pattern skipped");
                    None
                }
            })
            .collect();

        Self {
            patterns,
            dynamic: RwLock::new(HashSet::new()),
        }
    }

    /// Categorize a prompt
    ///
    /// Deterministic for identical input within one process.
    pub fn categorize(&self, prompt: &str) -> String {
        let lower = prompt.trim().to_lowercase();
        if lower.is_empty() {
            return EMPTY_CATEGORY.to_string();
        }

        if let Some((_, label)) = self.patterns.iter().find(|(re, _)| re.is_match(&lower)) {
            return (*label).to_string();
        }

        if let Some(first_word) = lower.split_whitespace().next() {
            if self.dynamic.read().contains(first_word) {
                return first_word.to_string();
            }

            let mut dynamic = self.dynamic.write();
            if dynamic.contains(first_word) || dynamic.len() < MAX_DYNAMIC_CATEGORIES {
                dynamic.insert(first_word.to_string());
                return first_word.to_string();
            }
        }

        overflow_bucket(&lower)
    }

    /// Number of first-word categories created so far
    pub fn dynamic_count(&self) -> usize {
        self.dynamic.read().len()
    }
}

impl Default for PromptCategorizer {
    fn default() -> Self {
        Self::new()
    }
}

fn overflow_bucket(lower: &str) -> String {
    let digest = Sha256::digest(lower.as_bytes());
    format!("other_{}", hex::encode(&digest[..1]))
}
