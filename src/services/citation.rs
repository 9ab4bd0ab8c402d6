//! Map generated text back to the chunks it references.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

use crate::models::{Citation, RetrievalResult};

static SOURCE_TAGS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\s*S\d+(?:\s*,\s*S\d+)*\s*\]").expect("source tag regex is valid")
});

static SOURCE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"S(\d+)").expect("source number regex is valid"));

static TITLE_PAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[([^\]]+?),\s*page\s*(\d+)\]").expect("title page regex is valid")
});

/// Plain title mentions only count for this many of the best hits.
const MENTION_WINDOW: usize = 3;

#[derive(Debug, Clone)]
pub struct CitationExtractor {
    preview_chars: usize,
}

impl CitationExtractor {
    pub fn new(preview_chars: usize) -> Self {
        Self { preview_chars }
    }

    /// One citation per referenced chunk, in order of first reference.
    ///
    /// Recognises `[S1]` / `[S1, S3]` tags, `[Title, Page N]` references and
    /// plain mentions of a top hit's document title. Chunks that are never
    /// referenced are left out.
    pub fn extract(&self, text: &str, results: &[RetrievalResult]) -> Vec<Citation> {
        let mut refs: Vec<(usize, usize)> = Vec::new();

        for tag in SOURCE_TAGS.find_iter(text) {
            for number in SOURCE_NUMBER.captures_iter(tag.as_str()) {
                if let Ok(n) = number[1].parse::<usize>()
                    && (1..=results.len()).contains(&n)
                {
                    refs.push((tag.start(), n - 1));
                }
            }
        }

        for caps in TITLE_PAGE.captures_iter(text) {
            let (Some(whole), Some(title), Some(page)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            let title = title.as_str().trim().to_lowercase();
            let Ok(page) = page.as_str().parse::<u32>() else {
                continue;
            };
            if title.is_empty() {
                continue;
            }
            let hit = results.iter().position(|r| {
                r.chunk.metadata.page_number == Some(page)
                    && r.chunk.metadata.document_title.to_lowercase().contains(&title)
            });
            if let Some(index) = hit {
                refs.push((whole.start(), index));
            }
        }

        for (index, result) in results.iter().take(MENTION_WINDOW).enumerate() {
            let title = result.chunk.metadata.document_title.trim();
            if title.is_empty() {
                continue;
            }
            let Ok(pattern) = RegexBuilder::new(&regex::escape(title))
                .case_insensitive(true)
                .build()
            else {
                continue;
            };
            if let Some(m) = pattern.find(text) {
                refs.push((m.start(), index));
            }
        }

        refs.sort_unstable();

        let mut seen = HashSet::new();
        refs.into_iter()
            .filter_map(|(_, index)| {
                let result = &results[index];
                seen.insert(result.chunk_id.as_str())
                    .then(|| Citation::from_result(result, self.preview_chars))
            })
            .collect()
    }
}

impl Default for CitationExtractor {
    fn default() -> Self {
        Self::new(200)
    }
}
