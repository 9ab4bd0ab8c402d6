//! Text chunking with overlap for embedding.
//!
//! Windows are measured in characters. Each window ends at the best natural
//! break inside its last 20%, and the next window starts `overlap` characters
//! before that end. Form feeds mark page boundaries; heading-like lines give
//! each window a section title.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::IngestionConfig;
use crate::utils::has_meaningful_content;

const PAGE_BREAK: char = '\x0c';

static NUMBERED_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+(\.\d+)*\.?\s+[A-Za-z][^.!?]{1,70}$").expect("valid heading regex")
});
static MARKDOWN_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,6}\s+(.+?)\s*#*$").expect("valid heading regex"));
static LABEL_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z][a-z]*( [A-Z][A-Za-z]*){0,5}:$").expect("valid heading regex")
});

/// A window of document text with its locators.
#[derive(Debug, Clone, PartialEq)]
pub struct TextWindow {
    pub text: String,
    /// Character offset of the window start in the source text.
    pub start: usize,
    /// Character offset one past the window end.
    pub end: usize,
    pub page_number: Option<u32>,
    pub section_title: Option<String>,
}

/// Text chunker that splits documents into overlapping windows.
#[derive(Debug, Clone)]
pub struct TextChunker {
    /// Target window size in characters
    chunk_size: usize,
    /// Characters shared by consecutive windows
    overlap: usize,
}

impl TextChunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            overlap: overlap.min(chunk_size - 1),
        }
    }

    pub fn from_config(config: &IngestionConfig) -> Self {
        Self::new(config.chunk_size, config.chunk_overlap)
    }

    /// Create a chunker with default settings.
    pub fn with_defaults() -> Self {
        Self::from_config(&IngestionConfig::default())
    }

    /// Split text into windows, dropping windows without meaningful content
    /// unless the whole document fits in one window.
    pub fn split(&self, content: &str) -> Vec<TextWindow> {
        let chars: Vec<char> = content.chars().collect();
        if chars.iter().all(|c| c.is_whitespace()) {
            return Vec::new();
        }

        let locators = Locators::scan(&chars);
        let spans = self.spans(&chars);
        let single = spans.len() == 1;

        spans
            .into_iter()
            .filter_map(|(start, end)| {
                let text = clean(&chars[start..end]);
                if text.is_empty() || (!single && !has_meaningful_content(&text)) {
                    return None;
                }
                Some(TextWindow {
                    text,
                    start,
                    end,
                    page_number: locators.page_at(start),
                    section_title: locators.section_for(start, end),
                })
            })
            .collect()
    }

    fn spans(&self, chars: &[char]) -> Vec<(usize, usize)> {
        let total = chars.len();
        let mut spans = Vec::new();
        let mut start = 0;

        while start < total {
            let target_end = (start + self.chunk_size).min(total);
            let end = self.find_break_point(chars, start, target_end, total);
            spans.push((start, end));

            if end >= total {
                break;
            }
            start = end.saturating_sub(self.overlap).max(start + 1);
        }

        spans
    }

    /// Find a natural break point near the target end position.
    fn find_break_point(
        &self,
        chars: &[char],
        start: usize,
        target_end: usize,
        total: usize,
    ) -> usize {
        if target_end >= total {
            return total;
        }

        // Look for a natural break point within the last 20% of the window
        let search_start = target_end
            .saturating_sub(self.chunk_size / 5)
            .max(start + 1);
        if search_start >= target_end {
            return target_end;
        }
        let search_range = &chars[search_start..target_end];

        // Priority: paragraph > newline > sentence end > whitespace
        let mut paragraph = None;
        let mut newline = None;
        let mut sentence = None;
        let mut space = None;

        for (i, c) in search_range.iter().copied().enumerate() {
            let pos = search_start + i;
            match c {
                PAGE_BREAK => paragraph = Some(pos + 1),
                '\n' => {
                    if pos > 0 && chars[pos - 1] == '\n' {
                        paragraph = Some(pos + 1);
                    }
                    newline = Some(pos + 1);
                }
                '.' | '!' | '?' => {
                    if chars.get(pos + 1).is_some_and(|c| c.is_whitespace()) {
                        sentence = Some(pos + 1);
                    }
                }
                ' ' | '\t' => space = Some(pos + 1),
                _ => {}
            }
        }

        paragraph
            .or(newline)
            .or(sentence)
            .or(space)
            .unwrap_or(target_end)
    }
}

/// Page and section positions of one document.
struct Locators {
    page_breaks: Vec<usize>,
    headings: Vec<(usize, String)>,
}

impl Locators {
    fn scan(chars: &[char]) -> Self {
        let page_breaks = chars
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == PAGE_BREAK)
            .map(|(i, _)| i)
            .collect();

        let mut headings = Vec::new();
        let mut line_start = 0;
        for (i, c) in chars.iter().enumerate() {
            if *c == '\n' || *c == PAGE_BREAK {
                push_heading(&mut headings, chars, line_start, i);
                line_start = i + 1;
            }
        }
        push_heading(&mut headings, chars, line_start, chars.len());

        Self {
            page_breaks,
            headings,
        }
    }

    /// 1-based page of an offset, only for text that has page breaks.
    fn page_at(&self, offset: usize) -> Option<u32> {
        if self.page_breaks.is_empty() {
            return None;
        }
        let before = self.page_breaks.partition_point(|&b| b < offset);
        Some(before as u32 + 1)
    }

    /// Nearest heading at or before `start`, else the first one inside the window.
    fn section_for(&self, start: usize, end: usize) -> Option<String> {
        let idx = self.headings.partition_point(|(pos, _)| *pos <= start);
        if idx > 0 {
            return Some(self.headings[idx - 1].1.clone());
        }
        self.headings
            .first()
            .filter(|(pos, _)| *pos < end)
            .map(|(_, title)| title.clone())
    }
}

fn push_heading(headings: &mut Vec<(usize, String)>, chars: &[char], from: usize, to: usize) {
    if from >= to {
        return;
    }
    let line: String = chars[from..to].iter().collect();
    if let Some(title) = heading_title(line.trim()) {
        headings.push((from, title));
    }
}

/// Returns the heading text if the line looks like a section heading.
pub fn heading_title(line: &str) -> Option<String> {
    if line.is_empty() || line.chars().count() > 80 {
        return None;
    }
    if let Some(caps) = MARKDOWN_HEADING.captures(line) {
        return caps.get(1).map(|m| m.as_str().to_string());
    }
    if NUMBERED_HEADING.is_match(line) || LABEL_HEADING.is_match(line) {
        return Some(line.trim_end_matches(':').to_string());
    }
    let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() >= 3 && letters.iter().all(|c| c.is_uppercase()) && !line.ends_with('.') {
        return Some(line.to_string());
    }
    None
}

fn clean(chars: &[char]) -> String {
    chars
        .iter()
        .map(|c| if *c == PAGE_BREAK { '\n' } else { *c })
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentence_text(sentences: usize) -> String {
        (0..sentences)
            .map(|i| format!("Sentence number {} explains one step of the setup.", i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_small_document_single_window() {
        let chunker = TextChunker::with_defaults();
        let windows = chunker.split("Hello, world!");

        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].text, "Hello, world!");
        assert_eq!(windows[0].start, 0);
        assert_eq!(windows[0].page_number, None);
    }

    #[test]
    fn test_empty_document() {
        let chunker = TextChunker::with_defaults();
        assert!(chunker.split("").is_empty());
        assert!(chunker.split(" \n\t ").is_empty());
    }

    #[test]
    fn test_windows_overlap_and_advance() {
        let chunker = TextChunker::new(200, 40);
        let content = sentence_text(40);
        let windows = chunker.split(&content);

        assert!(windows.len() > 1);
        for pair in windows.windows(2) {
            assert!(pair[1].start > pair[0].start);
            assert_eq!(pair[1].start, pair[0].end - 40);
        }
        assert_eq!(windows.last().unwrap().end, content.chars().count());
    }

    #[test]
    fn test_window_size_is_bounded() {
        let chunker = TextChunker::new(100, 20);
        let content = "x".repeat(1000);
        for window in chunker.split(&content) {
            assert!(window.end - window.start <= 100);
        }
    }

    #[test]
    fn test_large_overlap_still_advances() {
        let chunker = TextChunker::new(30, 100);
        let windows = chunker.split(&"abcdefghij".repeat(10));
        assert!(windows.len() > 1);
        for pair in windows.windows(2) {
            assert!(pair[1].start > pair[0].start);
        }
    }

    #[test]
    fn test_prefers_paragraph_break() {
        let chunker = TextChunker::new(100, 0);
        let first = "a".repeat(85);
        let content = format!("{first}\n\nSecond paragraph. It continues here with words");
        let windows = chunker.split(&content);

        assert_eq!(windows[0].end, 87);
        assert_eq!(windows[0].text, first);
    }

    #[test]
    fn test_page_break_outranks_later_newline() {
        let chunker = TextChunker::new(100, 0);
        let content = format!("{}\x0c{}\n{}", "a".repeat(85), "b".repeat(5), "c".repeat(50));
        let windows = chunker.split(&content);

        assert_eq!(windows[0].end, 86);
        assert_eq!(windows[0].text, "a".repeat(85));
        assert_eq!(windows[1].page_number, Some(2));
    }

    #[test]
    fn test_falls_back_to_sentence_end() {
        let chunker = TextChunker::new(100, 0);
        let content = format!("{}. {}", "b".repeat(90), "c".repeat(50));
        let windows = chunker.split(&content);
        assert_eq!(windows[0].end, 91);
    }

    #[test]
    fn test_page_numbers_from_form_feeds() {
        let chunker = TextChunker::new(60, 0);
        let page = "Every page has enough words to stand alone here.";
        let content = format!("{page}\x0c{page}\x0c{page}");
        let windows = chunker.split(&content);

        let pages: Vec<_> = windows.iter().map(|w| w.page_number).collect();
        assert_eq!(pages, vec![Some(1), Some(2), Some(3)]);
        assert!(windows.iter().all(|w| !w.text.contains('\x0c')));
    }

    #[test]
    fn test_section_titles() {
        let chunker = TextChunker::new(80, 0);
        let content = "INSTALLATION\nUnpack the device and connect the power cable.\n\n\
                       2. Configuration\nOpen the admin page and set a new password.";
        let windows = chunker.split(content);

        assert_eq!(windows[0].section_title.as_deref(), Some("INSTALLATION"));
        assert_eq!(
            windows.last().unwrap().section_title.as_deref(),
            Some("2. Configuration")
        );
    }

    #[test]
    fn test_heading_detection() {
        assert_eq!(heading_title("## Safety Notes"), Some("Safety Notes".into()));
        assert_eq!(heading_title("Troubleshooting:"), Some("Troubleshooting".into()));
        assert_eq!(heading_title("3.1 Wiring the relay"), Some("3.1 Wiring the relay".into()));
        assert_eq!(heading_title("WARNING"), Some("WARNING".into()));
        assert_eq!(heading_title("This is a normal sentence."), None);
        assert_eq!(heading_title("3 screws hold the cover in place."), None);
    }

    #[test]
    fn test_drops_windows_without_content() {
        let chunker = TextChunker::new(40, 0);
        let content = format!(
            "{}\n\n{}\n\n{}",
            "Meaningful words live in this paragraph.",
            "- - - - - - - - - - - - - - - - - -",
            "Another paragraph with real words inside."
        );
        let windows = chunker.split(&content);
        assert!(windows.iter().all(|w| has_meaningful_content(&w.text)));
    }
}
