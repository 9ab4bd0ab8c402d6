//! Versioned prompt templates.
//!
//! Templates are static data; [`PromptTemplate::render`] is a pure function of
//! its inputs, so the same question over the same chunks always produces the
//! same messages.

use std::fmt::Write;

use crate::models::{Message, RetrievalResult, Role};

/// Inserted in place of the context block when retrieval found nothing.
pub const NO_CONTEXT_MARKER: &str = "NO_CONTEXT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptTemplate {
    pub version: &'static str,
    /// Contains `{language_name}` and `{context}` placeholders.
    system: &'static str,
    no_context: &'static str,
}

const TEMPLATES: &[PromptTemplate] = &[
    PromptTemplate {
        version: "v1.0",
        system: "You are a documentation assistant. Answer the user's question using only the \
context passages below.

Rules:
- Cite every statement with the tag of the passage it comes from, for example [S1] or [S1, S3].
- You may also cite a passage as [Document Title, Page N].
- If the passages do not contain the answer, say so plainly. Do not invent information.
- Respond in {language_name}.

Context:
{context}",
        no_context: "NO_CONTEXT: no relevant passages were found in the knowledge base. \
Tell the user the documentation does not cover this and suggest rephrasing the question.",
    },
    PromptTemplate {
        version: "v1.1",
        system: "You answer questions about technical documentation.

Use only the numbered passages in the context. Start with a direct answer, then give the \
supporting detail as short steps or bullet points when that helps. Put the passage tag, such \
as [S2], right after each statement it supports. When passages disagree, mention both and \
cite each. Never cite a passage you did not use.

If the context is insufficient, answer that you could not find it in the documentation.

Write the answer in {language_name}.

Context:
{context}",
        no_context: "NO_CONTEXT: the search returned no passages for this question. \
Say that the documentation does not cover it. Do not answer from general knowledge.",
    },
];

/// Versions known to this build, oldest first.
pub fn versions() -> impl Iterator<Item = &'static str> {
    TEMPLATES.iter().map(|t| t.version)
}

pub fn language_name(code: &str) -> &'static str {
    match code {
        "de" => "German",
        "fr" => "French",
        "es" => "Spanish",
        _ => "English",
    }
}

impl PromptTemplate {
    pub fn get(version: &str) -> Option<&'static PromptTemplate> {
        TEMPLATES.iter().find(|t| t.version == version)
    }

    /// System prompt, trimmed history and the question, in that order.
    pub fn render(
        &self,
        query: &str,
        chunks: &[RetrievalResult],
        history: &[Message],
        max_history_turns: usize,
        language: &str,
    ) -> Vec<Message> {
        let context = if chunks.is_empty() {
            self.no_context.to_string()
        } else {
            context_block(chunks)
        };

        // Context goes in last so chunk text is never scanned for placeholders
        let system = self
            .system
            .replace("{language_name}", language_name(language))
            .replace("{context}", &context);

        let turns: Vec<&Message> = history.iter().filter(|m| m.role != Role::System).collect();
        let skip = turns.len().saturating_sub(max_history_turns);

        let mut messages = Vec::with_capacity(turns.len() - skip + 2);
        messages.push(Message::system(system));
        messages.extend(turns.into_iter().skip(skip).cloned());
        messages.push(Message::user(query));
        messages
    }
}

fn context_block(chunks: &[RetrievalResult]) -> String {
    let mut out = String::new();
    for (i, result) in chunks.iter().enumerate() {
        let meta = &result.chunk.metadata;
        if i > 0 {
            out.push_str("\n\n");
        }
        let _ = write!(out, "[S{}] Document: {}", i + 1, meta.document_title);
        if let Some(page) = meta.page_number {
            let _ = write!(out, " | Page: {}", page);
        }
        if let Some(section) = &meta.section_title {
            let _ = write!(out, " | Section: {}", section);
        }
        out.push('\n');
        out.push_str(result.chunk.text.trim());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, ChunkMetadata};
    use std::sync::Arc;

    fn result(ordinal: u32, text: &str, page: Option<u32>, section: Option<&str>) -> RetrievalResult {
        let chunk = Chunk::new(
            "manual",
            ordinal,
            text.into(),
            ChunkMetadata {
                document_title: "Router Manual".into(),
                page_number: page,
                section_title: section.map(String::from),
                language: "en".into(),
                ..Default::default()
            },
        );
        RetrievalResult::new(Arc::new(chunk), 0.9)
    }

    #[test]
    fn test_known_versions() {
        assert_eq!(versions().collect::<Vec<_>>(), vec!["v1.0", "v1.1"]);
        assert!(PromptTemplate::get("v9").is_none());
    }

    #[test]
    fn test_render_tags_chunks_with_locators() {
        let template = PromptTemplate::get("v1.0").unwrap();
        let chunks = vec![
            result(0, "Hold reset for 10 seconds.", Some(4), Some("Troubleshooting")),
            result(1, "Plug the cable into port 1.", None, None),
        ];
        let messages = template.render("How do I reset?", &chunks, &[], 6, "en");

        assert_eq!(messages.len(), 2);
        let system = &messages[0].content;
        assert!(system.contains(
            "[S1] Document: Router Manual | Page: 4 | Section: Troubleshooting\nHold reset for 10 seconds."
        ));
        assert!(system.contains("[S2] Document: Router Manual\nPlug the cable"));
        assert!(system.contains("Respond in English."));
        assert!(!system.contains(NO_CONTEXT_MARKER));
        assert_eq!(messages[1], Message::user("How do I reset?"));
    }

    #[test]
    fn test_render_without_chunks_uses_marker() {
        let template = PromptTemplate::get("v1.1").unwrap();
        let messages = template.render("Anything?", &[], &[], 6, "de");
        assert!(messages[0].content.contains(NO_CONTEXT_MARKER));
        assert!(messages[0].content.contains("in German."));
    }

    #[test]
    fn test_history_is_trimmed_to_recent_turns() {
        let template = PromptTemplate::get("v1.0").unwrap();
        let history: Vec<Message> = (0..10)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("q{i}"))
                } else {
                    Message::assistant(format!("a{i}"))
                }
            })
            .chain(std::iter::once(Message::system("ignored")))
            .collect();

        let messages = template.render("next", &[], &history, 4, "en");
        let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(&contents[1..], &["q6", "a7", "q8", "a9", "next"]);
    }

    #[test]
    fn test_render_is_deterministic() {
        let template = PromptTemplate::get("v1.0").unwrap();
        let chunks = vec![result(0, "Text with {context} inside.", Some(1), None)];
        let history = vec![Message::user("hi"), Message::assistant("hello")];

        let a = template.render("q", &chunks, &history, 6, "fr");
        let b = template.render("q", &chunks, &history, 6, "fr");
        assert_eq!(a, b);
        assert!(a[0].content.contains("Text with {context} inside."));
    }

    #[test]
    fn test_unknown_language_names_english() {
        assert_eq!(language_name("it"), "English");
        assert_eq!(language_name("es"), "Spanish");
    }
}
