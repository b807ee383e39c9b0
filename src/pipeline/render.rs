//! Bounded plain-text rendering of a candidate message for the prompt.

use regex::Regex;
use serde::Serialize;

use crate::mail::{BodyFormat, CandidateMessage};

/// Character limits applied after markup stripping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderLimits {
    pub subject: usize,
    pub preview: usize,
    pub body: usize,
}

impl Default for RenderLimits {
    fn default() -> Self {
        Self {
            subject: 200,
            preview: 300,
            body: 2000,
        }
    }
}

/// What the model sees of one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedMessage {
    pub id: String,
    pub sender: String,
    pub subject: String,
    pub preview: String,
    pub body: String,
}

/// Strips markup and truncates message fields.
#[derive(Debug, Clone)]
pub struct MessageRenderer {
    limits: RenderLimits,
    hidden_blocks: Regex,
    comments: Regex,
    tags: Regex,
    numeric_entities: Regex,
}

impl MessageRenderer {
    pub fn new(limits: RenderLimits) -> Result<Self, regex::Error> {
        Ok(Self {
            limits,
            hidden_blocks: Regex::new(r"(?is)<(script|style|head)\b[^>]*>.*?</\s*(script|style|head)\s*>")?,
            comments: Regex::new(r"(?s)<!--.*?-->")?,
            tags: Regex::new(r"(?s)<[^>]*>")?,
            numeric_entities: Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);")?,
        })
    }

    pub fn render(&self, message: &CandidateMessage) -> RenderedMessage {
        let body = match message.body_format {
            BodyFormat::Html => self.strip_markup(&message.body),
            BodyFormat::Text => collapse_whitespace(&message.body),
        };

        RenderedMessage {
            id: message.id.clone(),
            sender: message.sender.trim().to_string(),
            subject: truncate_chars(&collapse_whitespace(&message.subject), self.limits.subject),
            preview: truncate_chars(&collapse_whitespace(&message.body_preview), self.limits.preview),
            body: truncate_chars(&body, self.limits.body),
        }
    }

    /// HTML to whitespace-normalized text.
    pub fn strip_markup(&self, html: &str) -> String {
        let text = self.hidden_blocks.replace_all(html, " ");
        let text = self.comments.replace_all(&text, " ");
        let text = self.tags.replace_all(&text, " ");
        let text = self.decode_entities(&text);
        collapse_whitespace(&text)
    }

    fn decode_entities(&self, text: &str) -> String {
        let text = self
            .numeric_entities
            .replace_all(text, |caps: &regex::Captures<'_>| {
                let raw = &caps[1];
                let code = match raw.strip_prefix('x') {
                    Some(hex) => u32::from_str_radix(hex, 16).ok(),
                    None => raw.parse::<u32>().ok(),
                };
                code.and_then(char::from_u32)
                    .map(String::from)
                    .unwrap_or_default()
            });

        // `&amp;` last so `&amp;lt;` stays literal text.
        text.replace("&nbsp;", " ")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&apos;", "'")
            .replace("&amp;", "&")
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First `max` characters of `text`.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
