//! Line predicates for product references.
//!
//! Everything here is purely syntactic and cheap enough to re-run on every fragment.

use crate::constants::{REFERENCE_CLOSE, REFERENCE_OPEN};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // Optional ordinal ("1. ", "1.", "1 ") then `[[id]]`.
    static ref REFERENCE_LINE: Regex =
        Regex::new(r"^(?:\d+(?:\.\s?|\s))?\[\[(.*?)\]\]").expect("Invalid reference-line regex");
    static ref IMAGE_LINE: Regex = Regex::new(r"^ *!\[").expect("Invalid image-line regex");
    static ref ANY_TITLE_DESCRIPTION: Regex =
        Regex::new(r"\*\*[^*]+\*\*\s*-\s*(.*)$").expect("Invalid description regex");
}

/// Returns the id named by a reference line, or `None` for anything else.
pub fn match_reference(line: &str) -> Option<&str> {
    REFERENCE_LINE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

pub fn is_reference_line(line: &str) -> bool {
    REFERENCE_LINE.is_match(line)
}

/// Markdown image line (`![`), optionally indented with spaces.
pub fn is_image_line(line: &str) -> bool {
    IMAGE_LINE.is_match(line)
}

/// Text after `**<title>** - ` on a reference line.
///
/// Falls back to any bolded title when `title` is unknown or the model reworded it.
pub fn extract_description(line: &str, title: Option<&str>) -> Option<String> {
    let by_title = title.filter(|t| !t.is_empty()).and_then(|t| {
        let pattern = format!(r"\*\*{}\*\*\s*-\s*(.*)$", regex::escape(t));
        match Regex::new(&pattern) {
            Ok(re) => re
                .captures(line)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string()),
            Err(e) => {
                tracing::debug!("[DETECTOR] Title pattern rejected: {}", e);
                None
            }
        }
    });

    let captured = match by_title {
        Some(d) => Some(d),
        None => ANY_TITLE_DESCRIPTION
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string()),
    }?;

    let trimmed = captured.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Cuts a still-growing line before a `[[` that has not closed yet.
///
/// A single `[` is ordinary text and stays visible.
pub fn mask_dangling_marker(line: &str) -> &str {
    match line.rfind(REFERENCE_OPEN) {
        Some(open) if !line[open..].contains(REFERENCE_CLOSE) => &line[..open],
        _ => line,
    }
}
