//! Authoritative end-of-turn pass over the complete reply text.
//!
//! Pure functions of the final text and products; the reconciler's cursor is not consulted.

use crate::detector;
use crate::line_buffer::lines_of;
use crate::types::{ChatTranscriptEntry, ProductRecord};
use std::collections::HashSet;

/// Final prose entry for a closed turn.
///
/// When the reply referenced products, this is the text after the last reference or image line.
/// Otherwise it is the whole reply.
pub fn finalize(full_text: &str, products: &[ProductRecord]) -> ChatTranscriptEntry {
    let lines = lines_of(full_text);
    // An unknown-id reference still ends the trailing prose.
    let matched_any = !products.is_empty() || lines.iter().any(|l| detector::is_reference_line(l));

    if !matched_any {
        return ChatTranscriptEntry::prose(full_text.trim());
    }

    let mut trailing: Vec<&str> = lines
        .iter()
        .rev()
        .take_while(|l| !detector::is_reference_line(l) && !detector::is_image_line(l))
        .copied()
        .collect();
    trailing.reverse();
    ChatTranscriptEntry::prose(trailing.join("\n").trim())
}

/// Held products that no reference line in the reply names.
pub fn unreferenced_products<'a>(
    full_text: &str,
    products: &'a [ProductRecord],
) -> Vec<&'a ProductRecord> {
    let referenced: HashSet<&str> = lines_of(full_text)
        .into_iter()
        .filter_map(detector::match_reference)
        .collect();
    products
        .iter()
        .filter(|p| !referenced.contains(p.product_id.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prose_of(entry: &ChatTranscriptEntry) -> &str {
        match entry.as_prose() {
            Some(t) => t,
            None => panic!("Expected prose entry, got {:?}", entry),
        }
    }

    #[test]
    fn test_no_references_returns_whole_text_trimmed() {
        let text = "  Just chatting.\nNothing to buy here.\n";
        assert_eq!(
            prose_of(&finalize(text, &[])),
            "Just chatting.\nNothing to buy here."
        );
    }

    #[test]
    fn test_trailing_prose_after_last_reference() {
        let text = "Here are some options:\n1. [[p1]] **Shoe A** - comfy\n2. [[p2]] **Shoe B** - fast\nLet me know!\nHappy to help.";
        let products = vec![ProductRecord::new("p1", "Shoe A")];
        assert_eq!(
            prose_of(&finalize(text, &products)),
            "Let me know!\nHappy to help."
        );
    }

    #[test]
    fn test_image_line_bounds_trailing_prose() {
        let text = "[[p1]] **A** - x\n  ![A](https://img/a.png)\nThat's all.";
        assert_eq!(prose_of(&finalize(text, &[])), "That's all.");
    }

    #[test]
    fn test_unknown_reference_still_selects_trailing_branch() {
        let text = "Intro\n[[unknown]]\nOutro";
        assert_eq!(prose_of(&finalize(text, &[])), "Outro");
    }

    #[test]
    fn test_reference_as_last_line_yields_empty_prose() {
        let text = "Intro\n[[p1]] **A** - x\n";
        assert_eq!(prose_of(&finalize(text, &[ProductRecord::new("p1", "A")])), "");
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let text = "a\n[[p1]]\nb";
        let products = vec![ProductRecord::new("p1", "A")];
        assert_eq!(finalize(text, &products), finalize(text, &products));
    }

    #[test]
    fn test_unreferenced_products() {
        let text = "x\n[[p1]] **A** - y";
        let products = vec![ProductRecord::new("p1", "A"), ProductRecord::new("p2", "B")];
        let dropped = unreferenced_products(text, &products);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].product_id, "p2");
    }
}
