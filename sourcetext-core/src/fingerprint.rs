//! Occurrence fingerprints: the only identity mechanism for source texts.
//!
//! A fingerprint is the SHA-256 of `(stream, text, occurrence)`. The
//! occurrence counter makes the second copy of a paragraph a different unit
//! from the first, and the stream tag keeps the title and the body in
//! disjoint namespaces, so a title repeated in the body never collides.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::extract::Block;

const SEPARATOR: u8 = 0x1f;

/// Which logical stream a unit belongs to. Each stream counts occurrences
/// on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Title,
    Body,
}

impl Stream {
    fn tag(self) -> &'static [u8] {
        match self {
            Stream::Title => b"title",
            Stream::Body => b"body",
        }
    }
}

/// Lowercase hex SHA-256 over `stream ␟ text ␟ occurrence`.
pub fn fingerprint(stream: Stream, text: &str, occurrence: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stream.tag());
    hasher.update([SEPARATOR]);
    hasher.update(text.as_bytes());
    hasher.update([SEPARATOR]);
    hasher.update(occurrence.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Running per-text occurrence counts for one stream of one pipeline run.
#[derive(Debug, Default)]
pub struct OccurrenceCounter {
    seen: HashMap<String, u32>,
}

impl OccurrenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more occurrence of `text` and return the new count (first is 1).
    pub fn next(&mut self, text: &str) -> u32 {
        let count = self.seen.entry(text.to_string()).or_insert(0);
        *count += 1;
        *count
    }
}

/// A unit as the new decomposition wants it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub text: String,
    pub fingerprint: String,
    pub number: i64,
    /// Index into the extracted block list, `None` for the title.
    pub block: Option<usize>,
}

/// Collapse runs of whitespace to one space and trim the ends.
pub fn normalize_title(title: &str) -> String {
    title.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fingerprint the title and the body blocks and assign contiguous numbers:
/// the title (when non-empty) is number 0 and the blocks follow in order.
pub fn plan_units(title: &str, blocks: &[Block]) -> Vec<Candidate> {
    let mut candidates = Vec::with_capacity(blocks.len() + 1);

    let title = normalize_title(title);
    if !title.is_empty() {
        candidates.push(Candidate {
            fingerprint: fingerprint(Stream::Title, &title, 1),
            text: title,
            number: 0,
            block: None,
        });
    }

    let mut body = OccurrenceCounter::new();
    for (index, block) in blocks.iter().enumerate() {
        let occurrence = body.next(&block.text);
        candidates.push(Candidate {
            fingerprint: fingerprint(Stream::Body, &block.text, occurrence),
            text: block.text.clone(),
            number: candidates.len() as i64,
            block: Some(index),
        });
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NestedBlocks, DEFAULT_BLOCK_TAGS};
    use crate::extract::{extract_blocks, BlockTags};
    use crate::markup::parse_html;

    fn plan(title: &str, html: &str) -> Vec<Candidate> {
        let fragment = parse_html(html).unwrap();
        let blocks = extract_blocks(
            fragment.root(),
            &BlockTags::new(DEFAULT_BLOCK_TAGS),
            NestedBlocks::Inclusive,
        );
        plan_units(title, &blocks)
    }

    #[test]
    fn fingerprint_is_stable_hex_sha256() {
        let a = fingerprint(Stream::Body, "Hello", 1);
        assert_eq!(a, fingerprint(Stream::Body, "Hello", 1));
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn occurrence_and_stream_change_the_fingerprint() {
        let first = fingerprint(Stream::Body, "Hello", 1);
        assert_ne!(first, fingerprint(Stream::Body, "Hello", 2));
        assert_ne!(first, fingerprint(Stream::Title, "Hello", 1));
        assert_ne!(first, fingerprint(Stream::Body, "Hello!", 1));
    }

    #[test]
    fn counter_counts_per_text() {
        let mut counter = OccurrenceCounter::new();
        assert_eq!(counter.next("a"), 1);
        assert_eq!(counter.next("b"), 1);
        assert_eq!(counter.next("a"), 2);
    }

    #[test]
    fn duplicate_paragraphs_get_distinct_fingerprints() {
        let units = plan("", "<p>Same</p><p>Same</p>");
        assert_eq!(units.len(), 2);
        assert_ne!(units[0].fingerprint, units[1].fingerprint);
        assert_eq!(
            units.iter().map(|u| u.number).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[test]
    fn title_takes_number_zero_and_never_collides_with_body() {
        let units = plan("  X  ", "<p>X</p><p>Y</p>");
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].text, "X");
        assert_eq!(units[0].number, 0);
        assert_eq!(units[0].block, None);
        assert_eq!(units[1].text, "X");
        assert_eq!(units[1].number, 1);
        assert_eq!(units[1].block, Some(0));
        assert_ne!(units[0].fingerprint, units[1].fingerprint);
        assert_eq!(units[2].number, 2);
    }

    #[test]
    fn identical_input_reproduces_identical_plan() {
        let html = "<h1>A</h1><p>B</p><p>A</p>";
        assert_eq!(plan("T", html), plan("T", html));
    }

    #[test]
    fn title_whitespace_is_collapsed() {
        assert_eq!(normalize_title("  Hello \n  world "), "Hello world");
        assert!(plan(" \t ", "<p>x</p>").iter().all(|u| u.block.is_some()));
    }
}
