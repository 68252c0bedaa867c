//! Block extraction: the ordered `(element, normalized text)` pairs of a fragment.

use std::collections::HashSet;

use markup5ever_rcdom::{Handle, NodeData};

use crate::config::{NestedBlocks, PipelineConfig};
use crate::markup::element_name;

/// Lowercased local names of the elements treated as block-level units.
#[derive(Debug, Clone)]
pub struct BlockTags(HashSet<String>);

impl BlockTags {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            tags.into_iter()
                .map(|t| t.as_ref().trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        )
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(&config.block_tags)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    fn is_block(&self, node: &Handle) -> bool {
        element_name(node).is_some_and(|name| self.contains(name))
    }
}

/// One extracted block. `node` is the element itself, so the annotator can
/// rewrite it in place after reconciliation.
#[derive(Debug, Clone)]
pub struct Block {
    pub node: Handle,
    pub text: String,
}

/// Walk `root`'s descendants depth-first, pre-order, and return every block
/// element with non-empty normalized text. `root` itself is never a candidate.
pub fn extract_blocks(root: &Handle, tags: &BlockTags, nesting: NestedBlocks) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut stack: Vec<Handle> = root.children.borrow().iter().rev().cloned().collect();

    while let Some(node) = stack.pop() {
        if tags.is_block(&node) {
            let text = normalize_text(&node, tags, nesting);
            if !text.is_empty() {
                blocks.push(Block {
                    node: node.clone(),
                    text,
                });
            }
        }
        stack.extend(node.children.borrow().iter().rev().cloned());
    }

    blocks
}

/// Concatenate the descendant text of `node`: every text node trimmed,
/// empty ones dropped, the rest joined by single spaces.
///
/// Under [`NestedBlocks::Exclusive`] the walk does not enter nested block
/// elements; their text belongs to them alone.
pub fn normalize_text(node: &Handle, tags: &BlockTags, nesting: NestedBlocks) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut stack: Vec<Handle> = node.children.borrow().iter().rev().cloned().collect();

    while let Some(current) = stack.pop() {
        match &current.data {
            NodeData::Text { contents } => {
                let contents = contents.borrow();
                let trimmed = contents.trim();
                if !trimmed.is_empty() {
                    parts.push(trimmed.to_string());
                }
            }
            NodeData::Element { .. } => {
                if nesting == NestedBlocks::Exclusive && tags.is_block(&current) {
                    continue;
                }
                stack.extend(current.children.borrow().iter().rev().cloned());
            }
            _ => {}
        }
    }

    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_BLOCK_TAGS;
    use crate::markup::parse_html;

    fn texts(html: &str, nesting: NestedBlocks) -> Vec<String> {
        let fragment = parse_html(html).unwrap();
        let tags = BlockTags::new(DEFAULT_BLOCK_TAGS);
        extract_blocks(fragment.root(), &tags, nesting)
            .into_iter()
            .map(|b| b.text)
            .collect()
    }

    #[test]
    fn blocks_in_document_order() {
        let html = "<h1>Title</h1><p>First</p><ul><li>One</li><li>Two</li></ul><p>Last</p>";
        assert_eq!(
            texts(html, NestedBlocks::Inclusive),
            vec!["Title", "First", "One", "Two", "Last"]
        );
    }

    #[test]
    fn text_nodes_are_trimmed_and_joined_with_single_spaces() {
        let html = "<p>  Hello\n   <strong> big </strong>   world  </p>";
        assert_eq!(texts(html, NestedBlocks::Inclusive), vec!["Hello big world"]);
    }

    #[test]
    fn empty_blocks_are_skipped() {
        let html = "<p>   </p><p><img src=\"a.png\"></p><p>kept</p><h2><!-- note --></h2>";
        assert_eq!(texts(html, NestedBlocks::Inclusive), vec!["kept"]);
    }

    #[test]
    fn inline_content_outside_blocks_is_ignored() {
        let html = "loose text <em>here</em><div>div is not a block</div><p>para</p>";
        assert_eq!(texts(html, NestedBlocks::Inclusive), vec!["para"]);
    }

    #[test]
    fn nested_blocks_inclusive_double_counts() {
        let html = "<ul><li>Outer<ul><li>Inner</li></ul></li></ul>";
        assert_eq!(
            texts(html, NestedBlocks::Inclusive),
            vec!["Outer Inner", "Inner"]
        );
    }

    #[test]
    fn nested_blocks_exclusive_partitions_text() {
        let html = "<ul><li>Outer<ul><li>Inner</li></ul></li></ul>";
        assert_eq!(texts(html, NestedBlocks::Exclusive), vec!["Outer", "Inner"]);
    }

    #[test]
    fn exclusive_skips_wrapper_with_only_nested_text() {
        let html = "<table><tr><td><p>cell para</p></td></tr></table>";
        assert_eq!(texts(html, NestedBlocks::Exclusive), vec!["cell para"]);
        assert_eq!(
            texts(html, NestedBlocks::Inclusive),
            vec!["cell para", "cell para"]
        );
    }

    #[test]
    fn markdown_quote_is_one_block() {
        let html = crate::markup::markdown_to_html("> quote\n\nafter\n");
        assert_eq!(texts(&html, NestedBlocks::Inclusive), vec!["quote", "after"]);
    }

    #[test]
    fn tag_set_is_case_insensitive_and_ignores_blanks() {
        let tags = BlockTags::new(["P", " li ", ""]);
        assert!(tags.contains("p"));
        assert!(tags.contains("li"));
        assert!(!tags.contains(""));
    }
}
