//! Stable-identity markers.
//!
//! After reconciliation every extracted block gets its children wrapped in one
//! marker element carrying the unit id:
//!
//! ```text
//! <p>Hello <em>world</em></p>
//! <p><span data-source-text-id="42">Hello <em>world</em></span></p>
//! ```
//!
//! Only existing block elements are touched. Content outside a block is never
//! given a new block wrapper.

use std::collections::HashMap;

use html5ever::interface::{ElementFlags, NodeOrText, TreeSink};
use html5ever::tendril::StrTendril;
use html5ever::{namespace_url, ns, Attribute, LocalName, QualName};
use markup5ever_rcdom::{Handle, NodeData};
use tracing::warn;

use crate::config::PipelineConfig;
use crate::extract::Block;
use crate::fingerprint::Candidate;
use crate::markup::{element_name, Fragment};

/// The marker element and the attribute that carries the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub tag: String,
    pub attribute: String,
}

impl Marker {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            tag: config.marker_tag.to_ascii_lowercase(),
            attribute: config.marker_attribute.to_ascii_lowercase(),
        }
    }

    fn matches(&self, node: &Handle) -> bool {
        match &node.data {
            NodeData::Element { name, attrs, .. } => {
                *name.local == *self.tag
                    && attrs
                        .borrow()
                        .iter()
                        .any(|a| *a.name.local == *self.attribute)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationOutcome {
    pub annotated: usize,
    /// Texts of blocks whose fingerprint had no id after reconciliation.
    pub unresolved: Vec<String>,
}

/// Wrap the children of every block in `candidates` whose fingerprint
/// resolved in `ids`. Unresolved blocks are logged and left as they were.
pub fn annotate(
    fragment: &mut Fragment,
    blocks: &[Block],
    candidates: &[Candidate],
    ids: &HashMap<String, i64>,
    marker: &Marker,
) -> AnnotationOutcome {
    let mut outcome = AnnotationOutcome::default();

    for candidate in candidates {
        let Some(index) = candidate.block else {
            continue;
        };
        let Some(block) = blocks.get(index) else {
            continue;
        };
        match ids.get(&candidate.fingerprint) {
            Some(id) => {
                wrap_children(fragment, &block.node, marker, *id);
                outcome.annotated += 1;
            }
            None => {
                warn!(
                    fingerprint = %candidate.fingerprint,
                    number = candidate.number,
                    tag = element_name(&block.node).unwrap_or("?"),
                    "[SYNC][ANNOTATE] Block fingerprint did not resolve to an id; leaving it unmarked"
                );
                outcome.unresolved.push(candidate.text.clone());
            }
        }
    }

    outcome
}

fn wrap_children(fragment: &mut Fragment, block: &Handle, marker: &Marker, id: i64) {
    let dom = &mut fragment.dom;
    let name = QualName::new(None, ns!(html), LocalName::from(marker.tag.as_str()));
    let attrs = vec![Attribute {
        name: QualName::new(None, ns!(), LocalName::from(marker.attribute.as_str())),
        value: StrTendril::from(id.to_string()),
    }];
    let wrapper = dom.create_element(name, attrs, ElementFlags::default());
    dom.reparent_children(block, &wrapper);
    dom.append(block, NodeOrText::AppendNode(wrapper));
}

/// Unwrap every marker element already present in the fragment (a previous
/// annotated render being resubmitted), keeping the marker's children in
/// place. Returns how many markers were removed.
pub fn strip_markers(fragment: &mut Fragment, marker: &Marker) -> usize {
    let mut found = Vec::new();
    let mut stack: Vec<Handle> = fragment.root.children.borrow().iter().cloned().collect();
    while let Some(node) = stack.pop() {
        if marker.matches(&node) {
            found.push(node.clone());
        }
        stack.extend(node.children.borrow().iter().cloned());
    }

    let dom = &mut fragment.dom;
    for node in &found {
        let children: Vec<Handle> = node.children.borrow().clone();
        for child in children {
            dom.append_before_sibling(node, NodeOrText::AppendNode(child));
        }
        dom.remove_from_parent(node);
    }
    found.len()
}
