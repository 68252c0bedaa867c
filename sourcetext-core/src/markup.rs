//! Document parser adapter: HTML and Markdown in, an `rcdom` tree out, HTML back.
//!
//! Input is treated as a body fragment, never a full document, so
//! serialization gives back the same shape that was submitted (no synthetic
//! `<html>`/`<body>` wrappers). Malformed markup is tolerated the way an HTML5
//! parser tolerates it; parser recoveries are logged at `debug!`.

use std::fmt;
use std::str::FromStr;

use html5ever::driver::ParseOpts;
use html5ever::serialize::{serialize, SerializeOpts, TraversalScope};
use html5ever::tendril::TendrilSink;
use html5ever::{local_name, namespace_url, ns, parse_fragment, QualName};
use markup5ever_rcdom::{Handle, NodeData, RcDom, SerializableHandle};
use pulldown_cmark::{html, Options, Parser};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PipelineError;

/// Submission format. Both formats are annotated and stored as HTML.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentFormat {
    #[default]
    Html,
    Markdown,
}

impl fmt::Display for ContentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentFormat::Html => f.write_str("html"),
            ContentFormat::Markdown => f.write_str("markdown"),
        }
    }
}

impl FromStr for ContentFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "html" | "htm" => Ok(ContentFormat::Html),
            "markdown" | "md" => Ok(ContentFormat::Markdown),
            other => Err(format!("unknown content format '{other}'")),
        }
    }
}

/// A parsed body fragment. `root` is the synthetic context element whose
/// children are the submitted nodes.
pub struct Fragment {
    pub(crate) dom: RcDom,
    pub(crate) root: Handle,
}

impl fmt::Debug for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fragment")
            .field("children", &self.root.children.borrow().len())
            .finish()
    }
}

impl Fragment {
    pub fn root(&self) -> &Handle {
        &self.root
    }

    /// Serialize the fragment's children back to HTML.
    pub fn serialize(&self) -> Result<String, PipelineError> {
        let mut out = Vec::new();
        let opts = SerializeOpts {
            traversal_scope: TraversalScope::ChildrenOnly(None),
            ..Default::default()
        };
        serialize(&mut out, &SerializableHandle::from(self.root.clone()), opts)
            .map_err(|e| PipelineError::Parse(format!("serialization failed: {e}")))?;
        String::from_utf8(out)
            .map_err(|e| PipelineError::Parse(format!("serializer produced invalid UTF-8: {e}")))
    }
}

/// Parse `input` according to `format`.
pub fn parse(
    format: ContentFormat,
    input: &str,
    max_bytes: usize,
) -> Result<Fragment, PipelineError> {
    if input.len() > max_bytes {
        return Err(PipelineError::Parse(format!(
            "input is {} bytes, limit is {max_bytes}",
            input.len()
        )));
    }
    match format {
        ContentFormat::Html => parse_html(input),
        ContentFormat::Markdown => parse_html(&markdown_to_html(input)),
    }
}

/// Render CommonMark (plus tables, strikethrough, footnotes and task lists) to HTML.
pub fn markdown_to_html(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_TASKLISTS);

    let mut out = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut out, Parser::new_ext(markdown, options));
    out
}

pub fn parse_html(input: &str) -> Result<Fragment, PipelineError> {
    let context = QualName::new(None, ns!(html), local_name!("body"));
    let dom = parse_fragment(RcDom::default(), ParseOpts::default(), context, Vec::new())
        .one(input);

    if !dom.errors.is_empty() {
        debug!(
            recoveries = dom.errors.len(),
            first = %dom.errors[0],
            "HTML parser recovered from malformed input"
        );
    }

    let root = fragment_root(&dom.document)
        .ok_or_else(|| PipelineError::Parse("parser produced no fragment root".to_string()))?;
    Ok(Fragment { dom, root })
}

fn fragment_root(document: &Handle) -> Option<Handle> {
    document
        .children
        .borrow()
        .iter()
        .find(|child| matches!(child.data, NodeData::Element { .. }))
        .cloned()
}

/// Lowercase local name of an element node, `None` for every other node kind.
pub(crate) fn element_name(node: &Handle) -> Option<&str> {
    match &node.data {
        NodeData::Element { name, .. } => Some(&*name.local),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_round_trips_without_wrappers() {
        let input = "<h1>Title</h1><p>Hello <em>world</em></p>";
        let fragment = parse(ContentFormat::Html, input, usize::MAX).unwrap();
        assert_eq!(fragment.serialize().unwrap(), input);
    }

    #[test]
    fn tolerates_unclosed_tags() {
        let fragment = parse(ContentFormat::Html, "<p>one<p>two", usize::MAX).unwrap();
        assert_eq!(fragment.serialize().unwrap(), "<p>one</p><p>two</p>");
    }

    #[test]
    fn markdown_becomes_html_blocks() {
        let fragment = parse(ContentFormat::Markdown, "# Heading\n\nBody *text*\n", usize::MAX)
            .unwrap();
        let html = fragment.serialize().unwrap();
        assert!(html.contains("<h1>Heading</h1>"), "got {html}");
        assert!(html.contains("<p>Body <em>text</em></p>"), "got {html}");
    }

    #[test]
    fn oversized_input_is_a_parse_failure() {
        let err = parse(ContentFormat::Html, "<p>too long</p>", 4).unwrap_err();
        assert!(matches!(err, PipelineError::Parse(_)));
    }

    #[test]
    fn format_from_str() {
        assert_eq!("MD".parse::<ContentFormat>(), Ok(ContentFormat::Markdown));
        assert_eq!("html".parse::<ContentFormat>(), Ok(ContentFormat::Html));
        assert!("pdf".parse::<ContentFormat>().is_err());
    }
}
