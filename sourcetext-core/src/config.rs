use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;

/// Default extraction vocabulary: paragraphs, headings, list items, table cells and
/// the other containers that hold one translatable run of text.
///
/// `blockquote` is left out: rendered Markdown always wraps quoted text in a
/// `<p>`, so under inclusive nesting every quote would yield two equal units.
pub const DEFAULT_BLOCK_TAGS: &[&str] = &[
    "p",
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
    "li",
    "td",
    "th",
    "figcaption",
    "dt",
    "dd",
    "pre",
];

pub const DEFAULT_MARKER_TAG: &str = "span";
pub const DEFAULT_MARKER_ATTRIBUTE: &str = "data-source-text-id";
pub const DEFAULT_RENUMBER_OFFSET: i64 = 1_000_000;
pub const DEFAULT_UPDATE_BATCH_SIZE: usize = 1000;
pub const DEFAULT_MAX_INPUT_BYTES: usize = 5 * 1024 * 1024;

/// How a block nested inside another block contributes text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NestedBlocks {
    /// Every block carries all of its descendant text, nested blocks included.
    #[default]
    Inclusive,
    /// Every block is still extracted, but text owned by a nested block is
    /// only counted for that nested block.
    Exclusive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub block_tags: Vec<String>,
    pub marker_tag: String,
    pub marker_attribute: String,
    pub nesting: NestedBlocks,
    pub renumber_offset: i64,
    pub update_batch_size: usize,
    pub max_input_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            block_tags: DEFAULT_BLOCK_TAGS.iter().map(|t| t.to_string()).collect(),
            marker_tag: DEFAULT_MARKER_TAG.to_string(),
            marker_attribute: DEFAULT_MARKER_ATTRIBUTE.to_string(),
            nesting: NestedBlocks::default(),
            renumber_offset: DEFAULT_RENUMBER_OFFSET,
            update_batch_size: DEFAULT_UPDATE_BATCH_SIZE,
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
        }
    }
}

impl PipelineConfig {
    pub fn trace_loaded(&self) {
        info!(
            block_tags = self.block_tags.len(),
            marker = %format!("<{} {}>", self.marker_tag, self.marker_attribute),
            nesting = ?self.nesting,
            batch = self.update_batch_size,
            "Loaded PipelineConfig"
        );
        debug!(?self, "PipelineConfig loaded (full debug)");
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_tags.iter().all(|t| t.trim().is_empty()) {
            return Err(ConfigError::NoBlockTags);
        }
        if self.marker_tag.trim().is_empty() {
            return Err(ConfigError::EmptyMarker("tag"));
        }
        if self.marker_attribute.trim().is_empty() {
            return Err(ConfigError::EmptyMarker("attribute"));
        }
        if self.update_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.renumber_offset <= 0 {
            return Err(ConfigError::NonPositiveOffset(self.renumber_offset));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert_eq!(PipelineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"nesting": "exclusive", "update_batch_size": 10}"#).unwrap();
        assert_eq!(config.nesting, NestedBlocks::Exclusive);
        assert_eq!(config.update_batch_size, 10);
        assert_eq!(config.marker_attribute, DEFAULT_MARKER_ATTRIBUTE);
    }

    #[test]
    fn rejects_degenerate_values() {
        let config = PipelineConfig {
            block_tags: vec![" ".into()],
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoBlockTags));

        let config = PipelineConfig {
            update_batch_size: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroBatchSize));

        let config = PipelineConfig {
            renumber_offset: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NonPositiveOffset(0)));
    }
}
