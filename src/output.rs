//! Output types: the renderable document plus its diagnostics.

use crate::config::PolicyName;
use crate::error::ImageError;
use serde::{Deserialize, Serialize};

/// Result of sanitising one email body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizeOutput {
    /// Final wrapped HTML, ready for the rasterizer.
    pub html: String,
    /// One entry per `<img>` in document order.
    pub images: Vec<ImageRef>,
    pub stats: SanitizeStats,
}

impl SanitizeOutput {
    /// Images that ended up as placeholders.
    pub fn placeholders(&self) -> impl Iterator<Item = &ImageRef> {
        self.images
            .iter()
            .filter(|i| i.resolution == Resolution::Placeholder)
    }
}

/// Classification of an image `src`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageKind {
    DataUri,
    EmbeddedCid,
    Relative,
    CrossOriginHttp,
    Empty,
}

/// What happened to an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// `src` left untouched.
    Kept,
    /// `src` replaced with a data URI fetched through a relay.
    Proxied,
    /// `<img>` replaced with a fixed-size placeholder element.
    Placeholder,
}

/// Diagnostic record for one `<img>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub original_src: String,
    pub kind: ImageKind,
    pub resolution: Resolution,
    /// Relay that served a proxied image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    /// Failed fetch attempts, in attempt order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ImageError>,
}

/// Counters for one sanitisation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SanitizeStats {
    pub policy: PolicyName,
    pub input_bytes: usize,
    pub output_bytes: usize,
    /// Whole subtrees removed by tag (script, iframe, …).
    pub removed_elements: usize,
    /// Attributes removed (event handlers, dangerous URLs, allow-list misses).
    pub removed_attributes: usize,
    /// Offending `<style>` blocks dropped.
    pub removed_style_blocks: usize,
    /// CSS declarations removed by the layout normalizer.
    pub removed_declarations: usize,
    /// Subtrees pruned by the depth guard.
    pub pruned_subtrees: usize,
    /// Elements tagged by the button heuristic.
    pub enhanced_buttons: usize,
    pub images_kept: usize,
    pub images_proxied: usize,
    pub images_placeholder: usize,
    /// Input was already a complete document and passed through the shell.
    pub passthrough: bool,
    pub duration_ms: u64,
}

impl SanitizeStats {
    pub(crate) fn count_images(&mut self, images: &[ImageRef]) {
        self.images_kept = 0;
        self.images_proxied = 0;
        self.images_placeholder = 0;
        for image in images {
            match image.resolution {
                Resolution::Kept => self.images_kept += 1,
                Resolution::Proxied => self.images_proxied += 1,
                Resolution::Placeholder => self.images_placeholder += 1,
            }
        }
    }
}
