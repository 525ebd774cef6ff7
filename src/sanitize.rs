//! Whole-document entry points.
//!
//! [`sanitize`] runs the five stages on one email body and returns the
//! renderable document with its diagnostics. Use
//! [`crate::stream::sanitize_batch`] for many messages at once.
//!
//! The returned future is `Send`. The DOM never lives across an `.await`:
//! the tree is serialised with pending-image markers before the network
//! phase and re-parsed after it.

use crate::config::{PolicyName, SanitizationPolicy, SanitizeConfig};
use crate::error::SanitizeError;
use crate::output::{SanitizeOutput, SanitizeStats};
use crate::pipeline::dom::ParsedDocument;
use crate::pipeline::fetch::{HttpFetcher, ImageFetcher};
use crate::pipeline::images::{self, ImagePlan};
use crate::pipeline::{shell, threats};
use crate::styles;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Sanitise one email body for screenshot rendering.
///
/// This is the primary entry point for the library.
///
/// # Arguments
/// * `raw_html` - The email's HTML body, fragment or complete document
/// * `policy` - Preset to apply
/// * `config` - Limits, image routes and the optional injected fetcher
///
/// # Returns
/// `Ok(SanitizeOutput)` whenever a document could be produced, even if some
/// images fell back to placeholders (check `output.images`).
///
/// # Errors
/// Returns `Err(SanitizeError)` only for fatal errors:
/// - Input larger than `config.max_input_bytes`
/// - Serialisation failure
///
/// # Example
/// ```rust,no_run
/// use mailscribe::{sanitize, PolicyName, SanitizeConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = SanitizeConfig::default();
/// let out = sanitize("<p onclick=\"x()\">Hi</p>", PolicyName::Balanced, &config).await?;
/// assert!(!out.html.contains("onclick"));
/// # Ok(())
/// # }
/// ```
pub async fn sanitize(
    raw_html: &str,
    policy: PolicyName,
    config: &SanitizeConfig,
) -> Result<SanitizeOutput, SanitizeError> {
    let policy = config.effective_policy(policy);
    sanitize_with(raw_html, &policy, config).await
}

/// Sanitise with an explicit rule set instead of a named preset.
///
/// The config's `image_strategy` override is not applied here; `policy` is
/// used exactly as given.
pub async fn sanitize_with(
    raw_html: &str,
    policy: &SanitizationPolicy,
    config: &SanitizeConfig,
) -> Result<SanitizeOutput, SanitizeError> {
    let start = Instant::now();

    if raw_html.len() > config.max_input_bytes {
        return Err(SanitizeError::InputTooLarge {
            size: raw_html.len(),
            limit: config.max_input_bytes,
        });
    }

    // ── Stages 1–3 and image planning (sync) ─────────────────────────────
    let Prepared {
        html,
        complete,
        plan: ImagePlan {
            mut images,
            pending,
        },
        mut stats,
    } = prepare(raw_html, policy, config)?;

    // ── Stage 4: network phase ───────────────────────────────────────────
    let html = if pending.is_empty() {
        html
    } else {
        let outcomes = match resolve_fetcher(config) {
            Ok(fetcher) => {
                debug!(pending = pending.len(), "Resolving cross-origin images");
                images::resolve_pending(pending, config, fetcher).await
            }
            Err(e) => {
                warn!(error = %e, pending = pending.len(), "No image fetcher; using placeholders");
                images::unfetchable(pending, &e.to_string())
            }
        };

        let doc = ParsedDocument::parse_as(&html, complete);
        images::apply(&doc, outcomes, &mut images, policy);
        doc.serialize()?
    };

    // ── Stage 5: shell ───────────────────────────────────────────────────
    let snippet = styles::head_snippet(policy, config.font_preload_url.as_deref());
    let html = shell::wrap(&html, complete, &snippet, config.viewport_width);

    stats.count_images(&images);
    stats.output_bytes = html.len();
    stats.duration_ms = start.elapsed().as_millis() as u64;

    info!(
        policy = %policy.name,
        input_bytes = stats.input_bytes,
        output_bytes = stats.output_bytes,
        removed_elements = stats.removed_elements,
        images = images.len(),
        placeholders = stats.images_placeholder,
        duration_ms = stats.duration_ms,
        "Sanitised document"
    );

    Ok(SanitizeOutput {
        html,
        images,
        stats,
    })
}

/// Sanitise and write the renderable document to `output_path`.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
pub async fn sanitize_to_file(
    raw_html: &str,
    policy: PolicyName,
    output_path: impl AsRef<Path>,
    config: &SanitizeConfig,
) -> Result<SanitizeStats, SanitizeError> {
    let output = sanitize(raw_html, policy, config).await?;
    write_document(output_path.as_ref(), &output.html).await?;
    Ok(output.stats)
}

/// Synchronous wrapper around [`sanitize`].
///
/// Creates a temporary tokio runtime internally. Do not call it from inside
/// an async context.
pub fn sanitize_sync(
    raw_html: &str,
    policy: PolicyName,
    config: &SanitizeConfig,
) -> Result<SanitizeOutput, SanitizeError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| SanitizeError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(sanitize(raw_html, policy, config))
}

/// Email body substituted when a message has no HTML part.
///
/// The result is ordinary sanitiser input.
pub fn plaintext_fallback(text: &str) -> String {
    format!(
        "<pre style=\"white-space: pre-wrap; font-family: Arial, sans-serif;\">{}</pre>",
        html_escape::encode_double_quoted_attribute(text)
    )
}

/// Write a renderable document atomically (temp file + rename), creating
/// parent directories as needed.
/// The temp file is created next to `path` under a unique name.
pub async fn write_document(path: &Path, contents: &str) -> Result<(), SanitizeError> {
    let path = path.to_path_buf();
    let contents = contents.to_string();
    tokio::task::spawn_blocking(move || write_document_blocking(&path, &contents))
        .await
        .map_err(|e| SanitizeError::Internal(format!("write task failed: {e}")))?
}

fn write_document_blocking(path: &Path, contents: &str) -> Result<(), SanitizeError> {
    let write_failed = |e: std::io::Error| SanitizeError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(write_failed)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(write_failed)?;
    tmp.write_all(contents.as_bytes()).map_err(write_failed)?;
    tmp.persist(path).map_err(|e| write_failed(e.error))?;
    Ok(())
}

// ── Internal helpers ─────────────────────────────────────────────────────

/// Serialise/parse rounds allowed before foreign content is dropped.
const SETTLE_ROUNDS: usize = 3;

/// Everything the sync stages produce. Owns no DOM handle.
struct Prepared {
    html: String,
    complete: bool,
    plan: ImagePlan,
    stats: SanitizeStats,
}

fn prepare(
    raw_html: &str,
    policy: &SanitizationPolicy,
    config: &SanitizeConfig,
) -> Result<Prepared, SanitizeError> {
    let doc = ParsedDocument::parse(raw_html);
    let complete = doc.is_complete();
    debug!(complete, bytes = raw_html.len(), "Parsed input");

    let pruned_subtrees = doc.prune_depth(config.max_depth);
    let threats::Settled {
        doc,
        strip: stripped,
        layout: normalized,
        rounds,
    } = threats::settle(doc, policy, SETTLE_ROUNDS)?;
    if rounds > 0 {
        debug!(rounds, "Re-parse changed the markup");
    }
    let plan = images::plan(&doc, policy);

    let stats = SanitizeStats {
        policy: policy.name,
        input_bytes: raw_html.len(),
        removed_elements: stripped.removed_elements,
        removed_attributes: stripped.removed_attributes,
        removed_style_blocks: stripped.removed_style_blocks,
        removed_declarations: normalized.removed_declarations,
        pruned_subtrees,
        enhanced_buttons: normalized.enhanced_buttons,
        passthrough: complete,
        ..SanitizeStats::default()
    };

    Ok(Prepared {
        html: doc.serialize()?,
        complete,
        plan,
        stats,
    })
}

fn resolve_fetcher(config: &SanitizeConfig) -> Result<Arc<dyn ImageFetcher>, SanitizeError> {
    match &config.fetcher {
        Some(fetcher) => Ok(Arc::clone(fetcher)),
        None => Ok(Arc::new(HttpFetcher::new(config)?)),
    }
}
