//! Stage 4: image resolver.
//!
//! Every `<img>` is classified by its `src` and resolved to one of three
//! outcomes: kept as is, inlined as a `data:` URI fetched through a relay,
//! or replaced by a fixed-size placeholder that holds its layout slot.
//!
//! ## Three phases
//!
//! The DOM is `Rc`-based and cannot cross an `.await`, so resolution is
//! split around the network work:
//!
//! 1. [`plan`] (sync): classify, apply every decision that needs no network
//!    (placeholders, kept images), and tag cross-origin images that need a
//!    fetch with [`PENDING_ATTRIBUTE`].
//! 2. [`resolve_pending`] (async): probe then proxies, per image, with a
//!    bounded number in flight. No DOM involved.
//! 3. [`apply`] (sync, on the re-parsed document): look each tagged image
//!    up again and mutate it. An image whose tag is gone was detached in the
//!    meantime; that is a silent no-op.
//!
//! Every network attempt runs under its own timeout, so N images finish in
//! time linear in N whatever the relays do.

use crate::config::{ImageStrategy, SanitizationPolicy, SanitizeConfig};
use crate::error::ImageError;
use crate::output::{ImageKind, ImageRef, Resolution};
use crate::pipeline::css;
use crate::pipeline::dom::{self, ParsedDocument};
use crate::pipeline::encode;
use crate::pipeline::fetch::ImageFetcher;
use futures::stream::{self, StreamExt};
use kuchiki::traits::TendrilSink;
use kuchiki::NodeRef;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Marker attribute carrying the pending-image index between phases.
pub const PENDING_ATTRIBUTE: &str = "data-mailscribe-pending";

/// CSS class of generated placeholders.
pub const PLACEHOLDER_CLASS: &str = "img-placeholder";

/// Box styles copied from an image onto its placeholder when the policy
/// keeps layout.
const LAYOUT_PROPERTIES: &[&str] = &[
    "display",
    "float",
    "margin",
    "padding",
    "border",
    "vertical-align",
];

const PLACEHOLDER_BASE_STYLE: &str = "display:inline-block;box-sizing:border-box;\
overflow:hidden;vertical-align:middle;background-color:#f1f3f4;border:1px dashed #bdc1c6;\
color:#5f6368;font-family:Arial,sans-serif;font-size:12px;text-align:center;white-space:nowrap";

static DIMENSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\d+(\.\d+)?(px|%)?$").expect("valid regex"));

/// Classify a `src` value.
pub fn classify(src: &str) -> ImageKind {
    let src = src.trim();
    let lower = src.get(..8).unwrap_or(src).to_ascii_lowercase();
    if src.is_empty() {
        ImageKind::Empty
    } else if lower.starts_with("cid:") {
        ImageKind::EmbeddedCid
    } else if lower.starts_with("data:") {
        ImageKind::DataUri
    } else if lower.starts_with("http://") || lower.starts_with("https://") || src.starts_with("//") {
        ImageKind::CrossOriginHttp
    } else {
        ImageKind::Relative
    }
}

/// A cross-origin image waiting for the network phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingImage {
    /// Index into [`ImagePlan::images`], also the marker value.
    pub index: usize,
    /// Absolute URL to fetch.
    pub url: String,
}

/// Output of [`plan`].
#[derive(Debug, Clone, Default)]
pub struct ImagePlan {
    /// One entry per `<img>` in document order. Pending entries carry the
    /// provisional resolution `Placeholder` until [`apply`] runs.
    pub images: Vec<ImageRef>,
    pub pending: Vec<PendingImage>,
}

/// Phase 1: classify every image and apply network-free resolutions.
pub fn plan(doc: &ParsedDocument, policy: &SanitizationPolicy) -> ImagePlan {
    let mut out = ImagePlan::default();
    let imgs: Vec<NodeRef> = doc
        .elements()
        .into_iter()
        .filter(|n| dom::tag_name(n).as_deref() == Some("img"))
        .collect();

    for img in imgs {
        let src = dom::attr(&img, "src").unwrap_or_default();
        let kind = classify(&src);
        let index = out.images.len();

        let resolution = match kind {
            ImageKind::DataUri | ImageKind::Relative => Resolution::Kept,
            ImageKind::Empty | ImageKind::EmbeddedCid => {
                replace_with_placeholder(&img, policy);
                Resolution::Placeholder
            }
            ImageKind::CrossOriginHttp => match policy.image_strategy {
                ImageStrategy::PlaceholderOnly => {
                    replace_with_placeholder(&img, policy);
                    Resolution::Placeholder
                }
                ImageStrategy::ProbeThenProxy => {
                    if let Some(element) = img.as_element() {
                        element
                            .attributes
                            .borrow_mut()
                            .insert(PENDING_ATTRIBUTE, index.to_string());
                    }
                    out.pending.push(PendingImage {
                        index,
                        url: absolute_url(&src),
                    });
                    Resolution::Placeholder
                }
            },
        };
        debug!(index, ?kind, ?resolution, "Planned image");

        out.images.push(ImageRef {
            original_src: src,
            kind,
            resolution,
            proxy: None,
            errors: Vec::new(),
        });
    }
    out
}

fn absolute_url(src: &str) -> String {
    let src = src.trim();
    if src.starts_with("//") {
        format!("https:{src}")
    } else {
        src.to_string()
    }
}

/// How the network phase resolved one pending image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    /// The direct load test succeeded.
    Direct,
    /// A relay served the image.
    Proxied { proxy: String, data_uri: String },
    /// Every route failed or was cancelled.
    Failed,
}

/// Result of the network phase for one pending image.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub index: usize,
    pub fetched: Fetched,
    pub errors: Vec<ImageError>,
}

/// Phase 2: resolve pending images, at most `image_concurrency` at a time.
/// Outcomes come back in the order of `pending`.
pub async fn resolve_pending(
    pending: Vec<PendingImage>,
    config: &SanitizeConfig,
    fetcher: Arc<dyn ImageFetcher>,
) -> Vec<FetchOutcome> {
    stream::iter(pending.into_iter().map(|image| {
        let fetcher = Arc::clone(&fetcher);
        async move { resolve_one(image, config, fetcher.as_ref()).await }
    }))
    .buffered(config.image_concurrency.max(1))
    .collect()
    .await
}

/// Outcomes for `pending` when no fetch can be attempted at all: every image
/// fails with a transport error carrying `detail`.
pub fn unfetchable(pending: Vec<PendingImage>, detail: &str) -> Vec<FetchOutcome> {
    pending
        .into_iter()
        .map(|image| FetchOutcome {
            index: image.index,
            fetched: Fetched::Failed,
            errors: vec![ImageError::Transport {
                url: image.url,
                detail: detail.to_string(),
            }],
        })
        .collect()
}

async fn resolve_one(
    image: PendingImage,
    config: &SanitizeConfig,
    fetcher: &dyn ImageFetcher,
) -> FetchOutcome {
    let mut errors = Vec::new();
    let outcome = |fetched, errors| FetchOutcome {
        index: image.index,
        fetched,
        errors,
    };

    match attempt(fetcher, &image.url, config.probe_timeout_ms, config).await {
        Ok(_) => {
            debug!(url = %image.url, "Direct load succeeded");
            return outcome(Fetched::Direct, errors);
        }
        Err(ImageError::Cancelled) => {
            errors.push(ImageError::Cancelled);
            return outcome(Fetched::Failed, errors);
        }
        Err(e) => {
            debug!(url = %image.url, error = %e, "Direct load failed");
            errors.push(e);
        }
    }

    for proxy in &config.proxies {
        let relay_url = proxy.request_url(&image.url);
        match attempt(fetcher, &relay_url, config.proxy_timeout_ms, config).await {
            Ok((bytes, validated)) => {
                debug!(url = %image.url, proxy = %proxy.base, "Proxy fetch succeeded");
                return outcome(
                    Fetched::Proxied {
                        proxy: proxy.base.clone(),
                        data_uri: encode::to_data_uri(&bytes, validated.format),
                    },
                    errors,
                );
            }
            Err(ImageError::Cancelled) => {
                errors.push(ImageError::Cancelled);
                return outcome(Fetched::Failed, errors);
            }
            Err(e) => {
                debug!(url = %image.url, proxy = %proxy.base, error = %e, "Proxy fetch failed");
                errors.push(e);
            }
        }
    }

    warn!(
        url = %image.url,
        attempts = errors.len(),
        "All image routes failed; using placeholder"
    );
    outcome(Fetched::Failed, errors)
}

/// One fetch attempt under `timeout_ms`, raced against cancellation, with
/// the body validated as a raster image.
async fn attempt(
    fetcher: &dyn ImageFetcher,
    url: &str,
    timeout_ms: u64,
    config: &SanitizeConfig,
) -> Result<(Vec<u8>, encode::ValidatedImage), ImageError> {
    let timeout = Duration::from_millis(timeout_ms);
    let fetch = async {
        match tokio::time::timeout(timeout, fetcher.fetch(url, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(ImageError::Timeout {
                url: url.to_string(),
                ms: timeout_ms,
            }),
        }
    };

    let body = match &config.cancellation {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ImageError::Cancelled),
                result = fetch => result?,
            }
        }
        None => fetch.await?,
    };

    let validated = encode::validate(url, &body.bytes, config.max_image_bytes)?;
    Ok((body.bytes, validated))
}

/// Phase 3: apply network outcomes to the re-parsed document and record
/// them in `images`. Every pending marker is removed.
pub fn apply(
    doc: &ParsedDocument,
    outcomes: Vec<FetchOutcome>,
    images: &mut [ImageRef],
    policy: &SanitizationPolicy,
) {
    let mut tagged: HashMap<usize, NodeRef> = HashMap::new();
    for node in doc.elements() {
        let Some(element) = node.as_element() else {
            continue;
        };
        let marker = element.attributes.borrow_mut().remove(PENDING_ATTRIBUTE);
        if let Some(index) = marker.and_then(|a| a.value.parse::<usize>().ok()) {
            tagged.insert(index, node.clone());
        }
    }

    for outcome in outcomes {
        let Some(record) = images.get_mut(outcome.index) else {
            continue;
        };
        record.errors = outcome.errors;

        let Some(img) = tagged.remove(&outcome.index) else {
            debug!(index = outcome.index, "Image detached before resolution; skipping");
            continue;
        };

        match outcome.fetched {
            Fetched::Direct => record.resolution = Resolution::Kept,
            Fetched::Proxied { proxy, data_uri } => {
                if let Some(element) = img.as_element() {
                    element.attributes.borrow_mut().insert("src", data_uri);
                }
                record.resolution = Resolution::Proxied;
                record.proxy = Some(proxy);
            }
            Fetched::Failed => {
                replace_with_placeholder(&img, policy);
                record.resolution = Resolution::Placeholder;
            }
        }
    }
}

/// Replace `img` with a placeholder element sized like the image.
pub fn replace_with_placeholder(img: &NodeRef, policy: &SanitizationPolicy) {
    let markup = placeholder_markup(img, policy);
    let fragment = kuchiki::parse_html().one(markup);
    let Ok(span) = fragment.select_first("span") else {
        return;
    };
    let span = span.as_node().clone();
    span.detach();
    img.insert_before(span);
    img.detach();
}

/// Markup of the placeholder that stands in for `img`.
pub fn placeholder_markup(img: &NodeRef, policy: &SanitizationPolicy) -> String {
    let style = dom::attr(img, "style").unwrap_or_default();
    let width = dom::attr(img, "width")
        .and_then(|w| dimension(&w))
        .or_else(|| style_dimension(&style, "width"));
    let height = dom::attr(img, "height")
        .and_then(|h| dimension(&h))
        .or_else(|| style_dimension(&style, "height"));

    let mut css_text = PLACEHOLDER_BASE_STYLE.to_string();
    if policy.placeholder_keeps_layout {
        for decl in layout_declarations(&style) {
            css_text.push(';');
            css_text.push_str(decl);
        }
    }
    if let Some(w) = &width {
        css_text.push_str(&format!(";width:{w}"));
    }
    if let Some(h) = &height {
        css_text.push_str(&format!(";height:{h}"));
        if h.ends_with("px") {
            css_text.push_str(&format!(";line-height:{h}"));
        }
    }

    let label = placeholder_label(dom::attr(img, "alt").as_deref(), policy.placeholder_label_chars);
    format!(
        r#"<span class="{PLACEHOLDER_CLASS}" style="{}">{}</span>"#,
        html_escape::encode_double_quoted_attribute(&css_text),
        html_escape::encode_text(&label),
    )
}

/// `[alt]` truncated to `max_chars` characters, or `[img]`.
pub fn placeholder_label(alt: Option<&str>, max_chars: usize) -> String {
    let alt = alt.map(|a| a.split_whitespace().collect::<Vec<_>>().join(" "));
    match alt.as_deref() {
        Some(a) if !a.is_empty() => format!("[{}]", a.chars().take(max_chars).collect::<String>()),
        _ => "[img]".to_string(),
    }
}

/// Normalise a width/height value: bare numbers get `px`, `px` and `%`
/// pass, anything else is rejected.
pub fn dimension(value: &str) -> Option<String> {
    let value = value.trim();
    if !DIMENSION.is_match(value) {
        return None;
    }
    let lower = value.to_ascii_lowercase();
    if lower.ends_with("px") || lower.ends_with('%') {
        Some(lower)
    } else {
        Some(format!("{lower}px"))
    }
}

fn style_dimension(style: &str, property: &str) -> Option<String> {
    css::split_declarations(style)
        .into_iter()
        .filter_map(css::parse_declaration)
        .filter(|(prop, _)| prop == property)
        .last()
        .and_then(|(_, value)| dimension(value))
}

fn layout_declarations(style: &str) -> Vec<&str> {
    css::split_declarations(style)
        .into_iter()
        .map(str::trim)
        .filter(|decl| {
            css::parse_declaration(decl).is_some_and(|(prop, _)| {
                LAYOUT_PROPERTIES.iter().any(|p| prop.starts_with(p))
            }) && !css::is_offending(decl)
                && !decl.contains(['"', '<', '>'])
        })
        .collect()
}
