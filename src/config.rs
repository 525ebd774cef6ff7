//! Configuration types for email HTML sanitisation.
//!
//! Two layers control behaviour:
//!
//! * [`SanitizationPolicy`] is the immutable, per-mode rule set: which tags
//!   are forbidden, which attributes survive, whether style blocks are kept,
//!   how images are resolved. Three named presets ([`PolicyName`]) cover the
//!   aggressive ("ultra-stable"), balanced and layout-preserving modes. They
//!   are one pipeline parameterised three ways, never three code paths.
//!
//! * [`SanitizeConfig`] holds the runtime knobs shared by every policy:
//!   proxy relays, timeouts, size limits, the injected fetcher, cancellation
//!   and progress reporting. Built via [`SanitizeConfigBuilder`].

use crate::error::SanitizeError;
use crate::pipeline::fetch::ImageFetcher;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Default web font preloaded by the shell (Roboto regular, latin subset).
pub const DEFAULT_FONT_PRELOAD_URL: &str =
    "https://fonts.gstatic.com/s/roboto/v30/KFOmCnqEu92Fr1Mu4mxK.woff2";

/// Default CORS relay bases, tried in order.
pub const DEFAULT_PROXIES: &[&str] = &[
    "https://api.allorigins.win/raw?url=",
    "https://corsproxy.io/?",
];

/// Configuration for sanitising email HTML.
///
/// Built via [`SanitizeConfig::builder()`] or using
/// [`SanitizeConfig::default()`].
///
/// # Example
/// ```rust
/// use mailscribe::SanitizeConfig;
///
/// let config = SanitizeConfig::builder()
///     .probe_timeout_ms(2000)
///     .image_concurrency(8)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct SanitizeConfig {
    /// Override of the policy's image strategy. Default: None (policy decides).
    ///
    /// `Some(ImageStrategy::PlaceholderOnly)` gives a fully offline run: no
    /// network request is ever made, whatever the policy.
    pub image_strategy: Option<ImageStrategy>,

    /// Ordered CORS relay list. Default: [`DEFAULT_PROXIES`].
    ///
    /// Each relay is treated as unreliable: a 5xx, a timeout or a body that
    /// is not an image simply moves on to the next one.
    pub proxies: Vec<ProxyEndpoint>,

    /// Timeout of the direct load test, in milliseconds. Default: 3000.
    pub probe_timeout_ms: u64,

    /// Timeout of each proxy attempt, in milliseconds. Default: 5000.
    ///
    /// Resolution time per image is bounded by
    /// `probe_timeout_ms + proxies.len() * proxy_timeout_ms`.
    pub proxy_timeout_ms: u64,

    /// Image fetches in flight per document. Default: 4.
    pub image_concurrency: usize,

    /// Largest accepted image body in bytes. Default: 5 MiB.
    pub max_image_bytes: usize,

    /// Largest accepted input document in bytes. Default: 25 MiB.
    ///
    /// Matches Gmail's message ceiling. Larger input is refused with
    /// [`SanitizeError::InputTooLarge`] before parsing.
    pub max_input_bytes: usize,

    /// Maximum element nesting depth. Default: 256.
    ///
    /// Deeper subtrees are pruned. Renderers have their own recursion limits
    /// and pathological nesting is a cheap way to hang one.
    pub max_depth: usize,

    /// Web font preloaded by the shell. Default: [`DEFAULT_FONT_PRELOAD_URL`].
    ///
    /// `None` drops the `<link rel=preload>` but keeps the `@font-face`
    /// fallback with local sources.
    pub font_preload_url: Option<String>,

    /// Viewport width written into the shell's viewport meta. Default: 1200.
    pub viewport_width: u32,

    /// User-Agent for outbound image requests.
    pub user_agent: String,

    /// Pre-constructed image fetcher. Default: None (an `HttpFetcher` is built).
    pub fetcher: Option<Arc<dyn ImageFetcher>>,

    /// Cancels in-flight image fetches; cancelled images become placeholders.
    pub cancellation: Option<CancellationToken>,

    /// Batch progress events. Default: None.
    pub progress_callback: Option<ProgressCallback>,

    /// Documents in flight in [`crate::stream::sanitize_batch`]. Default: 4.
    pub concurrency: usize,
}

impl Default for SanitizeConfig {
    fn default() -> Self {
        Self {
            image_strategy: None,
            proxies: DEFAULT_PROXIES.iter().map(|b| ProxyEndpoint::new(*b)).collect(),
            probe_timeout_ms: 3000,
            proxy_timeout_ms: 5000,
            image_concurrency: 4,
            max_image_bytes: 5 * 1024 * 1024,
            max_input_bytes: 25 * 1024 * 1024,
            max_depth: 256,
            font_preload_url: Some(DEFAULT_FONT_PRELOAD_URL.to_string()),
            viewport_width: 1200,
            user_agent: concat!("mailscribe/", env!("CARGO_PKG_VERSION")).to_string(),
            fetcher: None,
            cancellation: None,
            progress_callback: None,
            concurrency: 4,
        }
    }
}

impl fmt::Debug for SanitizeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SanitizeConfig")
            .field("image_strategy", &self.image_strategy)
            .field("proxies", &self.proxies)
            .field("probe_timeout_ms", &self.probe_timeout_ms)
            .field("proxy_timeout_ms", &self.proxy_timeout_ms)
            .field("image_concurrency", &self.image_concurrency)
            .field("max_image_bytes", &self.max_image_bytes)
            .field("max_input_bytes", &self.max_input_bytes)
            .field("max_depth", &self.max_depth)
            .field("font_preload_url", &self.font_preload_url)
            .field("viewport_width", &self.viewport_width)
            .field("fetcher", &self.fetcher.as_ref().map(|_| "<dyn ImageFetcher>"))
            .field("cancellation", &self.cancellation.is_some())
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl SanitizeConfig {
    /// Create a new builder for `SanitizeConfig`.
    pub fn builder() -> SanitizeConfigBuilder {
        SanitizeConfigBuilder {
            config: Self::default(),
        }
    }

    /// The preset for `name`, with this config's image strategy override applied.
    pub fn effective_policy(&self, name: PolicyName) -> SanitizationPolicy {
        let mut policy = SanitizationPolicy::preset(name);
        if let Some(strategy) = self.image_strategy {
            policy.image_strategy = strategy;
        }
        policy
    }

    /// True once the caller has cancelled image work.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

/// Builder for [`SanitizeConfig`].
#[derive(Debug)]
pub struct SanitizeConfigBuilder {
    config: SanitizeConfig,
}

impl SanitizeConfigBuilder {
    pub fn image_strategy(mut self, strategy: ImageStrategy) -> Self {
        self.config.image_strategy = Some(strategy);
        self
    }

    /// Shorthand for `image_strategy(ImageStrategy::PlaceholderOnly)`.
    pub fn offline(self) -> Self {
        self.image_strategy(ImageStrategy::PlaceholderOnly)
    }

    /// Replace the relay list.
    pub fn proxies<I, S>(mut self, bases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.proxies = bases.into_iter().map(ProxyEndpoint::new).collect();
        self
    }

    pub fn probe_timeout_ms(mut self, ms: u64) -> Self {
        self.config.probe_timeout_ms = ms;
        self
    }

    pub fn proxy_timeout_ms(mut self, ms: u64) -> Self {
        self.config.proxy_timeout_ms = ms;
        self
    }

    pub fn image_concurrency(mut self, n: usize) -> Self {
        self.config.image_concurrency = n.max(1);
        self
    }

    pub fn max_image_bytes(mut self, n: usize) -> Self {
        self.config.max_image_bytes = n;
        self
    }

    pub fn max_input_bytes(mut self, n: usize) -> Self {
        self.config.max_input_bytes = n;
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.config.max_depth = depth.max(1);
        self
    }

    pub fn font_preload_url(mut self, url: Option<String>) -> Self {
        self.config.font_preload_url = url;
        self
    }

    pub fn viewport_width(mut self, px: u32) -> Self {
        self.config.viewport_width = px.clamp(320, 4096);
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config.user_agent = ua.into();
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn ImageFetcher>) -> Self {
        self.config.fetcher = Some(fetcher);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.config.cancellation = Some(token);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<SanitizeConfig, SanitizeError> {
        let c = &self.config;
        if c.probe_timeout_ms == 0 || c.proxy_timeout_ms == 0 {
            return Err(SanitizeError::InvalidConfig(
                "Image timeouts must be > 0ms".into(),
            ));
        }
        if c.concurrency == 0 || c.image_concurrency == 0 {
            return Err(SanitizeError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.max_image_bytes == 0 || c.max_input_bytes == 0 {
            return Err(SanitizeError::InvalidConfig(
                "Size limits must be > 0 bytes".into(),
            ));
        }
        for proxy in &c.proxies {
            proxy.validate()?;
        }
        Ok(self.config)
    }
}

// ── Proxy relays ─────────────────────────────────────────────────────────

/// One CORS relay: requests go to `base + urlencode(target)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub base: String,
}

impl ProxyEndpoint {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    /// Relay URL that fetches `target`.
    pub fn request_url(&self, target: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();
        format!("{}{}", self.base, encoded)
    }

    fn validate(&self) -> Result<(), SanitizeError> {
        let parsed = url::Url::parse(&self.base).map_err(|e| {
            SanitizeError::InvalidConfig(format!("Proxy base '{}' is not a URL: {e}", self.base))
        })?;
        match parsed.scheme() {
            "http" | "https" => Ok(()),
            other => Err(SanitizeError::InvalidConfig(format!(
                "Proxy base '{}' must be http(s), got scheme '{other}'",
                self.base
            ))),
        }
    }
}

// ── Policies ─────────────────────────────────────────────────────────────

/// Named sanitisation mode.
///
/// | Policy | Use case |
/// |--------|----------|
/// | `Aggressive` | Zero-crash capture: no style, no network, placeholders only |
/// | `Balanced` | Default: styles kept, cross-origin images probed then proxied |
/// | `LayoutPreserving` | Highest fidelity: CTA buttons emphasised, placeholders keep box styles |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyName {
    /// Also known as "ultra-stable".
    Aggressive,
    #[default]
    Balanced,
    LayoutPreserving,
}

impl PolicyName {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyName::Aggressive => "aggressive",
            PolicyName::Balanced => "balanced",
            PolicyName::LayoutPreserving => "layout-preserving",
        }
    }
}

impl fmt::Display for PolicyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyName {
    type Err = SanitizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "aggressive" | "ultra-stable" | "stable" => Ok(PolicyName::Aggressive),
            "balanced" => Ok(PolicyName::Balanced),
            "layout-preserving" | "layout" => Ok(PolicyName::LayoutPreserving),
            other => Err(SanitizeError::InvalidConfig(format!(
                "Unknown policy '{other}' (expected aggressive, balanced or layout-preserving)"
            ))),
        }
    }
}

/// How cross-origin `http(s)` images are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStrategy {
    /// Never fetch: every cross-origin image becomes a placeholder.
    PlaceholderOnly,
    /// Direct load test, then each proxy in order, then placeholder.
    ProbeThenProxy,
}

/// Tags whose whole subtree is removed under every policy.
pub const BASELINE_FORBIDDEN_TAGS: &[&str] = &[
    "script", "noscript", "iframe", "frame", "frameset", "object", "embed", "applet", "base",
    "template", "xmp", "noembed", "noframes", "plaintext", "video", "audio",
];

const AGGRESSIVE_FORBIDDEN_TAGS: &[&str] = &[
    "script", "noscript", "iframe", "frame", "frameset", "object", "embed", "applet", "base",
    "template", "xmp", "noembed", "noframes", "plaintext", "video", "audio", "style", "link",
    "meta",
];

/// Attributes that survive the aggressive policy (plus `data-*`).
const AGGRESSIVE_ATTRIBUTES: &[&str] = &["href", "alt", "title"];

/// Extra attributes the aggressive policy keeps on `<img>` so images can be
/// classified and their placeholders sized.
const AGGRESSIVE_IMG_ATTRIBUTES: &[&str] = &["src", "width", "height"];

/// CSS properties removed unconditionally (vendor-prefixed forms included).
pub const FORBIDDEN_CSS_PROPERTIES: &[&str] = &["transform", "animation", "transition"];

/// `position` values removed unconditionally.
pub const FORBIDDEN_POSITIONS: &[&str] = &["fixed", "absolute", "sticky"];

/// Immutable per-mode rule set driving every pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizationPolicy {
    pub name: PolicyName,
    /// Tags whose subtree is removed.
    pub forbidden_tags: &'static [&'static str],
    /// `Some(list)`: only these attributes (plus `data-*`) survive.
    /// `None`: everything survives except dangerous attributes.
    pub attribute_allow_list: Option<&'static [&'static str]>,
    /// Per-`<img>` additions to `attribute_allow_list`.
    pub img_attribute_allow_list: &'static [&'static str],
    /// Keep `<style>` blocks (minus offending ones).
    pub keep_style_blocks: bool,
    /// Keep `<link rel=stylesheet>` with an http(s) href.
    pub keep_stylesheet_links: bool,
    pub forbidden_css_properties: &'static [&'static str],
    pub forbidden_positions: &'static [&'static str],
    /// Apply the CTA button heuristic.
    pub button_heuristic: bool,
    pub image_strategy: ImageStrategy,
    /// Maximum characters of alt text in a placeholder label.
    pub placeholder_label_chars: usize,
    /// Copy the image's box styles onto its placeholder.
    pub placeholder_keeps_layout: bool,
}

impl SanitizationPolicy {
    /// The preset rule set for a named policy.
    pub fn preset(name: PolicyName) -> Self {
        match name {
            PolicyName::Aggressive => Self {
                name,
                forbidden_tags: AGGRESSIVE_FORBIDDEN_TAGS,
                attribute_allow_list: Some(AGGRESSIVE_ATTRIBUTES),
                img_attribute_allow_list: AGGRESSIVE_IMG_ATTRIBUTES,
                keep_style_blocks: false,
                keep_stylesheet_links: false,
                forbidden_css_properties: FORBIDDEN_CSS_PROPERTIES,
                forbidden_positions: FORBIDDEN_POSITIONS,
                button_heuristic: false,
                image_strategy: ImageStrategy::PlaceholderOnly,
                placeholder_label_chars: 20,
                placeholder_keeps_layout: false,
            },
            PolicyName::Balanced => Self {
                name,
                forbidden_tags: BASELINE_FORBIDDEN_TAGS,
                attribute_allow_list: None,
                img_attribute_allow_list: &[],
                keep_style_blocks: true,
                keep_stylesheet_links: true,
                forbidden_css_properties: FORBIDDEN_CSS_PROPERTIES,
                forbidden_positions: FORBIDDEN_POSITIONS,
                button_heuristic: false,
                image_strategy: ImageStrategy::ProbeThenProxy,
                placeholder_label_chars: 20,
                placeholder_keeps_layout: false,
            },
            PolicyName::LayoutPreserving => Self {
                name,
                forbidden_tags: BASELINE_FORBIDDEN_TAGS,
                attribute_allow_list: None,
                img_attribute_allow_list: &[],
                keep_style_blocks: true,
                keep_stylesheet_links: true,
                forbidden_css_properties: FORBIDDEN_CSS_PROPERTIES,
                forbidden_positions: FORBIDDEN_POSITIONS,
                button_heuristic: true,
                image_strategy: ImageStrategy::ProbeThenProxy,
                placeholder_label_chars: 30,
                placeholder_keeps_layout: true,
            },
        }
    }

    pub fn forbids_tag(&self, tag: &str) -> bool {
        self.forbidden_tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// Whether attribute `name` on element `tag` passes the allow-list.
    /// Dangerous-attribute checks are separate and apply regardless.
    pub fn allows_attribute(&self, tag: &str, name: &str) -> bool {
        match self.attribute_allow_list {
            None => true,
            Some(list) => {
                name.starts_with("data-")
                    || list.iter().any(|a| a.eq_ignore_ascii_case(name))
                    || (tag.eq_ignore_ascii_case("img")
                        && self
                            .img_attribute_allow_list
                            .iter()
                            .any(|a| a.eq_ignore_ascii_case(name)))
            }
        }
    }
}
