//! # mailscribe
//!
//! Turn untrusted email HTML into a document that is safe to render and
//! stable to screenshot.
//!
//! Email bodies arrive with scripts, tracking pixels, fixed-position
//! banners, CSS animations and images that only load from the sender's CDN.
//! A headless rasterizer pointed at that HTML produces screenshots that
//! differ from run to run, or leaks requests to the sender. This crate
//! rewrites the body so the screenshot shows the message as a reader would
//! see it, deterministically.
//!
//! ## Pipeline Overview
//!
//! ```text
//! raw HTML
//!  │
//!  ├─ 1. Parse    html5ever tree, depth guard
//!  ├─ 2. Strip    scripts, handlers, script URLs, offending style blocks
//!  ├─ 3. Layout   drop positioning and motion CSS, tag CTA buttons
//!  ├─ 4. Images   keep, inline through a relay, or placeholder (network)
//!  └─ 5. Shell    wrap the fragment or inject the head snippet
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mailscribe::{sanitize, PolicyName, SanitizeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SanitizeConfig::default();
//!     let raw = std::fs::read_to_string("message.html")?;
//!     let output = sanitize(&raw, PolicyName::LayoutPreserving, &config).await?;
//!     std::fs::write("render.html", &output.html)?;
//!     eprintln!("{} placeholders", output.stats.images_placeholder);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `mailscribe` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! mailscribe = { version = "0.1", default-features = false }
//! ```
//!
//! ## Choosing a Policy
//!
//! | Policy | Style blocks | Images | Best for |
//! |--------|--------------|--------|----------|
//! | `aggressive`        | removed | placeholders only, no network | Hostile or broken mail |
//! | `balanced`          | kept    | probe, then relays | Default |
//! | `layout-preserving` | kept    | probe, then relays; placeholders keep box styles | Marketing mail with CTA buttons |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod sanitize;
pub mod stream;
pub mod styles;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    ImageStrategy, PolicyName, ProxyEndpoint, SanitizationPolicy, SanitizeConfig,
    SanitizeConfigBuilder,
};
pub use error::{ImageError, SanitizeError};
pub use output::{ImageKind, ImageRef, Resolution, SanitizeOutput, SanitizeStats};
pub use pipeline::fetch::{FetchedBody, HttpFetcher, ImageFetcher};
pub use progress::{BatchProgressCallback, NoopProgressCallback, ProgressCallback};
pub use sanitize::{
    plaintext_fallback, sanitize, sanitize_sync, sanitize_to_file, sanitize_with, write_document,
};
pub use stream::{sanitize_batch, BatchItem, BatchResult, BatchStream};
pub use tokio_util::sync::CancellationToken;
