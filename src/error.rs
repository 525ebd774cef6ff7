//! Error types for the mailscribe library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`SanitizeError`]: **Fatal**, the document cannot be turned into a
//!   renderable page at all (input over the size ceiling, serialisation
//!   failure, invalid configuration). Returned as `Err(SanitizeError)` from
//!   the top-level `sanitize*` functions. Callers treat it as "unable to
//!   screenshot this email" and substitute a plaintext rendition.
//!
//! * [`ImageError`]: **Non-fatal**, one image could not be fetched through
//!   one route (probe timeout, proxy 500, body that is not an image). Stored
//!   inside [`crate::output::ImageRef`] so callers can audit why an image
//!   became a placeholder. The document itself always completes.
//!
//! Malformed markup and hostile constructs are neither: the parser accepts
//! anything, and the stripper removes threats silently.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the mailscribe library.
///
/// Image-level failures use [`ImageError`] and are stored in
/// [`crate::output::ImageRef`] rather than propagated here.
#[derive(Debug, Error)]
pub enum SanitizeError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input exceeds the configured ceiling and is refused before parsing.
    #[error("Input is {size} bytes, above the {limit}-byte limit\nRaise max_input_bytes or render the plaintext fallback instead.")]
    InputTooLarge { size: usize, limit: usize },

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// The cleaned tree could not be serialised back to HTML.
    #[error("Failed to serialise sanitised document: {0}")]
    Serialize(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output HTML file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single image fetch attempt.
///
/// Every failed attempt (the direct probe and each proxy) contributes one
/// entry to [`crate::output::ImageRef::errors`], in attempt order.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageError {
    /// The attempt did not finish inside its timeout.
    #[error("'{url}': timed out after {ms}ms")]
    Timeout { url: String, ms: u64 },

    /// The server answered with a non-success status.
    #[error("'{url}': HTTP {status}")]
    Status { url: String, status: u16 },

    /// Connection, TLS or body-read failure.
    #[error("'{url}': transport error: {detail}")]
    Transport { url: String, detail: String },

    /// The body was fetched but does not decode as a raster image.
    #[error("'{url}': response is not a usable image")]
    NotAnImage { url: String },

    /// The body exceeded the configured image size limit.
    #[error("'{url}': image is {size} bytes, above the {limit}-byte limit")]
    TooLarge { url: String, size: usize, limit: usize },

    /// The caller cancelled image resolution.
    #[error("image resolution cancelled")]
    Cancelled,
}

impl ImageError {
    /// URL of the failed attempt, when the error concerns one.
    pub fn url(&self) -> Option<&str> {
        match self {
            ImageError::Timeout { url, .. }
            | ImageError::Status { url, .. }
            | ImageError::Transport { url, .. }
            | ImageError::NotAnImage { url }
            | ImageError::TooLarge { url, .. } => Some(url),
            ImageError::Cancelled => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_too_large_display() {
        let e = SanitizeError::InputTooLarge {
            size: 30_000_000,
            limit: 26_214_400,
        };
        let msg = e.to_string();
        assert!(msg.contains("30000000"), "got: {msg}");
        assert!(msg.contains("26214400"), "got: {msg}");
    }

    #[test]
    fn timeout_display() {
        let e = ImageError::Timeout {
            url: "https://cdn.example.com/a.png".into(),
            ms: 3000,
        };
        assert!(e.to_string().contains("3000ms"));
        assert_eq!(e.url(), Some("https://cdn.example.com/a.png"));
    }

    #[test]
    fn status_display() {
        let e = ImageError::Status {
            url: "https://proxy.example/x".into(),
            status: 500,
        };
        assert!(e.to_string().contains("HTTP 500"));
    }

    #[test]
    fn cancelled_has_no_url() {
        assert_eq!(ImageError::Cancelled.url(), None);
    }

    #[test]
    fn image_error_serialises_with_kind_tag() {
        let e = ImageError::NotAnImage {
            url: "https://x.test/y".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"kind\":\"not_an_image\""), "got: {json}");
        let back: ImageError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
