//! Progress-callback trait for batch sanitisation events.
//!
//! Inject an [`Arc<dyn BatchProgressCallback>`] via
//! [`crate::config::SanitizeConfigBuilder::progress_callback`] to receive
//! events as [`crate::stream::sanitize_batch`] works through a batch.
//!
//! Callers can forward events to a channel, a job record or a terminal
//! progress bar; the library knows nothing about where they go. The trait is
//! `Send + Sync` because messages are sanitised concurrently.
//!
//! # Example
//!
//! ```rust
//! use mailscribe::{BatchProgressCallback, SanitizeConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: Arc<AtomicUsize>,
//! }
//!
//! impl BatchProgressCallback for CountingCallback {
//!     fn on_message_complete(&self, id: &str, _total: usize, html_len: usize) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{id} done ({html_len} bytes)");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback {
//!     completed: Arc::new(AtomicUsize::new(0)),
//! });
//!
//! let config = SanitizeConfig::builder()
//!     .progress_callback(counter as Arc<dyn BatchProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the batch API as it processes each message.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
///
/// # Thread safety
///
/// `on_message_start`, `on_message_complete` and `on_message_error` may be
/// called concurrently. Protect shared mutable state with `Mutex` or atomics.
pub trait BatchProgressCallback: Send + Sync {
    /// Called once before any message is sanitised.
    fn on_batch_start(&self, total: usize) {
        let _ = total;
    }

    /// Called just before a message enters the pipeline.
    fn on_message_start(&self, id: &str, total: usize) {
        let _ = (id, total);
    }

    /// Called when a message is sanitised.
    ///
    /// # Arguments
    /// * `id` - caller-supplied message id
    /// * `total` - messages in the batch
    /// * `html_len` - byte length of the renderable document
    fn on_message_complete(&self, id: &str, total: usize, html_len: usize) {
        let _ = (id, total, html_len);
    }

    /// Called when a message hits a fatal error.
    fn on_message_error(&self, id: &str, total: usize, error: &str) {
        let _ = (id, total, error);
    }

    /// Called once after every message has been attempted.
    ///
    /// Not called when the stream is dropped early.
    fn on_batch_complete(&self, total: usize, success_count: usize) {
        let _ = (total, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::SanitizeConfig`].
pub type ProgressCallback = Arc<dyn BatchProgressCallback>;
