//! Batch API: sanitise many messages, yielding each as it completes.
//!
//! An audit run renders hundreds of messages. [`sanitize_batch`] keeps at
//! most `config.concurrency` documents in flight and yields [`BatchResult`]
//! items in completion order (sort by `id` if order matters). A fatal error
//! on one message is reported in its result and never stops the batch.

use crate::config::{PolicyName, SanitizeConfig};
use crate::error::SanitizeError;
use crate::output::SanitizeOutput;
use crate::sanitize::{plaintext_fallback, sanitize};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_stream::Stream;
use tracing::{info, warn};

/// One message to sanitise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    /// Caller-chosen identifier echoed in the result.
    pub id: String,
    /// HTML body, if the message has one.
    pub html: Option<String>,
    /// Plaintext body, used when `html` is absent.
    pub text: Option<String>,
}

impl BatchItem {
    /// A message with an HTML body.
    pub fn html(id: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            html: Some(html.into()),
            text: None,
        }
    }

    /// A plaintext-only message.
    pub fn text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            html: None,
            text: Some(text.into()),
        }
    }

    /// The sanitiser input: the HTML body, or the plaintext fallback.
    pub fn body(&self) -> String {
        match &self.html {
            Some(html) => html.clone(),
            None => plaintext_fallback(self.text.as_deref().unwrap_or_default()),
        }
    }
}

/// Outcome for one [`BatchItem`].
#[derive(Debug)]
pub struct BatchResult {
    pub id: String,
    pub output: Result<SanitizeOutput, SanitizeError>,
}

/// A boxed stream of batch results.
pub type BatchStream = Pin<Box<dyn Stream<Item = BatchResult> + Send>>;

/// Sanitise `items` with at most `config.concurrency` in flight.
///
/// Dropping the stream drops the in-flight work; cancel the config's
/// `CancellationToken` to abort image fetches while still draining results.
///
/// # Example
/// ```rust,no_run
/// use mailscribe::{sanitize_batch, BatchItem, PolicyName, SanitizeConfig};
/// use futures::StreamExt;
///
/// # #[tokio::main]
/// # async fn main() {
/// let items = vec![
///     BatchItem::html("m1", "<p>Hello</p>"),
///     BatchItem::text("m2", "plain body"),
/// ];
/// let mut results = sanitize_batch(items, PolicyName::Balanced, &SanitizeConfig::default());
/// while let Some(r) = results.next().await {
///     match r.output {
///         Ok(out) => println!("{}: {} bytes", r.id, out.html.len()),
///         Err(e) => eprintln!("{}: {e}", r.id),
///     }
/// }
/// # }
/// ```
pub fn sanitize_batch(
    items: Vec<BatchItem>,
    policy: PolicyName,
    config: &SanitizeConfig,
) -> BatchStream {
    let total = items.len();
    let concurrency = config.concurrency.max(1);
    let config = Arc::new(config.clone());
    let successes = Arc::new(AtomicUsize::new(0));
    info!(total, concurrency, %policy, "Starting batch");

    if let Some(ref cb) = config.progress_callback {
        cb.on_batch_start(total);
    }

    let work = {
        let config = Arc::clone(&config);
        let successes = Arc::clone(&successes);
        stream::iter(items.into_iter().map(move |item| {
            let config = Arc::clone(&config);
            let successes = Arc::clone(&successes);
            async move {
                if let Some(ref cb) = config.progress_callback {
                    cb.on_message_start(&item.id, total);
                }
                let output = sanitize(&item.body(), policy, &config).await;
                match &output {
                    Ok(out) => {
                        successes.fetch_add(1, Ordering::SeqCst);
                        if let Some(ref cb) = config.progress_callback {
                            cb.on_message_complete(&item.id, total, out.html.len());
                        }
                    }
                    Err(e) => {
                        warn!(id = %item.id, error = %e, "Message failed");
                        if let Some(ref cb) = config.progress_callback {
                            cb.on_message_error(&item.id, total, &e.to_string());
                        }
                    }
                }
                BatchResult {
                    id: item.id,
                    output,
                }
            }
        }))
        .buffer_unordered(concurrency)
    };

    let finish = stream::once(async move {
        let ok = successes.load(Ordering::SeqCst);
        info!(total, succeeded = ok, "Batch complete");
        if let Some(ref cb) = config.progress_callback {
            cb.on_batch_complete(total, ok);
        }
    })
    .filter_map(|()| async { None::<BatchResult> });

    Box::pin(work.chain(finish))
}
