//! Pipeline stages for email HTML sanitisation.
//!
//! Each submodule implements exactly one transformation step, driven by a
//! [`crate::config::SanitizationPolicy`]. Keeping stages separate makes each
//! independently testable; the three policies are the same stages with
//! different parameters.
//!
//! ## Data Flow
//!
//! ```text
//! dom ──▶ threats ──▶ layout ──▶ images ──▶ shell
//! (parse)  (strip)    (CSS)      (resolve)  (wrap)
//! ```
//!
//! 1. [`dom`]     parse into a mutable tree, prune pathological depth
//! 2. [`threats`] remove scripts, handlers, script URLs, offending styles
//! 3. [`layout`]  drop positioning and motion CSS; tag CTA [`buttons`]
//! 4. [`images`]  classify and resolve every `<img>`; the only stage with
//!    network I/O ([`fetch`], validated by [`encode`])
//! 5. [`shell`]   wrap in a fixed document or inject the head snippet
//!
//! [`css`] holds the declaration-level helpers shared by stages 2 and 3.

pub mod buttons;
pub mod css;
pub mod dom;
pub mod encode;
pub mod fetch;
pub mod images;
pub mod layout;
pub mod shell;
pub mod threats;
