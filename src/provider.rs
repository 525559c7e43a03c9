//! Integration seams between the scan engine and the host application.
//!
//! The orchestrator never knows where page pixels come from or what a
//! detection turns into. Hosts plug in:
//!
//! - [`PageImageProvider`]: produce the RGBA buffer for a page number
//!   (render a PDF page, read a scanned image from disk, call a service).
//! - [`ResultMaterializer`]: convert an accepted detection into an
//!   [`ActionItem`] the application can act on. [`LinkMaterializer`] is the
//!   built-in implementation that normalises URLs, email addresses and
//!   phone numbers into clickable targets.
//!
//! ## Why boxed errors here?
//!
//! Provider and materializer implementations live in host code with their
//! own error types. Both traits return [`DynError`] so hosts can use `?`
//! directly; the orchestrator wraps whatever comes back into its own error
//! taxonomy (fetch failures become retryable extraction errors,
//! materializer failures are recorded without failing the page).
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use qrsweep::{DynError, PageImageProvider, PixelBuffer};
//!
//! /// Serves a solid white page for every request.
//! struct BlankPages;
//!
//! #[async_trait]
//! impl PageImageProvider for BlankPages {
//!     async fn fetch_page(&self, _page_number: u32) -> Result<PixelBuffer, DynError> {
//!         Ok(PixelBuffer::new(64, 64, vec![255; 64 * 64 * 4]))
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::decode::{classify, BoundingBox, ContentKind, Detection, PixelBuffer};

/// Boxed error type accepted from host-side implementations.
pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Produces the rendered RGBA pixels for a page.
///
/// Page numbers are 1-based and requested sequentially; a page may be
/// requested more than once when an attempt is retried after a transient
/// failure (a small cache in front of the provider absorbs most repeats).
#[async_trait]
pub trait PageImageProvider: Send + Sync {
    async fn fetch_page(&self, page_number: u32) -> Result<PixelBuffer, DynError>;
}

/// Turns an accepted detection into an application-facing action item.
///
/// Called once per detection on a successfully scanned page. A failure
/// here is recorded against the session but does not fail the page; the
/// detection itself is already counted.
#[async_trait]
pub trait ResultMaterializer: Send + Sync {
    async fn materialize(
        &self,
        detection: &Detection,
        page_number: u32,
        context_hint: &str,
    ) -> Result<ActionItem, DynError>;
}

/// An actionable artifact generated from one detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    /// 1-based page the code was found on.
    pub page_number: u32,
    /// Short human-readable label for list views.
    pub label: String,
    /// Normalised target: a URL, `mailto:` or `tel:` URI, or the raw text.
    pub target: String,
    pub kind: ContentKind,
    /// Where on the page the code sits, in native pixels.
    pub region: BoundingBox,
    pub confidence: f32,
}

/// Built-in materializer producing link-style action items.
///
/// Targets are normalised so they can be opened directly: email addresses
/// gain a `mailto:` scheme, phone numbers are reduced to digits behind
/// `tel:`, URLs and plain text pass through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkMaterializer;

#[async_trait]
impl ResultMaterializer for LinkMaterializer {
    async fn materialize(
        &self,
        detection: &Detection,
        page_number: u32,
        context_hint: &str,
    ) -> Result<ActionItem, DynError> {
        let content = detection.content.trim();
        let kind = classify(content);
        let label = build_label(content, kind, context_hint);
        let target = build_target(content, kind);
        Ok(ActionItem {
            page_number,
            label,
            target,
            kind,
            region: detection.bounding_box,
            confidence: detection.confidence,
        })
    }
}

const LABEL_MAX_CHARS: usize = 60;

fn build_label(content: &str, kind: ContentKind, context_hint: &str) -> String {
    let core = match kind {
        ContentKind::Url => shorten(strip_prefix_ci(content, &["https://", "http://"])),
        ContentKind::Email => shorten(strip_prefix_ci(content, &["mailto:"])),
        ContentKind::Phone => shorten(strip_prefix_ci(content, &["tel:"])),
        ContentKind::Text => shorten(content.lines().next().unwrap_or(content)),
    };
    let hint = context_hint.trim();
    if hint.is_empty() {
        core
    } else {
        format!("{hint}: {core}")
    }
}

fn build_target(content: &str, kind: ContentKind) -> String {
    match kind {
        ContentKind::Url | ContentKind::Text => content.to_string(),
        ContentKind::Email => {
            let address = strip_prefix_ci(content, &["mailto:"]);
            format!("mailto:{address}")
        }
        ContentKind::Phone => {
            let digits: String = strip_prefix_ci(content, &["tel:"])
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '+')
                .collect();
            format!("tel:{digits}")
        }
    }
}

/// Strip the first matching prefix, case-insensitively.
fn strip_prefix_ci<'a>(text: &'a str, prefixes: &[&str]) -> &'a str {
    for prefix in prefixes {
        if text.len() >= prefix.len() && text[..prefix.len()].eq_ignore_ascii_case(prefix) {
            return &text[prefix.len()..];
        }
    }
    text
}

fn shorten(text: &str) -> String {
    let mut out = String::new();
    for (index, ch) in text.chars().enumerate() {
        if index == LABEL_MAX_CHARS {
            out.push_str("...");
            return out;
        }
        out.push(ch);
    }
    out
}
