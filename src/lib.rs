//! # qrsweep
//!
//! Find and decode QR codes on every page of a rendered document, with the
//! orchestration needed to survive real documents: slow pages, broken
//! pages, memory pressure, and operators hitting pause.
//!
//! ## Why this crate?
//!
//! Off-the-shelf QR readers are tuned for camera photos: one frame, decent
//! lighting, a code filling a good share of the image. A rendered document
//! page is the opposite case. The code is a few hundred pixels tucked into
//! a corner of a letter-size canvas, sometimes printed light-on-dark, and
//! there are hundreds of pages to get through. `qrsweep` answers both
//! halves of that problem:
//!
//! - a **decode engine** that scans each page in several variants (plain,
//!   inverted, contrast-equalized), upscales the likely regions when the
//!   native pass finds nothing, and deduplicates the hits back in native
//!   page coordinates;
//! - a **scan orchestrator** that walks the document sequentially with a
//!   per-page timeout, retries with backoff, pause/resume, cooperative
//!   stop, a memory ceiling, and a bounded error record, so one bad page
//!   never takes down the run.
//!
//! ## Pipeline Overview
//!
//! ```text
//! document
//!  │
//!  ├─ 1. Provide   host fetches RGBA pixels per page (PageImageProvider)
//!  ├─ 2. Decode    grey plane → plain/inverted/equalized scan passes
//!  │               └─ nothing found? upscale corner/margin regions 2x, 3x
//!  ├─ 3. Filter    dedup by content + proximity, validate payloads
//!  ├─ 4. Act       detections → labelled action items (ResultMaterializer)
//!  └─ 5. Report    ScanState snapshots + progress events to observers
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use qrsweep::{DynError, PageImageProvider, PixelBuffer, ScanConfig, ScanOrchestrator};
//! use std::sync::Arc;
//!
//! /// Serves page pixels; a real host would rasterise its document here.
//! struct Renderer;
//!
//! #[async_trait]
//! impl PageImageProvider for Renderer {
//!     async fn fetch_page(&self, _page_number: u32) -> Result<PixelBuffer, DynError> {
//!         Ok(PixelBuffer::new(612, 792, vec![255; 612 * 792 * 4]))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = ScanOrchestrator::new(ScanConfig::default());
//!     orchestrator.on_progress(|progress| {
//!         eprintln!(
//!             "page {}/{}: {} code(s)",
//!             progress.page_number, progress.total_pages, progress.detections_on_page
//!         );
//!     });
//!
//!     let items = orchestrator.start_scanning(12, Arc::new(Renderer)).await?;
//!     for item in items {
//!         println!("p{} {} -> {}", item.page_number, item.label, item.target);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `qrsweep` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! qrsweep = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod decode;
pub mod error;
mod memory;
pub mod observer;
pub mod orchestrator;
pub mod provider;
pub mod state;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ScanConfig, ScanConfigBuilder};
pub use decode::{
    classify, BoundingBox, ContentKind, DecodeEngine, DecodeOptions, Detection, PixelBuffer,
};
pub use error::{ConfigError, DecodeError, ErrorKind, ScanError};
pub use memory::MemoryProbe;
pub use observer::{NoopObserver, ObserverId, ScanObserver, ScanProgress};
pub use orchestrator::ScanOrchestrator;
pub use provider::{ActionItem, DynError, LinkMaterializer, PageImageProvider, ResultMaterializer};
pub use state::{PageScanOutcome, ScanMetrics, ScanPhase, ScanState};
