//! Shared fixtures for the integration suites: synthetic QR pages and
//! scripted collaborators (page providers, observers, memory probes).
//!
//! Pages are real RGBA buffers with QR symbols painted module by module,
//! so the engine under test runs against genuine detector input instead
//! of mocks.

#![allow(dead_code)] // not every suite uses every fixture

use async_trait::async_trait;
use qrcode::{Color, QrCode};
use qrsweep::{
    DynError, MemoryProbe, PageImageProvider, PixelBuffer, ScanObserver, ScanPhase, ScanProgress,
    ScanState,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

// ── Tracing ──────────────────────────────────────────────────────────────────

/// Route crate traces through the libtest capture, so a failing test shows
/// the session log. `RUST_LOG` overrides the default `info` filter. First
/// caller wins; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

// ── Synthetic QR pages ───────────────────────────────────────────────────────

/// Quiet-zone width in modules, per the QR specification.
const QUIET_MODULES: u32 = 4;

pub const WHITE: u8 = 255;
pub const BLACK: u8 = 0;

/// Side length in pixels of the painted symbol, quiet zone included.
pub fn qr_side_px(payload: &str, module_px: u32) -> u32 {
    let code = QrCode::new(payload.as_bytes()).expect("payload must fit in a QR symbol");
    (code.width() as u32 + 2 * QUIET_MODULES) * module_px
}

/// Paint `payload` as a QR symbol onto an RGBA canvas.
///
/// The quiet zone's top-left corner lands at (`left`, `top`); modules are
/// `module_px` pixels square, drawn in `dark` grey over a `light` quiet
/// zone. Panics when the symbol does not fit on the canvas, so a misplaced
/// fixture fails loudly instead of wrapping around a row.
pub fn paint_qr(
    rgba: &mut [u8],
    canvas_width: u32,
    canvas_height: u32,
    payload: &str,
    left: u32,
    top: u32,
    module_px: u32,
    dark: u8,
    light: u8,
) {
    let code = QrCode::new(payload.as_bytes()).expect("payload must fit in a QR symbol");
    let modules = code.to_colors();
    let side = code.width() as u32;
    let total = (side + 2 * QUIET_MODULES) * module_px;
    assert!(
        left + total <= canvas_width && top + total <= canvas_height,
        "QR symbol of {total}px at ({left}, {top}) exceeds the {canvas_width}x{canvas_height} canvas"
    );

    for y in 0..total {
        for x in 0..total {
            put_grey(rgba, canvas_width, left + x, top + y, light);
        }
    }
    for (index, color) in modules.iter().enumerate() {
        if *color != Color::Dark {
            continue;
        }
        let module_x = (index as u32 % side + QUIET_MODULES) * module_px;
        let module_y = (index as u32 / side + QUIET_MODULES) * module_px;
        for dy in 0..module_px {
            for dx in 0..module_px {
                put_grey(rgba, canvas_width, left + module_x + dx, top + module_y + dy, dark);
            }
        }
    }
}

fn put_grey(rgba: &mut [u8], canvas_width: u32, x: u32, y: u32, grey: u8) {
    let offset = (y as usize * canvas_width as usize + x as usize) * 4;
    rgba[offset] = grey;
    rgba[offset + 1] = grey;
    rgba[offset + 2] = grey;
    rgba[offset + 3] = 255;
}

/// A page uniformly filled with one grey level, fully opaque.
pub fn uniform_page(width: u32, height: u32, grey: u8) -> PixelBuffer {
    let mut data = vec![0u8; width as usize * height as usize * 4];
    for pixel in data.chunks_exact_mut(4) {
        pixel[0] = grey;
        pixel[1] = grey;
        pixel[2] = grey;
        pixel[3] = 255;
    }
    PixelBuffer::new(width, height, data)
}

pub fn blank_page(width: u32, height: u32) -> PixelBuffer {
    uniform_page(width, height, WHITE)
}

/// A white page with one black QR symbol per entry:
/// `(payload, left, top, module_px)`.
pub fn page_with_codes(width: u32, height: u32, codes: &[(&str, u32, u32, u32)]) -> PixelBuffer {
    let mut page = blank_page(width, height);
    for &(payload, left, top, module_px) in codes {
        paint_qr(
            &mut page.data,
            width,
            height,
            payload,
            left,
            top,
            module_px,
            BLACK,
            WHITE,
        );
    }
    page
}

// ── Scripted page provider ───────────────────────────────────────────────────

/// Per-page behaviour for a [`ScriptedProvider`]. Pages are 1-based; the
/// script for page `n` lives at index `n - 1`.
pub enum PageScript {
    /// Serve these pixels on every attempt.
    Pixels(PixelBuffer),
    /// Fail every attempt with this message.
    Fail(&'static str),
    /// Fail the first `n` attempts, then serve the pixels.
    FailThenServe(u32, PixelBuffer),
    /// Never resolve; the per-page deadline has to fire.
    Hang,
}

/// Page source driven by a per-page script, counting every fetch attempt
/// so tests can assert exactly how often the orchestrator knocked.
pub struct ScriptedProvider {
    scripts: Vec<PageScript>,
    attempts: Mutex<HashMap<u32, u32>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<PageScript>) -> Arc<Self> {
        Arc::new(Self {
            scripts,
            attempts: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch attempts made for `page_number` so far.
    pub fn attempts_for(&self, page_number: u32) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(&page_number)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl PageImageProvider for ScriptedProvider {
    async fn fetch_page(&self, page_number: u32) -> Result<PixelBuffer, DynError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let counter = attempts.entry(page_number).or_insert(0);
            *counter += 1;
            *counter
        };
        match self.scripts.get(page_number as usize - 1) {
            None => Err(format!("page {page_number} is out of range").into()),
            Some(PageScript::Pixels(buffer)) => Ok(buffer.clone()),
            Some(PageScript::Fail(message)) => Err((*message).to_string().into()),
            Some(PageScript::FailThenServe(failures, buffer)) => {
                if attempt <= *failures {
                    Err(format!("transient failure on attempt {attempt}").into())
                } else {
                    Ok(buffer.clone())
                }
            }
            Some(PageScript::Hang) => {
                std::future::pending::<()>().await;
                unreachable!("pending future resolved")
            }
        }
    }
}

/// Parks every fetch until [`release`](Self::release) is called, then
/// serves a small blank page. Lets a test hold a session mid-page.
pub struct GatedProvider {
    gate: Notify,
}

impl GatedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Notify::new(),
        })
    }

    /// Let one parked (or the next) fetch proceed.
    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl PageImageProvider for GatedProvider {
    async fn fetch_page(&self, _page_number: u32) -> Result<PixelBuffer, DynError> {
        self.gate.notified().await;
        Ok(blank_page(64, 48))
    }
}

// ── Recording observer ───────────────────────────────────────────────────────

/// Records every event it receives for later assertions.
#[derive(Default)]
pub struct RecordingObserver {
    phases: Mutex<Vec<ScanPhase>>,
    state_pages: Mutex<Vec<u32>>,
    progress_pages: Mutex<Vec<u32>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Phase carried by each state-change event, in arrival order.
    pub fn phases(&self) -> Vec<ScanPhase> {
        self.phases.lock().unwrap().clone()
    }

    /// `current_page` carried by each state-change event, in arrival order.
    pub fn state_pages(&self) -> Vec<u32> {
        self.state_pages.lock().unwrap().clone()
    }

    /// Page number of each per-page progress event, in arrival order.
    pub fn progress_pages(&self) -> Vec<u32> {
        self.progress_pages.lock().unwrap().clone()
    }
}

impl ScanObserver for RecordingObserver {
    fn on_state_change(&self, state: &ScanState) {
        self.phases.lock().unwrap().push(state.phase);
        self.state_pages.lock().unwrap().push(state.current_page);
    }

    fn on_progress(&self, progress: &ScanProgress) {
        self.progress_pages.lock().unwrap().push(progress.page_number);
    }
}

// ── Memory probe ─────────────────────────────────────────────────────────────

/// Probe that always reports the same working-set reading.
pub struct FixedProbe(pub f64);

#[async_trait]
impl MemoryProbe for FixedProbe {
    async fn current_usage_mb(&self) -> f64 {
        self.0
    }
}
