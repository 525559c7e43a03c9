//! CLI binary for qrsweep.
//!
//! A thin shim over the library crate that maps CLI flags to `ScanConfig`,
//! serves page images from a directory (or a single file), and prints the
//! action items a scan produced.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use qrsweep::{
    ActionItem, DynError, PageImageProvider, PixelBuffer, ScanConfig, ScanObserver,
    ScanOrchestrator, ScanPhase, ScanProgress, ScanState,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── Page provider over a directory of images ─────────────────────────────────

/// Serves page pixels from image files on disk, one file per page, in
/// sorted file-name order. Decoding runs on the blocking pool; PNG and
/// JPEG are the supported inputs.
struct DirectoryImageProvider {
    pages: Vec<PathBuf>,
}

#[async_trait]
impl PageImageProvider for DirectoryImageProvider {
    async fn fetch_page(&self, page_number: u32) -> Result<PixelBuffer, DynError> {
        let index = page_number as usize - 1;
        let path = self
            .pages
            .get(index)
            .ok_or_else(|| format!("page {} is out of range", page_number))?
            .clone();
        let image = tokio::task::spawn_blocking(move || image::open(&path)).await??;
        Ok(PixelBuffer::from_rgba_image(image.to_rgba8()))
    }
}

/// Collect the page image files under `input`, sorted by file name.
/// A single-file input becomes a one-page document.
fn list_page_files(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    let entries = std::fs::read_dir(input)
        .with_context(|| format!("Failed to read directory {}", input.display()))?;

    let mut pages: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| {
                    let ext = ext.to_ascii_lowercase();
                    ext == "png" || ext == "jpg" || ext == "jpeg"
                })
                .unwrap_or(false)
        })
        .collect();
    pages.sort();
    Ok(pages)
}

// ── CLI progress observer using indicatif ────────────────────────────────────

/// Terminal progress: a live bar advanced once per page, with a log line
/// for every page that yielded codes and a message swap while paused.
struct CliProgressObserver {
    bar: ProgressBar,
}

impl CliProgressObserver {
    fn new(total_pages: u64) -> Arc<Self> {
        let bar = ProgressBar::new(total_pages);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Scanning");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ScanObserver for CliProgressObserver {
    fn on_state_change(&self, state: &ScanState) {
        match state.phase {
            ScanPhase::Paused => self.bar.set_message("paused".to_string()),
            ScanPhase::Scanning if state.current_page > 0 => {
                self.bar.set_message(format!("page {}", state.current_page));
            }
            _ => {}
        }
    }

    fn on_progress(&self, progress: &ScanProgress) {
        if progress.detections_on_page > 0 {
            self.bar.println(format!(
                "  {} Page {:>3}/{:<3}  {}",
                green("✓"),
                progress.page_number,
                progress.total_pages,
                dim(&format!("{} code(s)", progress.detections_on_page)),
            ));
        }
        self.bar.inc(1);
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Scan a directory of rendered pages (page-001.png, page-002.png, ...)
  qrsweep ./pages/

  # Scan a single image
  qrsweep poster.png

  # JSON report for scripting
  qrsweep --json ./pages/ > report.json

  # Slow renderer output: give each page a bigger budget
  qrsweep --timeout-ms 15000 ./pages/

  # Label the results with a document title
  qrsweep --hint "Q3 invoices" ./pages/

PAGE ORDER:
  Files are scanned in sorted file-name order. Zero-pad page numbers
  (page-001.png, not page-1.png) so page 10 does not sort before page 2.

OUTPUT:
  One line per decoded code:  page, kind, confidence, label, target.
  The target column is directly actionable: a URL, a mailto:/tel: URI,
  or the raw text payload. With --json a full report (session state plus
  items) is written to stdout instead.

ENVIRONMENT VARIABLES:
  QRSWEEP_TIMEOUT_MS   Per-page budget in ms (same as --timeout-ms)
  QRSWEEP_RETRIES      Retries per page (same as --retries)
  QRSWEEP_DELAY_MS     Inter-page delay in ms (same as --delay-ms)
  QRSWEEP_MAX_CODES    Per-document detection cap (same as --max-codes)
  QRSWEEP_HINT         Label prefix for action items (same as --hint)
  RUST_LOG             Overrides the log filter (e.g. RUST_LOG=qrsweep=debug)
"#;

/// Scan rendered document pages for QR codes.
#[derive(Parser, Debug)]
#[command(
    name = "qrsweep",
    version,
    about = "Scan rendered document pages for QR codes",
    long_about = "Walk a directory of rendered page images (or a single image), find QR codes \
on every page, and turn them into actionable links. Pages are scanned in several variants \
(plain, inverted, contrast-equalized) with upscaled region fallbacks, so small or \
light-on-dark codes are found too.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Directory of page images (PNG/JPEG), or a single image file.
    input: PathBuf,

    /// Per-page budget in milliseconds (fetch + decode + materialize).
    #[arg(long, env = "QRSWEEP_TIMEOUT_MS", default_value_t = 5_000)]
    timeout_ms: u64,

    /// Retries per page on a transient failure.
    #[arg(long, env = "QRSWEEP_RETRIES", default_value_t = 2)]
    retries: u32,

    /// Pacing delay between pages in milliseconds. Local files need none.
    #[arg(long, env = "QRSWEEP_DELAY_MS", default_value_t = 0)]
    delay_ms: u64,

    /// Stop accepting codes after this many across the document.
    #[arg(long, env = "QRSWEEP_MAX_CODES", default_value_t = 100)]
    max_codes: usize,

    /// Memory ceiling for cached and in-flight page buffers, in MB.
    #[arg(long, env = "QRSWEEP_MEMORY_LIMIT_MB", default_value_t = 150.0)]
    memory_limit_mb: f64,

    /// Label prefix for the generated action items (e.g. a document title).
    #[arg(long, env = "QRSWEEP_HINT")]
    hint: Option<String>,

    /// Output a structured JSON report instead of the table.
    #[arg(long, env = "QRSWEEP_JSON")]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, env = "QRSWEEP_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "QRSWEEP_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors and results.
    #[arg(short, long, env = "QRSWEEP_QUIET")]
    quiet: bool,
}

/// Everything the JSON report carries: the final session record plus the
/// materialized items, so scripts never need a second query.
#[derive(serde::Serialize)]
struct JsonReport<'a> {
    state: &'a ScanState,
    items: &'a [ActionItem],
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Library INFO logs duplicate what the progress bar already shows, so
    // they are suppressed while the bar is active.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    // ── Collect pages ────────────────────────────────────────────────────
    let pages = list_page_files(&cli.input)?;
    if pages.is_empty() {
        bail!(
            "No PNG or JPEG page images found in {}",
            cli.input.display()
        );
    }
    let total_pages = pages.len() as u32;

    // ── Build config and orchestrator ────────────────────────────────────
    let mut builder = ScanConfig::builder()
        .page_timeout_ms(cli.timeout_ms)
        .max_retries(cli.retries)
        .inter_page_delay_ms(cli.delay_ms)
        .max_total_detections(cli.max_codes)
        .memory_limit_mb(cli.memory_limit_mb);
    if let Some(ref hint) = cli.hint {
        builder = builder.context_hint(hint.clone());
    }
    let config = builder.build().context("Invalid configuration")?;

    let orchestrator = ScanOrchestrator::new(config);

    let observer = if show_progress {
        let observer = CliProgressObserver::new(total_pages as u64);
        orchestrator.subscribe(Arc::clone(&observer) as Arc<dyn ScanObserver>);
        Some(observer)
    } else {
        None
    };

    // Ctrl-C requests a cooperative stop; the session finalises as
    // Aborted and whatever was found so far is still printed.
    let stopper = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            stopper.stop();
        }
    });

    // ── Run the scan ─────────────────────────────────────────────────────
    let started = Instant::now();
    let provider = Arc::new(DirectoryImageProvider { pages });
    let items = orchestrator
        .start_scanning(total_pages, provider)
        .await
        .context("Scan failed to start")?;
    let state = orchestrator.state();

    if let Some(ref observer) = observer {
        observer.finish();
    }

    // ── Report ───────────────────────────────────────────────────────────
    if cli.json {
        let report = JsonReport {
            state: &state,
            items: &items,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
        return Ok(());
    }

    for error in &state.errors {
        eprintln!(
            "  {} {}  {}",
            red("✗"),
            if error.page_number > 0 {
                format!("Page {:>3}", error.page_number)
            } else {
                "Session ".to_string()
            },
            red(&error.message),
        );
    }

    let failed = state.failed_pages().len();
    let elapsed = started.elapsed();
    if !cli.quiet {
        let mark = if state.phase == ScanPhase::Aborted {
            red("✘")
        } else if failed > 0 {
            cyan("⚠")
        } else {
            green("✔")
        };
        eprintln!(
            "{} {} code(s) on {}/{} pages  {}",
            mark,
            bold(&state.found_count.to_string()),
            state.success_count(),
            state.total_pages,
            dim(&format!("{:.1}s", elapsed.as_secs_f64())),
        );
    }

    if !items.is_empty() {
        println!(
            "{:>4}  {:<6} {:>5}  {:<32} {}",
            "PAGE", "KIND", "CONF", "LABEL", "TARGET"
        );
        for item in &items {
            println!(
                "{:>4}  {:<6} {:>5.2}  {:<32} {}",
                item.page_number,
                item.kind.to_string(),
                item.confidence,
                item.label,
                item.target,
            );
        }
    }

    Ok(())
}
