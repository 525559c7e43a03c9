//! Scan session orchestration.
//!
//! [`ScanOrchestrator`] walks a document page by page, feeds each page's
//! pixels through the [`DecodeEngine`], and folds the results into a
//! session [`ScanState`] that observers can watch. It owns every
//! resilience concern: the per-page timeout, retries with exponential
//! backoff, pause/resume, cooperative stop, memory-pressure checks, a
//! per-document detection cap, and an early cutoff when consecutive pages
//! keep failing.
//!
//! ```text
//!   start_scanning(total_pages, provider)
//!        │
//!        ▼
//!   ┌─ for each page ─────────────────────────────────────────────┐
//!   │  control gate (parks while paused, exits on stop)           │
//!   │  inter-page delay                                           │
//!   │  detection-cap check ── reached ──► fail page fast          │
//!   │  ┌─ attempt loop ────────────────────────────────────────┐  │
//!   │  │ memory check ── over ──► forced cleanup ──► re-check  │  │
//!   │  │ fetch ► decode ► materialize   (raced vs timeout)     │  │
//!   │  │ transient failure ──► backoff ──► retry               │  │
//!   │  └───────────────────────────────────────────────────────┘  │
//!   │  record outcome, notify observers                           │
//!   └─────────────────────────────────────────────────────────────┘
//!        │
//!        ▼
//!   partial-failure verdict ► Completed / Aborted ► action items
//! ```
//!
//! ## Why a watch channel for control?
//!
//! `pause`, `resume` and `stop` must work from any task without holding a
//! lock across an await point. A `tokio::sync::watch` channel carries the
//! latest control signal; the scan loop consults it at page boundaries and
//! parks on `changed()` while paused, so a paused session costs nothing.
//! Control is deliberately coarse: an in-flight page always runs to its
//! own conclusion, and pause or stop take effect at the next boundary.
//!
//! ## Why a generation counter?
//!
//! [`ScanOrchestrator::reset`] must be able to wipe the session while a
//! loop is still unwinding. Every state write from the loop is tagged with
//! the generation it was started under and silently dropped once `reset`
//! (or a newer session) has bumped the counter, so a stale loop can never
//! pollute a fresh session's record.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::ScanConfig;
use crate::decode::{DecodeEngine, Detection};
use crate::error::{ErrorKind, ScanError};
use crate::memory::{bytes_to_mb, MemoryTracker, PageImageCache};
use crate::observer::{
    notify_progress, notify_state_change, ObserverId, ObserverRegistry, ProgressFn, ScanObserver,
    ScanProgress, StateChangeFn,
};
use crate::provider::{ActionItem, LinkMaterializer, PageImageProvider, ResultMaterializer};
use crate::state::{DurationSamples, PageScanOutcome, ScanPhase, ScanState};

/// Samples kept for the rolling page-time average; trimmed on cleanup.
const METRIC_SAMPLE_WINDOW: usize = 32;

/// Failed pages listed by name in the retry-subset verdict.
const VERDICT_RETRY_LIST: usize = 5;

/// Latest control request, carried to the scan loop by a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Run,
    Pause,
    Stop,
}

/// What the control gate decided at a page boundary.
enum Gate {
    Proceed,
    Stopped,
}

/// How the page loop ended.
enum SessionEnd {
    /// Every page was attempted.
    Natural,
    /// The consecutive-failure cutoff or a fatal error fired.
    StoppedEarly,
    /// Stop was requested or the session was reset underneath the loop.
    Aborted,
}

/// A successful page attempt, before it is folded into the session.
struct PageSuccess {
    detections: Vec<Detection>,
    items: Vec<ActionItem>,
    materialize_errors: Vec<ScanError>,
}

/// Final result of one page, after all retries.
enum PageOutcome {
    Success(PageSuccess),
    Failed(ScanError),
}

struct Shared {
    config: ScanConfig,
    engine: Arc<DecodeEngine>,
    materializer: Arc<dyn ResultMaterializer>,
    state: Mutex<ScanState>,
    observers: Mutex<ObserverRegistry>,
    cache: Mutex<PageImageCache>,
    tracker: MemoryTracker,
    samples: Mutex<DurationSamples>,
    control: watch::Sender<Signal>,
    generation: AtomicU64,
}

/// Drives scan sessions over a document.
///
/// One orchestrator hosts at most one active session at a time; a second
/// [`start_scanning`](Self::start_scanning) call fails without touching
/// the running session. Cloning is cheap and clones share the session,
/// which is how `pause`/`stop` are issued from other tasks while
/// `start_scanning` is being awaited.
#[derive(Clone)]
pub struct ScanOrchestrator {
    shared: Arc<Shared>,
}

impl ScanOrchestrator {
    /// Create an orchestrator with the built-in [`LinkMaterializer`].
    pub fn new(config: ScanConfig) -> Self {
        Self::with_materializer(config, Arc::new(LinkMaterializer))
    }

    /// Create an orchestrator with a custom result materializer.
    pub fn with_materializer(
        config: ScanConfig,
        materializer: Arc<dyn ResultMaterializer>,
    ) -> Self {
        let engine = Arc::new(DecodeEngine::new(config.decode.clone()));
        let cache = PageImageCache::new(config.cache_ttl(), config.cache_capacity);
        let (control, _initial_rx) = watch::channel(Signal::Run);
        Self {
            shared: Arc::new(Shared {
                config,
                engine,
                materializer,
                state: Mutex::new(ScanState::idle()),
                observers: Mutex::new(ObserverRegistry::new()),
                cache: Mutex::new(cache),
                tracker: MemoryTracker::new(),
                samples: Mutex::new(DurationSamples::default()),
                control,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Scan every page of a document and return the materialized results.
    ///
    /// Pages are processed strictly sequentially, `1..=total_pages`. The
    /// call resolves when the session reaches `Completed` or `Aborted`;
    /// partial results gathered before a stop or an early cutoff are still
    /// returned. Per-page failures never fail the call, they are recorded
    /// on the session state (see [`ScanState::errors`]).
    ///
    /// # Arguments
    /// * `total_pages`: number of pages the provider can serve
    /// * `provider`: source of rendered page pixels
    ///
    /// # Returns
    /// The accumulated action items, in page order.
    ///
    /// # Errors
    /// Fails without starting a session when the decode engine is
    /// unusable (`unsupported-environment`) or another session is already
    /// active (`processing-failed`).
    ///
    /// # Example
    /// ```rust,no_run
    /// use async_trait::async_trait;
    /// use qrsweep::{DynError, PageImageProvider, PixelBuffer, ScanConfig, ScanOrchestrator};
    /// use std::sync::Arc;
    ///
    /// struct BlankPages;
    ///
    /// #[async_trait]
    /// impl PageImageProvider for BlankPages {
    ///     async fn fetch_page(&self, _page: u32) -> Result<PixelBuffer, DynError> {
    ///         Ok(PixelBuffer::new(612, 792, vec![255; 612 * 792 * 4]))
    ///     }
    /// }
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let orchestrator = ScanOrchestrator::new(ScanConfig::default());
    /// let items = orchestrator.start_scanning(3, Arc::new(BlankPages)).await?;
    /// println!("{} action item(s)", items.len());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn start_scanning(
        &self,
        total_pages: u32,
        provider: Arc<dyn PageImageProvider>,
    ) -> Result<Vec<ActionItem>, ScanError> {
        // ── Step 1: Pre-flight checks ────────────────────────────────────
        if let Err(unsupported) = self.shared.engine.ensure_supported() {
            warn!("Refusing to scan: {}", unsupported);
            return Err(ScanError::session(
                unsupported.kind(),
                unsupported.to_string(),
            ));
        }

        // ── Step 2: Install the fresh session ────────────────────────────
        // The control signal is updated under the state lock here and in
        // pause/resume/stop, so phase and signal always move together.
        let my_generation = {
            let mut state = self.lock_state();
            if state.phase.is_active() {
                return Err(ScanError::session(
                    ErrorKind::ProcessingFailed,
                    "A scan session is already in progress",
                ));
            }
            *state = ScanState::fresh(total_pages);
            self.shared.control.send_replace(Signal::Run);
            self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        info!("Starting scan session: {} page(s)", total_pages);
        self.notify_state();

        // ── Step 3: Page loop ────────────────────────────────────────────
        let mut control_rx = self.shared.control.subscribe();
        let mut items: Vec<ActionItem> = Vec::new();
        let mut consecutive_failures: u32 = 0;
        let mut end = SessionEnd::Natural;

        'pages: for page_number in 1..=total_pages {
            if self.stale(my_generation) {
                end = SessionEnd::Aborted;
                break 'pages;
            }

            // Control gate. Parks here while paused; wakes on resume or stop.
            if let Gate::Stopped = self.wait_until_runnable(&mut control_rx).await {
                end = SessionEnd::Aborted;
                break 'pages;
            }

            // Pacing gap between pages, skipped before the first page. A
            // pause or stop issued during the gap is honoured before any
            // work starts on the next page.
            if page_number > 1 && self.shared.config.inter_page_delay_ms > 0 {
                sleep(self.shared.config.inter_page_delay()).await;
                if let Gate::Stopped = self.wait_until_runnable(&mut control_rx).await {
                    end = SessionEnd::Aborted;
                    break 'pages;
                }
            }

            let page_started = Instant::now();
            if !self.advance_to_page(my_generation, page_number) {
                end = SessionEnd::Aborted;
                break 'pages;
            }

            // Detection cap: once reached, remaining pages fail fast
            // without fetching any pixels.
            let cap = self.shared.config.max_total_detections;
            let capped = self.lock_state().found_count >= cap;
            let outcome = if capped {
                warn!(
                    "Detection cap of {} reached; failing page {} without scanning",
                    cap, page_number
                );
                PageOutcome::Failed(ScanError::new(
                    ErrorKind::DocumentLimitExceeded,
                    page_number,
                    format!("Detection cap of {} reached; page not scanned", cap),
                ))
            } else {
                self.scan_page(my_generation, page_number, &provider).await
            };

            let elapsed_ms = page_started.elapsed().as_millis() as u64;
            self.record_page_duration(my_generation, elapsed_ms);

            match outcome {
                PageOutcome::Success(success) => {
                    consecutive_failures = 0;
                    let PageSuccess {
                        detections,
                        items: page_items,
                        materialize_errors,
                    } = success;
                    let found = detections.len();
                    let generated = page_items.len();
                    if found > 0 {
                        info!(
                            "Page {}/{}: {} code(s) found",
                            page_number, total_pages, found
                        );
                    } else {
                        debug!("Page {}/{}: no codes", page_number, total_pages);
                    }
                    items.extend(page_items);
                    self.record_success(
                        my_generation,
                        page_number,
                        detections,
                        generated,
                        materialize_errors,
                    );
                }
                PageOutcome::Failed(error) => {
                    warn!("Page {}/{} failed: {}", page_number, total_pages, error);
                    let fatal = error.kind.is_fatal();
                    consecutive_failures += 1;
                    self.record_failure(my_generation, page_number, error);
                    if fatal {
                        end = SessionEnd::StoppedEarly;
                        break 'pages;
                    }
                    if consecutive_failures >= self.shared.config.max_consecutive_failures {
                        warn!(
                            "{} consecutive page failures; stopping the session early",
                            consecutive_failures
                        );
                        end = SessionEnd::StoppedEarly;
                        break 'pages;
                    }
                }
            }

            if page_number % self.shared.config.cleanup_interval_pages == 0 {
                self.periodic_cleanup();
            }
        }

        // ── Step 4: Finalise the session ─────────────────────────────────
        let aborted = matches!(end, SessionEnd::Aborted);
        let stopped_early = matches!(end, SessionEnd::StoppedEarly);
        let average_ms = self.lock_samples().average_ms();

        let final_snapshot = {
            let mut state = self.lock_state();
            if self.stale(my_generation) {
                // The session was reset underneath the loop; its record is
                // gone, but the gathered items still belong to the caller.
                return Ok(items);
            }
            let failed = state.failed_pages();
            if !failed.is_empty() {
                let verdict = partial_failure_verdict(&failed, total_pages, state.success_count());
                let message = if stopped_early {
                    format!(
                        "Stopped early after {} consecutive page failures. {}",
                        self.shared.config.max_consecutive_failures, verdict
                    )
                } else {
                    verdict
                };
                // The summary is the one error that must survive even when
                // the bounded list already filled up.
                state
                    .errors
                    .push(ScanError::session(ErrorKind::PartialFailure, message));
            }
            state.metrics.average_page_scan_time_ms = average_ms;
            state.completed_at = Some(SystemTime::now());
            state.phase = if aborted {
                ScanPhase::Aborted
            } else {
                ScanPhase::Completed
            };
            state.clone()
        };

        info!(
            "Scan {}: {} detection(s), {} action item(s), {}/{} page(s) succeeded, {} error(s)",
            if aborted { "aborted" } else { "complete" },
            final_snapshot.found_count,
            final_snapshot.generated_count,
            final_snapshot.success_count(),
            total_pages,
            final_snapshot.errors.len(),
        );
        let observers = self.observers_snapshot();
        notify_state_change(&observers, &final_snapshot);
        Ok(items)
    }

    /// Request a pause. Takes effect at the next page boundary; the page
    /// in flight completes first. Returns `false` unless the session was
    /// actively scanning.
    pub fn pause(&self) -> bool {
        let snapshot = {
            let mut state = self.lock_state();
            if state.phase != ScanPhase::Scanning {
                return false;
            }
            state.phase = ScanPhase::Paused;
            self.shared.control.send_replace(Signal::Pause);
            state.clone()
        };
        info!("Scan paused at page {}", snapshot.current_page);
        let observers = self.observers_snapshot();
        notify_state_change(&observers, &snapshot);
        true
    }

    /// Resume a paused session at the next unprocessed page. Returns
    /// `false` unless the session was paused.
    pub fn resume(&self) -> bool {
        let snapshot = {
            let mut state = self.lock_state();
            if state.phase != ScanPhase::Paused {
                return false;
            }
            state.phase = ScanPhase::Scanning;
            self.shared.control.send_replace(Signal::Run);
            state.clone()
        };
        info!("Scan resumed at page {}", snapshot.current_page);
        let observers = self.observers_snapshot();
        notify_state_change(&observers, &snapshot);
        true
    }

    /// Request a cooperative stop. The loop exits at the next page
    /// boundary (immediately when parked in pause) and the session
    /// finalises as `Aborted` with partial results. Returns `false` when
    /// no session is active.
    pub fn stop(&self) -> bool {
        {
            let state = self.lock_state();
            if !state.phase.is_active() {
                return false;
            }
            self.shared.control.send_replace(Signal::Stop);
        }
        info!("Scan stop requested");
        true
    }

    /// Discard the session record and cached buffers, returning to `Idle`.
    ///
    /// Safe to call while a session is running: the loop is told to stop
    /// and any writes it still makes are dropped, so a session started
    /// after the reset begins from a clean record.
    pub fn reset(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.lock_state();
            self.shared.control.send_replace(Signal::Stop);
            *state = ScanState::idle();
        }
        self.lock_cache().clear();
        info!("Scan session reset");
        self.notify_state();
    }

    /// Snapshot of the current session state.
    pub fn state(&self) -> ScanState {
        self.lock_state().clone()
    }

    /// Current phase, without copying the whole record.
    pub fn phase(&self) -> ScanPhase {
        self.lock_state().phase
    }

    /// Attach an observer. Events arrive in subscription order.
    pub fn subscribe(&self, observer: Arc<dyn ScanObserver>) -> ObserverId {
        self.lock_observers().subscribe(observer)
    }

    /// Detach a previously subscribed observer.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.lock_observers().unsubscribe(id)
    }

    /// Closure shorthand for state-change events.
    pub fn on_state_change<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&ScanState) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(StateChangeFn(callback)))
    }

    /// Closure shorthand for per-page progress events.
    pub fn on_progress<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&ScanProgress) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(ProgressFn(callback)))
    }

    // ── Page machinery ───────────────────────────────────────────────────

    /// One page, with retries. Memory pressure is re-checked before every
    /// attempt; the fetch/decode/materialize unit is raced against the
    /// page timeout. Timeouts are final, transient failures back off and
    /// retry up to `max_retries`.
    async fn scan_page(
        &self,
        my_generation: u64,
        page_number: u32,
        provider: &Arc<dyn PageImageProvider>,
    ) -> PageOutcome {
        let config = &self.shared.config;
        let mut attempt: u32 = 0;
        loop {
            if let Some(error) = self.check_memory(my_generation, page_number, attempt).await {
                return PageOutcome::Failed(error);
            }

            match timeout(config.page_timeout(), self.attempt_page(page_number, provider)).await {
                Err(_elapsed) => {
                    return PageOutcome::Failed(ScanError::with_retries(
                        ErrorKind::Timeout,
                        page_number,
                        format!(
                            "Page attempt exceeded the {} ms deadline",
                            config.page_timeout_ms
                        ),
                        attempt,
                    ));
                }
                Ok(Ok(success)) => return PageOutcome::Success(success),
                Ok(Err(mut error)) => {
                    if error.kind.is_retryable() && attempt < config.max_retries {
                        let delay = config.backoff_delay(attempt);
                        warn!(
                            "Page {} attempt {} failed ({}); retrying in {} ms",
                            page_number,
                            attempt + 1,
                            error,
                            delay.as_millis()
                        );
                        attempt += 1;
                        self.bump_retry_metric(my_generation);
                        sleep(delay).await;
                        continue;
                    }
                    error.retry_count = attempt;
                    return PageOutcome::Failed(error);
                }
            }
        }
    }

    /// One attempt: fetch pixels (cache first), decode on the blocking
    /// pool, materialize each detection. A full pixel pass over a page
    /// takes tens of milliseconds, so the decode runs off the async
    /// runtime to keep timers and control responsive.
    async fn attempt_page(
        &self,
        page_number: u32,
        provider: &Arc<dyn PageImageProvider>,
    ) -> Result<PageSuccess, ScanError> {
        let cached = self.lock_cache().get(page_number);
        let buffer = match cached {
            Some(buffer) => {
                debug!("Page {} image served from cache", page_number);
                buffer
            }
            None => {
                let fetched = provider.fetch_page(page_number).await.map_err(|source| {
                    ScanError::new(
                        ErrorKind::ImageExtractionFailed,
                        page_number,
                        format!("Failed to extract page image: {}", source),
                    )
                })?;
                let buffer = Arc::new(fetched);
                self.lock_cache().insert(page_number, Arc::clone(&buffer));
                buffer
            }
        };

        let _reservation = self.shared.tracker.reserve(buffer.byte_len());

        let engine = Arc::clone(&self.shared.engine);
        let decode_buffer = Arc::clone(&buffer);
        let decoded = tokio::task::spawn_blocking(move || engine.decode(&decode_buffer))
            .await
            .map_err(|join_error| {
                ScanError::new(
                    ErrorKind::ProcessingFailed,
                    page_number,
                    format!("Decode task failed: {}", join_error),
                )
            })?;
        let detections = decoded.map_err(|decode_error| {
            ScanError::new(decode_error.kind(), page_number, decode_error.to_string())
        })?;

        let hint = self.shared.config.context_hint.as_deref().unwrap_or("");
        let mut page_items = Vec::with_capacity(detections.len());
        let mut materialize_errors = Vec::new();
        for detection in &detections {
            match self
                .shared
                .materializer
                .materialize(detection, page_number, hint)
                .await
            {
                Ok(item) => page_items.push(item),
                Err(source) => {
                    warn!(
                        "Failed to materialize a detection on page {}: {}",
                        page_number, source
                    );
                    materialize_errors.push(ScanError::new(
                        ErrorKind::InvalidContent,
                        page_number,
                        format!("Failed to materialize detection: {}", source),
                    ));
                }
            }
        }

        Ok(PageSuccess {
            detections,
            items: page_items,
            materialize_errors,
        })
    }

    /// Memory-pressure check with one forced cleanup between the two
    /// measurements. Returns the final, non-retryable page error when the
    /// working set stays over the limit.
    async fn check_memory(
        &self,
        my_generation: u64,
        page_number: u32,
        attempt: u32,
    ) -> Option<ScanError> {
        let limit = self.shared.config.memory_limit_mb;
        let mut usage = self.current_memory_mb().await;
        self.note_memory_usage(my_generation, usage);
        if usage <= limit {
            return None;
        }

        warn!(
            "Memory usage {:.1} MB exceeds the {:.1} MB limit; forcing cleanup",
            usage, limit
        );
        let freed = self.lock_cache().clear();
        debug!(
            "Forced cleanup dropped {:.1} MB of cached pages",
            bytes_to_mb(freed)
        );

        usage = self.current_memory_mb().await;
        self.note_memory_usage(my_generation, usage);
        if usage <= limit {
            return None;
        }
        Some(ScanError::with_retries(
            ErrorKind::MemoryPressure,
            page_number,
            format!(
                "Memory usage {:.1} MB still exceeds the {:.1} MB limit after cleanup",
                usage, limit
            ),
            attempt,
        ))
    }

    async fn current_memory_mb(&self) -> f64 {
        match self.shared.config.memory_probe.as_ref() {
            Some(probe) => probe.current_usage_mb().await,
            None => {
                let cached = self.lock_cache().bytes();
                bytes_to_mb(cached + self.shared.tracker.in_use_bytes())
            }
        }
    }

    /// Park until the control signal allows work. `Proceed` also covers
    /// the resume-after-pause path; phase bookkeeping is done by the
    /// `pause`/`resume` calls themselves.
    async fn wait_until_runnable(&self, control: &mut watch::Receiver<Signal>) -> Gate {
        loop {
            let signal = *control.borrow_and_update();
            match signal {
                Signal::Run => return Gate::Proceed,
                Signal::Stop => return Gate::Stopped,
                Signal::Pause => {
                    if control.changed().await.is_err() {
                        return Gate::Stopped;
                    }
                }
            }
        }
    }

    // ── Session bookkeeping ──────────────────────────────────────────────

    /// Move `current_page` forward and notify. Returns `false` when the
    /// session was reset underneath the loop.
    fn advance_to_page(&self, my_generation: u64, page_number: u32) -> bool {
        let snapshot = {
            let mut state = self.lock_state();
            if self.stale(my_generation) {
                return false;
            }
            state.current_page = page_number;
            state.clone()
        };
        debug!("Scanning page {}/{}", page_number, snapshot.total_pages);
        let observers = self.observers_snapshot();
        notify_state_change(&observers, &snapshot);
        true
    }

    fn record_success(
        &self,
        my_generation: u64,
        page_number: u32,
        detections: Vec<Detection>,
        generated: usize,
        materialize_errors: Vec<ScanError>,
    ) {
        let (snapshot, progress) = {
            let mut state = self.lock_state();
            if self.stale(my_generation) {
                return;
            }
            let found_on_page = detections.len();
            state.record_outcome(
                PageScanOutcome {
                    page_number,
                    detections,
                    error: None,
                },
                generated,
            );
            let max_retained = self.shared.config.max_errors_retained;
            for error in materialize_errors {
                state.push_error(error, max_retained);
            }
            let progress = ScanProgress {
                page_number,
                total_pages: state.total_pages,
                detections_on_page: found_on_page,
                found_count: state.found_count,
                generated_count: state.generated_count,
            };
            (state.clone(), progress)
        };
        let observers = self.observers_snapshot();
        notify_state_change(&observers, &snapshot);
        notify_progress(&observers, &progress);
    }

    fn record_failure(&self, my_generation: u64, page_number: u32, error: ScanError) {
        let (snapshot, progress) = {
            let mut state = self.lock_state();
            if self.stale(my_generation) {
                return;
            }
            if error.kind == ErrorKind::Timeout {
                state.metrics.timeout_count += 1;
            }
            state.record_outcome(
                PageScanOutcome {
                    page_number,
                    detections: Vec::new(),
                    error: Some(error.clone()),
                },
                0,
            );
            state.push_error(error, self.shared.config.max_errors_retained);
            let progress = ScanProgress {
                page_number,
                total_pages: state.total_pages,
                detections_on_page: 0,
                found_count: state.found_count,
                generated_count: state.generated_count,
            };
            (state.clone(), progress)
        };
        let observers = self.observers_snapshot();
        notify_state_change(&observers, &snapshot);
        notify_progress(&observers, &progress);
    }

    fn record_page_duration(&self, my_generation: u64, elapsed_ms: u64) {
        let average_ms = {
            let mut samples = self.lock_samples();
            samples.push(elapsed_ms);
            samples.average_ms()
        };
        let mut state = self.lock_state();
        if self.stale(my_generation) {
            return;
        }
        state.metrics.average_page_scan_time_ms = average_ms;
    }

    fn note_memory_usage(&self, my_generation: u64, usage_mb: f64) {
        let mut state = self.lock_state();
        if self.stale(my_generation) {
            return;
        }
        state.metrics.memory_usage_mb = usage_mb;
    }

    fn bump_retry_metric(&self, my_generation: u64) {
        let mut state = self.lock_state();
        if self.stale(my_generation) {
            return;
        }
        state.metrics.retry_count += 1;
    }

    fn periodic_cleanup(&self) {
        let expired = self.lock_cache().purge_expired();
        self.lock_samples().trim(METRIC_SAMPLE_WINDOW);
        if expired > 0 {
            debug!("Periodic cleanup: dropped {} expired page buffer(s)", expired);
        }
    }

    fn notify_state(&self) {
        let snapshot = self.lock_state().clone();
        let observers = self.observers_snapshot();
        notify_state_change(&observers, &snapshot);
    }

    fn observers_snapshot(&self) -> Vec<Arc<dyn ScanObserver>> {
        self.lock_observers().snapshot()
    }

    fn stale(&self, my_generation: u64) -> bool {
        self.shared.generation.load(Ordering::SeqCst) != my_generation
    }

    fn lock_state(&self) -> MutexGuard<'_, ScanState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_observers(&self) -> MutexGuard<'_, ObserverRegistry> {
        self.shared
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cache(&self) -> MutexGuard<'_, PageImageCache> {
        self.shared
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_samples(&self) -> MutexGuard<'_, DurationSamples> {
        self.shared
            .samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Descriptive verdict over the failed pages of a finished session.
///
/// Thresholds are on the failed share of the whole document: above one
/// half the document looks unscannable, between one fifth and one half a
/// bounded re-run of the first few failed pages is worthwhile, and at one
/// fifth or below the failures are treated as skipped pages.
pub(crate) fn partial_failure_verdict(
    failed_pages: &[u32],
    total_pages: u32,
    success_count: usize,
) -> String {
    let failed = failed_pages.len();
    let ratio = if total_pages == 0 {
        0.0
    } else {
        failed as f64 / total_pages as f64
    };
    let percent = ratio * 100.0;

    if ratio > 0.5 {
        format!(
            "{} of {} pages failed ({:.0}%); failure rate too high, \
             check the document and the image provider before rescanning",
            failed, total_pages, percent
        )
    } else if ratio > 0.2 {
        let retry_list = failed_pages
            .iter()
            .take(VERDICT_RETRY_LIST)
            .map(|page| page.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "{} of {} pages failed ({:.0}%) while {} succeeded; \
             consider retrying pages {}",
            failed, total_pages, percent, success_count, retry_list
        )
    } else {
        format!(
            "{} of {} pages failed ({:.0}%); failed pages were skipped \
             and partial results returned",
            failed, total_pages, percent
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_recommends_stop_over_half() {
        let message = partial_failure_verdict(&[1, 2, 3, 4, 5, 6], 10, 4);
        assert!(message.contains("6 of 10 pages failed (60%)"));
        assert!(message.contains("failure rate too high"));
    }

    #[test]
    fn verdict_recommends_subset_retry_at_exactly_half() {
        let message = partial_failure_verdict(&[1, 2, 3, 4, 5], 10, 5);
        assert!(message.contains("50%"));
        assert!(message.contains("consider retrying pages 1, 2, 3, 4, 5"));
    }

    #[test]
    fn verdict_lists_at_most_five_retry_pages() {
        let message = partial_failure_verdict(&[2, 3, 4, 5, 6, 7], 15, 9);
        assert!(message.contains("consider retrying pages 2, 3, 4, 5, 6"));
        assert!(!message.contains("7"));
    }

    #[test]
    fn verdict_treats_exactly_one_fifth_as_skippable() {
        let message = partial_failure_verdict(&[3, 8], 10, 8);
        assert!(message.contains("2 of 10 pages failed (20%)"));
        assert!(message.contains("skipped"));
    }

    #[test]
    fn verdict_skip_bucket_for_rare_failures() {
        let message = partial_failure_verdict(&[17], 50, 49);
        assert!(message.contains("1 of 50 pages failed (2%)"));
        assert!(message.contains("partial results returned"));
    }
}
