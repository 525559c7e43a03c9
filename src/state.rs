//! Session state: phases, per-page outcomes, metrics, and the scan record.
//!
//! ## Why a session-scoped record?
//!
//! Everything the orchestrator learns during one scan lives in a single
//! [`ScanState`] value owned by that session: phase, cursor, counters, the
//! append-only error list, and per-page outcomes. Observers receive cloned
//! snapshots; nothing global survives the session. This keeps two scans of
//! the same orchestrator (one after the other) from leaking history into
//! each other, and makes the record trivially serializable for reports.

use std::time::SystemTime;

use crate::decode::Detection;
use crate::error::ScanError;

/// Lifecycle phase of a scan session.
///
/// Transitions: `Idle → Scanning ⇄ Paused`, exiting to `Completed` (document
/// exhausted or stopped early on repeated failure) or `Aborted` (cancelled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanPhase {
    Idle,
    Scanning,
    Paused,
    Completed,
    Aborted,
}

impl ScanPhase {
    /// A session in this phase still owns the page loop.
    pub fn is_active(&self) -> bool {
        matches!(self, ScanPhase::Scanning | ScanPhase::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanPhase::Completed | ScanPhase::Aborted)
    }
}

impl std::fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScanPhase::Idle => "idle",
            ScanPhase::Scanning => "scanning",
            ScanPhase::Paused => "paused",
            ScanPhase::Completed => "completed",
            ScanPhase::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Result of one page attempt, immutable once produced.
///
/// A page with zero detections and no error is a perfectly ordinary outcome
/// (most document pages carry no code at all).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PageScanOutcome {
    /// 1-based page number.
    pub page_number: u32,
    pub detections: Vec<Detection>,
    /// Final classified error if the page failed after retries.
    pub error: Option<ScanError>,
}

impl PageScanOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Incrementally folded session metrics.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ScanMetrics {
    /// Mean duration of the whole per-page unit (all attempts plus their
    /// backoff waits), over the retained sample window.
    pub average_page_scan_time_ms: f64,
    /// Last observed working-set reading from the memory probe.
    pub memory_usage_mb: f64,
    /// Pages whose final error was a deadline miss.
    pub timeout_count: u32,
    /// Extra attempts consumed across the session.
    pub retry_count: u32,
}

/// Bounded window of per-page durations feeding the running average.
///
/// Cleanup passes trim the window so a very long document does not retain
/// one sample per page forever.
#[derive(Debug, Clone, Default)]
pub(crate) struct DurationSamples {
    samples: Vec<u64>,
}

impl DurationSamples {
    pub(crate) fn push(&mut self, millis: u64) {
        self.samples.push(millis);
    }

    /// Mean over the retained window, 0.0 when empty.
    pub(crate) fn average_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.samples.iter().sum();
        sum as f64 / self.samples.len() as f64
    }

    /// Keep only the newest `max` samples.
    pub(crate) fn trim(&mut self, max: usize) {
        if self.samples.len() > max {
            let drop = self.samples.len() - max;
            self.samples.drain(..drop);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.samples.len()
    }
}

/// The orchestrator's session record.
///
/// Single writer (the orchestrator loop); observers and [`crate::ScanOrchestrator::state`]
/// hand out clones. One instance per session; a new `start_scanning` call
/// replaces it wholesale.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ScanState {
    pub phase: ScanPhase,
    /// Page currently (or last) being processed; 0 before the first page.
    pub current_page: u32,
    pub total_pages: u32,
    /// Total accepted detections across all completed outcomes.
    pub found_count: usize,
    /// Total materialized action items (≤ `found_count` when a materializer
    /// rejects individual detections).
    pub generated_count: usize,
    /// Append-only, page order, bounded; the partial-failure summary is the
    /// single trailing session-level entry.
    pub errors: Vec<ScanError>,
    /// One entry per attempted page, in page order.
    pub outcomes: Vec<PageScanOutcome>,
    pub started_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
    pub metrics: ScanMetrics,
    /// Errors observed but not stored once the bounded list filled up.
    pub suppressed_errors: usize,
}

impl Default for ScanState {
    fn default() -> Self {
        Self::idle()
    }
}

impl ScanState {
    /// The at-rest record before any session has run.
    pub fn idle() -> Self {
        Self {
            phase: ScanPhase::Idle,
            current_page: 0,
            total_pages: 0,
            found_count: 0,
            generated_count: 0,
            errors: Vec::new(),
            outcomes: Vec::new(),
            started_at: None,
            completed_at: None,
            metrics: ScanMetrics::default(),
            suppressed_errors: 0,
        }
    }

    /// Fresh record for a session that is about to scan `total_pages` pages.
    pub(crate) fn fresh(total_pages: u32) -> Self {
        Self {
            phase: ScanPhase::Scanning,
            total_pages,
            started_at: Some(SystemTime::now()),
            ..Self::idle()
        }
    }

    /// Append an error, honouring the retention bound. Returns `true` when
    /// the entry was stored.
    pub(crate) fn push_error(&mut self, error: ScanError, max_retained: usize) -> bool {
        if self.errors.len() < max_retained {
            self.errors.push(error);
            true
        } else {
            self.suppressed_errors += 1;
            false
        }
    }

    /// Record a finished page attempt and fold its detections into the
    /// session counters.
    pub(crate) fn record_outcome(&mut self, outcome: PageScanOutcome, generated: usize) {
        self.found_count += outcome.detections.len();
        self.generated_count += generated;
        self.outcomes.push(outcome);
    }

    /// Page numbers whose final outcome was a failure, in page order.
    pub fn failed_pages(&self) -> Vec<u32> {
        self.outcomes
            .iter()
            .filter(|o| o.error.is_some())
            .map(|o| o.page_number)
            .collect()
    }

    /// Pages that completed without a final error.
    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }
}
