//! Configuration for a scan session.
//!
//! Every orchestrator knob lives in [`ScanConfig`], built via its
//! [`ScanConfigBuilder`]. Keeping the knobs in one struct makes it trivial
//! to share a config across tasks, log it at session start, and diff two
//! runs to understand why their outcomes differ.
//!
//! # Design choice: builder over constructor
//! A fifteen-field constructor is unreadable and breaks on every new field.
//! The builder lets callers set only what they care about and rely on
//! documented defaults for the rest.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::decode::DecodeOptions;
use crate::error::ConfigError;
use crate::memory::MemoryProbe;

/// Configuration for a scan session.
///
/// Built via [`ScanConfig::builder()`] or using [`ScanConfig::default()`].
///
/// # Example
/// ```rust
/// use qrsweep::ScanConfig;
///
/// let config = ScanConfig::builder()
///     .page_timeout_ms(8_000)
///     .max_retries(1)
///     .context_hint("venue posters")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ScanConfig {
    /// Wall-clock budget for one page attempt in milliseconds. Default: 5000.
    ///
    /// Covers fetch, decode and materialization as one unit. A page that
    /// blows this budget fails with a timeout and is not retried; a page
    /// slow enough to time out once will almost always time out again, and
    /// retrying it would stall the whole document behind one pathological
    /// page.
    pub page_timeout_ms: u64,

    /// Retry attempts after a transient page failure. Default: 2.
    ///
    /// Fetch errors and decode-task failures are usually transient (a busy
    /// renderer, a starved thread pool). Structural failures and timeouts
    /// are never retried regardless of this setting.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 1000.
    pub retry_backoff_ms: u64,

    /// Upper bound on any single backoff delay in milliseconds. Default: 10000.
    pub max_backoff_ms: u64,

    /// Pacing delay between consecutive pages in milliseconds. Default: 500.
    ///
    /// Gives the page provider breathing room between renders and keeps a
    /// long document from monopolising shared resources. No delay is taken
    /// before the first page.
    pub inter_page_delay_ms: u64,

    /// Memory ceiling checked before each page, in megabytes. Default: 150.
    ///
    /// When usage exceeds the ceiling the orchestrator forces a cache
    /// cleanup and re-checks once; if still over, the page fails with a
    /// memory-pressure error and the scan moves on.
    pub memory_limit_mb: f64,

    /// Hard cap on detections per session. Default: 100.
    ///
    /// A document yielding hundreds of codes is almost always a scan of a
    /// code sheet rather than a real document. Once the cap is reached,
    /// remaining pages fail fast without fetching pixels.
    pub max_total_detections: usize,

    /// Consecutive failed pages that abort the session. Default: 3.
    ///
    /// Counted per page, not per attempt: a page that fails after two
    /// retries is one failure. Three distinct pages failing back-to-back
    /// indicates a systemic problem (corrupt file, dead renderer), so the
    /// scan stops early instead of walking the rest of the document.
    pub max_consecutive_failures: u32,

    /// Run cache/metrics cleanup every N pages. Default: 5.
    pub cleanup_interval_pages: u32,

    /// Lifetime of a cached page buffer in milliseconds. Default: 15000.
    pub cache_ttl_ms: u64,

    /// Maximum page buffers held in the cache. 0 disables caching. Default: 4.
    pub cache_capacity: usize,

    /// Errors retained on the session state before counting instead of
    /// storing. Default: 100.
    pub max_errors_retained: usize,

    /// Free-form hint forwarded to the materializer (e.g. a document
    /// title), used to label generated action items. Default: none.
    pub context_hint: Option<String>,

    /// Override for the memory-pressure measurement. When unset, usage is
    /// the library's own working set (cached pages plus in-flight buffers).
    pub memory_probe: Option<Arc<dyn MemoryProbe>>,

    /// Decode-engine tuning (buffer ceiling, dedup radius, content length).
    pub decode: DecodeOptions,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            page_timeout_ms: 5_000,
            max_retries: 2,
            retry_backoff_ms: 1_000,
            max_backoff_ms: 10_000,
            inter_page_delay_ms: 500,
            memory_limit_mb: 150.0,
            max_total_detections: 100,
            max_consecutive_failures: 3,
            cleanup_interval_pages: 5,
            cache_ttl_ms: 15_000,
            cache_capacity: 4,
            max_errors_retained: 100,
            context_hint: None,
            memory_probe: None,
            decode: DecodeOptions::default(),
        }
    }
}

impl fmt::Debug for ScanConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanConfig")
            .field("page_timeout_ms", &self.page_timeout_ms)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("max_backoff_ms", &self.max_backoff_ms)
            .field("inter_page_delay_ms", &self.inter_page_delay_ms)
            .field("memory_limit_mb", &self.memory_limit_mb)
            .field("max_total_detections", &self.max_total_detections)
            .field("max_consecutive_failures", &self.max_consecutive_failures)
            .field("cleanup_interval_pages", &self.cleanup_interval_pages)
            .field("cache_ttl_ms", &self.cache_ttl_ms)
            .field("cache_capacity", &self.cache_capacity)
            .field("max_errors_retained", &self.max_errors_retained)
            .field("context_hint", &self.context_hint)
            .field(
                "memory_probe",
                &self.memory_probe.as_ref().map(|_| "<dyn MemoryProbe>"),
            )
            .field("decode", &self.decode)
            .finish()
    }
}

impl ScanConfig {
    /// Create a new builder for `ScanConfig`.
    pub fn builder() -> ScanConfigBuilder {
        ScanConfigBuilder {
            config: Self::default(),
        }
    }

    pub(crate) fn page_timeout(&self) -> Duration {
        Duration::from_millis(self.page_timeout_ms)
    }

    pub(crate) fn inter_page_delay(&self) -> Duration {
        Duration::from_millis(self.inter_page_delay_ms)
    }

    pub(crate) fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Exponential backoff for the given retry ordinal, capped at
    /// `max_backoff_ms`: 1 s, 2 s, 4 s, ... by default.
    pub(crate) fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 1u64 << retry_count.min(32);
        let ms = self
            .retry_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Builder for [`ScanConfig`].
#[derive(Debug)]
pub struct ScanConfigBuilder {
    config: ScanConfig,
}

impl ScanConfigBuilder {
    pub fn page_timeout_ms(mut self, ms: u64) -> Self {
        self.config.page_timeout_ms = ms.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms.max(1);
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms.max(1);
        self
    }

    pub fn inter_page_delay_ms(mut self, ms: u64) -> Self {
        self.config.inter_page_delay_ms = ms;
        self
    }

    pub fn memory_limit_mb(mut self, mb: f64) -> Self {
        self.config.memory_limit_mb = mb.max(1.0);
        self
    }

    pub fn max_total_detections(mut self, n: usize) -> Self {
        self.config.max_total_detections = n.max(1);
        self
    }

    pub fn max_consecutive_failures(mut self, n: u32) -> Self {
        self.config.max_consecutive_failures = n.max(1);
        self
    }

    pub fn cleanup_interval_pages(mut self, n: u32) -> Self {
        self.config.cleanup_interval_pages = n.max(1);
        self
    }

    pub fn cache_ttl_ms(mut self, ms: u64) -> Self {
        self.config.cache_ttl_ms = ms;
        self
    }

    pub fn cache_capacity(mut self, n: usize) -> Self {
        self.config.cache_capacity = n;
        self
    }

    pub fn max_errors_retained(mut self, n: usize) -> Self {
        self.config.max_errors_retained = n.max(1);
        self
    }

    pub fn context_hint(mut self, hint: impl Into<String>) -> Self {
        self.config.context_hint = Some(hint.into());
        self
    }

    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.config.memory_probe = Some(probe);
        self
    }

    pub fn decode(mut self, options: DecodeOptions) -> Self {
        self.config.decode = options;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ScanConfig, ConfigError> {
        let c = &self.config;
        if c.page_timeout_ms == 0 {
            return Err(ConfigError("Page timeout must be at least 1 ms".into()));
        }
        if c.max_backoff_ms < c.retry_backoff_ms {
            return Err(ConfigError(format!(
                "Backoff cap ({} ms) below initial backoff ({} ms)",
                c.max_backoff_ms, c.retry_backoff_ms
            )));
        }
        if !(c.memory_limit_mb.is_finite() && c.memory_limit_mb > 0.0) {
            return Err(ConfigError(format!(
                "Memory limit must be a positive number of megabytes, got {}",
                c.memory_limit_mb
            )));
        }
        Ok(self.config)
    }
}
