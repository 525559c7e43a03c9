//! Error types for the qrsweep library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`DecodeError`] — **Structural**: the decode engine could not even look
//!   at the buffer (malformed RGBA data, oversize buffer, unusable engine
//!   options). Returned as `Err(DecodeError)` from [`crate::DecodeEngine::decode`]
//!   and never retried by the orchestrator.
//!
//! * [`ScanError`] — **Session-level record**: one page (or the session
//!   summary, page number 0) failed in a classified way. Stored inside
//!   [`crate::PageScanOutcome`] and [`crate::ScanState::errors`] so callers
//!   can inspect partial success rather than losing the whole document to
//!   one bad page.
//!
//! [`ErrorKind`] is a closed taxonomy; the orchestrator's retry and
//! stop-early decisions key off [`ErrorKind::is_retryable`] and
//! [`ErrorKind::is_fatal`] rather than string matching.

use thiserror::Error;

/// Classification of a scan failure.
///
/// Closed enumeration: every error the orchestrator records carries exactly
/// one of these kinds. Serialized with kebab-case wire names
/// (`"buffer-too-large"`, `"memory-pressure"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// The decode engine reported itself unusable before any page ran.
    UnsupportedEnvironment,
    /// The pixel buffer was structurally invalid (dimensions/length mismatch).
    InvalidInput,
    /// The pixel buffer exceeded the configured byte ceiling.
    BufferTooLarge,
    /// The image provider failed to produce a page image.
    ImageExtractionFailed,
    /// The page attempt exceeded the per-page deadline.
    Timeout,
    /// The working set stayed above the memory threshold after a forced cleanup.
    MemoryPressure,
    /// A processing-layer failure (panicked decode task, session misuse).
    ProcessingFailed,
    /// A decoded payload or materialized detection was rejected.
    InvalidContent,
    /// Session-level summary after a partially failed scan.
    PartialFailure,
    /// The per-document detection cap was reached; further pages fail fast.
    DocumentLimitExceeded,
}

impl ErrorKind {
    /// Stable wire name, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnsupportedEnvironment => "unsupported-environment",
            ErrorKind::InvalidInput => "invalid-input",
            ErrorKind::BufferTooLarge => "buffer-too-large",
            ErrorKind::ImageExtractionFailed => "image-extraction-failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::MemoryPressure => "memory-pressure",
            ErrorKind::ProcessingFailed => "processing-failed",
            ErrorKind::InvalidContent => "invalid-content",
            ErrorKind::PartialFailure => "partial-failure",
            ErrorKind::DocumentLimitExceeded => "document-limit-exceeded",
        }
    }

    /// Fatal kinds halt the session before any further page is attempted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::UnsupportedEnvironment)
    }

    /// Retryable kinds get up to `max_retries` extra attempts with backoff.
    ///
    /// Timeouts are deliberately not retryable: retrying a slow operation
    /// rarely helps and risks runaway latency. Structural buffer errors and
    /// memory pressure will not improve on a second attempt either.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ImageExtractionFailed | ErrorKind::ProcessingFailed
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified error recorded against one page, or against the session as a
/// whole (`page_number == 0`).
///
/// Stored in [`crate::PageScanOutcome::error`] and appended to
/// [`crate::ScanState::errors`]. The scan continues past non-fatal entries
/// unless the consecutive-failure cutoff triggers.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
#[error("[{kind}] {message}")]
pub struct ScanError {
    pub kind: ErrorKind,
    /// 1-based page the error belongs to; 0 for session-level entries.
    pub page_number: u32,
    pub message: String,
    /// Retries consumed before this error became final.
    pub retry_count: u32,
}

impl ScanError {
    pub fn new(kind: ErrorKind, page_number: u32, message: impl Into<String>) -> Self {
        Self {
            kind,
            page_number,
            message: message.into(),
            retry_count: 0,
        }
    }

    pub fn with_retries(
        kind: ErrorKind,
        page_number: u32,
        message: impl Into<String>,
        retry_count: u32,
    ) -> Self {
        Self {
            kind,
            page_number,
            message: message.into(),
            retry_count,
        }
    }

    /// Session-level entry (summary verdicts, pre-flight refusals).
    pub fn session(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, 0, message)
    }
}

/// Structural errors from the decode engine.
///
/// These are the only failures [`crate::DecodeEngine::decode`] surfaces as
/// `Err`; every softer problem (no grids, undecodable grids, rejected
/// payloads) degrades to an empty detection list instead.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The buffer is not a well-formed width x height RGBA plane.
    #[error(
        "invalid pixel buffer: {reason}\n\
         Expected non-zero dimensions and exactly width*height*4 bytes of RGBA data."
    )]
    InvalidBuffer { reason: String },

    /// The buffer exceeds the decode ceiling and was never attempted.
    #[error(
        "pixel buffer of {actual_bytes} bytes exceeds the {limit_bytes}-byte decode ceiling\n\
         Render the page at a lower resolution, or raise DecodeOptions::max_buffer_bytes."
    )]
    BufferTooLarge {
        actual_bytes: usize,
        limit_bytes: usize,
    },

    /// The engine options make every decode impossible.
    #[error("decode engine unavailable: {reason}")]
    Unsupported { reason: String },
}

impl DecodeError {
    /// Orchestrator-side classification of a structural failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DecodeError::InvalidBuffer { .. } => ErrorKind::InvalidInput,
            DecodeError::BufferTooLarge { .. } => ErrorKind::BufferTooLarge,
            DecodeError::Unsupported { .. } => ErrorKind::UnsupportedEnvironment,
        }
    }
}

/// Builder validation failure for [`crate::ScanConfig`] and friends.
#[derive(Debug, Error)]
#[error("Invalid configuration: {0}")]
pub struct ConfigError(pub String);
