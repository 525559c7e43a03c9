//! Decoded-payload validation, classification, and confidence scoring.
//!
//! A grid that decodes is not automatically a detection: garbage payloads
//! (empty, control bytes, absurd length) are rejected here and never reach
//! the result list. Survivors are classified so materializers can label a
//! clickable URL differently from a serial number.

use once_cell::sync::Lazy;
use regex::Regex;

/// Well-formed absolute http(s) URL. Anchored; no whitespace anywhere.
static RE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^https?://[^\s/$.?#][^\s]*$").unwrap());

/// Plain mailbox address, optionally with a `mailto:` prefix.
static RE_EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:mailto:)?[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}$").unwrap());

/// Phone-shaped: digits with the usual separators, optional leading `+` or
/// `tel:` prefix. A digit-count floor is applied separately.
static RE_PHONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:tel:)?\+?[0-9()\[\].\s-]{6,32}$").unwrap());

const MIN_PHONE_DIGITS: usize = 7;

/// Classification of an accepted payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Url,
    Email,
    Phone,
    Text,
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContentKind::Url => "url",
            ContentKind::Email => "email",
            ContentKind::Phone => "phone",
            ContentKind::Text => "text",
        };
        f.write_str(s)
    }
}

/// Why a decoded payload was dropped. Logged at debug level, never surfaced
/// as a page error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ContentRejection {
    Empty,
    ControlCharacters,
    TooLong { length: usize, max: usize },
}

impl std::fmt::Display for ContentRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentRejection::Empty => f.write_str("empty or whitespace-only payload"),
            ContentRejection::ControlCharacters => f.write_str("payload contains control characters"),
            ContentRejection::TooLong { length, max } => {
                write!(f, "payload of {length} chars exceeds the {max}-char limit")
            }
        }
    }
}

/// Gate a decoded payload and classify the survivors.
pub(crate) fn validate(content: &str, max_len: usize) -> Result<ContentKind, ContentRejection> {
    if content.trim().is_empty() {
        return Err(ContentRejection::Empty);
    }
    let length = content.chars().count();
    if length > max_len {
        return Err(ContentRejection::TooLong {
            length,
            max: max_len,
        });
    }
    if content
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r'))
    {
        return Err(ContentRejection::ControlCharacters);
    }
    Ok(classify(content))
}

/// Classify a payload by shape. Precedence: URL, email, phone, then plain
/// text (anything printable that survived validation).
pub fn classify(content: &str) -> ContentKind {
    let trimmed = content.trim();
    if RE_URL.is_match(trimmed) {
        ContentKind::Url
    } else if RE_EMAIL.is_match(trimmed) {
        ContentKind::Email
    } else if RE_PHONE.is_match(trimmed) && digit_count(trimmed) >= MIN_PHONE_DIGITS {
        ContentKind::Phone
    } else {
        ContentKind::Text
    }
}

fn digit_count(s: &str) -> usize {
    s.chars().filter(|c| c.is_ascii_digit()).count()
}

/// Heuristic confidence for an accepted detection.
///
/// 0.5 base, +0.3 when every corner anchor of the grid landed inside the
/// frame, +0.1 for non-empty content (always true past validation), +0.1
/// for a URL payload. Clamped to 1.0.
pub(crate) fn confidence_score(kind: ContentKind, anchors_in_frame: bool) -> f32 {
    let mut score: f32 = 0.5;
    if anchors_in_frame {
        score += 0.3;
    }
    score += 0.1;
    if kind == ContentKind::Url {
        score += 0.1;
    }
    score.min(1.0)
}
