//! Failure classification for extractor errors.
//!
//! yt-dlp reports authentication problems as free-form text, so the only
//! workable signal is substring matching over the error message. The policy
//! lives behind a single function pointer so the orchestrator can be tested
//! with a different classifier and the marker list can change in one place.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The session for the target site is expired or invalid; a credential
    /// refresh may recover it.
    Auth,
    /// Anything else: network errors, unsupported sites, format problems.
    Transient,
}

pub type Classifier = fn(&str) -> FailureKind;

/// Markers that indicate an expired or missing session. Matched
/// case-insensitively against the whole extractor error message.
const AUTH_MARKERS: [&str; 6] = [
    "403",
    "404",
    "login",
    "cookie",
    "need to log in",
    "unable to download",
];

pub fn classify_extractor_error(message: &str) -> FailureKind {
    let lower = message.to_ascii_lowercase();
    if AUTH_MARKERS.iter().any(|marker| lower.contains(marker)) {
        FailureKind::Auth
    } else {
        FailureKind::Transient
    }
}
