//! Fingerprinting: collapse noisy error events onto stable signature keys.
//!
//! Variable fragments of a message (ids, addresses, timestamps, paths, hashes)
//! are replaced with fixed placeholder tokens, the top stack frames are reduced
//! to `function@file` identities, and the result is hashed with SHA-256.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::{ErrorEvent, SignatureKey, StackFrame};

/// Bumped whenever templatization changes in a way that moves keys.
const KEY_VERSION: &str = "faultline-fp-v1";

pub const DEFAULT_MAX_FRAMES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FingerprintError {
    #[error("event has no service name")]
    MissingService,
    #[error("event has neither an error type nor a message")]
    Empty,
}

/// Result of fingerprinting one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub key: SignatureKey,
    pub message_template: String,
}

struct Rule {
    pattern: Regex,
    replacement: &'static str,
    /// Matches rejected here are left untouched.
    applies: fn(&str) -> bool,
}

impl Rule {
    fn new(pattern: &str, replacement: &'static str) -> Self {
        Self::guarded(pattern, replacement, |_| true)
    }

    fn guarded(pattern: &str, replacement: &'static str, applies: fn(&str) -> bool) -> Self {
        Self {
            pattern: Regex::new(pattern).unwrap(),
            replacement,
            applies,
        }
    }

    fn apply(&self, text: &str) -> String {
        self.pattern
            .replace_all(text, |caps: &Captures| {
                if !(self.applies)(&caps[0]) {
                    return caps[0].to_string();
                }
                let mut out = String::new();
                caps.expand(self.replacement, &mut out);
                out
            })
            .into_owned()
    }
}

fn has_digit(s: &str) -> bool {
    s.bytes().any(|b| b.is_ascii_digit())
}

fn is_hex_token(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    if lower.starts_with("0x") {
        return true;
    }
    // All-digit runs are left for the number rule.
    has_digit(&lower) && lower.bytes().any(|b| b.is_ascii_alphabetic())
}

/// Ordered: earlier rules consume text later rules would otherwise split.
static TEMPLATE_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        // ISO-8601 timestamps
        Rule::new(
            r"\b\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
            "<ts>",
        ),
        // UUIDs, any case
        Rule::new(
            r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b",
            "<uuid>",
        ),
        // IPv4, optionally with a port
        Rule::new(r"\b(?:\d{1,3}\.){3}\d{1,3}(?::\d{1,5})?\b", "<ip>"),
        // IPv6, full or compressed, optionally bracketed with a port
        Rule::guarded(
            r"(?i)\[?\b(?:(?:[0-9a-f]{1,4}:){7}[0-9a-f]{1,4}|(?:[0-9a-f]{1,4}:){1,6}(?::[0-9a-f]{1,4}){1,6})\b(?:%\w+)?\]?(?::\d{1,5})?",
            "<ip>",
            has_digit,
        ),
        // Explicit ports
        Rule::new(r"(?i)\bport\s*[:=]?\s*\d{1,5}\b", "port <port>"),
        Rule::new(r"\b([a-z][a-z0-9-]*(?:\.[a-z0-9-]+)*):\d{2,5}\b", "${1}:<port>"),
        // File paths with at least two segments
        Rule::new(r"(?:\b[A-Za-z]:)?(?:[\\/][\w.@~-]+){2,}[\\/]?", "<path>"),
        // Hex hashes and literals
        Rule::guarded(r"(?i)\b(?:0x[0-9a-f]+|[0-9a-f]{6,})\b", "<hex>", is_hex_token),
        // Everything numeric that is left
        Rule::new(r"\d+", "<num>"),
    ]
});

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// Replace every variable fragment of `text` with its placeholder token.
pub fn templatize(text: &str) -> String {
    let mut result = text.to_string();
    for rule in TEMPLATE_RULES.iter() {
        result = rule.apply(&result);
    }
    WHITESPACE.replace_all(result.trim(), " ").into_owned()
}

/// Reduce a file path to its last two components so that deploy roots and
/// checkout locations do not move the key.
fn file_identity(file: &str) -> String {
    let normalized = file.trim().replace('\\', "/");
    let parts: Vec<&str> = normalized.split('/').filter(|p| !p.is_empty()).collect();
    let tail = &parts[parts.len().saturating_sub(2)..];
    DIGITS.replace_all(&tail.join("/"), "<num>").into_owned()
}

fn frame_identity(frame: &StackFrame) -> Option<String> {
    let function = frame
        .function
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(|f| DIGITS.replace_all(f, "<num>").into_owned());
    let file = frame
        .file
        .as_deref()
        .map(file_identity)
        .filter(|f| !f.is_empty());

    if function.is_none() && file.is_none() {
        return None;
    }
    Some(format!(
        "{}@{}",
        function.as_deref().unwrap_or("?"),
        file.as_deref().unwrap_or("?")
    ))
}

/// Maps error events onto signature keys.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    max_frames: usize,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAMES)
    }
}

impl Fingerprinter {
    pub fn new(max_frames: usize) -> Self {
        Self { max_frames }
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// Stack shape: identities of the innermost `max_frames` frames.
    /// Line numbers never participate.
    pub fn stack_shape(&self, stack: &[StackFrame]) -> String {
        stack
            .iter()
            .filter_map(frame_identity)
            .take(self.max_frames)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn fingerprint(&self, event: &ErrorEvent) -> Result<Fingerprint, FingerprintError> {
        let service = event.service.trim();
        if service.is_empty() {
            return Err(FingerprintError::MissingService);
        }
        let error_type = event.error_type.trim();
        if error_type.is_empty() && event.message.trim().is_empty() {
            return Err(FingerprintError::Empty);
        }

        let message_template = templatize(&event.message);
        let shape = self.stack_shape(&event.stack);

        let mut hasher = Sha256::new();
        for part in [KEY_VERSION, error_type, service, message_template.as_str(), shape.as_str()] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }

        Ok(Fingerprint {
            key: SignatureKey::from_digest(&hasher.finalize()),
            message_template,
        })
    }
}
