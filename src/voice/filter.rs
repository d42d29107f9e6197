//! Reply filter
//!
//! The response-generation backend occasionally leaks tool-invocation JSON or
//! generic recommendation prompts into the user-facing channel. This filter is
//! the only defense before text reaches the speaker, so it stays conservative:
//! a legitimate reply must never be silenced.
//!
//! Rules run in order; an empty return means "reject, do not speak".

use std::sync::LazyLock;

use regex::Regex;

/// Minimum speakable length (chars) after control stripping and trimming
const MIN_REPLY_CHARS: usize = 5;

/// Upper length bound for the short-solicitation heuristic
const SOLICITATION_MAX_CHARS: usize = 20;

/// Tool/function-call vocabulary that never belongs in speech
const TOOL_TOKENS: &[&str] = &["tool_call", "function_call", "tool_use", "api_call"];

/// Collaborator protocol field names leaking into the text channel
const PROTOCOL_TOKENS: &[&str] = &["actionType", "actionParams", "emotionType"];

/// Structural `name:`/`name=` key patterns from serialized tool calls
static NAME_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)["']?name["']?\s*[:=]"#).expect("valid regex"));

/// Structural argument/parameter key patterns
static ARGS_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(arguments|args|params)\b\s*[:=]").expect("valid regex"));

/// Solicitation phrasing for the short-question heuristic
static SOLICIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(您|你)(想|需要)|要不要|想(了解|知道|试试)|需要我").expect("valid regex"));

/// Sanitize backend reply text before it is spoken
///
/// Returns the text trimmed with control characters stripped, or an empty
/// string when the reply must not be spoken.
#[must_use]
pub fn filter_reply(raw: &str) -> String {
    let trimmed = raw.trim();

    // JSON-looking control/tool-call payloads are backend artifacts
    if trimmed.starts_with('{') || trimmed.contains("\"name\":") {
        tracing::debug!("reply rejected: json payload marker");
        return String::new();
    }

    let lower = trimmed.to_lowercase();
    if TOOL_TOKENS.iter().any(|t| lower.contains(t)) {
        tracing::debug!("reply rejected: tool vocabulary");
        return String::new();
    }

    if NAME_KEY_RE.is_match(trimmed)
        || ARGS_KEY_RE.is_match(trimmed)
        || PROTOCOL_TOKENS.iter().any(|t| trimmed.contains(t))
    {
        tracing::debug!("reply rejected: structural key-value pattern");
        return String::new();
    }

    if is_short_solicitation(trimmed) {
        tracing::debug!("reply rejected: short solicitation prompt");
        return String::new();
    }

    let stripped = strip_control_chars(raw);
    let clean = stripped.trim();

    if clean.chars().count() < MIN_REPLY_CHARS || !clean.chars().any(char::is_alphanumeric) {
        tracing::debug!("reply rejected: too short or degenerate");
        return String::new();
    }

    clean.to_string()
}

/// Short trailing-question strings that merely solicit a follow-up
///
/// Fixed heuristic: length threshold plus a phrase list. Long or ordinary
/// conversational questions pass through untouched.
fn is_short_solicitation(text: &str) -> bool {
    if !(text.ends_with('?') || text.ends_with('？')) {
        return false;
    }
    if text.chars().count() > SOLICITATION_MAX_CHARS {
        return false;
    }
    SOLICIT_RE.is_match(text)
}

/// Remove the C0 (U+0000-U+001F) and C1 (U+007F-U+009F) control ranges
fn strip_control_chars(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '\u{0000}'..='\u{001F}' | '\u{007F}'..='\u{009F}'))
        .collect()
}
