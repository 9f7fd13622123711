//! Heuristic classification of PTY output chunks.
//!
//! Raw bytes are always preserved verbatim for rendering; the stripped text
//! is only used for pattern matching. The heuristics are best-effort and
//! may false-positive on unrelated numbered lists; they feed notifications,
//! not correctness.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static NUMBERED_OPTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\.\s+(.+)$").expect("Invalid option regex"));
static TOOL_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Read|Edit|Write|Bash|Glob|Grep").expect("Invalid tool regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParsedEventKind {
    Text,
    ToolStart,
    ToolEnd,
    AskUser,
    Diff,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AskOption {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedEvent {
    #[serde(rename = "type")]
    pub kind: ParsedEventKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<AskOption>,
}

/// Strip ANSI escape sequences for pattern matching:
/// - CSI sequences (colors, cursor movement): `\x1b[...X`
/// - OSC sequences (titles, hyperlinks): `\x1b]...\x07` or `\x1b]...\x1b\\`
pub fn strip_ansi_codes(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            if chars.peek() == Some(&'[') {
                chars.next();
                while let Some(&next) = chars.peek() {
                    chars.next();
                    if next.is_ascii_alphabetic() || next == '~' || next == '@' {
                        break;
                    }
                }
            } else if chars.peek() == Some(&']') {
                chars.next();
                while let Some(&next) = chars.peek() {
                    if next == '\x07' {
                        chars.next();
                        break;
                    } else if next == '\x1b' {
                        chars.next();
                        if chars.peek() == Some(&'\\') {
                            chars.next();
                        }
                        break;
                    }
                    chars.next();
                }
            } else {
                // Two-char escapes like \x1b( or \x1b=
                chars.next();
            }
        } else {
            result.push(c);
        }
    }

    result
}

/// Classify one output chunk. Precedence: `ask_user`, then `tool_start`,
/// then `diff`, else `text`.
pub fn classify_chunk(raw: &[u8]) -> ParsedEvent {
    let text = String::from_utf8_lossy(raw);
    let stripped = strip_ansi_codes(&text);

    let options = extract_options(&stripped);
    if stripped.contains('?') && options.len() >= 2 {
        return ParsedEvent {
            kind: ParsedEventKind::AskUser,
            content: stripped,
            tool_name: None,
            options,
        };
    }

    if let Some(m) = TOOL_TOKEN.find(&stripped) {
        return ParsedEvent {
            kind: ParsedEventKind::ToolStart,
            tool_name: Some(m.as_str().to_string()),
            content: stripped,
            options: Vec::new(),
        };
    }

    if stripped.contains("@@") && (stripped.contains('+') || stripped.contains('-')) {
        return ParsedEvent {
            kind: ParsedEventKind::Diff,
            content: stripped,
            tool_name: None,
            options: Vec::new(),
        };
    }

    ParsedEvent {
        kind: ParsedEventKind::Text,
        content: stripped,
        tool_name: None,
        options: Vec::new(),
    }
}

fn extract_options(stripped: &str) -> Vec<AskOption> {
    stripped
        .lines()
        .filter_map(|line| {
            let caps = NUMBERED_OPTION.captures(line.trim_end())?;
            Some(AskOption {
                value: caps[1].to_string(),
                label: caps[2].trim().to_string(),
            })
        })
        .collect()
}
