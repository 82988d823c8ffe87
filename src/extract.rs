//! Extraction strategies: pull a non-negative integer metric out of a
//! fetched payload.
//!
//! Strategies are data-driven and tried in a fixed priority order, most
//! structured first and regex-on-raw-markup last: structured data is
//! less likely to silently change shape than ad-hoc text patterns. Each
//! strategy is a pure function of the payload; a value is never
//! fabricated. New strategies are appended to the list, not wired into
//! control flow.

use regex::RegexBuilder;
use serde_json::Value;

/// One way of locating the metric inside a payload. Configured per
/// source; order in the list is priority order.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Strategy {
    /// Parse the whole payload as JSON and follow an RFC 6901 pointer.
    JsonPointer { pointer: String },
    /// Find a `<script id="...">` JSON block inside HTML, parse it, and
    /// follow a pointer into it.
    EmbeddedJson { script_id: String, pointer: String },
    /// Match `"key": <digits>` anywhere in the raw payload.
    KeyRegex { key: String },
    /// Match a human-formatted number followed by a label word, e.g.
    /// `1,234,567 Followers`. Grouping separators are stripped.
    LabelledNumber { label: String },
}

impl Strategy {
    /// Apply this strategy to a payload. `None` on any shape mismatch.
    pub fn apply(&self, payload: &str) -> Option<u64> {
        match self {
            Strategy::JsonPointer { pointer } => {
                let root: Value = serde_json::from_str(payload).ok()?;
                value_as_count(root.pointer(pointer)?)
            }
            Strategy::EmbeddedJson { script_id, pointer } => {
                let pattern = format!(
                    r#"<script[^>]*id=["']{}["'][^>]*>(.*?)</script>"#,
                    regex::escape(script_id)
                );
                let re = RegexBuilder::new(&pattern)
                    .dot_matches_new_line(true)
                    .case_insensitive(true)
                    .build()
                    .ok()?;
                let raw = re.captures(payload)?.get(1)?.as_str().trim();
                let root: Value = serde_json::from_str(raw).ok()?;
                value_as_count(root.pointer(pointer)?)
            }
            Strategy::KeyRegex { key } => {
                let pattern = format!(r#""{}"\s*:\s*([0-9]{{1,15}})"#, regex::escape(key));
                let re = RegexBuilder::new(&pattern).build().ok()?;
                re.captures(payload)?.get(1)?.as_str().parse().ok()
            }
            Strategy::LabelledNumber { label } => {
                let pattern = format!(r#"([\d.,]+)\s*{}"#, regex::escape(label));
                let re = RegexBuilder::new(&pattern)
                    .case_insensitive(true)
                    .build()
                    .ok()?;
                let raw = re.captures(payload)?.get(1)?.as_str();
                let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
                if digits.is_empty() {
                    return None;
                }
                digits.parse().ok()
            }
        }
    }
}

/// Accept JSON integers and strings of digits; reject everything else.
fn value_as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Try `strategies` in order against `payload`; first well-formed value
/// wins.
pub fn extract(strategies: &[Strategy], payload: &str) -> Option<u64> {
    strategies.iter().find_map(|s| s.apply(payload))
}
