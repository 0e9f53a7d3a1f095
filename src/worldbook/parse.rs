//! Tolerant parsing of completion text into a [`Worldbook`]
//!
//! LLMs wrap JSON in code fences, cut off before the last closing brace, or
//! emit something JSON-shaped that no strict parser accepts. `parse_response`
//! tries, in order:
//! 1. Direct parse (response is pure JSON)
//! 2. Strip fence markers / surrounding prose and parse the `{ … }` span
//! 3. Balance-repair: close dangling strings, brackets and braces
//! 4. Structural extraction: regex-recover category → entry → {keywords, content}
//!
//! Only when all four come up empty is the document unrecoverable.

use super::types::{Entry, Worldbook};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use thiserror::Error;

/// Why a response could not be coerced into a worldbook.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("response is empty")]
    Empty,
    #[error("unrecoverable response: {0}")]
    Unrecoverable(String),
}

const KEYWORD_FIELDS: &[&str] = &["keywords", "keys", "key", "triggers"];
const CONTENT_FIELDS: &[&str] = &["content", "description", "text"];

/// Which stage of the ladder produced the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStage {
    Strict,
    Unwrapped,
    Repaired,
    Extracted,
}

/// Parse completion text, reporting which stage succeeded.
pub fn parse_response_with_stage(text: &str) -> Result<(Worldbook, ParseStage), ParseError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    if let Some(wb) = parse_object(trimmed) {
        return Ok((wb, ParseStage::Strict));
    }

    let unfenced = strip_fences(trimmed);
    if let (Some(start), Some(end)) = (unfenced.find('{'), unfenced.rfind('}')) {
        if start < end {
            if let Some(wb) = parse_object(&unfenced[start..=end]) {
                return Ok((wb, ParseStage::Unwrapped));
            }
        }
    }

    if let Some(start) = unfenced.find('{') {
        let repaired = remove_trailing_commas(&balance_delimiters(&unfenced[start..]));
        if let Some(wb) = parse_object(&repaired) {
            return Ok((wb, ParseStage::Repaired));
        }
    }

    let extracted = extract_structure(unfenced);
    if !extracted.is_empty() {
        return Ok((extracted, ParseStage::Extracted));
    }

    let preview: String = trimmed.chars().take(120).collect();
    Err(ParseError::Unrecoverable(preview))
}

/// Parse completion text into a worldbook.
pub fn parse_response(text: &str) -> Result<Worldbook, ParseError> {
    parse_response_with_stage(text).map(|(wb, _)| wb)
}

fn parse_object(text: &str) -> Option<Worldbook> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(worldbook_from_map(&map)),
        _ => None,
    }
}

/// Convert a parsed JSON object into a worldbook, skipping malformed parts.
fn worldbook_from_map(map: &serde_json::Map<String, Value>) -> Worldbook {
    let mut wb = Worldbook::new();
    for (category, entries) in map {
        let Value::Object(entries) = entries else {
            continue;
        };
        for (name, value) in entries {
            if let Some(entry) = entry_from_value(value) {
                wb.insert(category.trim(), name.trim(), entry);
            }
        }
    }
    wb
}

fn entry_from_value(value: &Value) -> Option<Entry> {
    match value {
        Value::String(content) => Some(Entry::new(Vec::<String>::new(), content.trim())),
        Value::Object(fields) => {
            let keywords = KEYWORD_FIELDS
                .iter()
                .find_map(|f| fields.get(*f))
                .map(keywords_from_value)
                .unwrap_or_default();
            let content = CONTENT_FIELDS
                .iter()
                .find_map(|f| fields.get(*f))
                .map(|v| match v {
                    Value::String(s) => s.trim().to_string(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            Some(Entry::new(keywords, content))
        }
        _ => None,
    }
}

fn keywords_from_value(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Value::String(s) => split_keyword_list(s),
        _ => Vec::new(),
    }
}

fn split_keyword_list(s: &str) -> Vec<String> {
    s.split([',', '，', '、', ';'])
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect()
}

/// Return the body of the first fenced block, or the input if there is none.
/// A missing closing fence takes everything to the end.
fn strip_fences(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text;
    };
    let after = &text[open + 3..];
    // skip the info string (e.g. "json") up to end of line
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(after.len());
    let body = &after[body_start..];
    match body.find("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

/// Close any string, array or object left open at the end of `text`.
fn balance_delimiters(text: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut out = text.trim_end().to_string();
    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    while out.ends_with(',') || out.ends_with(':') {
        out.pop();
        out = out.trim_end().to_string();
    }
    out.extend(stack.iter().rev());
    out
}

fn remove_trailing_commas(text: &str) -> String {
    static TRAILING: OnceLock<Regex> = OnceLock::new();
    let re = TRAILING.get_or_init(|| Regex::new(r",(\s*[}\]])").expect("valid regex"));
    re.replace_all(text, "$1").into_owned()
}

fn entry_regexes() -> &'static [Regex; 2] {
    static ENTRY: OnceLock<[Regex; 2]> = OnceLock::new();
    ENTRY.get_or_init(|| {
        let name = r#""((?:[^"\\]|\\.)+)"\s*:\s*\{\s*"#;
        let keys = r#""(?:keywords|keys|key|triggers)"\s*:\s*(\[[^\]]*\]?|"(?:[^"\\]|\\.)*")"#;
        let content = r#""(?:content|description|text)"\s*:\s*"((?:[^"\\]|\\.)*)"?"#;
        [
            Regex::new(&format!(r"{name}{keys}\s*,?\s*{content}")).expect("valid regex"),
            Regex::new(&format!(r"{name}{content}\s*,?\s*{keys}")).expect("valid regex"),
        ]
    })
}

fn object_open_regex() -> &'static Regex {
    static OPEN: OnceLock<Regex> = OnceLock::new();
    OPEN.get_or_init(|| Regex::new(r#""((?:[^"\\]|\\.)+)"\s*:\s*\{"#).expect("valid regex"))
}

/// Recover entries from text no JSON parser accepts.
///
/// Each entry is a `"name": { "keywords": …, "content": "…" }` match (either
/// field order). Its category is the closest preceding `"name": {` opener
/// that is not itself an entry.
fn extract_structure(text: &str) -> Worldbook {
    let [keys_first, content_first] = entry_regexes();

    // (start, name, keywords_raw, content_raw)
    let mut found: Vec<(usize, String, String, String)> = Vec::new();
    for caps in keys_first.captures_iter(text) {
        let start = caps.get(0).map(|m| m.start()).unwrap_or(0);
        found.push((start, caps[1].to_string(), caps[2].to_string(), caps[3].to_string()));
    }
    for caps in content_first.captures_iter(text) {
        let start = caps.get(0).map(|m| m.start()).unwrap_or(0);
        if found.iter().any(|(s, ..)| *s == start) {
            continue;
        }
        found.push((start, caps[1].to_string(), caps[3].to_string(), caps[2].to_string()));
    }
    found.sort_by_key(|(start, ..)| *start);

    let entry_starts: Vec<usize> = found.iter().map(|(s, ..)| *s).collect();
    let categories: Vec<(usize, String)> = object_open_regex()
        .captures_iter(text)
        .filter_map(|caps| {
            let m = caps.get(0)?;
            if entry_starts.contains(&m.start()) {
                None
            } else {
                Some((m.start(), unescape(&caps[1])))
            }
        })
        .collect();

    let mut wb = Worldbook::new();
    for (start, name, keywords_raw, content_raw) in found {
        let category = categories
            .iter()
            .rev()
            .find(|(pos, _)| *pos < start)
            .map(|(_, c)| c.clone())
            .unwrap_or_else(|| "Uncategorized".to_string());
        let keywords = parse_loose_keywords(&keywords_raw);
        let content = unescape(&content_raw);
        wb.insert(category, unescape(&name), Entry::new(keywords, content.trim()));
    }
    wb
}

fn parse_loose_keywords(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.starts_with('[') {
        let closed = if raw.ends_with(']') {
            raw.to_string()
        } else {
            format!("{}]", raw.trim_end_matches(','))
        };
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&closed) {
            return keywords_from_value(&Value::Array(items));
        }
        let inner = closed.trim_start_matches('[').trim_end_matches(']');
        return inner
            .split(',')
            .map(|k| k.trim().trim_matches('"').to_string())
            .filter(|k| !k.is_empty())
            .collect();
    }
    split_keyword_list(&unescape(raw.trim_matches('"')))
}

/// Decode JSON string escapes, falling back to the raw text.
fn unescape(raw: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{}\"", raw)).unwrap_or_else(|_| raw.to_string())
}
