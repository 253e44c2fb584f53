//! Tolerant parsing for tool-call arguments.
//!
//! Models frequently return function-call arguments as strings that are
//! almost, but not quite, JSON: trailing commas, single quotes, Python-style
//! literals, bare keys.  This module applies an ordered list of repair
//! strategies, each a pure function from string to a candidate document,
//! and records which strategy succeeded so repair rates stay observable.
//!
//! Strategy order:
//!
//! 1. strict JSON;
//! 2. trailing commas stripped;
//! 3. single quotes swapped for double quotes;
//! 4. literal normalisation (`True`/`False`/`None` keywords plus the two
//!    repairs above);
//! 5. bare keys quoted;
//! 6. quoted key/value extraction as a last resort.
//!
//! # Example
//!
//! ```rust
//! use selfevolve::providers::lenient::parse_relaxed_str;
//!
//! let (value, strategy) = parse_relaxed_str("{'task': 'classify', 'n': 3,}");
//! assert_eq!(strategy, "json:single_quotes_swapped");
//! assert_eq!(value.unwrap()["task"], "classify");
//! ```

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    static ref TRAILING_COMMA_RE: Regex = Regex::new(r",\s*([}\]])").unwrap();
    static ref BARE_KEY_RE: Regex = Regex::new(r#"([\{,]\s*)([A-Za-z_][\w\-]*)\s*:"#).unwrap();
    static ref QUOTED_PAIR_RE: Regex =
        Regex::new(r#"["']([A-Za-z_][\w\-]*)["']\s*:\s*["']((?s).*?)["']\s*[,}]"#).unwrap();
}

/// Parse an argument payload that may be a structured map or a string.
///
/// Structured maps pass through untouched with the `"structured"` label.
/// Strings run the repair ladder; irreparable input yields `Value::Null`
/// with the `"failed"` label.
pub fn parse_tool_arguments(raw: &Value) -> (Value, &'static str) {
    match raw {
        Value::Object(_) => (raw.clone(), "structured"),
        Value::String(s) => match parse_relaxed_str(s) {
            (Some(v), strategy) => (v, strategy),
            (None, strategy) => (Value::Null, strategy),
        },
        Value::Null => (Value::Null, "failed:missing"),
        other => (other.clone(), "structured"),
    }
}

/// Run the repair ladder over a raw string, returning the parsed object (if
/// any) plus the label of the strategy that produced it.
pub fn parse_relaxed_str(raw: &str) -> (Option<Value>, &'static str) {
    let s = raw.trim();
    if s.is_empty() {
        return (None, "failed:empty");
    }

    if let Some(v) = try_object(s) {
        return (Some(v), "json");
    }

    let no_trailing = TRAILING_COMMA_RE.replace_all(s, "$1").into_owned();
    if let Some(v) = try_object(&no_trailing) {
        return (Some(v), "json:trailing_commas_removed");
    }

    let swapped = no_trailing.replace('\'', "\"");
    if let Some(v) = try_object(&swapped) {
        return (Some(v), "json:single_quotes_swapped");
    }

    let literal = normalize_literal_keywords(&swapped);
    if let Some(v) = try_object(&literal) {
        return (Some(v), "literal");
    }

    let quoted = BARE_KEY_RE.replace_all(&literal, "$1\"$2\":").into_owned();
    if let Some(v) = try_object(&quoted) {
        return (Some(v), "json:bare_keys_quoted");
    }

    let mut out = serde_json::Map::new();
    for caps in QUOTED_PAIR_RE.captures_iter(s) {
        out.insert(
            caps[1].to_string(),
            Value::String(caps[2].trim().to_string()),
        );
    }
    if !out.is_empty() {
        return (Some(Value::Object(out)), "pair_extraction");
    }

    (None, "failed")
}

/// Locate a brace-balanced JSON object starting at or after `from` and
/// return its byte range.
///
/// Used when a tool call is embedded in surrounding prose: the caller finds
/// the tool name, then brace-matches the adjacent document instead of
/// parsing the full response.  Quotes are honoured so braces inside string
/// values do not unbalance the count.
pub fn find_braced_object(text: &str, from: usize) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    let start = text[from.min(text.len())..].find('{')? + from;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some((start, start + offset + 1));
                }
            }
            _ => {}
        }
    }
    None
}

fn try_object(s: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(s) {
        Ok(v @ Value::Object(_)) => Some(v),
        Ok(Value::Array(items)) => items.into_iter().find(|i| i.is_object()),
        _ => None,
    }
}

fn normalize_literal_keywords(s: &str) -> String {
    // Word-ish replacement is enough here: the input already failed strict
    // parsing, so collateral edits inside values are an accepted trade-off.
    s.replace(": True", ": true")
        .replace(": False", ": false")
        .replace(": None", ": null")
        .replace(":True", ":true")
        .replace(":False", ":false")
        .replace(":None", ":null")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strict_json_wins_first() {
        let (v, strategy) = parse_relaxed_str(r#"{"a": 1}"#);
        assert_eq!(strategy, "json");
        assert_eq!(v.unwrap(), json!({"a": 1}));
    }

    #[test]
    fn trailing_commas_are_stripped() {
        let (v, strategy) = parse_relaxed_str(r#"{"a": [1, 2,], "b": 3,}"#);
        assert_eq!(strategy, "json:trailing_commas_removed");
        assert_eq!(v.unwrap(), json!({"a": [1, 2], "b": 3}));
    }

    #[test]
    fn python_literals_parse() {
        let (v, strategy) = parse_relaxed_str("{'flag': True, 'missing': None}");
        assert_eq!(strategy, "literal");
        assert_eq!(v.unwrap(), json!({"flag": true, "missing": null}));
    }

    #[test]
    fn bare_keys_get_quoted() {
        let (v, strategy) = parse_relaxed_str(r#"{specialization: "algebra", specific_task: "x"}"#);
        assert_eq!(strategy, "json:bare_keys_quoted");
        assert_eq!(v.unwrap()["specialization"], "algebra");
    }

    #[test]
    fn hopeless_input_fails_with_label() {
        let (v, strategy) = parse_relaxed_str("not even close");
        assert!(v.is_none());
        assert_eq!(strategy, "failed");
    }

    #[test]
    fn structured_maps_pass_through() {
        let raw = json!({"k": "v"});
        let (v, strategy) = parse_tool_arguments(&raw);
        assert_eq!(strategy, "structured");
        assert_eq!(v, raw);
    }

    #[test]
    fn braced_object_is_found_inside_prose() {
        let text = r#"I will call consult_graduate_specialist with {"specific_task": "a {nested} brace in text"} now."#;
        let (start, end) = find_braced_object(text, 0).unwrap();
        let doc: Value = serde_json::from_str(&text[start..end]).unwrap();
        assert_eq!(doc["specific_task"], "a {nested} brace in text");
    }
}
