//! Robust JSON extraction from reasoning-layer responses.
//!
//! The raw text may wrap the payload in fenced code blocks, prepend prose, or
//! carry common generation defects (trailing commas, unquoted keys, single
//! quotes). Strategies are tried in order; the last one repairs before
//! parsing.

use anyhow::{anyhow, Result};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn fence_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"(?s)```json\n(.*?)\n```").expect("static regex"),
            Regex::new(r"(?s)```\n(.*?)\n```").expect("static regex"),
            Regex::new(r"(?s)```(.*?)```").expect("static regex"),
        ]
    })
}

const PROSE_PREFIXES: [&str; 5] = [
    "Here is the JSON output based on the provided information and process definition:",
    "Here is the JSON response:",
    "The result is:",
    "JSON output:",
    "Response:",
];

/// Extract the first JSON object from free-form text.
pub fn extract_json(text: &str) -> Result<Value> {
    // Fenced code blocks first.
    for pattern in fence_patterns() {
        if let Some(caps) = pattern.captures(text) {
            if let Ok(value) = serde_json::from_str(caps[1].trim()) {
                return Ok(value);
            }
        }
    }

    // Outermost brace span.
    if let Some(span) = brace_span(text) {
        if let Ok(value) = serde_json::from_str(span) {
            return Ok(value);
        }
    }

    // Strip known prose prefixes.
    let mut cleaned = text.trim();
    for prefix in PROSE_PREFIXES {
        if let Some(rest) = cleaned.strip_prefix(prefix) {
            cleaned = rest.trim();
        }
    }
    if let Ok(value) = serde_json::from_str(cleaned) {
        return Ok(value);
    }

    // Last resort: repair the brace span.
    if let Some(span) = brace_span(cleaned) {
        let repaired = repair_json(span);
        if let Ok(value) = serde_json::from_str(&repaired) {
            return Ok(value);
        }
    }

    let preview: String = text.chars().take(200).collect();
    Err(anyhow!("could not parse JSON from text: {preview}..."))
}

fn brace_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Fix the defects the reasoning layer most often produces.
fn repair_json(text: &str) -> String {
    static TRAILING_COMMA: OnceLock<Regex> = OnceLock::new();
    static UNQUOTED_KEY: OnceLock<Regex> = OnceLock::new();

    let trailing = TRAILING_COMMA
        .get_or_init(|| Regex::new(r",(\s*[}\]])").expect("static regex"));
    let unquoted = UNQUOTED_KEY.get_or_init(|| {
        Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)(\s*):"#).expect("static regex")
    });

    let mut fixed = trailing.replace_all(text, "$1").to_string();
    fixed = unquoted.replace_all(&fixed, "$1\"$2\"$3:").to_string();
    // Single-quoted strings, only when the text carries no double quotes of
    // its own (a blanket swap would corrupt apostrophes inside values).
    if !fixed.contains('"') {
        fixed = fixed.replace('\'', "\"");
    }
    fixed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_fenced_json_block() {
        let text = "Sure, here you go:\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(extract_json(text).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn parses_generic_fence() {
        let text = "```\n{\"a\": [1, 2]}\n```";
        assert_eq!(extract_json(text).unwrap(), json!({"a": [1, 2]}));
    }

    #[test]
    fn parses_bare_object_with_surrounding_prose() {
        let text = "The decision follows. {\"next\": \"ship\"} Let me know.";
        assert_eq!(extract_json(text).unwrap(), json!({"next": "ship"}));
    }

    #[test]
    fn strips_known_prefixes() {
        let text = "Here is the JSON response: {\"ok\": true}";
        assert_eq!(extract_json(text).unwrap(), json!({"ok": true}));
    }

    #[test]
    fn repairs_trailing_commas() {
        let text = "{\"items\": [1, 2,], \"done\": true,}";
        assert_eq!(
            extract_json(text).unwrap(),
            json!({"items": [1, 2], "done": true})
        );
    }

    #[test]
    fn repairs_unquoted_keys() {
        let text = "{instanceId: \"a.b\", result: \"DONE\"}";
        assert_eq!(
            extract_json(text).unwrap(),
            json!({"instanceId": "a.b", "result": "DONE"})
        );
    }

    #[test]
    fn repairs_single_quotes() {
        let text = "{'a': 'b'}";
        assert_eq!(extract_json(text).unwrap(), json!({"a": "b"}));
    }

    #[test]
    fn rejects_hopeless_text_with_preview() {
        let err = extract_json("no json here at all").unwrap_err();
        assert!(err.to_string().contains("no json here"));
    }

    #[test]
    fn nested_fences_prefer_the_json_one() {
        let text = "```\nnot json\n```\n```json\n{\"x\": 9}\n```";
        assert_eq!(extract_json(text).unwrap(), json!({"x": 9}));
    }
}
