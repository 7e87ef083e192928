//! Outbound secret redaction (C7, `spec.md` §4.7).
//!
//! Redaction is outbound-only: stored rows are never mutated, only the
//! serialized copy that crosses the API/SSE boundary.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

const MASK: &str = "***REDACTED***";

lazy_static! {
    /// OpenAI-style and Anthropic-style secret key formats plus explicit
    /// `api_key`/`secret_key` JSON fields (`spec.md` §4.7).
    static ref SECRET_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"sk-ant-[A-Za-z0-9\-_]{20,}").unwrap(),
        Regex::new(r"sk-[A-Za-z0-9]{32,}").unwrap(),
        Regex::new(r#""(api_key|secret_key)"\s*:\s*"[^"]*""#).unwrap(),
    ];
}

/// Replace every secret-pattern match in `text` with [`MASK`].
pub fn redact_text(text: &str) -> String {
    let mut out = text.to_string();
    for pattern in SECRET_PATTERNS.iter() {
        out = pattern
            .replace_all(&out, |caps: &regex::Captures| {
                if let Some(field) = caps.get(1) {
                    format!("\"{}\":\"{}\"", field.as_str(), MASK)
                } else {
                    MASK.to_string()
                }
            })
            .to_string();
    }
    out
}

/// Recursively redact every string value in a JSON document.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(redact_text(s)),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::Object(map) => {
            Value::Object(map.iter().map(|(k, v)| (k.clone(), redact_value(v))).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_openai_style_key() {
        let text = "here is my key sk-abcdefghijklmnopqrstuvwxyz123456 thanks";
        let redacted = redact_text(text);
        assert!(!redacted.contains("sk-abc"));
        assert!(redacted.contains(MASK));
    }

    #[test]
    fn redacts_anthropic_style_key() {
        let text = "sk-ant-REDACTED";
        let redacted = redact_text(text);
        assert!(!redacted.contains("sk-ant-api03"));
    }

    #[test]
    fn redacts_explicit_json_fields() {
        let text = r#"{"api_key":"topsecretvalue"}"#;
        let redacted = redact_text(text);
        assert!(!redacted.contains("topsecretvalue"));
    }

    #[test]
    fn leaves_ordinary_text_untouched() {
        let text = "the quick brown fox";
        assert_eq!(redact_text(text), text);
    }
}
