//! Parsing the Decision Agent's reply schema out of raw LLM text.
//!
//! Contract: `{analysis?: string, reasoning?: string, result: integer}`,
//! `result` in `[1, choice_count]`. We never trust the provider's own
//! `finish_reason == "stop"` as proof of well-formedness -- every reply
//! goes through the same strict-then-tolerant pipeline.

use std::sync::LazyLock;

use regex::Regex;
use schemars::JsonSchema;

use crate::prelude::*;

/// The reply schema itself, expressed as an ordinary Rust type so we can
/// derive its JSON Schema with `schemars` rather than hand-maintaining one.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ReplySchema {
    pub analysis: Option<String>,
    pub reasoning: Option<String>,
    pub result: i64,
}

static VALIDATOR: LazyLock<jsonschema::Validator> = LazyLock::new(|| {
    let mut settings = schemars::r#gen::SchemaSettings::draft07();
    settings.inline_subschemas = true;
    let generator = schemars::SchemaGenerator::new(settings);
    let schema = generator.into_root_schema_for::<ReplySchema>();
    let schema_json =
        serde_json::to_value(schema).expect("ReplySchema schema always serializes");
    jsonschema::validator_for(&schema_json).expect("ReplySchema schema is always valid")
});

/// A parsed reply, with the fields we could recover. `result` may be
/// missing or out of range; the caller decides what to do about it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedReply {
    pub analysis: Option<String>,
    pub reasoning: Option<String>,
    pub result: Option<i64>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ReplyParseError {
    #[error("could not recover any structured fields from the reply")]
    Unrecoverable,
}

/// Parse a raw reply, trying in order: strict JSON, then (if that fails)
/// a tolerant repair pass. Point 3 of the spec -- promoting `analysis` to
/// `reasoning` when only `analysis` is recoverable -- is applied here so
/// callers never need to consult a raw, unparsed fallback string.
pub fn parse_reply(content: &str) -> Result<ParsedReply, ReplyParseError> {
    let stripped = strip_code_fences(content);

    if let Ok(value) = serde_json::from_str::<Value>(&stripped) {
        if VALIDATOR.is_valid(&value) {
            if let Ok(schema) = serde_json::from_value::<ReplySchema>(value) {
                return Ok(promote_analysis(ParsedReply {
                    analysis: schema.analysis,
                    reasoning: schema.reasoning,
                    result: Some(schema.result),
                }));
            }
        }
        // Valid JSON, but not schema-conformant (e.g. `result` missing or
        // non-integer). Fall through to tolerant field extraction so we
        // can still recover whatever fields are present and well-typed.
        if let Value::Object(_) = value {
            let reply = extract_fields(&stripped);
            if reply.analysis.is_some() || reply.reasoning.is_some() || reply.result.is_some()
            {
                return Ok(promote_analysis(reply));
            }
        }
    }

    // Strict parse failed outright (e.g. truncated JSON). Try regex-based
    // substring extraction over the raw text.
    let reply = extract_fields(&stripped);
    if reply.analysis.is_some() || reply.reasoning.is_some() || reply.result.is_some() {
        Ok(promote_analysis(reply))
    } else {
        Err(ReplyParseError::Unrecoverable)
    }
}

fn promote_analysis(mut reply: ParsedReply) -> ParsedReply {
    if reply.reasoning.is_none() {
        reply.reasoning = reply.analysis.clone();
    }
    reply
}

fn strip_code_fences(content: &str) -> String {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_owned();
    };
    // Skip an optional language tag on the fence's opening line.
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\n', '\r']);
    rest.strip_suffix("```").unwrap_or(rest).trim().to_owned()
}

static FIELD_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    Regex::new(r#""(analysis|reasoning|result)"\s*:\s*("((?:[^"\\]|\\.)*)"|-?\d+)"#)
        .expect("static regex is valid")
});

/// Recover `analysis`/`reasoning`/`result` fields by substring match,
/// tolerating truncated or otherwise non-well-formed JSON around them.
fn extract_fields(content: &str) -> ParsedReply {
    let mut reply = ParsedReply::default();
    for capture in FIELD_RE.captures_iter(content) {
        let key = &capture[1];
        let raw = &capture[2];
        match key {
            "result" => {
                if let Ok(n) = raw.parse::<i64>() {
                    reply.result = Some(n);
                }
            }
            "analysis" | "reasoning" => {
                let text = capture
                    .get(3)
                    .map(|m| unescape_json_string(m.as_str()))
                    .unwrap_or_default();
                if key == "analysis" {
                    reply.analysis = Some(text);
                } else {
                    reply.reasoning = Some(text);
                }
            }
            _ => unreachable!(),
        }
    }
    reply
}

fn unescape_json_string(s: &str) -> String {
    // We only ever feed this function a match from `FIELD_RE`'s string
    // branch, so wrapping in quotes and handing to `serde_json` is safe
    // and handles the full JSON escape grammar without reimplementing it.
    serde_json::from_str::<String>(&format!("\"{s}\"")).unwrap_or_else(|_| s.to_owned())
}

/// Is `result` a valid 1-based choice index for `choice_count` choices?
pub fn result_in_range(result: i64, choice_count: usize) -> bool {
    result >= 1 && result as usize <= choice_count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_json_parses() {
        let reply = parse_reply(r#"{"reasoning": "seems safe", "result": 2}"#).unwrap();
        assert_eq!(reply.result, Some(2));
        assert_eq!(reply.reasoning.as_deref(), Some("seems safe"));
    }

    #[test]
    fn strips_code_fences() {
        let reply = parse_reply("```json\n{\"result\": 1}\n```").unwrap();
        assert_eq!(reply.result, Some(1));
    }

    #[test]
    fn only_analysis_is_promoted_to_reasoning() {
        let reply =
            parse_reply(r#"{"analysis": "thinking it over", "result": 1}"#).unwrap();
        assert_eq!(reply.reasoning.as_deref(), Some("thinking it over"));
    }

    #[test]
    fn truncated_json_recovers_via_regex() {
        let reply =
            parse_reply(r#"{"reasoning": "going north", "result": 3"#).unwrap();
        assert_eq!(reply.result, Some(3));
        assert_eq!(reply.reasoning.as_deref(), Some("going north"));
    }

    #[test]
    fn garbage_is_unrecoverable() {
        assert_eq!(parse_reply("not json at all"), Err(ReplyParseError::Unrecoverable));
    }

    #[test]
    fn range_check() {
        assert!(result_in_range(1, 3));
        assert!(result_in_range(3, 3));
        assert!(!result_in_range(0, 3));
        assert!(!result_in_range(4, 3));
    }
}
