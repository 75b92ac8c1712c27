//! Cleanup and strict parsing of model output.

use jobdigest_core::MatchRecord;
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SanitizeError {
    #[error("response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("JSON root is {found}, expected a list")]
    NotAList { found: &'static str },
    #[error("list element {index} is {found}, expected an object")]
    NotAnObject { index: usize, found: &'static str },
}

/// Strips a surrounding code fence, with or without a language tag, and a
/// surrounding pair of matching triple quotes.
pub fn sanitize(raw: &str) -> String {
    let mut s = raw.trim();

    if let Some(rest) = s.strip_prefix("```") {
        let tag_len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '-')))
            .unwrap_or(rest.len());
        s = rest[tag_len..].trim();
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest.trim();
    }

    for quote in ["\"\"\"", "'''"] {
        if s.len() >= 2 * quote.len() && s.starts_with(quote) && s.ends_with(quote) {
            s = s[quote.len()..s.len() - quote.len()].trim();
            break;
        }
    }

    s.to_string()
}

/// Sanitizes `raw` and requires a JSON list of objects at the root.
pub fn parse_match_list(raw: &str) -> Result<Vec<MatchRecord>, SanitizeError> {
    let cleaned = sanitize(raw);
    let value: JsonValue = serde_json::from_str(&cleaned)?;
    let items = match value {
        JsonValue::Array(items) => items,
        other => {
            return Err(SanitizeError::NotAList {
                found: json_kind(&other),
            })
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            JsonValue::Object(fields) => Ok(MatchRecord::from(fields)),
            other => Err(SanitizeError::NotAnObject {
                index,
                found: json_kind(&other),
            }),
        })
        .collect()
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "a list",
        JsonValue::Object(_) => "an object",
    }
}
