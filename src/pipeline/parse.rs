//! Parsers for model replies.
//!
//! Parsing never fails a work item: callers store the raw reply regardless
//! and record `null` as the parsed value when these return nothing.

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Why an age estimation reply could not be parsed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AgeEstimationError {
    #[error("No JSON object found in reply starting with: '{preview}'")]
    NoJsonObject { preview: String },

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Reply JSON is missing required field '{0}'")]
    MissingField(&'static str),
}

/// Extracts the `[[N]]` rating from a moderation reply.
///
/// Ratings inside `<think>...</think>` blocks are ignored; the first rating
/// in the remaining text wins.
pub fn parse_moderation_rating(raw: &str) -> Option<i64> {
    let think = Regex::new(r"(?s)<think>.*?</think>").ok()?;
    let rating = Regex::new(r"\[\[(\d+)\]\]").ok()?;

    let visible = think.replace_all(raw, "");
    rating
        .captures(&visible)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Parses the JSON object of an age estimation reply.
///
/// The object is taken from the first `{` to the last `}` so that prose
/// around it is tolerated. It must contain `characters_detected` and
/// `characters`.
pub fn parse_age_estimation(raw: &str) -> Result<Value, AgeEstimationError> {
    let text = raw.trim();
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return Err(AgeEstimationError::NoJsonObject {
            preview: text.chars().take(100).collect(),
        });
    };
    if end < start {
        return Err(AgeEstimationError::NoJsonObject {
            preview: text.chars().take(100).collect(),
        });
    }

    let value: Value = serde_json::from_str(&text[start..=end])
        .map_err(|e| AgeEstimationError::InvalidJson(e.to_string()))?;

    for field in ["characters_detected", "characters"] {
        if value.get(field).is_none() {
            return Err(AgeEstimationError::MissingField(field));
        }
    }
    Ok(value)
}

/// Age of the first listed character, when at least one was detected.
pub fn main_character_age(estimation: &Value) -> Option<Value> {
    let detected = estimation
        .get("characters_detected")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    if detected <= 0 {
        return None;
    }
    estimation
        .get("characters")
        .and_then(Value::as_array)
        .and_then(|characters| characters.first())
        .and_then(|first| first.get("most_likely_age"))
        .filter(|age| !age.is_null())
        .cloned()
}
