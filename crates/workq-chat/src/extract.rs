//! Structured parsing of language-model output.
//!
//! Output is first validated strictly against the expected shape. Only
//! when that fails does the fallback extractor look for a JSON object
//! inside a fenced code block or surrounding prose, and the extracted
//! text must then pass the same validation.

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;

static FENCED_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").expect("Invalid fenced block regex")
});

/// How a structured value was obtained.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed<T> {
    /// The whole output was valid.
    Strict(T),
    /// Valid only after the fallback extractor ran.
    Extracted(T),
}

impl<T> Parsed<T> {
    pub fn into_inner(self) -> T {
        match self {
            Parsed::Strict(v) | Parsed::Extracted(v) => v,
        }
    }

    pub fn is_strict(&self) -> bool {
        matches!(self, Parsed::Strict(_))
    }
}

/// Parse `text` as `T` and run `validate` on the result.
///
/// `validate` returns a reason when the value is structurally valid JSON
/// but semantically unusable.
pub fn parse_structured<T, F>(text: &str, validate: F) -> Result<Parsed<T>, String>
where
    T: DeserializeOwned,
    F: Fn(&T) -> Result<(), String>,
{
    let strict_error = match parse_and_validate(text.trim(), &validate) {
        Ok(value) => return Ok(Parsed::Strict(value)),
        Err(e) => e,
    };

    let candidate = extract_json_object(text)
        .ok_or_else(|| format!("no JSON object found ({strict_error})"))?;
    parse_and_validate(candidate, &validate).map(Parsed::Extracted)
}

fn parse_and_validate<T, F>(text: &str, validate: &F) -> Result<T, String>
where
    T: DeserializeOwned,
    F: Fn(&T) -> Result<(), String>,
{
    let value: T = serde_json::from_str(text).map_err(|e| e.to_string())?;
    validate(&value)?;
    Ok(value)
}

/// Find a JSON object inside free-form model output.
///
/// Prefers the contents of a fenced code block; otherwise returns the
/// first balanced `{...}` span, ignoring braces inside string literals.
pub fn extract_json_object(text: &str) -> Option<&str> {
    if let Some(caps) = FENCED_BLOCK_RE.captures(text) {
        if let Some(m) = caps.get(1) {
            return Some(m.as_str());
        }
    }

    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
