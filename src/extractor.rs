//! Variable extraction from protocol responses.
//!
//! Correlation rules pull values out of a response — by JSONPath, header
//! name, cookie name, or the first regex capture group — and bind them into
//! the calling virtual user's session store.

use crate::request::parse_header_blob;
use crate::response::ResponseRecord;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Where an extraction rule reads its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractSource {
    /// Dot / `[index]` JSON path into the response body.
    JsonPath,
    /// Response header by name.
    Header,
    /// Cookie name from `Set-Cookie` headers.
    Cookie,
    /// First capture group of a regex applied to the body.
    Regex,
}

/// One correlation rule: pull `key` from `source`, bind it as `variable`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractRule {
    pub source: ExtractSource,
    pub key: String,
    pub variable: String,
}

/// Errors that can occur during variable extraction.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("JSONPath query failed: {0}")]
    JsonPathError(String),

    #[error("Invalid JSON response: {0}")]
    InvalidJson(String),

    #[error("Regex compilation failed: {0}")]
    RegexError(#[from] regex::Error),

    #[error("Regex pattern did not match")]
    RegexNoMatch,

    #[error("Header '{0}' not found in response")]
    HeaderNotFound(String),

    #[error("Cookie '{0}' not found in response")]
    CookieNotFound(String),
}

/// Normalise a dot/`[index]` path to RFC 9535 by anchoring it at `$`.
fn normalize_json_path(path: &str) -> String {
    if path.starts_with('$') {
        path.to_string()
    } else {
        format!("$.{path}")
    }
}

/// Extract a JSON value by path from a JSON body.
pub fn extract_json_path(json_body: &str, path: &str) -> Result<Value, ExtractionError> {
    use serde_json_path::JsonPath;

    let json: Value =
        serde_json::from_str(json_body).map_err(|e| ExtractionError::InvalidJson(e.to_string()))?;

    let normalized = normalize_json_path(path);
    let json_path = JsonPath::parse(&normalized)
        .map_err(|e| ExtractionError::JsonPathError(format!("Invalid JSONPath '{path}': {e}")))?;

    let node_list = json_path.query(&json);
    match node_list.exactly_one() {
        Ok(value) => Ok(value.clone()),
        Err(_) => Err(ExtractionError::JsonPathError(format!(
            "JSONPath '{path}' did not match exactly one value"
        ))),
    }
}

/// Extract a header value from a newline-delimited header blob.
pub fn extract_header(headers_blob: &str, header_name: &str) -> Result<String, ExtractionError> {
    crate::request::header_from_blob(headers_blob, header_name)
        .ok_or_else(|| ExtractionError::HeaderNotFound(header_name.to_string()))
}

/// Extract a cookie value from the `Set-Cookie` lines of a header blob.
pub fn extract_cookie(headers_blob: &str, cookie_name: &str) -> Result<String, ExtractionError> {
    for (name, value) in parse_header_blob(headers_blob) {
        if !name.eq_ignore_ascii_case("set-cookie") {
            continue;
        }
        if let Some(pair) = value.split(';').next() {
            if let Some((n, v)) = pair.split_once('=') {
                if n.trim() == cookie_name {
                    return Ok(v.trim().to_string());
                }
            }
        }
    }
    Err(ExtractionError::CookieNotFound(cookie_name.to_string()))
}

/// Extract the first capture group of `pattern` applied to `text`.
pub fn extract_regex_group1(text: &str, pattern: &str) -> Result<String, ExtractionError> {
    let re = Regex::new(pattern)?;
    let captures = re.captures(text).ok_or(ExtractionError::RegexNoMatch)?;
    captures
        .get(1)
        .map(|m| m.as_str().to_string())
        .ok_or(ExtractionError::RegexNoMatch)
}

/// Apply one rule to a response record.
pub fn extract_value(
    rule: &ExtractRule,
    response: &ResponseRecord,
) -> Result<Value, ExtractionError> {
    match rule.source {
        ExtractSource::JsonPath => extract_json_path(&response.body, &rule.key),
        ExtractSource::Header => extract_header(&response.headers, &rule.key).map(Value::String),
        ExtractSource::Cookie => extract_cookie(&response.headers, &rule.key).map(Value::String),
        ExtractSource::Regex => {
            extract_regex_group1(&response.body, &rule.key).map(Value::String)
        }
    }
}

/// Apply every rule, returning the successfully bound variables.
///
/// Failed extractions are logged and skipped; they never fail the step.
pub fn extract_variables(
    rules: &[ExtractRule],
    response: &ResponseRecord,
) -> HashMap<String, Value> {
    let mut variables = HashMap::new();

    for rule in rules {
        match extract_value(rule, response) {
            Ok(value) => {
                debug!(variable = %rule.variable, "Extracted variable");
                variables.insert(rule.variable.clone(), value);
            }
            Err(e) => {
                warn!(variable = %rule.variable, error = %e, "Failed to extract variable");
            }
        }
    }

    variables
}
