//! Shared JSON plumbing for the wire formats.
//!
//! The chunk wire format writes numeric NaN as the bare `NaN` token, which
//! strict JSON emitters and parsers reject. Writing goes through the
//! helpers here; parsing first rewrites bare `NaN` tokens (outside string
//! literals) to `null`, then maps `null` array entries back to NaN.

use crate::error::TimeSeriesError;

/// Writes one f64 in wire form into `out`: `NaN` for non-values, the
/// shortest round-trippable decimal otherwise.
pub(crate) fn write_double(out: &mut String, value: f64) {
    if value.is_nan() {
        out.push_str("NaN");
    } else {
        // going through a Number keeps the textual form identical to what
        // a serde_json parser will re-read
        match serde_json::Number::from_f64(value) {
            Some(n) => out.push_str(&n.to_string()),
            None => out.push_str("null"), // infinities are not produced by the core
        }
    }
}

/// Writes one JSON string literal (with escaping) or `null`.
pub(crate) fn write_string(out: &mut String, value: Option<&str>) {
    match value {
        None => out.push_str("null"),
        Some(s) => match serde_json::to_string(s) {
            Ok(escaped) => out.push_str(&escaped),
            Err(_) => out.push_str("null"),
        },
    }
}

/// Rewrites bare `NaN` tokens outside string literals to `null`, so the
/// text becomes strict JSON. Everything else is copied verbatim.
pub(crate) fn sanitize_non_finite(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
        } else if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
        } else if bytes[i..].starts_with(b"NaN") {
            out.push_str("null");
            i += 3;
        } else {
            out.push(c);
            i += 1;
        }
    }
    out
}

/// Parses wire text (possibly containing bare `NaN` tokens) into a
/// `serde_json::Value`.
pub(crate) fn parse_value(text: &str) -> Result<serde_json::Value, TimeSeriesError> {
    Ok(serde_json::from_str(&sanitize_non_finite(text))?)
}

/// Extracts a required field from a JSON object, failing on absence.
pub(crate) fn required<'a>(
    object: &'a serde_json::Map<String, serde_json::Value>,
    field: &str,
    context: &str,
) -> Result<&'a serde_json::Value, TimeSeriesError> {
    object
        .get(field)
        .ok_or_else(|| TimeSeriesError::Json(format!("Missing field '{field}' in {context}")))
}

pub(crate) fn as_usize(
    value: &serde_json::Value,
    field: &str,
) -> Result<usize, TimeSeriesError> {
    value
        .as_u64()
        .map(|v| v as usize)
        .ok_or_else(|| TimeSeriesError::Json(format!("Field '{field}' is not a non-negative integer")))
}
