//! JSON field helpers shared by the decoder.
//!
//! The venue encodes numbers inconsistently: prices arrive as strings
//! (`"1.0850"`) on some feeds and as native numbers on others, ids may be
//! either. These helpers accept both.

use serde_json::Value;

/// Parse a JSON value (string or number) as `f64`.
#[inline]
pub fn parse_str_f64(v: Option<&Value>) -> Option<f64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        fast_float2::parse(s.trim()).ok()
    } else {
        v.as_f64()
    }
}

/// Parse a JSON value (string or number) as `i64`.
///
/// Fractional numbers are truncated toward zero.
#[inline]
pub fn parse_str_i64(v: Option<&Value>) -> Option<i64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        s.trim().parse().ok()
    } else {
        v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))
    }
}

/// Render a scalar JSON value as text.
///
/// Strings are returned without quotes, numbers and booleans in their JSON
/// form, `null` as an empty string. Arrays and objects yield `None`.
pub fn scalar_to_string(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn f64_from_string_or_number() {
        assert_eq!(parse_str_f64(Some(&json!("1.0850"))), Some(1.085));
        assert_eq!(parse_str_f64(Some(&json!(2.5))), Some(2.5));
        assert_eq!(parse_str_f64(Some(&json!("abc"))), None);
        assert_eq!(parse_str_f64(None), None);
    }

    #[test]
    fn i64_from_string_or_number() {
        assert_eq!(parse_str_i64(Some(&json!("1700000000"))), Some(1_700_000_000));
        assert_eq!(parse_str_i64(Some(&json!(42))), Some(42));
        assert_eq!(parse_str_i64(Some(&json!(1.9))), Some(1));
        assert_eq!(parse_str_i64(Some(&json!(null))), None);
    }

    #[test]
    fn scalars_render_as_text() {
        assert_eq!(scalar_to_string(Some(&json!("x"))).as_deref(), Some("x"));
        assert_eq!(scalar_to_string(Some(&json!(17))).as_deref(), Some("17"));
        assert_eq!(scalar_to_string(Some(&json!(null))).as_deref(), Some(""));
        assert_eq!(scalar_to_string(Some(&json!({"a": 1}))), None);
    }
}
