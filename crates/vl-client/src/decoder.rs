//! Frame decoding: lenient JSON parse followed by shape classification.
//!
//! # Repair
//!
//! Some venue gateways emit JavaScript-flavoured literals (`{'a':'b',}`).
//! A frame that fails a strict parse gets two repairs and one retry:
//!
//! 1. unescaped `'` becomes `"`
//! 2. a `,` directly followed (after whitespace) by `}` or `]` is removed
//!
//! # Classification
//!
//! | Shape  | Condition                  | Result            |
//! |--------|----------------------------|-------------------|
//! | array  | `"t"`, len ≥ 4             | `Quote`           |
//! | array  | `"n"`, len ≥ 8             | `Notify`          |
//! | array  | `"sr"`, len = 2            | `SymbolsReindex`  |
//! | array  | `"sc"`, len = 2            | `SecurityReindex` |
//! | object | has `event`                | `UserEvent`       |
//! | object | has `extID`                | `Response`        |
//! | other  |                            | `Unknown`         |

use chrono::DateTime;
use serde_json::{Map, Value};
use tracing::trace;
use vl_core::{DecodeError, Message, Notify, NotifyPayload, Quote, UserEvent};

use crate::json_util::{parse_str_f64, parse_str_i64, scalar_to_string};

/// Correlation field echoed back by the venue on command responses.
pub const EXT_ID_FIELD: &str = "extID";

/// Session token field stamped on every outbound request.
pub const TOKEN_FIELD: &str = "__token";

/// Field that marks an object frame as a user event.
pub const EVENT_FIELD: &str = "event";

/// Parse and classify one frame.
pub fn decode(frame: &str) -> Result<Message, DecodeError> {
    let value = parse_lenient(frame)?;
    classify(value)
}

// ---------------------------------------------------------------------------
// Parsing + repair
// ---------------------------------------------------------------------------

/// Strict parse, then one retry on the repaired text.
pub fn parse_lenient(frame: &str) -> Result<Value, DecodeError> {
    match serde_json::from_str(frame) {
        Ok(v) => Ok(v),
        Err(first) => {
            let repaired = repair(frame);
            serde_json::from_str(&repaired).map_err(|_| DecodeError::Parse(first.to_string())).inspect(|_| {
                trace!("repaired frame: {frame} -> {repaired}");
            })
        }
    }
}

/// Apply both repairs.
pub fn repair(frame: &str) -> String {
    strip_trailing_commas(&replace_single_quotes(frame))
}

/// Turn single-quoted strings into double-quoted ones.
///
/// Apostrophes inside double-quoted strings are left alone. Inside a
/// single-quoted string `\'` becomes a bare `'` and a bare `"` is escaped.
fn replace_single_quotes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    // Delimiter of the string being copied, if any.
    let mut open: Option<char> = None;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        let Some(delim) = open else {
            match c {
                '"' | '\'' => {
                    open = Some(c);
                    out.push('"');
                }
                _ => out.push(c),
            }
            continue;
        };
        match c {
            '\\' => match chars.next() {
                Some('\'') => out.push('\''),
                Some(next) => {
                    out.push('\\');
                    out.push(next);
                }
                None => out.push('\\'),
            },
            c if c == delim => {
                open = None;
                out.push('"');
            }
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out
}

/// Drop commas that sit directly before a closing `}` or `]`.
///
/// Commas inside double-quoted strings are left alone.
fn strip_trailing_commas(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Classify a parsed frame.
pub fn classify(value: Value) -> Result<Message, DecodeError> {
    match value {
        Value::Array(arr) => classify_array(arr),
        Value::Object(obj) => classify_object(obj),
        other => Ok(Message::Unknown(other)),
    }
}

fn classify_object(obj: Map<String, Value>) -> Result<Message, DecodeError> {
    if let Some(event) = obj.get(EVENT_FIELD) {
        let event =
            scalar_to_string(Some(event)).ok_or_else(|| DecodeError::Shape("event field is not a scalar".into()))?;
        return Ok(Message::UserEvent(UserEvent { event, body: Value::Object(obj) }));
    }
    if let Some(id) = obj.get(EXT_ID_FIELD) {
        let ext_id = scalar_to_string(Some(id))
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DecodeError::Shape("extID is empty or not a scalar".into()))?;
        return Ok(Message::Response { ext_id, payload: Value::Object(obj) });
    }
    Ok(Message::Unknown(Value::Object(obj)))
}

fn classify_array(arr: Vec<Value>) -> Result<Message, DecodeError> {
    let tag = arr.first().and_then(Value::as_str).unwrap_or_default().to_owned();
    match (tag.as_str(), arr.len()) {
        ("t", n) if n >= 4 => parse_quote(&arr).map(Message::Quote),
        ("n", n) if n >= 8 => parse_notify(&arr).map(Message::Notify),
        ("sr", 2) => Ok(Message::SymbolsReindex(arr.into_iter().nth(1).unwrap_or_default())),
        ("sc", 2) => Ok(Message::SecurityReindex(arr.into_iter().nth(1).unwrap_or_default())),
        _ => Ok(Message::Unknown(Value::Array(arr))),
    }
}

/// `["t", symbol, bid, ask, unix_seconds?]`
fn parse_quote(arr: &[Value]) -> Result<Quote, DecodeError> {
    let symbol = scalar_to_string(arr.get(1))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DecodeError::Shape("quote without symbol".into()))?;
    let bid = parse_str_f64(arr.get(2)).ok_or_else(|| DecodeError::Shape(format!("bad bid for {symbol}")))?;
    let ask = parse_str_f64(arr.get(3)).ok_or_else(|| DecodeError::Shape(format!("bad ask for {symbol}")))?;
    let timestamp = parse_str_i64(arr.get(4)).and_then(|secs| DateTime::from_timestamp(secs, 0));

    Ok(Quote { symbol, bid, ask, timestamp })
}

/// `["n", message, description, token, status, level, userId, createTime, payload?, code?]`
fn parse_notify(arr: &[Value]) -> Result<Notify, DecodeError> {
    let text = |i: usize| scalar_to_string(arr.get(i)).unwrap_or_default();

    let token = scalar_to_string(arr.get(3))
        .ok_or_else(|| DecodeError::Shape("notify token is not a scalar".into()))?;

    let (payload, code) = match arr.get(8) {
        Some(Value::Object(map)) => (NotifyPayload::Object(map.clone()), parse_str_i64(arr.get(9))),
        Some(v) if v.is_i64() || v.is_u64() => {
            let code = v.as_i64().ok_or_else(|| DecodeError::Shape("notify code out of range".into()))?;
            (NotifyPayload::Code(code), Some(code))
        }
        _ => (NotifyPayload::None, parse_str_i64(arr.get(9))),
    };

    Ok(Notify {
        message: text(1),
        description: text(2),
        token,
        status: text(4),
        level: text(5),
        user_id: text(6),
        create_time: parse_str_i64(arr.get(7)),
        payload,
        code,
    })
}
