//! Canonical probe identity.
//!
//! Two requests that mean the same thing must hash to the same signature, in
//! this process and in every later one. Arguments are normalized first, then
//! written in a fixed textual form (sorted keys, no whitespace) that does not
//! depend on how `serde_json` orders maps.

use std::fmt::Write as _;

use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

/// Hex characters kept from the sha256 digest.
const SIGNATURE_LEN: usize = 16;

/// Normalized arguments plus their identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Canonical {
    pub args: Value,
    pub form: String,
    pub signature: String,
}

/// Canonicalize `raw_args` for `probe_name`. Total: any JSON input is accepted.
pub fn canonicalize(probe_name: &str, raw_args: &Value) -> Canonical {
    let args = match raw_args {
        Value::Null => Value::Object(Map::new()),
        Value::Object(_) => normalize(raw_args),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), normalize(other));
            Value::Object(map)
        }
    };
    let mut form = String::new();
    write_canonical(&args, &mut form);
    let signature = signature_of(probe_name, &form);
    Canonical {
        args,
        form,
        signature,
    }
}

fn signature_of(probe_name: &str, form: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(probe_name.as_bytes());
    hasher.update(b"\n");
    hasher.update(form.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..SIGNATURE_LEN].to_string()
}

fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, inner) in map {
                if inner.is_null() {
                    continue;
                }
                out.insert(key.clone(), normalize(inner));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::Number(number) => Value::Number(normalize_number(number)),
        Value::String(text) => normalize_string(text),
        Value::Bool(_) | Value::Null => value.clone(),
    }
}

fn normalize_number(number: &Number) -> Number {
    if number.is_i64() || number.is_u64() {
        return number.clone();
    }
    match number.as_f64() {
        Some(float) => integral(float)
            .map(Number::from)
            .unwrap_or_else(|| number.clone()),
        None => number.clone(),
    }
}

/// Integer value of `float` when it has no fractional part and is exactly representable.
fn integral(float: f64) -> Option<i64> {
    const EXACT: f64 = 9_007_199_254_740_992.0;
    if float.is_finite() && float.fract() == 0.0 && float.abs() <= EXACT {
        Some(float as i64)
    } else {
        None
    }
}

fn normalize_string(text: &str) -> Value {
    let trimmed = text.trim();
    match trimmed {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if !is_plain_decimal(trimmed) {
        return Value::String(text.to_string());
    }
    exact_number(trimmed)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(text.to_string()))
}

/// The number `text` spells, when a JSON number can hold it without loss.
fn exact_number(text: &str) -> Option<Number> {
    let integer = match text.split_once('.') {
        Some((int_part, frac_part)) if frac_part.bytes().all(|b| b == b'0') => int_part,
        Some(_) => {
            let float = text.parse::<f64>().ok()?;
            return (float.to_string() == text)
                .then(|| Number::from_f64(float))
                .flatten();
        }
        None => text,
    };
    if let Ok(int) = integer.parse::<i64>() {
        return Some(Number::from(int));
    }
    integer.parse::<u64>().ok().map(Number::from)
}

/// `-?(0|[1-9][0-9]*)(\.[0-9]+)?` without pulling a regex into the hot path.
fn is_plain_decimal(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((int_part, frac_part)) => (int_part, Some(frac_part)),
        None => (digits, None),
    };
    let int_ok = !int_part.is_empty()
        && int_part.bytes().all(|b| b.is_ascii_digit())
        && (int_part == "0" || !int_part.starts_with('0'));
    let frac_ok =
        frac_part.is_none_or(|frac| !frac.is_empty() && frac.bytes().all(|b| b.is_ascii_digit()));
    int_ok && frac_ok
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                if let Some(inner) = map.get(*key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(text) => write_string(text, out),
        Value::Number(number) => {
            let _ = write!(out, "{number}");
        }
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Null => out.push_str("null"),
    }
}

fn write_string(text: &str, out: &mut String) {
    // serde_json string escaping is deterministic and never fails for &str.
    match serde_json::to_string(text) {
        Ok(escaped) => out.push_str(&escaped),
        Err(_) => out.push_str(text),
    }
}
