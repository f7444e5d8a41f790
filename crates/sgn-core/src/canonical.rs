//! Canonical encoding for KU hashing and signing
//!
//! All hashed/signed KU material uses deterministic CBOR with strict
//! constraints:
//! - Map keys are byte-lex sorted on their UTF-8 bytes
//! - Integers use the shortest encoding
//! - Floats are always 64-bit IEEE-754; NaN/±Inf are rejected
//! - Definite lengths only; no tags
//!
//! This is the normative encoding: two implementations that disagree on a
//! single byte will disagree on every CID and signature.

use crate::error::{Error, Result};
use serde_json::{Map, Value};

const MAJOR_UNSIGNED: u8 = 0;
const MAJOR_NEGATIVE: u8 = 1;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;

const SIMPLE_FALSE: u8 = 0xf4;
const SIMPLE_TRUE: u8 = 0xf5;
const SIMPLE_NULL: u8 = 0xf6;
const FLOAT64: u8 = 0xfb;

/// Serialize a JSON value to canonical CBOR bytes.
///
/// The caller is responsible for stripping signature fields first when the
/// bytes feed a CID or signature; see [`strip_unsigned`].
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(128);
    write_value(value, &mut out)?;
    Ok(out)
}

/// Return a copy of the KU with the top-level `sig` and legacy `signatures`
/// fields removed. Non-objects pass through untouched.
pub fn strip_unsigned(value: &Value) -> Value {
    match value.as_object() {
        Some(obj) => {
            let mut stripped = obj.clone();
            stripped.remove("sig");
            stripped.remove("signatures");
            Value::Object(stripped)
        }
        None => value.clone(),
    }
}

fn write_value(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Null => out.push(SIMPLE_NULL),
        Value::Bool(false) => out.push(SIMPLE_FALSE),
        Value::Bool(true) => out.push(SIMPLE_TRUE),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                write_head(MAJOR_UNSIGNED, u, out);
            } else if let Some(i) = n.as_i64() {
                // i < 0 here: as_u64 covered the non-negative range
                write_head(MAJOR_NEGATIVE, !(i as u64), out);
            } else {
                let f = n.as_f64().ok_or(Error::NonFiniteFloat)?;
                if !f.is_finite() {
                    return Err(Error::NonFiniteFloat);
                }
                out.push(FLOAT64);
                out.extend_from_slice(&f.to_bits().to_be_bytes());
            }
        }
        Value::String(s) => {
            write_head(MAJOR_TEXT, s.len() as u64, out);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            write_head(MAJOR_ARRAY, items.len() as u64, out);
            for item in items {
                write_value(item, out)?;
            }
        }
        Value::Object(map) => write_map(map, out)?,
    }
    Ok(())
}

fn write_map(map: &Map<String, Value>, out: &mut Vec<u8>) -> Result<()> {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    write_head(MAJOR_MAP, entries.len() as u64, out);
    for (key, value) in entries {
        write_head(MAJOR_TEXT, key.len() as u64, out);
        out.extend_from_slice(key.as_bytes());
        write_value(value, out)?;
    }
    Ok(())
}

/// Write a CBOR item head with the shortest argument encoding.
fn write_head(major: u8, arg: u64, out: &mut Vec<u8>) {
    let major = major << 5;
    if arg < 24 {
        out.push(major | arg as u8);
    } else if arg <= u8::MAX as u64 {
        out.push(major | 24);
        out.push(arg as u8);
    } else if arg <= u16::MAX as u64 {
        out.push(major | 25);
        out.extend_from_slice(&(arg as u16).to_be_bytes());
    } else if arg <= u32::MAX as u64 {
        out.push(major | 26);
        out.extend_from_slice(&(arg as u32).to_be_bytes());
    } else {
        out.push(major | 27);
        out.extend_from_slice(&arg.to_be_bytes());
    }
}
