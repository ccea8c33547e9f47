// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Serialized-size estimation without serializing.
//!
//! The estimate mirrors `serde_json`'s compact output exactly: quoted and
//! escaped strings, numeric text, and structural punctuation.

use serde_json::Value;

/// Bytes `s` occupies between its quotes once JSON-escaped.
#[must_use]
pub fn escaped_content_len(s: &str) -> usize {
    s.chars().map(escaped_char_len).sum()
}

/// Bytes `c` occupies once JSON-escaped.
#[must_use]
pub fn escaped_char_len(c: char) -> usize {
    match c {
        '"' | '\\' | '\u{08}' | '\u{0C}' | '\n' | '\r' | '\t' => 2,
        c if (c as u32) < 0x20 => 6,
        c => c.len_utf8(),
    }
}

/// Bytes of `s` as a JSON string literal, quotes included.
#[must_use]
pub fn quoted_len(s: &str) -> usize {
    escaped_content_len(s) + 2
}

/// Bytes `value` occupies in compact JSON.
#[must_use]
pub fn estimated_size(value: &Value) -> usize {
    match value {
        Value::Null => 4,
        Value::Bool(true) => 4,
        Value::Bool(false) => 5,
        Value::Number(n) => n.to_string().len(),
        Value::String(s) => quoted_len(s),
        Value::Array(items) => {
            let commas = items.len().saturating_sub(1);
            2 + commas + items.iter().map(estimated_size).sum::<usize>()
        }
        Value::Object(map) => {
            let commas = map.len().saturating_sub(1);
            2 + commas
                + map
                    .iter()
                    .map(|(k, v)| member_size(k, v))
                    .sum::<usize>()
        }
    }
}

/// Bytes of a `"key":value` object member, excluding the separating comma.
#[must_use]
pub fn member_size(key: &str, value: &Value) -> usize {
    quoted_len(key) + 1 + estimated_size(value)
}
