// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read-side decoding of a single stamped record.

use serde_json::Value;

use super::{TIMESTAMP_KEY, VALUE_KEY};

/// A remote record with its timestamp split off.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Decoded {
    /// The record's content; `None` when the record holds nothing but a
    /// timestamp (or is `null`).
    pub value: Option<Value>,
    /// Server timestamp in epoch milliseconds, when present and resolved.
    pub timestamp: Option<i64>,
}

/// Split the timestamp off one record, by shape.
///
/// - `{"@": t, "_": v}` is a wrapped primitive and decodes to `v`
/// - `{"@": t, ...rest}` is an object carrying its own timestamp and decodes
///   to `rest`
/// - `{"@": t}` decodes to an absent value
/// - anything else passes through untouched with no timestamp
pub fn decode(record: Value) -> Decoded {
    let wrapped = is_wrapped(&record);
    let Value::Object(mut map) = record else {
        return Decoded {
            value: Some(record).filter(|v| !v.is_null()),
            timestamp: None,
        };
    };

    let Some(raw_ts) = map.remove(TIMESTAMP_KEY) else {
        return Decoded {
            value: Some(Value::Object(map)),
            timestamp: None,
        };
    };
    let timestamp = raw_ts.as_i64();

    let value = if wrapped {
        map.remove(VALUE_KEY)
    } else if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    };

    Decoded { value, timestamp }
}

/// Whether `record` has the wrapped shape `{"@": t, "_": v}`.
pub fn is_wrapped(record: &Value) -> bool {
    record
        .as_object()
        .is_some_and(|map| map.len() == 2 && map.contains_key(TIMESTAMP_KEY) && map.contains_key(VALUE_KEY))
}
