//! Tamper-evidence checksums for audit events.
//!
//! The digest input is a fixed field order, each field length-prefixed, with
//! the event data rendered as canonical JSON (object keys sorted, no
//! insignificant whitespace). It does not depend on any serializer's field
//! or map ordering, so the same event hashes the same everywhere.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Timestamps inside the digest: RFC 3339, millisecond precision, `Z`.
pub fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Deterministic JSON text for `value`.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Fields covered by the checksum, in digest order.
pub struct ChecksumInput<'a> {
    pub id: &'a str,
    pub event_type: &'a str,
    pub level: &'a str,
    pub actor: &'a str,
    pub description: &'a str,
    pub data: &'a Value,
    pub timestamp: &'a DateTime<Utc>,
}

/// Hex SHA-256 over the canonical encoding of `input`.
pub fn compute(input: &ChecksumInput<'_>) -> String {
    let data = canonical_json(input.data);
    let timestamp = canonical_timestamp(input.timestamp);
    let mut hasher = Sha256::new();
    for field in [
        input.id,
        input.event_type,
        input.level,
        input.actor,
        input.description,
        data.as_str(),
        timestamp.as_str(),
    ] {
        hasher.update(field.len().to_string().as_bytes());
        hasher.update(b":");
        hasher.update(field.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
