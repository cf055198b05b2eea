//! Deterministic content hashing for elements.
//!
//! `H = SHA-256(canonical(view(el)))` where `view` drops `updatedAt` and the
//! reserved `_el_` metadata namespace, and `canonical` serializes with keys
//! sorted, arrays in order, numbers in shortest round-trip form, and Unicode
//! normalized to NFC. The hash is the primary equality predicate between
//! sync peers: serialize twice → identical bytes.

use std::fmt::Write as _;

use serde_json::Value;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::error::{Result, StoneforgeError};
use crate::model::{Element, RESERVED_METADATA_PREFIX};

/// Compute the 64-hex-char content hash of an element.
///
/// # Errors
/// Returns [`StoneforgeError::InvalidMetadata`] if the element fails to
/// serialize (bounded metadata makes this unreachable in practice).
pub fn content_hash(el: &Element) -> Result<String> {
    let view = hash_view(el)?;
    let mut canonical = String::new();
    write_canonical(&mut canonical, &view);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(64);
    for byte in digest {
        // Writing hex into a String cannot fail.
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}

/// The element as a JSON value with `updatedAt` and `_el_` keys removed.
fn hash_view(el: &Element) -> Result<Value> {
    let mut value = serde_json::to_value(el).map_err(|e| StoneforgeError::InvalidMetadata {
        reason: format!("element '{}' is not serializable: {e}", el.id),
    })?;
    if let Value::Object(map) = &mut value {
        map.remove("updatedAt");
        if let Some(Value::Object(metadata)) = map.get_mut("metadata") {
            metadata.retain(|key, _| !key.starts_with(RESERVED_METADATA_PREFIX));
        }
    }
    Ok(value)
}

/// Serialize a JSON value canonically into `out`.
///
/// Object keys are emitted in sorted order (byte-wise, after NFC
/// normalization); `serde_json`'s number formatting already produces the
/// shortest round-trip form via ryu/itoa.
fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::String(s) => write_canonical_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
            keys.sort_by(|a, b| {
                let a: String = a.nfc().collect();
                let b: String = b.nfc().collect();
                a.cmp(&b)
            });
            out.push('{');
            for (i, &key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical_string(out, key);
                out.push(':');
                // Key came from the map; the value is always present.
                if let Some(v) = map.get(key) {
                    write_canonical(out, v);
                }
            }
            out.push('}');
        }
    }
}

fn write_canonical_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.nfc() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ElementId, ElementType};
    use chrono::Utc;

    fn sample() -> Element {
        Element::new(
            ElementId::new("el-1a2b3c").expect("valid id"),
            ElementType::Task,
            "el-boot01",
            Utc::now(),
        )
        .expect("valid element")
    }

    #[test]
    fn hash_is_stable_across_serialization_runs() {
        let el = sample();
        assert_eq!(content_hash(&el).expect("hash"), content_hash(&el).expect("hash"));
    }

    #[test]
    fn hash_ignores_updated_at() {
        let mut a = sample();
        let mut b = a.clone();
        b.updated_at = a.updated_at + chrono::Duration::hours(3);
        assert_eq!(content_hash(&a).expect("hash"), content_hash(&b).expect("hash"));

        a.tags = vec!["urgent".to_owned()];
        assert_ne!(content_hash(&a).expect("hash"), content_hash(&b).expect("hash"));
    }

    #[test]
    fn hash_ignores_reserved_metadata_namespace() {
        let a = sample();
        let mut b = a.clone();
        // Reserved keys bypass the public constructor by design; the system
        // writes them directly.
        b.metadata.insert(
            "_el_cache".to_owned(),
            serde_json::Value::String("x".to_owned()),
        );
        assert_eq!(content_hash(&a).expect("hash"), content_hash(&b).expect("hash"));
    }

    #[test]
    fn unicode_is_nfc_normalized_before_hashing() {
        let mut a = sample();
        let mut b = a.clone();
        // "é" precomposed vs. "e" + combining acute.
        a.metadata.insert(
            "note".to_owned(),
            serde_json::Value::String("caf\u{e9}".to_owned()),
        );
        b.metadata.insert(
            "note".to_owned(),
            serde_json::Value::String("cafe\u{301}".to_owned()),
        );
        assert_eq!(content_hash(&a).expect("hash"), content_hash(&b).expect("hash"));
    }

    #[test]
    fn hash_is_sixty_four_hex_chars() {
        let hash = content_hash(&sample()).expect("hash");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
