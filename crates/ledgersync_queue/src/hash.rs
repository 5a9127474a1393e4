//! Canonical hashing for payloads and operation ids.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::operation::{OperationType, Payload};

/// Computes the canonical hash of a payload.
///
/// The payload is rewritten with all object keys recursively sorted before
/// hashing, so two payloads that differ only in field order produce the same
/// hash. Used for idempotency verification and conflict comparison.
pub fn canonical_payload_hash(payload: &Payload) -> String {
    let canonical = Value::Object(payload.clone());
    let mut hasher = Sha256::new();
    write_canonical(&canonical, &mut hasher);
    hex_digest(hasher)
}

/// Derives the deterministic operation id for a logical mutation.
///
/// The id is a function of `(operation type, collection, document id,
/// creation time)`: replaying the same logical mutation, for example after a
/// crash before the first flush, reproduces the same id so the remote side
/// can de-duplicate.
pub fn operation_id_for(
    op_type: &OperationType,
    collection: &str,
    document_id: &str,
    created_at: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(op_type.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(collection.as_bytes());
    hasher.update(b"|");
    hasher.update(document_id.as_bytes());
    hasher.update(b"|");
    hasher.update(created_at.timestamp_millis().to_le_bytes());
    hex_digest(hasher)
}

/// Feeds a JSON value into the hasher in canonical (sorted-key) form.
fn write_canonical(value: &Value, hasher: &mut Sha256) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
        Value::Number(n) => {
            hasher.update(b"#");
            hasher.update(n.to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.update(b"s");
            hasher.update((s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                write_canonical(item, hasher);
            }
            hasher.update(b"]");
        }
        Value::Object(map) => {
            // serde_json's default map preserves insertion order; sort here
            // so the hash is independent of field order.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                hasher.update(b"k");
                hasher.update((key.len() as u64).to_le_bytes());
                hasher.update(key.as_bytes());
                write_canonical(&map[key], hasher);
            }
            hasher.update(b"}");
        }
    }
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn payload_from(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn hash_independent_of_key_order() {
        let a = payload_from(json!({"name": "Asha", "balance": 12.5, "tags": ["vip"]}));
        let b = payload_from(json!({"tags": ["vip"], "balance": 12.5, "name": "Asha"}));

        assert_eq!(canonical_payload_hash(&a), canonical_payload_hash(&b));
    }

    #[test]
    fn hash_sensitive_to_values() {
        let a = payload_from(json!({"total": 100}));
        let b = payload_from(json!({"total": 101}));

        assert_ne!(canonical_payload_hash(&a), canonical_payload_hash(&b));
    }

    #[test]
    fn hash_sensitive_to_nesting() {
        let a = payload_from(json!({"items": [{"qty": 1}, {"qty": 2}]}));
        let b = payload_from(json!({"items": [{"qty": 2}, {"qty": 1}]}));

        assert_ne!(canonical_payload_hash(&a), canonical_payload_hash(&b));
    }

    #[test]
    fn operation_id_is_deterministic() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();

        let first = operation_id_for(&OperationType::Create, "bills", "bill_1", at);
        let second = operation_id_for(&OperationType::Create, "bills", "bill_1", at);

        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn operation_id_varies_per_input() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();

        let create = operation_id_for(&OperationType::Create, "bills", "bill_1", at);
        let update = operation_id_for(&OperationType::Update, "bills", "bill_1", at);
        let other_doc = operation_id_for(&OperationType::Create, "bills", "bill_2", at);

        assert_ne!(create, update);
        assert_ne!(create, other_doc);
    }
}
