//! Canonical JSON serialization.
//!
//! Every signature and every chain hash in the Kernel is computed over the
//! byte sequence produced here, so the encoding must be identical across
//! implementations:
//! - object keys are sorted by the byte order of their JSON-encoded form,
//! - array order is preserved,
//! - numbers use their shortest round-trip JSON form,
//! - strings are JSON-encoded without HTML escaping,
//! - no whitespace, no newlines, no BOM.
//!
//! The golden vectors in the test module are the cross-implementation
//! contract; re-implementers must match them byte for byte.

use {
    serde::Serialize,
    serde_json::Value,
    sha2::{Digest as _, Sha256},
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum CanonicalError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("malformed json: {0}")]
    MalformedJson(#[source] serde_json::Error),
}

/// Produce the canonical byte encoding of a JSON value.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    let mut out = Vec::with_capacity(128);
    write_value(value, &mut out)?;
    Ok(out)
}

/// Canonicalize any serializable value by routing it through [`Value`].
pub fn canonicalize<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonicalError> {
    let value =
        serde_json::to_value(value).map_err(|e| CanonicalError::InvalidInput(e.to_string()))?;
    canonical_bytes(&value)
}

/// Build a JSON number from a float, rejecting non-finite values.
///
/// `serde_json` maps NaN and infinities to `null` instead of erroring, so
/// callers constructing numeric payloads programmatically must come through
/// here to honor the no-non-finite rule.
pub fn number_from_f64(f: f64) -> Result<Value, CanonicalError> {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| CanonicalError::InvalidInput(format!("non-finite number: {f}")))
}

/// Parse a JSON document and return its canonical bytes.
pub fn canonical_from_slice(bytes: &[u8]) -> Result<Vec<u8>, CanonicalError> {
    let value: Value = serde_json::from_slice(bytes).map_err(CanonicalError::MalformedJson)?;
    canonical_bytes(&value)
}

/// `SHA-256(canonical_bytes(value))` as a raw 32-byte digest.
pub fn canonical_digest(value: &Value) -> Result<[u8; 32], CanonicalError> {
    Ok(sha256(&canonical_bytes(value)?))
}

/// `SHA-256(canonical_bytes(value))`, hex-encoded.
pub fn canonical_digest_hex(value: &Value) -> Result<String, CanonicalError> {
    Ok(hex::encode(canonical_digest(value)?))
}

/// Compute `sha256(data)` and return the raw 32-byte digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hex-encode `sha256(data)`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

fn write_value(value: &Value, out: &mut Vec<u8>) -> Result<(), CanonicalError> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => {
            if n.as_f64().is_some_and(|f| !f.is_finite()) {
                return Err(CanonicalError::InvalidInput(format!(
                    "non-finite number: {n}"
                )));
            }
            // serde_json renders numbers via itoa/ryu, which is the shortest
            // round-trip form.
            out.extend_from_slice(n.to_string().as_bytes());
        }
        Value::String(s) => write_string(s, out)?,
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // Sort keys by the byte order of their JSON-encoded form.
            let mut entries: Vec<(Vec<u8>, &Value)> = Vec::with_capacity(map.len());
            for (key, val) in map {
                let mut encoded = Vec::with_capacity(key.len() + 2);
                write_string(key, &mut encoded)?;
                entries.push((encoded, val));
            }
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            out.push(b'{');
            for (i, (key, val)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(key);
                out.push(b':');
                write_value(val, out)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

fn write_string(s: &str, out: &mut Vec<u8>) -> Result<(), CanonicalError> {
    // serde_json escapes `"`, `\` and control characters and nothing else; in
    // particular it does not HTML-escape `<`, `>`, `&` or `/`.
    serde_json::to_writer(&mut *out, s).map_err(CanonicalError::MalformedJson)
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    fn canonical_str(value: &Value) -> String {
        String::from_utf8(canonical_bytes(value).unwrap()).unwrap()
    }

    #[test]
    fn golden_vectors() {
        let cases: &[(Value, &str)] = &[
            (json!(null), "null"),
            (json!(true), "true"),
            (json!(false), "false"),
            (json!(0), "0"),
            (json!(-2), "-2"),
            (json!(18446744073709551615u64), "18446744073709551615"),
            (json!(0.5), "0.5"),
            (json!(-0.0), "-0.0"),
            (json!(1e21), "1e21"),
            (json!(""), "\"\""),
            (json!("a\"b\\c\nd\u{1}e</>&"), "\"a\\\"b\\\\c\\nd\\u0001e</>&\""),
            (json!([]), "[]"),
            (json!({}), "{}"),
            (
                json!({"b": 1, "a": [true, null, "x"], "c": {"z": 0.5, "y": -2}}),
                r#"{"a":[true,null,"x"],"b":1,"c":{"y":-2,"z":0.5}}"#,
            ),
            // Non-ASCII keys sort by their UTF-8 bytes, after ASCII.
            (json!({"é": 1, "z": 2}), "{\"z\":2,\"\u{e9}\":1}"),
            (
                json!({"nested": [{"k": [1, 2, 3]}, "s"], "empty": {}}),
                r#"{"empty":{},"nested":[{"k":[1,2,3]},"s"]}"#,
            ),
        ];

        for (value, expected) in cases {
            assert_eq!(&canonical_str(value), expected, "vector for {value}");
        }
    }

    #[test]
    fn deterministic_across_key_insertion_order() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":{"b":2,"a":3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":{"a":3,"b":2},"x":1}"#).unwrap();
        assert_eq!(canonical_bytes(&a).unwrap(), canonical_bytes(&b).unwrap());
    }

    #[test]
    fn round_trips_all_json_values() {
        let original = json!({
            "s": "héllo\t\"quoted\"",
            "n": [0, -1, 2.25, 1e-6],
            "deep": {"a": {"b": {"c": null}}},
            "flags": [true, false]
        });
        let bytes = canonical_bytes(&original).unwrap();
        let reparsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reparsed, original);
        // Canonicalizing the reparse is a fixed point.
        assert_eq!(canonical_bytes(&reparsed).unwrap(), bytes);
    }

    #[test]
    fn no_whitespace_outside_strings() {
        let bytes = canonical_bytes(&json!({"a": [1, 2], "b": {"c": true}})).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":[1,2],"b":{"c":true}}"#
        );
    }

    #[test]
    fn rejects_non_finite_numbers() {
        assert_matches::assert_matches!(
            number_from_f64(f64::NAN),
            Err(CanonicalError::InvalidInput(_))
        );
        assert_matches::assert_matches!(
            number_from_f64(f64::INFINITY),
            Err(CanonicalError::InvalidInput(_))
        );
        assert_eq!(number_from_f64(0.5).unwrap(), json!(0.5));
    }

    #[test]
    fn rejects_malformed_json_text() {
        assert_matches::assert_matches!(
            canonical_from_slice(b"{\"a\": }"),
            Err(CanonicalError::MalformedJson(_))
        );
    }

    #[test]
    fn digest_matches_direct_hash() {
        let value = json!({"n": 1});
        let bytes = canonical_bytes(&value).unwrap();
        assert_eq!(canonical_digest(&value).unwrap(), sha256(&bytes));
        assert_eq!(canonical_digest_hex(&value).unwrap(), sha256_hex(&bytes));
    }
}
